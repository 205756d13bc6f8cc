// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Target classification and rewriting.
//!
//! A target is the client-supplied string being resolved: a bare host or
//! `host:port`, an `http://`/`https://` URL, or an RPC method path of the
//! form `/Service/Method`.

/// The syntactic kind of a resolve target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    /// Bare `host` or `host:port`.
    Host,
    /// Explicit `http://` or `https://` URL.
    Url,
    /// `/Service/Method` RPC path.
    MethodPath,
}

/// Classify a target string.
pub fn classify(target: &str) -> TargetKind {
    if target.starts_with("http://") || target.starts_with("https://") {
        TargetKind::Url
    } else if target.starts_with('/') {
        TargetKind::MethodPath
    } else {
        TargetKind::Host
    }
}

/// Rewrite a matched target against `resolved_host`.
///
/// Bare hosts and method paths become `resolved_host` itself. URLs keep
/// their path and query, swap the authority for `resolved_host`, and take
/// their scheme from `requires_secure` regardless of the input scheme.
pub fn rewrite(target: &str, resolved_host: &str, requires_secure: bool) -> String {
    match classify(target) {
        TargetKind::Host | TargetKind::MethodPath => resolved_host.to_string(),
        TargetKind::Url => {
            let rest = match target.split_once("://") {
                Some((_, rest)) => rest,
                None => target,
            };
            // The authority ends at the first '/', '?', or '#'.
            let suffix = match rest.find(['/', '?', '#']) {
                Some(i) => &rest[i..],
                None => "",
            };
            let scheme = if requires_secure { "https" } else { "http" };
            format!("{scheme}://{resolved_host}{suffix}")
        }
    }
}

#[cfg(test)]
#[path = "target_tests.rs"]
mod tests;
