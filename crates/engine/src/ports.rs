// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Port leasing from configured ranges.
//!
//! A port is free when it has not been leased (or was released) and a
//! probe bind succeeds. With no ranges configured the picker defers to
//! OS ephemeral assignment.

use std::collections::HashSet;
use std::net::TcpListener as StdTcpListener;

use parking_lot::Mutex;
use thiserror::Error;

/// Errors from port leasing.
#[derive(Debug, Error)]
pub enum PortError {
    #[error("port range [{0}, {1}) is empty")]
    EmptyRange(u16, u16),

    #[error("port ranges [{0}, {1}) and [{2}, {3}) overlap")]
    Overlap(u16, u16, u16, u16),

    #[error("no free port left in configured ranges")]
    Exhausted,

    #[error("ephemeral port assignment failed: {0}")]
    Ephemeral(std::io::Error),
}

/// Leases and releases TCP ports from `[begin, end)` ranges.
pub struct PortPicker {
    inner: Mutex<Inner>,
}

struct Inner {
    ranges: Vec<(u16, u16)>,
    leased: HashSet<u16>,
}

impl PortPicker {
    /// Build a picker over non-overlapping `[begin, end)` ranges.
    /// Overlap is a configuration error and must abort broker startup.
    pub fn new(mut ranges: Vec<(u16, u16)>) -> Result<Self, PortError> {
        for &(begin, end) in &ranges {
            if begin >= end {
                return Err(PortError::EmptyRange(begin, end));
            }
        }
        ranges.sort_unstable();
        for pair in ranges.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            if b.0 < a.1 {
                return Err(PortError::Overlap(a.0, a.1, b.0, b.1));
            }
        }
        Ok(Self {
            inner: Mutex::new(Inner {
                ranges,
                leased: HashSet::new(),
            }),
        })
    }

    /// Lease a currently-free port.
    ///
    /// Skips ports already leased and probes each candidate with a bind
    /// before handing it out. Fails with [`PortError::Exhausted`] when
    /// every configured port is taken.
    pub fn next(&self) -> Result<u16, PortError> {
        let mut inner = self.inner.lock();
        let Inner { ranges, leased } = &mut *inner;

        if ranges.is_empty() {
            // The OS may hand back a recently-closed port; skip any we
            // still consider leased.
            for _ in 0..16 {
                let listener =
                    StdTcpListener::bind(("127.0.0.1", 0)).map_err(PortError::Ephemeral)?;
                let port = listener.local_addr().map_err(PortError::Ephemeral)?.port();
                if leased.insert(port) {
                    return Ok(port);
                }
            }
            return Err(PortError::Exhausted);
        }

        for &(begin, end) in ranges.iter() {
            for port in begin..end {
                if leased.contains(&port) {
                    continue;
                }
                if StdTcpListener::bind(("127.0.0.1", port)).is_ok() {
                    leased.insert(port);
                    return Ok(port);
                }
            }
        }
        Err(PortError::Exhausted)
    }

    /// Return a port to the pool.
    pub fn release(&self, port: u16) {
        self.inner.lock().leased.remove(&port);
    }
}

#[cfg(test)]
#[path = "ports_tests.rs"]
mod tests;
