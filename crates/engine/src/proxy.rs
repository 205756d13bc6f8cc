// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-emulator TCP proxies.
//!
//! Each accepted connection resolves the emulator's first target
//! pattern (starting the emulator on demand when so configured) and
//! shuttles bytes both ways until either side closes. Proxies live
//! until broker shutdown.

use std::net::TcpListener as StdTcpListener;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use broker_core::{BrokerError, EmulatorId};

use crate::ports::PortPicker;
use crate::registry::{ProxyEntry, Registry};
use crate::resolver::Resolver;

/// Proxy state as returned by `CreateProxy`/`GetProxy`/`ListProxies`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyView {
    pub emulator_id: EmulatorId,
    pub port: u16,
}

/// Creates and tracks one TCP proxy per emulator.
pub struct ProxyManager {
    registry: Arc<Registry>,
    picker: Arc<PortPicker>,
    resolver: Arc<Resolver>,
    /// Deadline applied to each proxied connection's resolve.
    connect_deadline: Option<Duration>,
}

impl ProxyManager {
    pub fn new(
        registry: Arc<Registry>,
        picker: Arc<PortPicker>,
        resolver: Arc<Resolver>,
        connect_deadline: Option<Duration>,
    ) -> Self {
        Self {
            registry,
            picker,
            resolver,
            connect_deadline,
        }
    }

    /// Create the proxy for an emulator. A requested port of 0 leases
    /// one from the picker; an explicit port that fails to bind is
    /// `AlreadyExists`.
    pub fn create(
        &self,
        emulator_id: &EmulatorId,
        requested_port: u16,
    ) -> Result<ProxyView, BrokerError> {
        self.registry.reserve_proxy(emulator_id)?;

        match self.bind(emulator_id, requested_port) {
            Ok(view) => Ok(view),
            Err(e) => {
                self.registry.cancel_proxy_reservation(emulator_id);
                Err(e)
            }
        }
    }

    fn bind(&self, emulator_id: &EmulatorId, requested_port: u16) -> Result<ProxyView, BrokerError> {
        let (std_listener, port, leased) = if requested_port == 0 {
            let port = self
                .picker
                .next()
                .map_err(|e| BrokerError::Internal(format!("proxy port lease failed: {e}")))?;
            match StdTcpListener::bind(("127.0.0.1", port)) {
                Ok(listener) => (listener, port, true),
                Err(e) => {
                    self.picker.release(port);
                    return Err(BrokerError::Internal(format!(
                        "bind of leased proxy port {port} failed: {e}"
                    )));
                }
            }
        } else {
            let listener = StdTcpListener::bind(("127.0.0.1", requested_port)).map_err(|e| {
                BrokerError::AlreadyExists(format!(
                    "proxy port {requested_port} is unavailable: {e}"
                ))
            })?;
            (listener, requested_port, false)
        };

        std_listener
            .set_nonblocking(true)
            .map_err(|e| BrokerError::Internal(format!("proxy listener setup failed: {e}")))?;
        let listener = TcpListener::from_std(std_listener)
            .map_err(|e| BrokerError::Internal(format!("proxy listener setup failed: {e}")))?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(serve(
            listener,
            emulator_id.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.resolver),
            self.connect_deadline,
            shutdown_rx,
        ));

        self.registry.commit_proxy(
            emulator_id,
            ProxyEntry {
                port,
                leased_from_picker: leased,
                shutdown: shutdown_tx,
                task,
            },
        );
        info!(emulator = %emulator_id, port, "proxy created");
        Ok(ProxyView {
            emulator_id: emulator_id.clone(),
            port,
        })
    }

    pub fn get(&self, emulator_id: &EmulatorId) -> Result<ProxyView, BrokerError> {
        self.registry
            .proxy_port(emulator_id)
            .map(|port| ProxyView {
                emulator_id: emulator_id.clone(),
                port,
            })
            .ok_or_else(|| BrokerError::NotFound(format!("proxy for emulator {emulator_id}")))
    }

    pub fn list(&self) -> Vec<ProxyView> {
        self.registry
            .proxy_ports()
            .into_iter()
            .map(|(emulator_id, port)| ProxyView { emulator_id, port })
            .collect()
    }

    /// Tear down every proxy and release their leased ports.
    pub fn shutdown(&self) {
        for (emulator_id, entry) in self.registry.take_proxies() {
            debug!(emulator = %emulator_id, port = entry.port, "proxy shut down");
            let _ = entry.shutdown.send(true);
            entry.task.abort();
            if entry.leased_from_picker {
                self.picker.release(entry.port);
            }
        }
    }
}

/// Accept loop for one proxy.
async fn serve(
    listener: TcpListener,
    emulator_id: EmulatorId,
    registry: Arc<Registry>,
    resolver: Arc<Resolver>,
    connect_deadline: Option<Duration>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            accepted = listener.accept() => match accepted {
                Ok((inbound, peer)) => {
                    debug!(emulator = %emulator_id, %peer, "proxy connection accepted");
                    let emulator_id = emulator_id.clone();
                    let registry = Arc::clone(&registry);
                    let resolver = Arc::clone(&resolver);
                    tokio::spawn(async move {
                        handle_connection(inbound, &emulator_id, &registry, &resolver, connect_deadline)
                            .await;
                    });
                }
                Err(e) => {
                    warn!(emulator = %emulator_id, error = %e, "proxy accept failed");
                }
            },
        }
    }
}

/// Resolve the emulator's first pattern and pump bytes. A failed
/// resolve closes the connection by dropping it.
async fn handle_connection(
    mut inbound: TcpStream,
    emulator_id: &EmulatorId,
    registry: &Registry,
    resolver: &Resolver,
    connect_deadline: Option<Duration>,
) {
    let Some(pattern) = registry.first_target_pattern(emulator_id) else {
        warn!(emulator = %emulator_id, "proxied emulator has no target pattern");
        return;
    };

    let deadline = connect_deadline.map(|d| Instant::now() + d);
    let destination = match resolver.resolve(&pattern, deadline).await {
        Ok(resolution) => resolution.target,
        Err(e) => {
            debug!(emulator = %emulator_id, error = %e, "proxied resolve failed, closing connection");
            return;
        }
    };

    let mut outbound = match TcpStream::connect(&destination).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(emulator = %emulator_id, destination, error = %e, "proxy dial failed");
            return;
        }
    };

    if let Err(e) = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await {
        debug!(emulator = %emulator_id, error = %e, "proxy stream ended with error");
    }
}

#[cfg(test)]
#[path = "proxy_tests.rs"]
mod tests;
