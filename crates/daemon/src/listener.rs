// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Listener task for handling broker RPC connections.
//!
//! The Listener runs in a spawned task, accepting TCP connections and
//! handling each on its own task so a slow start never blocks other
//! clients. Handlers are thin adaptors delegating to the engine.

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};
use tokio::sync::Notify;
use tracing::{debug, error, warn};

use broker_core::{EmulatorId, RuleId};
use broker_engine::Broker;

use crate::protocol::{self, Request, Response, DEFAULT_TIMEOUT};

/// Shared broker context for all request handlers.
pub struct ListenCtx {
    pub broker: Arc<Broker>,
    pub shutdown: Arc<Notify>,
}

/// Listener task for accepting socket connections.
pub struct Listener {
    socket: TokioTcpListener,
    ctx: Arc<ListenCtx>,
}

/// Errors from connection handling.
#[derive(Debug, Error)]
pub(crate) enum ConnectionError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),
}

impl Listener {
    /// Create a new listener.
    pub fn new(socket: TokioTcpListener, ctx: Arc<ListenCtx>) -> Self {
        Self { socket, ctx }
    }

    /// Run the listener loop, spawning a task per connection.
    pub async fn run(self) {
        loop {
            match self.socket.accept().await {
                Ok((stream, _)) => {
                    let ctx = Arc::clone(&self.ctx);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, &ctx).await {
                            match e {
                                ConnectionError::Protocol(
                                    protocol::ProtocolError::ConnectionClosed,
                                ) => debug!("Client disconnected"),
                                ConnectionError::Protocol(protocol::ProtocolError::Timeout) => {
                                    warn!("Connection timeout")
                                }
                                _ => error!("Connection error: {}", e),
                            }
                        }
                    });
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            }
        }
    }
}

/// Handle a single client connection.
async fn handle_connection(stream: TcpStream, ctx: &ListenCtx) -> Result<(), ConnectionError> {
    let (mut reader, mut writer) = stream.into_split();

    // Read request with timeout
    let request = protocol::read_request(&mut reader, DEFAULT_TIMEOUT).await?;
    debug!(request = ?request, "received request");

    // Handle request; errors become Error responses
    let response = handle_request(request, ctx).await;
    debug!("Sending response: {:?}", response);

    // Write response with timeout
    protocol::write_response(&mut writer, &response, DEFAULT_TIMEOUT).await?;

    Ok(())
}

/// Deadline for this call from an optional per-request timeout.
fn caller_deadline(timeout_ms: Option<u64>) -> Option<Instant> {
    timeout_ms.map(|ms| Instant::now() + Duration::from_millis(ms))
}

/// Handle a single request and return a response.
pub async fn handle_request(request: Request, ctx: &ListenCtx) -> Response {
    let broker = &ctx.broker;
    match request {
        Request::Ping => Response::Pong,

        Request::CreateEmulator { emulator } => {
            match broker.registry.create_emulator(emulator) {
                Ok(()) => Response::Ok,
                Err(e) => Response::error(&e),
            }
        }

        Request::GetEmulator { emulator_id } => {
            match broker.registry.get_emulator(&EmulatorId::new(emulator_id)) {
                Ok(emulator) => Response::Emulator {
                    emulator: Box::new(emulator),
                },
                Err(e) => Response::error(&e),
            }
        }

        Request::ListEmulators => Response::Emulators {
            emulators: broker.registry.list_emulators(),
        },

        Request::StartEmulator {
            emulator_id,
            timeout_ms,
        } => {
            let id = EmulatorId::new(emulator_id);
            match broker.starter.start(&id, caller_deadline(timeout_ms)).await {
                Ok(()) => Response::Ok,
                Err(e) => Response::error(&e),
            }
        }

        Request::ReportEmulatorOnline {
            emulator_id,
            resolved_host,
            target_patterns,
        } => {
            let id = EmulatorId::new(emulator_id);
            match broker
                .registry
                .report_online(&id, &resolved_host, target_patterns)
            {
                Ok(()) => Response::Ok,
                Err(e) => Response::error(&e),
            }
        }

        Request::StopEmulator { emulator_id } => {
            match broker.starter.stop(&EmulatorId::new(emulator_id)).await {
                Ok(()) => Response::Ok,
                Err(e) => Response::error(&e),
            }
        }

        Request::CreateResolveRule { rule } => {
            match broker.registry.create_resolve_rule(rule) {
                Ok(()) => Response::Ok,
                Err(e) => Response::error(&e),
            }
        }

        Request::GetResolveRule { rule_id } => {
            match broker.registry.get_resolve_rule(&RuleId::new(rule_id)) {
                Ok(rule) => Response::Rule { rule },
                Err(e) => Response::error(&e),
            }
        }

        Request::UpdateResolveRule { rule } => {
            match broker.registry.update_resolve_rule(rule) {
                Ok(()) => Response::Ok,
                Err(e) => Response::error(&e),
            }
        }

        Request::ListResolveRules => Response::Rules {
            rules: broker.registry.list_resolve_rules(),
        },

        Request::Resolve { target, timeout_ms } => {
            match broker
                .resolver
                .resolve(&target, caller_deadline(timeout_ms))
                .await
            {
                Ok(resolution) => Response::Resolved {
                    target: resolution.target,
                    requires_secure_connection: resolution.requires_secure_connection,
                },
                Err(e) => Response::error(&e),
            }
        }

        Request::CreateProxy { emulator_id, port } => {
            match broker.proxies.create(&EmulatorId::new(emulator_id), port) {
                Ok(proxy) => Response::Proxy { proxy },
                Err(e) => Response::error(&e),
            }
        }

        Request::GetProxy { emulator_id } => {
            match broker.proxies.get(&EmulatorId::new(emulator_id)) {
                Ok(proxy) => Response::Proxy { proxy },
                Err(e) => Response::error(&e),
            }
        }

        Request::ListProxies => Response::Proxies {
            proxies: broker.proxies.list(),
        },

        Request::Shutdown => {
            ctx.shutdown.notify_one();
            Response::ShuttingDown
        }
    }
}

#[cfg(test)]
#[path = "listener_tests.rs"]
mod tests;
