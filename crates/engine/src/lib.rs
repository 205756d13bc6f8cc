// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! broker-engine: state engine and lifecycle coordinator for the
//! emulator broker.
//!
//! The [`Broker`] ties the pieces together: the [`registry::Registry`]
//! (emulators, rules, proxies behind one mutex), the
//! [`starter::Starter`] (deadline-bounded start/stop), the
//! [`resolver::Resolver`] (target matching and on-demand starts), and
//! the [`proxy::ProxyManager`] (per-emulator TCP proxies).

pub mod command;
pub mod launcher;
pub mod ports;
pub mod proxy;
pub mod readiness;
pub mod record;
pub mod registry;
pub mod resolver;
pub mod starter;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

pub use command::ExpandedCommand;
pub use launcher::{ChildProcess, LaunchSpec, ProcessLauncher, TokioLauncher, BROKER_ADDRESS_ENV};
pub use ports::{PortError, PortPicker};
pub use proxy::{ProxyManager, ProxyView};
pub use readiness::{Readiness, ReadinessWaiter, StartOutcome};
pub use registry::{EmulatorView, Registry};
pub use resolver::{Resolution, Resolver};
pub use starter::Starter;

#[cfg(any(test, feature = "test-support"))]
pub use launcher::{FakeChildHandle, FakeLauncher};

/// Static configuration for a [`Broker`].
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Address of the broker's own RPC endpoint, handed to children via
    /// [`BROKER_ADDRESS_ENV`].
    pub broker_address: String,
    /// Directory of the broker binary, substituted for `{dir:broker}`.
    pub broker_dir: PathBuf,
    /// `[begin, end)` port ranges for the picker; empty defers to the OS.
    pub port_ranges: Vec<(u16, u16)>,
    /// Default bound on how long a start may take before it is abandoned.
    /// `None` means starts without a caller deadline wait indefinitely.
    pub default_start_deadline: Option<Duration>,
}

/// The assembled broker engine.
pub struct Broker {
    pub registry: Arc<Registry>,
    pub starter: Arc<Starter>,
    pub resolver: Arc<Resolver>,
    pub proxies: Arc<ProxyManager>,
}

impl Broker {
    /// Build the engine. Fails if the configured port ranges overlap.
    pub fn new(
        config: BrokerConfig,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Result<Self, PortError> {
        let picker = Arc::new(PortPicker::new(config.port_ranges)?);
        let registry = Arc::new(Registry::new(Arc::clone(&picker)));
        let starter = Arc::new(Starter::new(
            Arc::clone(&registry),
            Arc::clone(&picker),
            launcher,
            config.broker_address,
            config.broker_dir,
            config.default_start_deadline,
        ));
        let resolver = Arc::new(Resolver::new(Arc::clone(&registry), Arc::clone(&starter)));
        let proxies = Arc::new(ProxyManager::new(
            Arc::clone(&registry),
            Arc::clone(&picker),
            Arc::clone(&resolver),
            config.default_start_deadline,
        ));
        Ok(Self {
            registry,
            starter,
            resolver,
            proxies,
        })
    }

    /// Stop every emulator and tear down all proxies.
    pub async fn shutdown(&self) {
        for id in self.registry.emulator_ids() {
            if let Err(e) = self.starter.stop(&id).await {
                warn!(emulator = %id, error = %e, "stop during shutdown failed");
            }
        }
        self.proxies.shutdown();
    }
}
