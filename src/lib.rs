pub mod agent;
pub mod catalog;
pub mod commands;
pub mod config;
/// clusterhub - control plane for multi-host segmented database clusters
///
/// The hub keeps one mutual TLS channel to the agent on every host and drives
/// cluster-wide workflows over them:
/// 1. Cluster bring-up: validate hosts, create the coordinator and primaries,
///    restart in production mode and finalize the catalog
/// 2. Mirror attachment: register mirrors, open replication access on the
///    primaries, copy and start every mirror
///
/// Progress and log output of a workflow is streamed back to the caller.
pub mod core;
pub mod error;
pub mod server;
pub mod stream;
pub mod tls;
pub mod utils;
pub mod workflow;

use std::sync::Arc;
use tracing::{debug, info};

use crate::agent::transport::TlsDialer;
use crate::catalog::postgres::PgCatalogConnector;
use crate::catalog::CatalogConnector;
use crate::commands::{GpHomeCommands, LocalCommands};
use crate::config::Config;
use crate::core::connection::{Connection, ConnectionManager, Dialer};
use crate::error::{HubError, HubResult};
use crate::tls::{Credentials, PemCredentials};

/// Hub instance: configuration plus the collaborators every workflow uses
pub struct Hub {
    config: Config,
    conns: ConnectionManager,
    catalog: Arc<dyn CatalogConnector>,
    commands: Arc<dyn LocalCommands>,
}

impl Hub {
    /// Create a hub from explicit collaborators
    pub fn new(
        config: Config,
        dialer: Arc<dyn Dialer>,
        catalog: Arc<dyn CatalogConnector>,
        commands: Arc<dyn LocalCommands>,
    ) -> Self {
        let conns = ConnectionManager::new(dialer, config.dial_timeout());
        Self {
            config,
            conns,
            catalog,
            commands,
        }
    }

    /// Production wiring: TLS dialer, coordinator catalog and the utilities
    /// under the configured installation root
    pub fn from_config(config: Config) -> HubResult<Self> {
        config.validate()?;

        let credentials: Arc<dyn Credentials> = Arc::new(PemCredentials::from_config(&config.tls));
        // Surface bad certificate paths at startup rather than on first dial
        credentials.client_connector()?;

        let commands = Arc::new(GpHomeCommands::new(&config.hub.gphome));
        let user = commands.current_user()?;
        let dialer = Arc::new(TlsDialer::new(credentials, config.hub.agent_port));
        let catalog = Arc::new(PgCatalogConnector::new(user));

        info!(
            "Hub configured for {} agent hosts on port {}",
            config.hub.hostnames.len(),
            config.hub.agent_port
        );
        Ok(Self::new(config, dialer, catalog, commands))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Hosts running an agent
    pub fn hostnames(&self) -> &[String] {
        &self.config.hub.hostnames
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.conns
    }

    pub(crate) fn catalog(&self) -> &dyn CatalogConnector {
        self.catalog.as_ref()
    }

    pub(crate) fn commands(&self) -> &Arc<dyn LocalCommands> {
        &self.commands
    }

    /// Make sure every configured agent host has a ready connection
    pub async fn dial_all_agents(&self) -> HubResult<Vec<Arc<Connection>>> {
        debug!("Ensuring connections to {} agents", self.hostnames().len());
        self.conns.ensure_connections(self.hostnames()).await
    }

    /// Fail unless every host in `hosts` has a connection in `conns`
    pub(crate) fn require_hosts<'a, I>(conns: &[Arc<Connection>], hosts: I) -> HubResult<()>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut missing: Vec<&str> = hosts
            .into_iter()
            .filter(|host| !conns.iter().any(|conn| conn.hostname() == *host))
            .collect();
        missing.sort_unstable();
        missing.dedup();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(HubError::validation(format!(
                "no agent connection for hosts: {}",
                missing.join(",")
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::tests::CountingDialer;
    use std::sync::atomic::Ordering;

    struct NoCatalog;

    #[async_trait::async_trait]
    impl CatalogConnector for NoCatalog {
        async fn connect(&self, _dir: &str, _utility: bool) -> HubResult<Arc<dyn catalog::Catalog>> {
            Err(HubError::catalog("no catalog"))
        }
    }

    fn hub(hostnames: &[&str], dialer: Arc<CountingDialer>) -> Hub {
        let mut config = Config::default();
        config.hub.hostnames = hostnames.iter().map(|h| h.to_string()).collect();
        Hub::new(
            config,
            dialer,
            Arc::new(NoCatalog),
            Arc::new(GpHomeCommands::new("/usr/local/gpdb")),
        )
    }

    #[tokio::test]
    async fn test_dial_all_agents_uses_configured_hosts() {
        let dialer = Arc::new(CountingDialer::new());
        let hub = hub(&["cdw", "sdw1"], dialer.clone());

        let conns = hub.dial_all_agents().await.unwrap();
        assert_eq!(conns.len(), 2);
        hub.dial_all_agents().await.unwrap();
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_require_hosts_lists_missing() {
        let dialer = Arc::new(CountingDialer::new());
        let hub = hub(&["cdw", "sdw1"], dialer);
        let conns = hub.dial_all_agents().await.unwrap();

        assert!(Hub::require_hosts(&conns, ["cdw", "sdw1"]).is_ok());
        let err = Hub::require_hosts(&conns, ["sdw3", "cdw", "sdw2", "sdw3"]).unwrap_err();
        assert_eq!(err.to_string(), "no agent connection for hosts: sdw2,sdw3");
    }
}
