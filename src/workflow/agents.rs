/// Agent lifecycle: stop, status and hostname discovery
use crate::agent::ServiceStatus;
use crate::core::connection::Connection;
use crate::core::rpc::execute_rpc;
use crate::error::{HubError, HubResult};
use crate::Hub;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

impl Hub {
    /// Stop the agent on every host. An agent has stopped when its channel
    /// drops during the call; a normal reply means it is still running.
    /// The pool is discarded either way.
    pub async fn stop_agents(&self) -> HubResult<()> {
        let conns = self.dial_all_agents().await?;

        let result = execute_rpc(&conns, |conn| async move {
            match conn.agent().stop().await {
                Ok(()) => Err(HubError::remote(
                    conn.hostname(),
                    format!("failed to stop agent on host {}", conn.hostname()),
                )),
                Err(e) if e.is_unavailable() => Ok(()),
                Err(e) => Err(HubError::remote(
                    conn.hostname(),
                    format!("failed to stop agent on host {}: {}", conn.hostname(), e),
                )),
            }
        })
        .await;

        self.connections().discard().await;
        if result.is_ok() {
            info!("Stopped agents on {} hosts", conns.len());
        }
        result
    }

    /// Service status of the agent on every host, ordered by host
    pub async fn status_agents(&self) -> HubResult<Vec<ServiceStatus>> {
        let conns = self.dial_all_agents().await?;
        let statuses = Arc::new(Mutex::new(Vec::with_capacity(conns.len())));

        execute_rpc(&conns, |conn| {
            let statuses = Arc::clone(&statuses);
            async move {
                let host = conn.hostname().to_string();
                let status = conn.agent().status().await.map_err(|_| {
                    HubError::remote(&host, format!("failed to get agent status on host {}", host))
                })?;
                statuses.lock().await.push(ServiceStatus { host, ..status });
                Ok(())
            }
        })
        .await?;

        let mut statuses = std::mem::take(&mut *statuses.lock().await);
        statuses.sort_by(|a, b| a.host.cmp(&b.host));
        Ok(statuses)
    }

    /// Map each address to the hostname its agent reports. Connections are
    /// opened for this call only and never join the pool.
    pub async fn get_all_hostnames(&self, addresses: &[String]) -> HubResult<BTreeMap<String, String>> {
        debug!("Resolving hostnames of {} addresses", addresses.len());

        let mut conns: Vec<Connection> = Vec::with_capacity(addresses.len());
        for addr in addresses {
            match self.connections().dial_uncached(addr).await {
                Ok(conn) => conns.push(conn),
                Err(e) => {
                    conns.iter().for_each(Connection::close);
                    return Err(e);
                }
            }
        }

        let replies = join_all(conns.iter().zip(addresses).map(|(conn, addr)| async move {
            conn.agent()
                .get_hostname()
                .await
                .map(|hostname| (addr.clone(), hostname))
                .map_err(|e| {
                    HubError::remote(addr, format!("getting hostname for {} failed with error: {}", addr, e))
                })
        }))
        .await;
        conns.iter().for_each(Connection::close);

        replies.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::*;
    use crate::catalog::{Catalog, CatalogConnector};
    use crate::commands::GpHomeCommands;
    use crate::config::Config;
    use crate::core::connection::{ChannelState, Dialer};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;

    #[derive(Clone, Copy)]
    enum StopBehavior {
        Disconnect,
        Reply,
        Refuse,
    }

    struct LifecycleAgent {
        host: String,
        stop: StopBehavior,
    }

    #[async_trait]
    impl AgentClient for LifecycleAgent {
        async fn make_segment(&self, _req: MakeSegmentRequest) -> HubResult<()> {
            Ok(())
        }
        async fn start_segment(&self, _req: StartSegmentRequest) -> HubResult<()> {
            Ok(())
        }
        async fn update_pg_conf(&self, _req: UpdatePgConfRequest) -> HubResult<()> {
            Ok(())
        }
        async fn update_pg_hba_conf_and_reload(&self, _req: UpdatePgHbaConfRequest) -> HubResult<()> {
            Ok(())
        }
        async fn pg_basebackup(&self, _req: PgBasebackupRequest) -> HubResult<()> {
            Ok(())
        }
        async fn get_interface_addrs(&self) -> HubResult<Vec<String>> {
            Ok(Vec::new())
        }
        async fn validate_host_env(&self, _req: ValidateHostEnvRequest) -> HubResult<Vec<LogMessage>> {
            Ok(Vec::new())
        }
        async fn get_hostname(&self) -> HubResult<String> {
            Ok(format!("{}.example", self.host))
        }
        async fn status(&self) -> HubResult<ServiceStatus> {
            Ok(ServiceStatus {
                host: String::new(),
                status: "running".to_string(),
                uptime: "5m".to_string(),
                pid: 4242,
            })
        }
        async fn stop(&self) -> HubResult<()> {
            match self.stop {
                StopBehavior::Disconnect => Err(HubError::unavailable(&self.host, "connection reset")),
                StopBehavior::Reply => Ok(()),
                StopBehavior::Refuse => Err(HubError::rpc("permission denied")),
            }
        }
        fn state(&self) -> ChannelState {
            ChannelState::Ready
        }
    }

    struct LifecycleDialer {
        stop: BTreeMap<String, StopBehavior>,
        dials: AtomicUsize,
    }

    #[async_trait]
    impl Dialer for LifecycleDialer {
        async fn dial(&self, host: &str) -> HubResult<Connection> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            let stop = self.stop.get(host).copied().unwrap_or(StopBehavior::Disconnect);
            let agent = Arc::new(LifecycleAgent {
                host: host.to_string(),
                stop,
            });
            Ok(Connection::new(host, agent, CancellationToken::new()))
        }
    }

    struct NoCatalog;

    #[async_trait]
    impl CatalogConnector for NoCatalog {
        async fn connect(&self, _dir: &str, _utility: bool) -> HubResult<Arc<dyn Catalog>> {
            Err(HubError::catalog("no catalog"))
        }
    }

    fn hub(stop: &[(&str, StopBehavior)]) -> (Hub, Arc<LifecycleDialer>) {
        let dialer = Arc::new(LifecycleDialer {
            stop: stop.iter().map(|(h, b)| (h.to_string(), *b)).collect(),
            dials: AtomicUsize::new(0),
        });
        let mut config = Config::default();
        config.hub.hostnames = stop.iter().map(|(h, _)| h.to_string()).collect();
        let hub = Hub::new(
            config,
            dialer.clone(),
            Arc::new(NoCatalog),
            Arc::new(GpHomeCommands::new("/usr/local/gpdb")),
        );
        (hub, dialer)
    }

    #[tokio::test]
    async fn test_stop_agents_counts_disconnect_as_stopped() {
        let (hub, dialer) = hub(&[("sdw1", StopBehavior::Disconnect), ("sdw2", StopBehavior::Disconnect)]);

        hub.stop_agents().await.unwrap();
        assert!(hub.connections().connections().await.is_empty());

        // A discarded pool is dialed again
        hub.dial_all_agents().await.unwrap();
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_stop_agents_reply_means_not_stopped() {
        let (hub, _dialer) = hub(&[("sdw1", StopBehavior::Disconnect), ("sdw2", StopBehavior::Reply)]);

        let err = hub.stop_agents().await.unwrap_err();
        assert_eq!(err.to_string(), "host: sdw2, failed to stop agent on host sdw2");
        assert!(hub.connections().connections().await.is_empty());
    }

    #[tokio::test]
    async fn test_stop_agents_other_error() {
        let (hub, _dialer) = hub(&[("sdw1", StopBehavior::Refuse)]);

        let err = hub.stop_agents().await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "host: sdw1, failed to stop agent on host sdw1: permission denied"
        );
    }

    #[tokio::test]
    async fn test_status_agents_sorted_by_host() {
        let (hub, _dialer) = hub(&[("sdw2", StopBehavior::Reply), ("cdw", StopBehavior::Reply)]);

        let statuses = hub.status_agents().await.unwrap();
        let hosts: Vec<_> = statuses.iter().map(|s| s.host.as_str()).collect();
        assert_eq!(hosts, vec!["cdw", "sdw2"]);
        assert_eq!(statuses[0].pid, 4242);
        assert_eq!(statuses[0].status, "running");
    }

    #[tokio::test]
    async fn test_get_all_hostnames_bypasses_pool() {
        let (hub, dialer) = hub(&[("cdw", StopBehavior::Reply)]);

        let addrs = vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()];
        let names = hub.get_all_hostnames(&addrs).await.unwrap();
        assert_eq!(names["10.0.0.1"], "10.0.0.1.example");
        assert_eq!(names.len(), 2);
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 2);
        assert!(hub.connections().connections().await.is_empty());
    }
}
