/// Agent connection pool
///
/// The hub keeps one authenticated channel per agent host. The pool is
/// established once and afterwards only health-checked: a channel that went
/// away is reported, never silently redialed, so an operation that needs
/// every host cannot run against a fleet that changed underneath it.
use crate::agent::AgentClient;
use crate::error::{HubError, HubResult};
use async_trait::async_trait;
use fnv::FnvHashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Transport state of an agent channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelState::Idle => write!(f, "IDLE"),
            ChannelState::Connecting => write!(f, "CONNECTING"),
            ChannelState::Ready => write!(f, "READY"),
            ChannelState::TransientFailure => write!(f, "TRANSIENT_FAILURE"),
            ChannelState::Shutdown => write!(f, "SHUTDOWN"),
        }
    }
}

/// A published channel to one agent host. Read-only once created.
pub struct Connection {
    hostname: String,
    agent: Arc<dyn AgentClient>,
    cancel: CancellationToken,
}

impl Connection {
    pub fn new<S: Into<String>>(
        hostname: S,
        agent: Arc<dyn AgentClient>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            agent,
            cancel,
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn agent(&self) -> &dyn AgentClient {
        self.agent.as_ref()
    }

    pub fn state(&self) -> ChannelState {
        self.agent.state()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ChannelState::Ready
    }

    /// Tear down the channel
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("hostname", &self.hostname)
            .field("state", &self.state())
            .finish()
    }
}

/// Strategy for opening a channel to the agent on a host
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, host: &str) -> HubResult<Connection>;
}

#[derive(Default)]
struct Pool {
    conns: Vec<Arc<Connection>>,
    /// Set once every requested host was dialed successfully
    established: bool,
}

/// Hub-wide pool of agent connections
pub struct ConnectionManager {
    dialer: Arc<dyn Dialer>,
    dial_timeout: Duration,
    pool: Mutex<Pool>,
}

impl ConnectionManager {
    pub fn new(dialer: Arc<dyn Dialer>, dial_timeout: Duration) -> Self {
        Self {
            dialer,
            dial_timeout,
            pool: Mutex::new(Pool::default()),
        }
    }

    pub fn dial_timeout(&self) -> Duration {
        self.dial_timeout
    }

    /// Make sure there is a ready connection for every host and return the
    /// pool.
    ///
    /// The first call dials each host with a bounded timeout and fails on the
    /// first host that cannot be reached; hosts dialed before the failure stay
    /// cached and are not dialed again. Once every host has been dialed the
    /// pool is only checked for readiness, unready hosts are reported and
    /// nothing is redialed.
    pub async fn ensure_connections(&self, hosts: &[String]) -> HubResult<Vec<Arc<Connection>>> {
        let mut pool = self.pool.lock().await;

        if !pool.established {
            for host in hosts {
                if pool.conns.iter().any(|c| c.hostname() == host) {
                    continue;
                }
                let conn = self.dial_host(host).await?;
                pool.conns.push(Arc::new(conn));
            }
            pool.established = true;
            info!("Connected to agents on {} hosts", pool.conns.len());
        }

        ensure_ready(&pool.conns)?;
        Ok(pool.conns.clone())
    }

    /// Dial a host on behalf of the caller without caching the result
    pub async fn dial_uncached(&self, host: &str) -> HubResult<Connection> {
        self.dial_host(host).await
    }

    async fn dial_host(&self, host: &str) -> HubResult<Connection> {
        debug!("Dialing agent on host {}", host);

        match timeout(self.dial_timeout, self.dialer.dial(host)).await {
            Ok(Ok(conn)) => {
                debug!("Successfully connected to agent on host {}", host);
                Ok(conn)
            }
            Ok(Err(e)) => {
                warn!("Failed to connect to agent on host {}: {}", host, e);
                Err(match e {
                    HubError::Connection { .. } => e,
                    other => HubError::connection(host, other.to_string()),
                })
            }
            Err(_) => {
                warn!(
                    "Timeout connecting to agent on host {} after {:?}",
                    host, self.dial_timeout
                );
                Err(HubError::timeout(format!("connecting to agent on host {}", host)))
            }
        }
    }

    /// Snapshot of the cached connections
    pub async fn connections(&self) -> Vec<Arc<Connection>> {
        self.pool.lock().await.conns.clone()
    }

    /// Close and forget every cached connection so the next call dials again
    pub async fn discard(&self) {
        let mut pool = self.pool.lock().await;
        for conn in pool.conns.drain(..) {
            conn.close();
        }
        pool.established = false;
        debug!("Discarded agent connection pool");
    }
}

/// Fail with the hostnames of every connection not in a ready state
pub fn ensure_ready(conns: &[Arc<Connection>]) -> HubResult<()> {
    let hosts: Vec<String> = conns
        .iter()
        .filter(|conn| !conn.is_ready())
        .map(|conn| conn.hostname().to_string())
        .collect();

    if hosts.is_empty() {
        Ok(())
    } else {
        Err(HubError::Unready { hosts })
    }
}

/// Connections for the given hosts, in pool order
pub fn connections_for_hosts(conns: &[Arc<Connection>], hosts: &[&str]) -> Vec<Arc<Connection>> {
    conns
        .iter()
        .filter(|conn| hosts.contains(&conn.hostname()))
        .cloned()
        .collect()
}

/// Index connections by hostname
pub fn connections_by_host(conns: &[Arc<Connection>]) -> FnvHashMap<String, Arc<Connection>> {
    conns
        .iter()
        .map(|conn| (conn.hostname().to_string(), Arc::clone(conn)))
        .collect()
}
