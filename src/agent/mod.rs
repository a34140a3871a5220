/// Operations the hub invokes on the per-host agents
///
/// The agents themselves live elsewhere; the hub only depends on the
/// `AgentClient` trait below. `transport` provides the framed TLS client used
/// in production, tests substitute in-memory implementations.
pub mod transport;

use crate::core::connection::ChannelState;
use crate::core::{Locale, Segment};
use crate::error::HubResult;
use crate::stream::LogLevel;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Slot name used when streaming a mirror from its primary
pub const REPLICATION_SLOT_NAME: &str = "internal_wal_replication_slot";

/// Start options for a coordinator brought up before the cluster exists
pub const UTILITY_MODE_OPTIONS: &str = "-c gp_role=utility";

/// Start options for mirrors joining a running cluster
pub const EXECUTE_MODE_OPTIONS: &str = "-c gp_role=execute";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MakeSegmentRequest {
    pub segment: Segment,
    pub locale: Locale,
    pub encoding: String,
    pub seg_config: BTreeMap<String, String>,
    pub coordinator_addrs: Vec<String>,
    pub hba_hostnames: bool,
    pub data_checksums: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartSegmentRequest {
    pub data_dir: String,
    pub wait: bool,
    pub options: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatePgConfRequest {
    pub pgdata: String,
    pub params: BTreeMap<String, String>,
    pub overwrite: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatePgHbaConfRequest {
    pub pgdata: String,
    pub addrs: Vec<String>,
    pub replication: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PgBasebackupRequest {
    pub target_dir: String,
    pub source_host: String,
    pub source_port: u16,
    /// Agent drops an existing slot of the same name before creating it
    pub create_slot: bool,
    pub force_overwrite: bool,
    pub target_dbid: i32,
    pub write_recovery_conf: bool,
    pub replication_slot_name: String,
    #[serde(default)]
    pub exclude_paths: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateHostEnvRequest {
    pub directory_list: Vec<String>,
    pub locale: Locale,
    pub port_list: Vec<u16>,
    pub forced: bool,
    pub host_address_list: Vec<String>,
    pub gp_version: String,
}

/// Warning or informational finding reported by host validation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMessage {
    pub message: String,
    pub level: LogLevel,
}

/// Agent service state on one host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub host: String,
    pub status: String,
    pub uptime: String,
    pub pid: u32,
}

/// Agent RPC surface used by the hub.
///
/// Every call is a single request and a single reply. Failures reported by
/// the agent come back as `HubError::Rpc` carrying the agent's message;
/// callers attribute them to a host with `HubError::on_host`.
#[async_trait]
pub trait AgentClient: Send + Sync {
    async fn make_segment(&self, req: MakeSegmentRequest) -> HubResult<()>;

    async fn start_segment(&self, req: StartSegmentRequest) -> HubResult<()>;

    async fn update_pg_conf(&self, req: UpdatePgConfRequest) -> HubResult<()>;

    async fn update_pg_hba_conf_and_reload(&self, req: UpdatePgHbaConfRequest) -> HubResult<()>;

    async fn pg_basebackup(&self, req: PgBasebackupRequest) -> HubResult<()>;

    async fn get_interface_addrs(&self) -> HubResult<Vec<String>>;

    async fn validate_host_env(&self, req: ValidateHostEnvRequest) -> HubResult<Vec<LogMessage>>;

    async fn get_hostname(&self) -> HubResult<String>;

    async fn status(&self) -> HubResult<ServiceStatus>;

    async fn stop(&self) -> HubResult<()>;

    /// Transport state of the underlying channel
    fn state(&self) -> ChannelState;
}
