#![allow(dead_code)]

use async_trait::async_trait;
use clusterhub::agent::*;
use clusterhub::catalog::{Catalog, CatalogConnector};
use clusterhub::commands::LocalCommands;
use clusterhub::config::Config;
use clusterhub::core::connection::{ChannelState, Connection, Dialer};
use clusterhub::core::{Role, Segment, COORDINATOR_CONTENT_ID, COORDINATOR_DBID};
use clusterhub::error::{HubError, HubResult};
use clusterhub::stream::{HubReply, HubStream, LogLevel};
use clusterhub::Hub;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

/// Agent that records every call and fails the ones it is told to
#[derive(Default)]
pub struct MemoryAgent {
    pub host: String,
    pub calls: Mutex<Vec<String>>,
    /// Data directories whose segment creation fails
    pub fail_make_segment: Vec<String>,
    pub validation_error: Option<String>,
    pub validation_warnings: Vec<String>,
    pub interface_addrs: Vec<String>,
}

impl MemoryAgent {
    pub fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            interface_addrs: vec![format!("{}-addr/24", host)],
            ..Default::default()
        }
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_starting_with(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| call.starts_with(prefix))
            .collect()
    }
}

#[async_trait]
impl AgentClient for MemoryAgent {
    async fn make_segment(&self, req: MakeSegmentRequest) -> HubResult<()> {
        self.record(format!(
            "make_segment {} coordinator_addrs={}",
            req.segment.data_directory,
            req.coordinator_addrs.join(",")
        ));
        if self.fail_make_segment.contains(&req.segment.data_directory) {
            return Err(HubError::rpc(format!(
                "initdb failed for {}",
                req.segment.data_directory
            )));
        }
        Ok(())
    }

    async fn start_segment(&self, req: StartSegmentRequest) -> HubResult<()> {
        self.record(format!("start_segment {} {}", req.data_dir, req.options));
        Ok(())
    }

    async fn update_pg_conf(&self, req: UpdatePgConfRequest) -> HubResult<()> {
        let params: Vec<String> = req.params.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        self.record(format!("update_pg_conf {} {}", req.pgdata, params.join(",")));
        Ok(())
    }

    async fn update_pg_hba_conf_and_reload(&self, req: UpdatePgHbaConfRequest) -> HubResult<()> {
        self.record(format!(
            "update_pg_hba {} {} replication={}",
            req.pgdata,
            req.addrs.join(","),
            req.replication
        ));
        Ok(())
    }

    async fn pg_basebackup(&self, req: PgBasebackupRequest) -> HubResult<()> {
        self.record(format!(
            "pg_basebackup {} from {}:{} dbid={} slot={}",
            req.target_dir, req.source_host, req.source_port, req.target_dbid, req.replication_slot_name
        ));
        Ok(())
    }

    async fn get_interface_addrs(&self) -> HubResult<Vec<String>> {
        Ok(self.interface_addrs.clone())
    }

    async fn validate_host_env(&self, req: ValidateHostEnvRequest) -> HubResult<Vec<LogMessage>> {
        self.record(format!(
            "validate_host_env {} version={}",
            req.directory_list.join(","),
            req.gp_version
        ));
        if let Some(message) = &self.validation_error {
            return Err(HubError::rpc(message.clone()));
        }
        Ok(self
            .validation_warnings
            .iter()
            .map(|message| LogMessage {
                message: message.clone(),
                level: LogLevel::Warning,
            })
            .collect())
    }

    async fn get_hostname(&self) -> HubResult<String> {
        Ok(self.host.clone())
    }

    async fn status(&self) -> HubResult<ServiceStatus> {
        Ok(ServiceStatus {
            host: self.host.clone(),
            status: "running".to_string(),
            uptime: "1h".to_string(),
            pid: 100,
        })
    }

    async fn stop(&self) -> HubResult<()> {
        Err(HubError::unavailable(&self.host, "connection closed"))
    }

    fn state(&self) -> ChannelState {
        ChannelState::Ready
    }
}

/// Hands out pre-built agents by hostname
pub struct MemoryDialer {
    pub agents: BTreeMap<String, Arc<MemoryAgent>>,
}

impl MemoryDialer {
    pub fn new(agents: Vec<MemoryAgent>) -> Self {
        Self {
            agents: agents
                .into_iter()
                .map(|agent| (agent.host.clone(), Arc::new(agent)))
                .collect(),
        }
    }

    pub fn agent(&self, host: &str) -> Arc<MemoryAgent> {
        Arc::clone(&self.agents[host])
    }
}

#[async_trait]
impl Dialer for MemoryDialer {
    async fn dial(&self, host: &str) -> HubResult<Connection> {
        let agent = self
            .agents
            .get(host)
            .ok_or_else(|| HubError::connection(host, "no route to host"))?;
        Ok(Connection::new(host, Arc::clone(agent) as Arc<dyn AgentClient>, CancellationToken::new()))
    }
}

/// Catalog keeping the segment configuration in memory, numbering segments
/// the way the coordinator does
#[derive(Default)]
pub struct MemoryCatalog {
    pub rows: Mutex<Vec<Segment>>,
    pub statements: Mutex<Vec<(String, String)>>,
    pub connects: Mutex<Vec<(String, bool)>>,
    pub mirror_registrations: Mutex<usize>,
    pub fts_probes: Mutex<usize>,
    /// Statements starting with any of these prefixes fail
    pub fail_statements: Vec<String>,
}

impl MemoryCatalog {
    /// A running mirrorless cluster: coordinator on cdw, one primary per host
    pub fn with_primaries(hosts: &[&str]) -> Self {
        let catalog = Self::default();
        {
            let mut rows = catalog.rows.lock().unwrap();
            let mut coordinator = Segment::new("cdw", "cdw", 7000, "/data/coordinator/gpseg-1");
            coordinator.content_id = COORDINATOR_CONTENT_ID;
            coordinator.dbid = COORDINATOR_DBID;
            rows.push(coordinator);
            for (content, host) in hosts.iter().enumerate() {
                let mut primary =
                    Segment::new(*host, *host, 7002, format!("/data/primary/gpseg{}", content));
                primary.content_id = content as i32;
                primary.dbid = content as i32 + 2;
                rows.push(primary);
            }
        }
        catalog
    }

    pub fn rows(&self) -> Vec<Segment> {
        self.rows.lock().unwrap().clone()
    }

    pub fn statements(&self) -> Vec<(String, String)> {
        self.statements.lock().unwrap().clone()
    }

    fn next_dbid(rows: &[Segment]) -> i32 {
        rows.iter().map(|seg| seg.dbid).max().unwrap_or(0) + 1
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn read_segments(&self) -> HubResult<Vec<Segment>> {
        let mut rows = self.rows();
        rows.sort_by(|a, b| {
            a.content_id
                .cmp(&b.content_id)
                .then_with(|| b.role.as_char().cmp(&a.role.as_char()))
        });
        Ok(rows)
    }

    async fn register_coordinator(&self, coordinator: &Segment) -> HubResult<()> {
        let mut seg = coordinator.clone();
        seg.dbid = COORDINATOR_DBID;
        seg.content_id = COORDINATOR_CONTENT_ID;
        self.rows.lock().unwrap().push(seg);
        Ok(())
    }

    async fn register_primaries(&self, primaries: &[Segment]) -> HubResult<()> {
        let mut rows = self.rows.lock().unwrap();
        for (content, primary) in primaries.iter().enumerate() {
            let mut seg = primary.clone();
            seg.dbid = Self::next_dbid(&rows);
            seg.content_id = content as i32;
            seg.role = Role::Primary;
            seg.preferred_role = Role::Primary;
            rows.push(seg);
        }
        Ok(())
    }

    async fn register_mirrors(&self, mirrors: &[Segment]) -> HubResult<()> {
        *self.mirror_registrations.lock().unwrap() += 1;
        let mut rows = self.rows.lock().unwrap();
        for mirror in mirrors {
            let mut seg = mirror.clone();
            seg.dbid = Self::next_dbid(&rows);
            seg.role = Role::Mirror;
            seg.preferred_role = Role::Mirror;
            rows.push(seg);
        }
        Ok(())
    }

    async fn exec_on_database(&self, dbname: &str, statement: &str) -> HubResult<()> {
        if self
            .fail_statements
            .iter()
            .any(|prefix| statement.starts_with(prefix.as_str()))
        {
            return Err(HubError::catalog(format!("executing {:?}: permission denied", statement)));
        }
        self.statements
            .lock()
            .unwrap()
            .push((dbname.to_string(), statement.to_string()));
        Ok(())
    }

    async fn trigger_fts_probe(&self) -> HubResult<()> {
        *self.fts_probes.lock().unwrap() += 1;
        Ok(())
    }
}

pub struct MemoryCatalogConnector {
    pub catalog: Arc<MemoryCatalog>,
}

#[async_trait]
impl CatalogConnector for MemoryCatalogConnector {
    async fn connect(&self, coordinator_data_dir: &str, utility: bool) -> HubResult<Arc<dyn Catalog>> {
        self.catalog
            .connects
            .lock()
            .unwrap()
            .push((coordinator_data_dir.to_string(), utility));
        Ok(Arc::clone(&self.catalog) as Arc<dyn Catalog>)
    }
}

/// Local utilities that only record what they were asked to do
#[derive(Default)]
pub struct MemoryCommands {
    pub calls: Mutex<Vec<String>>,
}

impl MemoryCommands {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.calls().iter().filter(|call| call.starts_with(name)).count()
    }
}

#[async_trait]
impl LocalCommands for MemoryCommands {
    async fn engine_version(&self) -> HubResult<String> {
        Ok("postgres (Greenplum Database) 7.0.0".to_string())
    }

    async fn stop_coordinator(&self, data_dir: &str) -> HubResult<()> {
        self.calls.lock().unwrap().push(format!("stop_coordinator {}", data_dir));
        Ok(())
    }

    async fn start_cluster(&self, data_dir: &str, _verbose: bool, stream: &HubStream) -> HubResult<()> {
        self.calls.lock().unwrap().push(format!("start_cluster {}", data_dir));
        stream.send_stdout("gpstart:cdw:gpadmin-[INFO]:-Database successfully started\n");
        Ok(())
    }

    fn host_addrs_no_loopback(&self) -> HubResult<Vec<String>> {
        Ok(vec!["192.0.2.10/24".to_string()])
    }

    fn current_user(&self) -> HubResult<String> {
        Ok("gpadmin".to_string())
    }
}

pub struct Fixture {
    pub hub: Hub,
    pub dialer: Arc<MemoryDialer>,
    pub catalog: Arc<MemoryCatalog>,
    pub commands: Arc<MemoryCommands>,
}

impl Fixture {
    pub fn new(agents: Vec<MemoryAgent>, catalog: MemoryCatalog) -> Self {
        let dialer = Arc::new(MemoryDialer::new(agents));
        let catalog = Arc::new(catalog);
        let commands = Arc::new(MemoryCommands::default());

        let mut config = Config::default();
        config.hub.hostnames = dialer.agents.keys().cloned().collect();

        let hub = Hub::new(
            config,
            dialer.clone(),
            Arc::new(MemoryCatalogConnector {
                catalog: Arc::clone(&catalog),
            }),
            commands.clone(),
        );
        Self {
            hub,
            dialer,
            catalog,
            commands,
        }
    }
}

/// Every reply queued on a finished stream
pub fn drain(rx: &mut UnboundedReceiver<HubReply>) -> Vec<HubReply> {
    let mut replies = Vec::new();
    while let Ok(reply) = rx.try_recv() {
        replies.push(reply);
    }
    replies
}

pub fn log_messages(replies: &[HubReply]) -> Vec<String> {
    replies
        .iter()
        .filter_map(|reply| match reply {
            HubReply::Log { message, .. } => Some(message.clone()),
            _ => None,
        })
        .collect()
}

/// Position of `message` among the log lines, panicking when absent
pub fn log_position(logs: &[String], message: &str) -> usize {
    logs.iter()
        .position(|log| log == message)
        .unwrap_or_else(|| panic!("log {:?} not found in {:#?}", message, logs))
}
