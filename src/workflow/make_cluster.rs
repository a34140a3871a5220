/// Cluster bring-up
use super::{
    conns_with_work, for_each_on_host, log_and_return, INITIALIZING_PRIMARIES, VALIDATING_HOSTS,
};
use crate::agent::{
    LogMessage, MakeSegmentRequest, StartSegmentRequest, ValidateHostEnvRequest,
    UTILITY_MODE_OPTIONS,
};
use crate::catalog::{self, read_gparray};
use crate::commands::LocalCommands;
use crate::core::connection::{connections_for_hosts, Connection};
use crate::core::rpc::{execute_rpc, group_by_host};
use crate::core::{
    AddMirrorsRequest, ClusterParams, GpArray, MakeClusterRequest, Role, Segment,
    COORDINATOR_CONTENT_ID, COORDINATOR_DBID,
};
use crate::error::{HubError, HubResult};
use crate::stream::HubStream;
use crate::Hub;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

/// What one host is asked to check before anything is created on it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostValidation {
    pub directories: Vec<String>,
    pub ports: Vec<u16>,
    pub addresses: BTreeSet<String>,
}

/// Per-host validation work for every segment of the request
pub fn validation_plan(request: &MakeClusterRequest) -> BTreeMap<String, HostValidation> {
    let mut plan: BTreeMap<String, HostValidation> = BTreeMap::new();
    for seg in request.all_segments() {
        let entry = plan.entry(seg.hostname.clone()).or_default();
        entry.directories.push(seg.data_directory.clone());
        entry.ports.push(seg.port);
        entry.addresses.insert(seg.address.clone());
    }
    plan
}

/// Mirrors of the request carrying the content id the catalog assigned to
/// the primary each one follows
pub fn populate_mirror_content_ids(
    gparray: &GpArray,
    request: &MakeClusterRequest,
) -> HubResult<Vec<Segment>> {
    request
        .segment_pairs
        .iter()
        .filter_map(|pair| pair.mirror.as_ref().map(|mirror| (&pair.primary, mirror)))
        .map(|(primary, mirror)| {
            let mut mirror = mirror.clone();
            mirror.content_id = gparray.content_id_of(primary)?;
            mirror.role = Role::Mirror;
            mirror.preferred_role = Role::Mirror;
            Ok(mirror)
        })
        .collect()
}

fn make_segment_request(
    seg: &Segment,
    params: &ClusterParams,
    coordinator_addrs: &[String],
) -> MakeSegmentRequest {
    MakeSegmentRequest {
        segment: seg.clone(),
        locale: params.locale.clone(),
        encoding: params.encoding.clone(),
        seg_config: params.config_for(seg),
        coordinator_addrs: coordinator_addrs.to_vec(),
        hba_hostnames: params.hba_hostnames,
        data_checksums: params.data_checksums,
    }
}

/// Stop the coordinator, reporting the shutdown on the stream
pub(crate) async fn stop_coordinator(
    commands: &dyn LocalCommands,
    data_dir: &str,
    stream: &HubStream,
) -> HubResult<()> {
    stream.send_log("Shutting down coordinator segment");
    commands.stop_coordinator(data_dir).await?;
    stream.send_log("Successfully shut down coordinator segment");
    Ok(())
}

/// Stops the coordinator unless disarmed. Armed once the coordinator runs
/// and disarmed when every primary exists.
#[must_use]
pub(crate) struct CoordinatorRollback {
    commands: Option<Arc<dyn LocalCommands>>,
    stream: HubStream,
    data_dir: String,
}

impl CoordinatorRollback {
    pub(crate) fn arm(commands: Arc<dyn LocalCommands>, stream: HubStream, data_dir: String) -> Self {
        Self {
            commands: Some(commands),
            stream,
            data_dir,
        }
    }

    pub(crate) fn disarm(mut self) {
        self.commands = None;
    }

    /// Shut the coordinator down now. Failures are only logged.
    pub(crate) async fn rollback(mut self) {
        if let Some(commands) = self.commands.take() {
            shutdown_after_failure(commands, self.stream.clone(), self.data_dir.clone()).await;
        }
    }
}

async fn shutdown_after_failure(commands: Arc<dyn LocalCommands>, stream: HubStream, data_dir: String) {
    stream.send_log("Not able to create the cluster, proceeding to shutdown the coordinator segment");
    if let Err(e) = stop_coordinator(commands.as_ref(), &data_dir, &stream).await {
        error!("{}", e);
    }
}

impl Drop for CoordinatorRollback {
    fn drop(&mut self) {
        // Reached only when the workflow unwound without deciding
        if let Some(commands) = self.commands.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(shutdown_after_failure(
                    commands,
                    self.stream.clone(),
                    self.data_dir.clone(),
                ));
            }
        }
    }
}

impl Hub {
    /// Bring up a new cluster as described by `request`, streaming progress
    /// to the caller.
    pub async fn make_cluster(&self, request: MakeClusterRequest, stream: &HubStream) -> HubResult<()> {
        log_and_return(self.run_make_cluster(request, stream).await)
    }

    async fn run_make_cluster(&self, request: MakeClusterRequest, stream: &HubStream) -> HubResult<()> {
        request.validate_layout()?;

        let conns = self.dial_all_agents().await?;
        let hosts = request.hostnames();
        Hub::require_hosts(&conns, hosts.iter().map(String::as_str))?;

        stream.send_log("Starting to create the cluster");
        self.validate_environment(&conns, &request, stream)
            .await
            .map_err(|e| e.context("validating hosts"))?;

        let mut coordinator = request.coordinator.clone();
        coordinator.content_id = COORDINATOR_CONTENT_ID;
        coordinator.dbid = COORDINATOR_DBID;
        coordinator.role = Role::Primary;
        coordinator.preferred_role = Role::Primary;

        stream.send_log("Creating coordinator segment");
        self.create_and_start_coordinator(&conns, &coordinator, &request.cluster_params)
            .await?;
        stream.send_log("Successfully created coordinator segment");

        let rollback = CoordinatorRollback::arm(
            Arc::clone(self.commands()),
            stream.clone(),
            coordinator.data_directory.clone(),
        );
        let gparray = match self
            .register_and_create_primaries(&conns, &request, &coordinator, stream)
            .await
        {
            Ok(gparray) => {
                rollback.disarm();
                gparray
            }
            Err(e) => {
                rollback.rollback().await;
                return Err(e);
            }
        };

        stream.send_log("Restarting the cluster in production mode");
        stop_coordinator(self.commands().as_ref(), &coordinator.data_directory, stream).await?;
        self.commands()
            .start_cluster(&coordinator.data_directory, request.verbose, stream)
            .await?;
        stream.send_log("Completed restart of the cluster in production mode");

        self.finalize_catalog(&coordinator.data_directory, &request.cluster_params, stream)
            .await?;

        if !request.is_mirrorless() {
            let mirrors = populate_mirror_content_ids(&gparray, &request)?;
            self.run_add_mirrors(
                AddMirrorsRequest {
                    coordinator_data_dir: coordinator.data_directory.clone(),
                    mirrors,
                    hba_hostnames: request.cluster_params.hba_hostnames,
                },
                stream,
            )
            .await?;
        }

        info!("Cluster with coordinator {} created", coordinator.data_directory);
        stream.send_log("Successfully created the cluster");
        Ok(())
    }

    /// Ask every participating host to validate its environment. Findings
    /// are streamed only once every host has answered.
    async fn validate_environment(
        &self,
        conns: &[Arc<Connection>],
        request: &MakeClusterRequest,
        stream: &HubStream,
    ) -> HubResult<()> {
        let plan = Arc::new(validation_plan(request));
        debug!("Host validation plan: {:?}", plan);

        let gp_version = self.commands().engine_version().await?;

        let total = plan.len() as u32;
        stream.send_progress(VALIDATING_HOSTS, total);

        let replies: Arc<Mutex<Vec<(String, Vec<LogMessage>)>>> = Arc::new(Mutex::new(Vec::new()));
        let targets = conns_with_work(conns, &plan);

        let result = {
            let replies = Arc::clone(&replies);
            let locale = request.cluster_params.locale.clone();
            let forced = request.force;
            execute_rpc(&targets, move |conn| {
                let plan = Arc::clone(&plan);
                let replies = Arc::clone(&replies);
                let stream = stream.clone();
                let locale = locale.clone();
                let gp_version = gp_version.clone();
                async move {
                    let host = conn.hostname().to_string();
                    let entry = match plan.get(&host) {
                        Some(entry) => entry,
                        None => return Ok(()),
                    };
                    debug!("Starting to validate host: {}", host);

                    let req = ValidateHostEnvRequest {
                        directory_list: entry.directories.clone(),
                        locale,
                        port_list: entry.ports.clone(),
                        forced,
                        host_address_list: entry.addresses.iter().cloned().collect(),
                        gp_version,
                    };
                    let messages = conn
                        .agent()
                        .validate_host_env(req)
                        .await
                        .map_err(|e| e.on_host(&host))?;

                    stream.send_progress(VALIDATING_HOSTS, total);
                    debug!("Successfully completed validation for host: {}", host);
                    replies.lock().await.push((host, messages));
                    Ok(())
                }
            })
            .await
        };

        let mut replies = std::mem::take(&mut *replies.lock().await);
        replies.sort_by(|a, b| a.0.cmp(&b.0));
        for (host, messages) in replies {
            for msg in messages {
                stream.send_log_level(format!("Host: {} {}", host, msg.message), msg.level);
            }
        }

        result
    }

    async fn create_and_start_coordinator(
        &self,
        conns: &[Arc<Connection>],
        coordinator: &Segment,
        params: &ClusterParams,
    ) -> HubResult<()> {
        let targets = connections_for_hosts(conns, &[coordinator.hostname.as_str()]);
        if targets.is_empty() {
            return Err(HubError::validation(format!(
                "no agent connection for coordinator host {}",
                coordinator.hostname
            )));
        }

        let make = make_segment_request(coordinator, params, &[]);
        execute_rpc(&targets, move |conn| {
            let make = make.clone();
            async move {
                let host = conn.hostname().to_string();
                let data_dir = make.segment.data_directory.clone();
                conn.agent()
                    .make_segment(make)
                    .await
                    .map_err(|e| e.on_host(&host))?;
                conn.agent()
                    .start_segment(StartSegmentRequest {
                        data_dir,
                        wait: true,
                        options: UTILITY_MODE_OPTIONS.to_string(),
                    })
                    .await
                    .map_err(|e| e.on_host(&host))
            }
        })
        .await
    }

    async fn register_and_create_primaries(
        &self,
        conns: &[Arc<Connection>],
        request: &MakeClusterRequest,
        coordinator: &Segment,
        stream: &HubStream,
    ) -> HubResult<GpArray> {
        stream.send_log("Starting to register primary segments with the coordinator");
        let catalog = self
            .catalog()
            .connect(&coordinator.data_directory, true)
            .await?;
        catalog.register_coordinator(coordinator).await?;

        let primaries: Vec<Segment> = request.primary_segments().into_iter().cloned().collect();
        catalog.register_primaries(&primaries).await?;
        stream.send_log("Successfully registered primary segments with the coordinator");

        let gparray = read_gparray(catalog.as_ref()).await?;

        let coordinator_addrs = if request.cluster_params.hba_hostnames {
            vec![coordinator.address.clone()]
        } else {
            self.commands().host_addrs_no_loopback()?
        };

        stream.send_log("Creating primary segments");
        let segs: Vec<Segment> = gparray.primary_segments().into_iter().cloned().collect();
        self.create_segments(conns, &segs, &request.cluster_params, &coordinator_addrs, stream)
            .await?;
        stream.send_log("Successfully created primary segments");

        Ok(gparray)
    }

    /// Create registered primaries in parallel, grouped by host
    async fn create_segments(
        &self,
        conns: &[Arc<Connection>],
        segs: &[Segment],
        params: &ClusterParams,
        coordinator_addrs: &[String],
        stream: &HubStream,
    ) -> HubResult<()> {
        let plan: BTreeMap<String, Vec<MakeSegmentRequest>> = group_by_host(segs)
            .into_iter()
            .map(|(host, segs)| {
                let requests = segs
                    .iter()
                    .map(|seg| make_segment_request(seg, params, coordinator_addrs))
                    .collect();
                (host, requests)
            })
            .collect();

        let total = segs.len() as u32;
        stream.send_progress(INITIALIZING_PRIMARIES, total);

        for_each_on_host(conns, &plan, move |conn, req: MakeSegmentRequest| {
            let stream = stream.clone();
            async move {
                let host = conn.hostname().to_string();
                let segment = req.segment.clone();
                debug!("Starting to create primary segment: {}", segment);
                conn.agent()
                    .make_segment(req)
                    .await
                    .map_err(|e| e.on_host(&host))?;
                stream.send_progress(INITIALIZING_PRIMARIES, total);
                debug!("Successfully created primary segment: {}", segment);
                Ok(())
            }
        })
        .await
    }

    /// Extensions, collations, the requested database and the superuser
    /// password, all on the cluster running in production mode
    async fn finalize_catalog(
        &self,
        coordinator_data_dir: &str,
        params: &ClusterParams,
        stream: &HubStream,
    ) -> HubResult<()> {
        let catalog = self.catalog().connect(coordinator_data_dir, false).await?;

        stream.send_log("Creating core extensions");
        catalog::create_gp_toolkit_ext(catalog.as_ref()).await?;
        stream.send_log("Successfully created core extensions");

        stream.send_log("Importing system collations");
        catalog::import_collations(catalog.as_ref()).await?;

        if let Some(dbname) = params.db_name.as_deref().filter(|name| !name.is_empty()) {
            stream.send_log(format!("Creating database {:?}", dbname));
            catalog::create_database(catalog.as_ref(), dbname).await?;
        }

        stream.send_log("Setting superuser password");
        let user = self.commands().current_user()?;
        catalog::set_user_password(catalog.as_ref(), &user, &params.su_password).await
    }
}
