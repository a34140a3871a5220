/// Mirror attachment for a running mirrorless cluster
use super::{for_each_on_host, log_and_return, INITIALIZING_MIRRORS};
use crate::agent::{
    PgBasebackupRequest, StartSegmentRequest, UpdatePgConfRequest, UpdatePgHbaConfRequest,
    EXECUTE_MODE_OPTIONS, REPLICATION_SLOT_NAME,
};
use crate::catalog::read_gparray;
use crate::core::connection::{connections_by_host, Connection};
use crate::core::{AddMirrorsRequest, GpArray, Segment};
use crate::error::{HubError, HubResult};
use crate::stream::HubStream;
use crate::Hub;
use fnv::FnvHashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// A registered mirror together with the primary it copies from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorPlacement {
    pub primary: Segment,
    pub mirror: Segment,
}

/// Mirrors may only be added when there is exactly one per primary
pub fn check_mirror_count(gparray: &GpArray, mirrors: &[Segment]) -> HubResult<()> {
    let primaries = gparray.primary_segments().len();
    if primaries != mirrors.len() {
        return Err(HubError::validation(format!(
            "number of mirrors {} is not equal to the number of primaries {} present in the cluster",
            mirrors.len(),
            primaries
        )));
    }
    Ok(())
}

/// Look up the registered pair for every requested mirror
pub fn placements_for(gparray: &GpArray, mirrors: &[Segment]) -> HubResult<Vec<MirrorPlacement>> {
    mirrors
        .iter()
        .map(|seg| {
            let pair = gparray.segment_pair_for_content(seg.content_id)?;
            let mirror = pair.mirror.clone().ok_or_else(|| {
                HubError::catalog(format!("no mirror registered for content {}", seg.content_id))
            })?;
            Ok(MirrorPlacement {
                primary: pair.primary.clone(),
                mirror,
            })
        })
        .collect()
}

fn group_placements<F>(placements: &[MirrorPlacement], host_of: F) -> BTreeMap<String, Vec<MirrorPlacement>>
where
    F: Fn(&MirrorPlacement) -> &str,
{
    let mut groups: BTreeMap<String, Vec<MirrorPlacement>> = BTreeMap::new();
    for placement in placements {
        groups
            .entry(host_of(placement).to_string())
            .or_default()
            .push(placement.clone());
    }
    groups
}

/// Interface addresses reported by the agent on `host`
async fn interface_addrs(
    conns: &FnvHashMap<String, Arc<Connection>>,
    host: &str,
) -> HubResult<Vec<String>> {
    let conn = conns
        .get(host)
        .ok_or_else(|| HubError::validation(format!("no agent connection for host {}", host)))?;

    conn.agent().get_interface_addrs().await.map_err(|e| {
        HubError::remote(
            host,
            format!("failed to get interface addresses for host {}: {}", host, e),
        )
    })
}

/// Admit every mirror to the replication entries of its primary and reload
async fn update_hba_with_mirror_entries(
    conns: &[Arc<Connection>],
    placements: &[MirrorPlacement],
    hba_hostnames: bool,
) -> HubResult<()> {
    let plan = group_placements(placements, |p| p.primary.hostname.as_str());
    let by_host = Arc::new(connections_by_host(conns));

    for_each_on_host(conns, &plan, move |conn, placement: MirrorPlacement| {
        let by_host = Arc::clone(&by_host);
        async move {
            let host = conn.hostname().to_string();
            let addrs = if hba_hostnames {
                vec![
                    placement.primary.address.clone(),
                    placement.mirror.address.clone(),
                ]
            } else {
                let mut addrs = interface_addrs(&by_host, &placement.primary.hostname).await?;
                addrs.extend(interface_addrs(&by_host, &placement.mirror.hostname).await?);
                addrs
            };

            debug!(
                "Adding replication entries {:?} to pg_hba.conf of {} on host {}",
                addrs, placement.primary.data_directory, host
            );
            conn.agent()
                .update_pg_hba_conf_and_reload(UpdatePgHbaConfRequest {
                    pgdata: placement.primary.data_directory.clone(),
                    addrs,
                    replication: true,
                })
                .await
                .map_err(|e| e.on_host(&host))
        }
    })
    .await
}

/// Copy every mirror from its primary and give it its own port
async fn create_mirror_segments(
    conns: &[Arc<Connection>],
    placements: &[MirrorPlacement],
    stream: &HubStream,
) -> HubResult<()> {
    let plan = group_placements(placements, |p| p.mirror.hostname.as_str());

    let total = placements.len() as u32;
    stream.send_progress(INITIALIZING_MIRRORS, total);

    for_each_on_host(conns, &plan, move |conn, placement: MirrorPlacement| {
        let stream = stream.clone();
        async move {
            let host = conn.hostname().to_string();
            let MirrorPlacement { primary, mirror } = placement;
            debug!("Starting to create mirror segment: {}", mirror);

            conn.agent()
                .pg_basebackup(PgBasebackupRequest {
                    target_dir: mirror.data_directory.clone(),
                    source_host: primary.hostname.clone(),
                    source_port: primary.port,
                    create_slot: true,
                    force_overwrite: false,
                    target_dbid: mirror.dbid,
                    write_recovery_conf: true,
                    replication_slot_name: REPLICATION_SLOT_NAME.to_string(),
                    exclude_paths: Vec::new(),
                })
                .await
                .map_err(|e| e.on_host(&host))?;
            debug!(
                "Successfully ran pg_basebackup on segment with data directory {} on host {}",
                primary.data_directory, primary.hostname
            );

            let mut params = BTreeMap::new();
            params.insert("port".to_string(), mirror.port.to_string());
            conn.agent()
                .update_pg_conf(UpdatePgConfRequest {
                    pgdata: mirror.data_directory.clone(),
                    params,
                    overwrite: true,
                })
                .await
                .map_err(|e| e.on_host(&host))?;

            stream.send_progress(INITIALIZING_MIRRORS, total);
            debug!("Successfully created mirror segment: {}", mirror);
            Ok(())
        }
    })
    .await
}

async fn start_mirror_segments(conns: &[Arc<Connection>], placements: &[MirrorPlacement]) -> HubResult<()> {
    let plan = group_placements(placements, |p| p.mirror.hostname.as_str());

    for_each_on_host(conns, &plan, |conn, placement: MirrorPlacement| async move {
        let host = conn.hostname().to_string();
        conn.agent()
            .start_segment(StartSegmentRequest {
                data_dir: placement.mirror.data_directory,
                wait: true,
                options: EXECUTE_MODE_OPTIONS.to_string(),
            })
            .await
            .map_err(|e| e.on_host(&host))
    })
    .await
}

impl Hub {
    /// Attach one mirror per primary to a running mirrorless cluster.
    ///
    /// Nothing is registered unless the mirror count matches the primary
    /// count and the cluster has no mirrors yet.
    pub async fn add_mirrors(&self, request: AddMirrorsRequest, stream: &HubStream) -> HubResult<()> {
        log_and_return(self.run_add_mirrors(request, stream).await)
    }

    pub(crate) async fn run_add_mirrors(&self, request: AddMirrorsRequest, stream: &HubStream) -> HubResult<()> {
        stream.send_log("Starting to add mirrors to the cluster");

        let conns = self.dial_all_agents().await?;

        let catalog = self
            .catalog()
            .connect(&request.coordinator_data_dir, true)
            .await?;
        let gparray = read_gparray(catalog.as_ref()).await?;

        stream.send_log(
            "Checking if the number of primary segments and the number of mirrors to add are equal",
        );
        check_mirror_count(&gparray, &request.mirrors)?;

        stream.send_log("Checking if the cluster already has mirrors");
        if gparray.has_mirrors() {
            return Err(HubError::validation(
                "cannot add mirrors, the cluster is already configured with mirrors",
            ));
        }

        Hub::require_hosts(
            &conns,
            gparray
                .primary_segments()
                .into_iter()
                .chain(request.mirrors.iter())
                .map(|seg| seg.hostname.as_str()),
        )?;

        stream.send_log("Starting to register mirror segments with the coordinator");
        catalog.register_mirrors(&request.mirrors).await?;
        stream.send_log("Successfully registered the mirror segments with the coordinator");

        let gparray = read_gparray(catalog.as_ref()).await?;
        let placements = placements_for(&gparray, &request.mirrors)?;

        stream.send_log("Starting to modify the pg_hba.conf on the primary segments to add mirror entries");
        update_hba_with_mirror_entries(&conns, &placements, request.hba_hostnames).await?;
        stream.send_log("Successfully modified the pg_hba.conf on the primary segments");

        stream.send_log("Creating mirror segments");
        create_mirror_segments(&conns, &placements, stream).await?;
        stream.send_log("Successfully created mirror segments");

        stream.send_log("Starting up the mirror segments");
        start_mirror_segments(&conns, &placements).await?;
        stream.send_log("Successfully started the mirror segments");

        stream.send_log("Triggering FTS probe");
        self.catalog()
            .connect(&request.coordinator_data_dir, false)
            .await?
            .trigger_fts_probe()
            .await?;

        info!("Added {} mirrors", placements.len());
        stream.send_log("Mirror segments have been added");
        stream.send_log("Data synchronization might be in progress and will continue in the background");
        stream.send_log("Use 'gpstate -s' to check the resynchronization progress");
        Ok(())
    }
}
