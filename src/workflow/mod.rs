/// Cluster workflows driven by the hub
///
/// Each workflow is an `impl Hub` block. Errors are logged once where the
/// workflow gives up and returned unchanged to the caller.
pub mod add_mirrors;
pub mod agents;
pub mod make_cluster;

use crate::core::connection::Connection;
use crate::core::rpc::{execute_rpc, run_joined};
use crate::error::HubResult;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tracing::error;

pub(crate) const VALIDATING_HOSTS: &str = "Validating Hosts:";
pub(crate) const INITIALIZING_PRIMARIES: &str = "Initializing primary segments:";
pub(crate) const INITIALIZING_MIRRORS: &str = "Initializing mirror segments:";

/// Log a workflow failure before handing it back
pub(crate) fn log_and_return<T>(result: HubResult<T>) -> HubResult<T> {
    if let Err(e) = &result {
        error!("{}", e);
    }
    result
}

/// Connections for the hosts that have work in a per-host plan
pub(crate) fn conns_with_work<V>(
    conns: &[Arc<Connection>],
    plan: &BTreeMap<String, V>,
) -> Vec<Arc<Connection>> {
    conns
        .iter()
        .filter(|conn| plan.contains_key(conn.hostname()))
        .cloned()
        .collect()
}

/// Run `work` for every item of a per-host plan. Hosts run in parallel and
/// the items of one host run concurrently with their failures joined.
pub(crate) async fn for_each_on_host<T, F, Fut>(
    conns: &[Arc<Connection>],
    plan: &BTreeMap<String, Vec<T>>,
    work: F,
) -> HubResult<()>
where
    T: Clone,
    F: Fn(Arc<Connection>, T) -> Fut,
    Fut: Future<Output = HubResult<()>> + Send + 'static,
{
    let targets = conns_with_work(conns, plan);
    execute_rpc(&targets, |conn| {
        let tasks: Vec<Fut> = plan
            .get(conn.hostname())
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|item| work(Arc::clone(&conn), item))
            .collect();
        run_joined(tasks)
    })
    .await
}
