/// Parallel fan-out of agent calls
use super::connection::Connection;
use super::Segment;
use crate::error::{HubError, HubResult};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Run `work` once per connection, concurrently, and wait for every task.
///
/// Failures are collected in a queue sized to the number of connections so no
/// task ever blocks reporting. The call succeeds only when every task did;
/// otherwise the error of the first failing connection (in the order given)
/// is returned and the others are logged.
pub async fn execute_rpc<F, Fut>(conns: &[Arc<Connection>], work: F) -> HubResult<()>
where
    F: Fn(Arc<Connection>) -> Fut,
    Fut: Future<Output = HubResult<()>> + Send + 'static,
{
    if conns.is_empty() {
        return Ok(());
    }

    let (tx, mut rx) = mpsc::channel::<(usize, HubError)>(conns.len());

    let handles: Vec<_> = conns
        .iter()
        .enumerate()
        .map(|(index, conn)| {
            let tx = tx.clone();
            let host = conn.hostname().to_string();
            let fut = work(Arc::clone(conn));
            tokio::spawn(async move {
                if let Err(e) = fut.await {
                    debug!("RPC on host {} failed: {}", host, e);
                    // Capacity equals the task count so this never waits
                    let _ = tx.send((index, e)).await;
                }
            })
        })
        .collect();
    drop(tx);

    for (index, result) in join_all(handles).await.into_iter().enumerate() {
        if let Err(e) = result {
            let host = conns[index].hostname();
            return Err(HubError::internal(format!(
                "RPC task for host {} did not complete: {}",
                host, e
            )));
        }
    }

    let mut errors = Vec::new();
    while let Some(entry) = rx.recv().await {
        errors.push(entry);
    }
    errors.sort_by_key(|(index, _)| *index);

    let mut errors = errors.into_iter();
    match errors.next() {
        None => Ok(()),
        Some((_, first)) => {
            for (index, other) in errors {
                warn!(
                    "Additional RPC failure on host {}: {}",
                    conns[index].hostname(),
                    other
                );
            }
            Err(first)
        }
    }
}

/// Run the sub-tasks of one host concurrently and combine their failures
/// into a single error.
pub async fn run_joined<I, Fut>(tasks: I) -> HubResult<()>
where
    I: IntoIterator<Item = Fut>,
    Fut: Future<Output = HubResult<()>> + Send + 'static,
{
    let handles: Vec<_> = tasks.into_iter().map(tokio::spawn).collect();

    let mut errors = Vec::new();
    for result in join_all(handles).await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => errors.push(e),
            Err(e) => errors.push(HubError::internal(format!("sub-task did not complete: {}", e))),
        }
    }

    match HubError::join(errors) {
        None => Ok(()),
        Some(e) => Err(e),
    }
}

/// Group segments by the host they live on
pub fn group_by_host<'a, I>(segments: I) -> BTreeMap<String, Vec<Segment>>
where
    I: IntoIterator<Item = &'a Segment>,
{
    let mut groups: BTreeMap<String, Vec<Segment>> = BTreeMap::new();
    for seg in segments {
        groups
            .entry(seg.hostname.clone())
            .or_default()
            .push(seg.clone());
    }
    groups
}
