use std::collections::HashSet;
use std::sync::Arc;

use patchfleet_core::{BuildTable, ErrorKind, PatchError, PlannedHost};
use patchfleet_planner::{plan_inventory, VersionSpec};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info_span, Instrument};

use crate::traits::{Credential, Inventory};

/// What to plan for every host of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanRequest {
    pub specs: Vec<VersionSpec>,
    pub continue_run: bool,
}

/// Collects inventory from every host, at most `throttle` at a time, and
/// plans each one. Results keep the order of `hosts`; duplicate names are
/// planned once.
pub async fn plan_fleet(
    inventory: Arc<dyn Inventory>,
    credential: &Credential,
    table: Arc<BuildTable>,
    request: Arc<PlanRequest>,
    hosts: &[String],
    throttle: usize,
) -> Vec<PlannedHost> {
    let hosts = distinct_hosts(hosts);
    let semaphore = Arc::new(Semaphore::new(throttle.max(1)));
    let mut set = JoinSet::new();

    for (index, host) in hosts.iter().enumerate() {
        let inventory = Arc::clone(&inventory);
        let table = Arc::clone(&table);
        let request = Arc::clone(&request);
        let semaphore = Arc::clone(&semaphore);
        let credential = credential.clone();
        let host = host.clone();
        let span = info_span!("inventory", host = %host);

        set.spawn(
            async move {
                let components = match semaphore.acquire_owned().await {
                    Ok(_permit) => inventory
                        .collect_components(&host, &credential)
                        .await
                        .map_err(|err| as_connection_error(&host, err)),
                    Err(_) => Err(PatchError::Connection(format!(
                        "{host}: inventory throttle closed"
                    ))),
                };
                let planned = plan_inventory(
                    &table,
                    &host,
                    components,
                    &request.specs,
                    request.continue_run,
                );
                (index, planned)
            }
            .instrument(span),
        );
    }

    let mut slots: Vec<Option<PlannedHost>> = vec![None; hosts.len()];
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((index, planned)) => slots[index] = Some(planned),
            Err(err) => error!(error = %err, "inventory task did not complete"),
        }
    }

    slots
        .into_iter()
        .zip(hosts)
        .map(|(planned, host)| {
            planned.unwrap_or_else(|| {
                let err = PatchError::Connection(format!("{host}: inventory task did not complete"));
                PlannedHost::failed(host, err)
            })
        })
        .collect()
}

fn as_connection_error(host: &str, err: PatchError) -> PatchError {
    match err.kind() {
        ErrorKind::Connection => err,
        _ => PatchError::Connection(format!("{host}: {err}")),
    }
}

fn distinct_hosts(hosts: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    hosts
        .iter()
        .map(|host| host.trim())
        .filter(|host| !host.is_empty() && seen.insert(host.to_ascii_lowercase()))
        .map(str::to_string)
        .collect()
}
