//! Drives one rebalance pass: collects node state, computes a plan, and
//! dispatches/commits it. `spec.md` §4.5 steps 1–11.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};

use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use tracing::{debug, info, warn};

use crate::rebalance::planner::{compute_plan, RebalancePlan};
use crate::server::Controller;
use crate::wire::message::NodeOutbound;

/// Runs one rebalance pass to completion, or skips it early when there
/// aren't enough live nodes. Holds the gate's exclusive guard for its
/// entire duration, so it waits for in-flight client operations to drain
/// and blocks new ones from starting until it returns.
pub async fn run_once(controller: &Controller) {
    let _excl = controller.gate.exclusive().await;

    let r = controller.config.replication_factor;
    let live_ports = controller.registry.live_ports();
    if live_ports.len() < r {
        info!(live = live_ports.len(), r, "not enough nodes to rebalance, skipping this pass");
        return;
    }

    let timeout = controller.config.timeout();
    let currents = collect_currents(controller, &live_ports, timeout).await;
    if currents.is_empty() {
        warn!("no node responded to LIST within the deadline, skipping this pass");
        return;
    }

    let visible: BTreeSet<String> = controller.index.snapshot_visible().into_iter().collect();
    let removing: BTreeSet<String> = controller.index.snapshot_removing().into_iter().collect();

    let plan = compute_plan(&currents, &visible, &removing, r);
    if !plan.unrecoverable.is_empty() {
        warn!(files = ?plan.unrecoverable, "some files could not be repaired to full replication this pass");
    }

    let acked = dispatch_plan(controller, &currents, &plan, timeout).await;
    commit_plan(controller, &currents, &plan, &acked);

    info!(
        nodes = currents.len(),
        files = visible.len(),
        acked = acked.len(),
        "rebalance pass complete"
    );
}

async fn collect_currents(
    controller: &Controller,
    live_ports: &[u16],
    timeout: std::time::Duration,
) -> BTreeMap<u16, Vec<String>> {
    let mut futs = FuturesUnordered::new();
    for &port in live_ports {
        let Some(session) = controller.registry.get(port) else { continue };
        let rx = session.register_list();
        futs.push(async move {
            if session.send_line(&NodeOutbound::List.to_string()).await.is_err() {
                return (port, None);
            }
            (port, rx.await.ok())
        });
    }

    let results = Arc::new(StdMutex::new(BTreeMap::new()));
    let results_inner = Arc::clone(&results);
    let collect_fut = async move {
        while let Some((port, files)) = futs.next().await {
            if let Some(files) = files {
                results_inner
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(port, files);
            }
        }
    };
    let _ = tokio::time::timeout(timeout, collect_fut).await;

    Arc::try_unwrap(results)
        .map(|m| m.into_inner().unwrap_or_else(|e| e.into_inner()))
        .unwrap_or_default()
}

async fn dispatch_plan(
    controller: &Controller,
    currents: &BTreeMap<u16, Vec<String>>,
    plan: &RebalancePlan,
    timeout: std::time::Duration,
) -> HashSet<u16> {
    let mut futs = FuturesUnordered::new();
    for &port in currents.keys() {
        if !plan.has_work(port) {
            continue;
        }
        let Some(session) = controller.registry.get(port) else { continue };
        let sends: Vec<(String, Vec<u16>)> = plan
            .sends
            .get(&port)
            .map(|m| m.iter().map(|(f, d)| (f.clone(), d.clone())).collect())
            .unwrap_or_default();
        let removals: Vec<String> = plan.removals.get(&port).map(|s| s.iter().cloned().collect()).unwrap_or_default();
        let message = NodeOutbound::Rebalance { sends, removals };
        let rx = session.register_rebalance_complete();
        futs.push(async move {
            if session.send_line(&message.to_string()).await.is_err() {
                return (port, false);
            }
            (port, rx.await.is_ok())
        });
    }

    let acked = Arc::new(StdMutex::new(HashSet::new()));
    let acked_inner = Arc::clone(&acked);
    let wait_fut = async move {
        while let Some((port, ok)) = futs.next().await {
            if ok {
                acked_inner.lock().unwrap_or_else(|e| e.into_inner()).insert(port);
            } else {
                debug!(port, "node did not confirm rebalance dispatch within the deadline");
            }
        }
    };
    let _ = tokio::time::timeout(timeout, wait_fut).await;

    Arc::try_unwrap(acked).map(|m| m.into_inner().unwrap_or_else(|e| e.into_inner())).unwrap_or_default()
}

/// Commits the parts of the plan the controller can be sure of: a node's
/// `fileCount` only for nodes that had no work (nothing could have gone
/// wrong) or that acked their dispatch; a file's replica set only once
/// every node in its final replica set is in that confirmed set, same for
/// dropping a fully-reconciled `REMOVE_IN_PROGRESS` entry.
fn commit_plan(
    controller: &Controller,
    currents: &BTreeMap<u16, Vec<String>>,
    plan: &RebalancePlan,
    acked: &HashSet<u16>,
) {
    let confirmed: HashSet<u16> = currents
        .keys()
        .copied()
        .filter(|port| !plan.has_work(*port) || acked.contains(port))
        .collect();

    for &port in confirmed.iter() {
        if let Some(files) = plan.final_currents.get(&port) {
            controller.registry.set_count(port, files.len() as i64);
        }
    }

    for (file, replicas) in &plan.final_replicas {
        if replicas.iter().all(|p| confirmed.contains(p)) {
            controller.index.set_replicas(file, replicas.iter().copied().collect());
        }
    }

    let mut removal_targets: HashMap<&str, HashSet<u16>> = HashMap::new();
    for (port, files) in &plan.removals {
        for f in files {
            removal_targets.entry(f.as_str()).or_default().insert(*port);
        }
    }
    for name in controller.index.snapshot_removing() {
        let targets = removal_targets.get(name.as_str());
        let fully_confirmed = targets.is_none_or(|ports| ports.iter().all(|p| confirmed.contains(p)));
        if fully_confirmed {
            controller.index.drop_entry(&name);
        }
    }
}
