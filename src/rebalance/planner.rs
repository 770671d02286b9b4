//! The rebalance planner: `spec.md` §4.5 steps 5–8, as a pure function over
//! an explicit [`RebalancePlan`] state, per the design note in §9
//! recommending exactly this so the planner's termination and selection
//! rules are unit-testable without any network I/O.

use std::collections::{BTreeMap, BTreeSet};

use tracing::warn;

/// A scheduled instruction set for every node touched by one rebalance
/// pass, plus the final placement the controller commits to on success.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebalancePlan {
    /// Final file set each responding node should hold once its dispatch is
    /// applied.
    pub final_currents: BTreeMap<u16, BTreeSet<String>>,
    /// Per-source-node: file -> ordered destination ports to push it to.
    pub sends: BTreeMap<u16, BTreeMap<String, Vec<u16>>>,
    /// Per-node: files to delete locally.
    pub removals: BTreeMap<u16, BTreeSet<String>>,
    /// Final replica set for every visible file, for the index commit.
    pub final_replicas: BTreeMap<String, BTreeSet<u16>>,
    /// Visible files that could not be brought up to `R` replicas this pass
    /// because no responding node reported holding any copy.
    pub unrecoverable: Vec<String>,
}

impl RebalancePlan {
    /// True if this node has any work to do (used to decide whether to
    /// dispatch a `REBALANCE` message to it at all).
    #[must_use]
    pub fn has_work(&self, port: u16) -> bool {
        self.sends.get(&port).is_some_and(|m| !m.is_empty())
            || self.removals.get(&port).is_some_and(|s| !s.is_empty())
    }
}

/// Safety net against a planner bug producing an infinite loop; real passes
/// converge in far fewer iterations than this.
fn iteration_cap(nodes: usize, files: usize) -> usize {
    (nodes + 1) * (files + 1) + 64
}

/// Computes a rebalance plan.
///
/// - `currents`: per-responding-node reported file sets (from `LIST`).
/// - `visible`: filenames with index status `STORE_COMPLETE`.
/// - `removing`: filenames with index status `REMOVE_IN_PROGRESS`, whose
///   copies should be deleted wherever reported.
/// - `r`: the target replication factor.
///
/// Assumes `currents.len() >= r`; callers must skip planning otherwise (§4.5
/// step 3).
#[must_use]
pub fn compute_plan(
    currents: &BTreeMap<u16, Vec<String>>,
    visible: &BTreeSet<String>,
    removing: &BTreeSet<String>,
    r: usize,
) -> RebalancePlan {
    let mut cur: BTreeMap<u16, BTreeSet<String>> = currents
        .iter()
        .map(|(port, files)| (*port, files.iter().cloned().collect()))
        .collect();
    let mut files_stored: BTreeMap<String, BTreeSet<u16>> = BTreeMap::new();
    for (port, files) in &cur {
        for f in files {
            files_stored.entry(f.clone()).or_default().insert(*port);
        }
    }

    let mut sends: BTreeMap<u16, BTreeMap<String, Vec<u16>>> = BTreeMap::new();
    let mut removals: BTreeMap<u16, BTreeSet<String>> = BTreeMap::new();

    reconcile_phantoms(&mut cur, &mut files_stored, &mut removals, visible, removing);

    let mut unrecoverable = Vec::new();
    repair_under_replicated(&mut cur, &mut files_stored, &mut sends, visible, r, &mut unrecoverable);

    if !cur.is_empty() {
        let f = visible.len();
        let n = cur.len();
        let min = (r * f) / n;
        let max = r.saturating_mul(f).div_ceil(n.max(1));
        balance_load(&mut cur, &mut files_stored, &mut sends, &mut removals, min, max);
    }

    RebalancePlan {
        final_currents: cur,
        sends,
        removals,
        final_replicas: files_stored,
        unrecoverable,
    }
}

fn reconcile_phantoms(
    cur: &mut BTreeMap<u16, BTreeSet<String>>,
    files_stored: &mut BTreeMap<String, BTreeSet<u16>>,
    removals: &mut BTreeMap<u16, BTreeSet<String>>,
    visible: &BTreeSet<String>,
    removing: &BTreeSet<String>,
) {
    for (port, files) in cur.iter_mut() {
        let phantom: Vec<String> = files
            .iter()
            .filter(|f| !visible.contains(*f) || removing.contains(*f))
            .cloned()
            .collect();
        for f in phantom {
            files.remove(&f);
            if let Some(holders) = files_stored.get_mut(&f) {
                holders.remove(port);
                if holders.is_empty() {
                    files_stored.remove(&f);
                }
            }
            removals.entry(*port).or_default().insert(f);
        }
    }
}

fn repair_under_replicated(
    cur: &mut BTreeMap<u16, BTreeSet<String>>,
    files_stored: &mut BTreeMap<String, BTreeSet<u16>>,
    sends: &mut BTreeMap<u16, BTreeMap<String, Vec<u16>>>,
    visible: &BTreeSet<String>,
    r: usize,
    unrecoverable: &mut Vec<String>,
) {
    for file in visible {
        let holders = files_stored.get(file).cloned().unwrap_or_default();
        if holders.len() >= r {
            continue;
        }
        let Some(&source) = holders.iter().min() else {
            unrecoverable.push(file.clone());
            warn!(file = %file, "no responding node holds this file; cannot repair replication this pass");
            continue;
        };
        let mut holders = holders;
        let needed = r - holders.len();
        for _ in 0..needed {
            let dest = cur
                .iter()
                .filter(|(port, _)| !holders.contains(port))
                .min_by_key(|(port, files)| (files.len(), *port))
                .map(|(port, _)| *port);
            let Some(dest) = dest else {
                warn!(file = %file, "no legal destination left to reach target replication this pass");
                break;
            };
            cur.entry(dest).or_default().insert(file.clone());
            holders.insert(dest);
            sends.entry(source).or_default().entry(file.clone()).or_default().push(dest);
        }
        files_stored.insert(file.clone(), holders);
    }
}

fn balance_load(
    cur: &mut BTreeMap<u16, BTreeSet<String>>,
    files_stored: &mut BTreeMap<String, BTreeSet<u16>>,
    sends: &mut BTreeMap<u16, BTreeMap<String, Vec<u16>>>,
    removals: &mut BTreeMap<u16, BTreeSet<String>>,
    min: usize,
    max: usize,
) {
    let cap = iteration_cap(cur.len(), files_stored.len());
    for _ in 0..cap {
        let over_loaded: Vec<u16> =
            cur.iter().filter(|(_, files)| files.len() > max).map(|(p, _)| *p).collect();
        if let Some((src, file, dest)) = pick_move_from_overloaded(&over_loaded, cur, files_stored, sends) {
            apply_move(src, dest, &file, cur, files_stored, sends, removals);
            continue;
        }

        let under_loaded: Vec<u16> =
            cur.iter().filter(|(_, files)| files.len() < min).map(|(p, _)| *p).collect();
        if let Some((src, dest, file)) = pick_move_to_underloaded(&under_loaded, cur) {
            apply_move(src, dest, &file, cur, files_stored, sends, removals);
            continue;
        }

        return;
    }
    warn!("rebalance load-balancing loop hit its iteration cap; leaving remaining imbalance for the next pass");
}

/// Picks the (source, file, destination) move that most helps an
/// over-loaded node, preferring the destination with the fewest files.
/// Files already scheduled to be sent elsewhere from `src` this pass are
/// skipped so the source they're sent from doesn't lose them out from under
/// the in-flight transfer.
fn pick_move_from_overloaded(
    over_loaded: &[u16],
    cur: &BTreeMap<u16, BTreeSet<String>>,
    files_stored: &BTreeMap<String, BTreeSet<u16>>,
    sends: &BTreeMap<u16, BTreeMap<String, Vec<u16>>>,
) -> Option<(u16, String, u16)> {
    for &src in over_loaded {
        let Some(files) = cur.get(&src) else { continue };
        let already_sending = sends.get(&src);
        let mut best: Option<(usize, u16, String)> = None;
        for file in files {
            if already_sending.is_some_and(|m| m.contains_key(file)) {
                continue;
            }
            let holders = files_stored.get(file).cloned().unwrap_or_default();
            let candidate = cur
                .iter()
                .filter(|(port, _)| !holders.contains(port))
                .min_by_key(|(port, f)| (f.len(), *port));
            if let Some((&dest, dest_files)) = candidate {
                let key = (dest_files.len(), dest, file.clone());
                if best.as_ref().is_none_or(|b| key < *b) {
                    best = Some(key);
                }
            }
        }
        if let Some((_, dest, file)) = best {
            return Some((src, file, dest));
        }
    }
    None
}

/// Picks a move that helps an under-loaded node, per the Design Notes'
/// resolution of the ambiguous "find highest node not containing a file"
/// helper: among nodes holding at least one file the under-loaded node
/// lacks, take the one with the largest file count (port ascending on tie).
fn pick_move_to_underloaded(
    under_loaded: &[u16],
    cur: &BTreeMap<u16, BTreeSet<String>>,
) -> Option<(u16, u16, String)> {
    for &dest in under_loaded {
        let dest_files = cur.get(&dest).cloned().unwrap_or_default();
        let candidate = cur
            .iter()
            .filter(|(port, files)| *port != dest && files.iter().any(|f| !dest_files.contains(f)))
            .max_by_key(|(port, files)| (files.len(), std::cmp::Reverse(*port)));
        if let Some((&src, files)) = candidate {
            if let Some(file) = files.iter().find(|f| !dest_files.contains(*f)) {
                return Some((src, dest, file.clone()));
            }
        }
    }
    None
}

fn apply_move(
    src: u16,
    dest: u16,
    file: &str,
    cur: &mut BTreeMap<u16, BTreeSet<String>>,
    files_stored: &mut BTreeMap<String, BTreeSet<u16>>,
    sends: &mut BTreeMap<u16, BTreeMap<String, Vec<u16>>>,
    removals: &mut BTreeMap<u16, BTreeSet<String>>,
) {
    if let Some(files) = cur.get_mut(&src) {
        files.remove(file);
    }
    cur.entry(dest).or_default().insert(file.to_string());
    if let Some(holders) = files_stored.get_mut(file) {
        holders.remove(&src);
        holders.insert(dest);
    }
    sends.entry(src).or_default().entry(file.to_string()).or_default().push(dest);
    removals.entry(src).or_default().insert(file.to_string());
}
