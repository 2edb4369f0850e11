//! Placement planning for a rebalance pass.
//!
//! A pass collects every responding node's reported file list and reduces
//! the placement to two invariants: every indexed file sits on exactly R
//! nodes, and every node's file count lies within the two integers
//! surrounding `R * F / N`. The plan is held as explicit state and mutated
//! monotonically: phantom files become deletions, under-replicated files
//! become sends, and the balancing loop moves files one at a time, each
//! move strictly shrinking the remaining imbalance. Ties always break by
//! port number so identical inputs plan identical passes.

use std::collections::{BTreeMap, BTreeSet};

use crate::protocol::RebalancePayload;

/// Acceptable per-node file counts: `(floor, ceil)` of `r * files / nodes`.
pub fn thresholds(r: usize, files: usize, nodes: usize) -> (usize, usize) {
    if nodes == 0 {
        return (0, 0);
    }
    let total = r * files;
    (total / nodes, total.div_ceil(nodes))
}

/// The controller's view of the index at plan time.
#[derive(Debug, Default, Clone)]
pub struct IndexView {
    /// Every name the index knows, in any state.
    pub known: BTreeSet<String>,
    /// Names whose remove is still awaiting reconciliation; nodes reporting
    /// these hold bytes the index has already given up on.
    pub removing: BTreeSet<String>,
}

/// Mutable plan for one rebalance pass.
///
/// `currents` tracks each node's post-plan file list and `files_stored`
/// each file's post-plan holders; both are updated the moment a transfer is
/// scheduled so later picks see the new placement. `sends` and `removals`
/// accumulate the per-node directive bodies.
#[derive(Debug, Default)]
pub struct PlanState {
    currents: BTreeMap<u16, Vec<String>>,
    files_stored: BTreeMap<String, Vec<u16>>,
    sends: BTreeMap<u16, BTreeMap<String, Vec<u16>>>,
    removals: BTreeMap<u16, Vec<String>>,
    changed: bool,
}

impl PlanState {
    /// Folds the reported file lists into plan state, scheduling a deletion
    /// for every phantom: a reported name the index does not know, or one
    /// whose remove never finished. Phantoms are kept out of the placement
    /// tallies so the balancing loop sees post-deletion counts.
    pub fn from_reports(reports: BTreeMap<u16, Vec<String>>, view: &IndexView) -> Self {
        let mut plan = PlanState::default();
        for (port, names) in reports {
            plan.sends.insert(port, BTreeMap::new());
            let mut held = Vec::new();
            let mut doomed = Vec::new();
            for name in names {
                if !view.known.contains(&name) || view.removing.contains(&name) {
                    doomed.push(name);
                    plan.changed = true;
                } else {
                    plan.files_stored.entry(name.clone()).or_default().push(port);
                    held.push(name);
                }
            }
            plan.removals.insert(port, doomed);
            plan.currents.insert(port, held);
        }
        plan
    }

    /// Schedules sends for every file reported by fewer than `r` nodes: the
    /// first reporting holder pushes a copy to each of the `r - c`
    /// least-loaded nodes not yet holding the file.
    pub fn repair_replication(&mut self, r: usize) {
        let under: Vec<(String, usize)> = self
            .files_stored
            .iter()
            .filter(|(_, holders)| holders.len() < r)
            .map(|(name, holders)| (name.clone(), r - holders.len()))
            .collect();

        for (name, needed) in under {
            let Some(source) = self
                .files_stored
                .get(&name)
                .and_then(|holders| holders.first())
                .copied()
            else {
                continue;
            };
            for _ in 0..needed {
                let Some(dest) = self.least_loaded_not_holding(&name) else {
                    break;
                };
                self.sends
                    .entry(source)
                    .or_default()
                    .entry(name.clone())
                    .or_default()
                    .push(dest);
                if let Some(holders) = self.files_stored.get_mut(&name) {
                    holders.push(dest);
                }
                if let Some(files) = self.currents.get_mut(&dest) {
                    files.push(name.clone());
                }
                self.changed = true;
            }
        }
    }

    /// Moves files one at a time until every node's count lies in
    /// `[min, max]` or no legal move remains. A move is only taken when it
    /// strictly shrinks the imbalance, so the loop always terminates; a
    /// node whose imbalance cannot be reduced is set aside.
    pub fn balance_loads(&mut self, min: usize, max: usize) {
        let mut settled: BTreeSet<u16> = BTreeSet::new();
        loop {
            let Some(port) = self
                .currents
                .iter()
                .find(|(port, files)| {
                    !settled.contains(*port) && (files.len() < min || files.len() > max)
                })
                .map(|(port, _)| *port)
            else {
                break;
            };

            let over = self.currents.get(&port).map_or(0, Vec::len) > max;
            let moved = if over {
                self.shed_from(port, max)
            } else {
                self.pull_into(port, min)
            };
            if !moved {
                settled.insert(port);
            }
        }
    }

    /// Moves one file off an over-loaded node: of its files, the one whose
    /// least-loaded legal destination holds the fewest. Refuses the move if
    /// even that destination is already at `max`.
    fn shed_from(&mut self, port: u16, max: usize) -> bool {
        let files = self.currents.get(&port).cloned().unwrap_or_default();
        let mut best: Option<(String, u16, usize)> = None;
        for name in &files {
            if let Some(dest) = self.least_loaded_not_holding(name) {
                let dest_len = self.currents.get(&dest).map_or(0, Vec::len);
                if best.as_ref().map_or(true, |(_, _, len)| dest_len < *len) {
                    best = Some((name.clone(), dest, dest_len));
                }
            }
        }
        match best {
            Some((name, dest, dest_len)) if dest_len < max => {
                self.move_file(&name, port, dest);
                true
            }
            _ => false,
        }
    }

    /// Pulls one file onto an under-loaded node from the fullest node that
    /// holds something it lacks. Refuses to drain a donor at or below
    /// `min`.
    fn pull_into(&mut self, port: u16, min: usize) -> bool {
        let have = self.currents.get(&port).cloned().unwrap_or_default();
        let Some(donor) = self
            .currents
            .iter()
            .filter(|(donor, files)| {
                **donor != port && files.iter().any(|f| !have.contains(f))
            })
            .max_by_key(|(donor, files)| (files.len(), **donor))
            .map(|(donor, _)| *donor)
        else {
            return false;
        };
        if self.currents.get(&donor).map_or(0, Vec::len) <= min {
            return false;
        }
        let Some(name) = self
            .currents
            .get(&donor)
            .and_then(|files| files.iter().find(|f| !have.contains(*f)).cloned())
        else {
            return false;
        };
        self.move_file(&name, donor, port);
        true
    }

    /// Least-loaded node whose planned file list lacks `name`, ties broken
    /// by ascending port.
    fn least_loaded_not_holding(&self, name: &str) -> Option<u16> {
        self.currents
            .iter()
            .filter(|(_, files)| !files.iter().any(|f| f == name))
            .min_by_key(|(port, files)| (files.len(), **port))
            .map(|(port, _)| *port)
    }

    /// Relocates one replica of `name` from `from` to `to`.
    ///
    /// When `from` was itself only a planned recipient of the file, the
    /// pending transfer is rerouted straight to `to` instead; `from` never
    /// held the bytes, so it must neither forward nor delete them.
    fn move_file(&mut self, name: &str, from: u16, to: u16) {
        let mut rerouted = false;
        for planned in self.sends.values_mut() {
            if let Some(dests) = planned.get_mut(name) {
                if let Some(pos) = dests.iter().position(|d| *d == from) {
                    dests.remove(pos);
                    dests.push(to);
                    rerouted = true;
                    break;
                }
            }
        }
        if !rerouted {
            self.sends
                .entry(from)
                .or_default()
                .entry(name.to_string())
                .or_default()
                .push(to);
            let removals = self.removals.entry(from).or_default();
            if !removals.iter().any(|r| r == name) {
                removals.push(name.to_string());
            }
        }

        if let Some(holders) = self.files_stored.get_mut(name) {
            holders.retain(|p| *p != from);
            holders.push(to);
        }
        if let Some(files) = self.currents.get_mut(&from) {
            files.retain(|f| f != name);
        }
        if let Some(files) = self.currents.get_mut(&to) {
            files.push(name.to_string());
        }
        self.changed = true;
    }

    /// Whether the pass scheduled any transfer or deletion.
    pub fn has_changes(&self) -> bool {
        self.changed
    }

    /// The directive body for one node, or `None` when it has nothing to
    /// do.
    pub fn instruction_for(&self, port: u16) -> Option<RebalancePayload> {
        let sends = self
            .sends
            .get(&port)
            .map(|planned| {
                planned
                    .iter()
                    .map(|(name, dests)| (name.clone(), dests.clone()))
                    .collect()
            })
            .unwrap_or_default();
        let removals = self.removals.get(&port).cloned().unwrap_or_default();
        let payload = RebalancePayload { sends, removals };
        (!payload.is_empty()).then_some(payload)
    }

    /// A node's post-plan file count; becomes its committed estimate once
    /// the node confirms.
    pub fn planned_count(&self, port: u16) -> usize {
        self.currents.get(&port).map_or(0, Vec::len)
    }

    /// Post-plan holders of every surviving file.
    pub fn placements(&self) -> &BTreeMap<String, Vec<u16>> {
        &self.files_stored
    }

    #[cfg(test)]
    fn current(&self, port: u16) -> &[String] {
        self.currents.get(&port).map(Vec::as_slice).unwrap_or(&[])
    }

    #[cfg(test)]
    fn imbalance(&self, r: usize, min: usize, max: usize) -> usize {
        let node_term: usize = self
            .currents
            .values()
            .map(|files| files.len().saturating_sub(max) + min.saturating_sub(files.len()))
            .sum();
        let file_term: usize = self
            .files_stored
            .values()
            .map(|holders| r.saturating_sub(holders.len()))
            .sum();
        node_term + file_term
    }
}
