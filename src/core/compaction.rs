//! Change-log compaction.
//!
//! Given the persisted logs in application order, pick the ones that can be dropped without
//! changing the state they produce:
//! - an add immediately followed by a delete of the same `(kind, name, namespace)`: both go
//! - an add immediately followed by another add of the same key: the first goes
//! - a noop next to any other command goes
//!
//! Removing logs makes their neighbours adjacent, so the rules are applied to the surviving
//! sequence again until none of them matches.
use std::collections::HashSet;

use super::change_log::{Action, ChangeLog};

/// Positions in `logs` that one rule drops, or `None` at the fixed point.
fn next_reduction(logs: &[&ChangeLog]) -> Option<Vec<usize>> {
    if logs.len() > 1
        && let Some(pos) = logs.iter().position(|log| log.cmd.is_noop())
    {
        return Some(vec![pos]);
    }
    for i in 1..logs.len() {
        let (prev, cur) = (logs[i - 1], logs[i]);
        if prev.target() != cur.target() {
            continue;
        }
        match (prev.cmd.action(), cur.cmd.action()) {
            (Some(Action::Add), Some(Action::Delete)) => return Some(vec![i - 1, i]),
            (Some(Action::Add), Some(Action::Add)) => return Some(vec![i - 1]),
            _ => {}
        }
    }
    None
}

/// Logs that compaction would remove, de-duplicated by id, in original order.
pub fn compaction_remove_list(logs: &[ChangeLog]) -> Vec<ChangeLog> {
    let mut remaining: Vec<&ChangeLog> = logs.iter().collect();
    let mut removed = HashSet::new();
    let mut passes = 0usize;
    while let Some(positions) = next_reduction(&remaining) {
        passes += 1;
        for &pos in positions.iter().rev() {
            removed.insert(remaining.remove(pos).id.clone());
        }
    }
    tracing::debug!(passes, removed = removed.len(), "compaction reached a fixed point");

    let mut seen = HashSet::new();
    logs.iter()
        .filter(|log| removed.contains(&log.id) && seen.insert(log.id.clone()))
        .cloned()
        .collect()
}

/// The logs left after applying [`compaction_remove_list`].
pub fn compact(logs: &[ChangeLog]) -> Vec<ChangeLog> {
    let removed: HashSet<String> = compaction_remove_list(logs)
        .into_iter()
        .map(|log| log.id)
        .collect();
    logs.iter()
        .filter(|log| !removed.contains(&log.id))
        .cloned()
        .collect()
}
