//! Disjoint partitioning of resolved plans into independent groups.
//!
//! Plans whose members overlap (or, optionally, share a project) must be
//! handled as one unit; unrelated plans can proceed in parallel. Mutual
//! membership edges make each group a strongly connected component of the
//! dependency graph.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::change::{Change, ChangeId};
use crate::error::{ChangeFailure, FailureKind};
use crate::transaction::Transaction;

/// Split resolved plans into disjoint groups, bounded by `max_txn_length`.
///
/// Every change in the input must be the root of one of `plans`. Within a
/// group, changes keep their plan-resolved order. When a cap is set, a group
/// is cut at the last change whose own dependency closure still fits; changes
/// past the cut are dropped for this cycle without failure. A group that
/// cannot fit even one closure under the cap (a cycle wider than the cap)
/// fails every member with [`FailureKind::TransactionTooLong`].
pub fn partition(
    plans: &[Transaction],
    max_txn_length: Option<usize>,
    merge_by_project: bool,
) -> (Vec<Transaction>, Vec<ChangeFailure>) {
    // Node numbering by first appearance keeps the output deterministic.
    let mut order: Vec<Change> = Vec::new();
    let mut node_of: HashMap<ChangeId, usize> = HashMap::new();
    let mut plan_of_root: HashMap<ChangeId, &Transaction> = HashMap::new();
    for plan in plans {
        if let Some(root) = plan.root() {
            plan_of_root.insert(root.id().clone(), plan);
        }
        for change in plan {
            if !node_of.contains_key(change.id()) {
                node_of.insert(change.id().clone(), order.len());
                order.push(change.clone());
            }
        }
    }

    let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); order.len()];
    let mut seen_edges: HashSet<(usize, usize)> = HashSet::new();
    let mut link = |adjacency: &mut Vec<Vec<usize>>, from: usize, to: usize| {
        if from != to && seen_edges.insert((from, to)) {
            adjacency[from].push(to);
        }
    };

    // All members of one plan stand or fall together.
    for plan in plans {
        let nodes: Vec<usize> = plan.ids().map(|id| node_of[id]).collect();
        for &a in &nodes {
            for &b in &nodes {
                link(&mut adjacency, a, b);
            }
        }
    }

    // Simultaneous submissions to one project collide at the review service,
    // so optionally treat same-project changes as one unit.
    if merge_by_project {
        let mut by_project: HashMap<&str, Vec<usize>> = HashMap::new();
        for (node, change) in order.iter().enumerate() {
            by_project.entry(change.project()).or_default().push(node);
        }
        for nodes in by_project.values() {
            for &a in nodes {
                for &b in nodes {
                    link(&mut adjacency, a, b);
                }
            }
        }
    }

    let mut components = strongly_connected(&adjacency);
    components.sort_by_key(|members| members.iter().copied().min().unwrap_or(usize::MAX));

    let mut groups = Vec::new();
    let mut failures = Vec::new();
    for members in components {
        let member_set: HashSet<usize> = members.iter().copied().collect();
        let ordered: Vec<&Change> = order
            .iter()
            .enumerate()
            .filter(|(node, _)| member_set.contains(node))
            .map(|(_, change)| change)
            .collect();

        let group = match max_txn_length {
            None => ordered.iter().map(|c| (*c).clone()).collect::<Vec<_>>(),
            Some(cap) => {
                let mut out: Vec<Change> = Vec::new();
                let mut out_ids: HashSet<ChangeId> = HashSet::new();
                for change in &ordered {
                    let closure: Vec<&Change> = plan_of_root
                        .get(change.id())
                        .map(|plan| {
                            plan.changes()
                                .iter()
                                .filter(|c| !out_ids.contains(c.id()))
                                .collect()
                        })
                        .unwrap_or_default();
                    if out.len() + closure.len() > cap {
                        break;
                    }
                    for c in closure {
                        out_ids.insert(c.id().clone());
                        out.push(c.clone());
                    }
                }
                out
            }
        };

        if group.is_empty() && !ordered.is_empty() {
            let cap = max_txn_length.unwrap_or(0);
            for change in &ordered {
                failures.push(ChangeFailure::new(
                    change.id().clone(),
                    FailureKind::TransactionTooLong {
                        actual: ordered.len(),
                        cap,
                    },
                ));
            }
            continue;
        }
        if !group.is_empty() {
            groups.push(Transaction::from_ordered(group));
        }
    }

    debug!(
        plans = plans.len(),
        groups = groups.len(),
        failures = failures.len(),
        "partitioned plans"
    );
    (groups, failures)
}

/// Iterative Tarjan over a Vec adjacency list.
fn strongly_connected(adjacency: &[Vec<usize>]) -> Vec<Vec<usize>> {
    #[derive(Clone, Copy)]
    struct NodeState {
        index: usize,
        lowlink: usize,
        on_stack: bool,
    }

    let n = adjacency.len();
    let mut state: Vec<Option<NodeState>> = vec![None; n];
    let mut stack: Vec<usize> = Vec::new();
    let mut next_index = 0usize;
    let mut components = Vec::new();

    for start in 0..n {
        if state[start].is_some() {
            continue;
        }
        state[start] = Some(NodeState {
            index: next_index,
            lowlink: next_index,
            on_stack: true,
        });
        next_index += 1;
        stack.push(start);

        // (node, next neighbor offset) frames replace recursion.
        let mut frames: Vec<(usize, usize)> = vec![(start, 0)];
        while let Some(frame) = frames.last_mut() {
            let node = frame.0;
            if frame.1 < adjacency[node].len() {
                let next = adjacency[node][frame.1];
                frame.1 += 1;
                match state[next] {
                    None => {
                        state[next] = Some(NodeState {
                            index: next_index,
                            lowlink: next_index,
                            on_stack: true,
                        });
                        next_index += 1;
                        stack.push(next);
                        frames.push((next, 0));
                    }
                    Some(ns) if ns.on_stack => {
                        if let Some(cur) = state[node].as_mut() {
                            cur.lowlink = cur.lowlink.min(ns.index);
                        }
                    }
                    Some(_) => {}
                }
                continue;
            }

            let node_state = match state[node] {
                Some(ns) => ns,
                None => break,
            };
            if node_state.lowlink == node_state.index {
                let mut component = Vec::new();
                while let Some(member) = stack.pop() {
                    if let Some(ms) = state[member].as_mut() {
                        ms.on_stack = false;
                    }
                    component.push(member);
                    if member == node {
                        break;
                    }
                }
                components.push(component);
            }
            frames.pop();
            if let Some(&(parent, _)) = frames.last() {
                if let Some(ps) = state[parent].as_mut() {
                    ps.lowlink = ps.lowlink.min(node_state.lowlink);
                }
            }
        }
    }
    components
}
