use std::collections::{BTreeMap, BTreeSet};

use crate::common::types::TxnId;

/// Wait-for graph over transaction ids: an edge t1 -> t2 means t1 waits
/// for a lock t2 holds. Built fresh on every detector pass. Ordered
/// collections keep DFS exploration deterministic, so the victim chosen
/// for a given graph is reproducible.
pub(crate) struct WaitForGraph {
    edges: BTreeMap<TxnId, BTreeSet<TxnId>>,
}

impl WaitForGraph {
    pub(crate) fn new() -> Self {
        Self {
            edges: BTreeMap::new(),
        }
    }

    pub(crate) fn add_edge(&mut self, from: TxnId, to: TxnId) {
        self.edges.entry(from).or_default().insert(to);
    }

    /// Drop a transaction and every edge touching it
    pub(crate) fn remove_transaction(&mut self, txn_id: TxnId) {
        self.edges.remove(&txn_id);
        for targets in self.edges.values_mut() {
            targets.remove(&txn_id);
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Find one cycle, returned as the transactions on it. DFS starts from
    /// the smallest txn id and explores neighbors in ascending order.
    pub(crate) fn find_cycle(&self) -> Option<Vec<TxnId>> {
        let mut visited = BTreeSet::new();
        for &start in self.edges.keys() {
            if visited.contains(&start) {
                continue;
            }
            let mut path = Vec::new();
            let mut on_path = BTreeSet::new();
            if let Some(cycle) = self.dfs(start, &mut visited, &mut path, &mut on_path) {
                return Some(cycle);
            }
        }
        None
    }

    fn dfs(
        &self,
        node: TxnId,
        visited: &mut BTreeSet<TxnId>,
        path: &mut Vec<TxnId>,
        on_path: &mut BTreeSet<TxnId>,
    ) -> Option<Vec<TxnId>> {
        visited.insert(node);
        path.push(node);
        on_path.insert(node);

        if let Some(targets) = self.edges.get(&node) {
            for &next in targets {
                if on_path.contains(&next) {
                    let start = path.iter().position(|&n| n == next)?;
                    return Some(path[start..].to_vec());
                }
                if !visited.contains(&next) {
                    if let Some(cycle) = self.dfs(next, visited, path, on_path) {
                        return Some(cycle);
                    }
                }
            }
        }

        path.pop();
        on_path.remove(&node);
        None
    }
}
