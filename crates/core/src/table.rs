//! Versioned rows in redb.
//!
//! All five temporal relations share one key shape,
//! `(graph, owner, key, branch, rev)`, so that one type can serve graph,
//! node and edge attributes as well as node and edge existence. `owner` is
//! empty for graph attributes and `key` is empty for existence rows. Rows
//! are never removed except by deleting a whole graph.
//!
//! The key order makes every `(graph, owner, key, branch)` history one
//! contiguous, revision-ordered run, so an as-of lookup is one reverse range
//! probe per lineage step.

use crate::codec::StoredValue;
use crate::lineage::Lineage;
use crate::Result;
use redb::{ReadableTable, TableDefinition, WriteTransaction};
use std::collections::BTreeSet;

/// `(graph, owner, key, branch, rev)`.
pub type RowKey = (&'static str, &'static str, &'static str, &'static str, u64);

type OwnedRowKey = (String, String, String, String, u64);

/// A resolved row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub branch: String,
    pub rev: u64,
    pub stored: StoredValue,
}

#[derive(Clone, Copy)]
pub struct TemporalTable {
    name: &'static str,
    def: TableDefinition<'static, RowKey, &'static str>,
}

pub const GRAPH_VAL: TemporalTable = TemporalTable::new("graph_val");
pub const NODE_VAL: TemporalTable = TemporalTable::new("node_val");
pub const EDGE_VAL: TemporalTable = TemporalTable::new("edge_val");
pub const NODES: TemporalTable = TemporalTable::new("nodes");
pub const EDGES: TemporalTable = TemporalTable::new("edges");

pub const ALL: [TemporalTable; 5] = [GRAPH_VAL, NODE_VAL, EDGE_VAL, NODES, EDGES];

impl TemporalTable {
    const fn new(name: &'static str) -> Self {
        Self {
            name,
            def: TableDefinition::new(name),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Create the table if it does not exist yet.
    pub fn create(&self, txn: &WriteTransaction) -> Result<()> {
        txn.open_table(self.def)?;
        Ok(())
    }

    /// Resolve `(graph, owner, key)` as of `lineage`.
    ///
    /// The row with the greatest revision wins; on equal revisions the
    /// branch nearest the head of the lineage wins. `None` means no row was
    /// ever visible, which differs from a visible tombstone row.
    pub fn get(
        &self,
        txn: &WriteTransaction,
        graph: &str,
        owner: &str,
        key: &str,
        lineage: &Lineage,
    ) -> Result<Option<Row>> {
        let table = txn.open_table(self.def)?;
        let mut best: Option<Row> = None;
        for step in lineage.steps() {
            let branch = step.branch.as_str();
            let lo = (graph, owner, key, branch, 0u64);
            let hi = (graph, owner, key, branch, step.ceiling);
            let mut range = table.range(lo..=hi)?;
            let Some(entry) = range.next_back() else {
                continue;
            };
            let (k, v) = entry?;
            let rev = k.value().4;
            // Strictly greater: earlier steps are nearer and keep ties.
            if best.as_ref().is_none_or(|b| rev > b.rev) {
                best = Some(Row {
                    branch: branch.to_string(),
                    rev,
                    stored: serde_json::from_str(v.value())?,
                });
            }
        }
        Ok(best)
    }

    /// Insert the row at exactly `(graph, owner, key, branch, rev)`, or
    /// overwrite it if it already exists.
    #[allow(clippy::too_many_arguments)]
    pub fn set(
        &self,
        txn: &WriteTransaction,
        graph: &str,
        owner: &str,
        key: &str,
        branch: &str,
        rev: u64,
        stored: &StoredValue,
    ) -> Result<()> {
        let json = serde_json::to_string(stored)?;
        let mut table = txn.open_table(self.def)?;
        table.insert((graph, owner, key, branch, rev), json.as_str())?;
        Ok(())
    }

    /// Rows of one key on one branch with `after < rev <= through`, in
    /// revision order.
    #[allow(clippy::too_many_arguments)]
    pub fn branch_rows(
        &self,
        txn: &WriteTransaction,
        graph: &str,
        owner: &str,
        key: &str,
        branch: &str,
        after: u64,
        through: u64,
    ) -> Result<Vec<(u64, StoredValue)>> {
        let mut out = Vec::new();
        if after >= through {
            return Ok(out);
        }
        let table = txn.open_table(self.def)?;
        let lo = (graph, owner, key, branch, after + 1);
        let hi = (graph, owner, key, branch, through);
        for entry in table.range(lo..=hi)? {
            let (k, v) = entry?;
            out.push((k.value().4, serde_json::from_str(v.value())?));
        }
        Ok(out)
    }

    /// Every key that has at least one row for `(graph, owner)`, on any
    /// branch.
    pub fn keys(&self, txn: &WriteTransaction, graph: &str, owner: &str) -> Result<BTreeSet<String>> {
        let table = txn.open_table(self.def)?;
        let mut out = BTreeSet::new();
        for entry in table.range((graph, owner, "", "", 0u64)..)? {
            let (k, _) = entry?;
            let (g, o, key, _, _) = k.value();
            if g != graph || o != owner {
                break;
            }
            out.insert(key.to_string());
        }
        Ok(out)
    }

    /// Every owner with at least one row in `graph`.
    pub fn owners(&self, txn: &WriteTransaction, graph: &str) -> Result<BTreeSet<String>> {
        let table = txn.open_table(self.def)?;
        let mut out = BTreeSet::new();
        for entry in table.range((graph, "", "", "", 0u64)..)? {
            let (k, _) = entry?;
            let (g, owner, _, _, _) = k.value();
            if g != graph {
                break;
            }
            out.insert(owner.to_string());
        }
        Ok(out)
    }

    /// Whether `(graph, owner)` has any row at all.
    pub fn has_owner(&self, txn: &WriteTransaction, graph: &str, owner: &str) -> Result<bool> {
        let table = txn.open_table(self.def)?;
        let mut range = table.range((graph, owner, "", "", 0u64)..)?;
        let found = match range.next() {
            Some(entry) => {
                let (k, _) = entry?;
                let (g, o, _, _, _) = k.value();
                g == graph && o == owner
            }
            None => false,
        };
        Ok(found)
    }

    /// Delete every row of `graph`. Returns the number of rows removed.
    pub fn remove_graph(&self, txn: &WriteTransaction, graph: &str) -> Result<usize> {
        let mut table = txn.open_table(self.def)?;
        let mut doomed: Vec<OwnedRowKey> = Vec::new();
        for entry in table.range((graph, "", "", "", 0u64)..)? {
            let (k, _) = entry?;
            let (g, owner, key, branch, rev) = k.value();
            if g != graph {
                break;
            }
            doomed.push((
                g.to_string(),
                owner.to_string(),
                key.to_string(),
                branch.to_string(),
                rev,
            ));
        }
        for (g, owner, key, branch, rev) in &doomed {
            table.remove((g.as_str(), owner.as_str(), key.as_str(), branch.as_str(), *rev))?;
        }
        Ok(doomed.len())
    }
}
