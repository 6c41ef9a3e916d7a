//! History windows and point-in-time diffs over one entity's attributes.

use crate::codec::StoredValue;
use crate::value::Value;
use crate::{Entity, Position, Result, RevgraphError, VersionedGraph};
use std::collections::{BTreeMap, BTreeSet};
use tracing::trace;

/// Most revisions a single window materialises per key.
pub const MAX_WINDOW_WIDTH: usize = 1 << 20;

/// Which keys a [`window`](VersionedGraph::window) reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyFilter {
    /// Every key holding a value at some revision of the window.
    All,
    /// Exactly these keys, even when they never hold a value.
    Keys(Vec<String>),
}

/// Per-revision history of an entity's keys on one branch.
#[derive(Debug, Clone, PartialEq)]
pub struct Window {
    pub branch: String,
    pub from: u64,
    pub to: u64,
    /// `series[key][i]` is the value as of revision `from + i`; `None` when
    /// absent or deleted.
    pub series: BTreeMap<String, Vec<Option<Value>>>,
}

impl Window {
    /// Number of revisions covered, both ends included.
    pub fn len(&self) -> usize {
        let span = self.to.saturating_sub(self.from).saturating_add(1);
        usize::try_from(span).unwrap_or(usize::MAX)
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Value of `key` as of `rev`, if `rev` lies inside the window.
    pub fn at(&self, key: &str, rev: u64) -> Option<&Value> {
        if rev < self.from || rev > self.to {
            return None;
        }
        self.series.get(key)?.get((rev - self.from) as usize)?.as_ref()
    }
}

/// One key whose resolved value differs between two revisions.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffEntry {
    pub key: String,
    pub before: Option<Value>,
    pub after: Option<Value>,
}

impl VersionedGraph {
    /// Reconstruct the history of `entity`'s keys on `branch` over
    /// `[from, to]`.
    ///
    /// Each series is seeded with the value resolved at `from` (through the
    /// lineage as usual); later revisions only change through rows written on
    /// `branch` itself, and gaps carry the last known value forward.
    ///
    /// # Errors
    ///
    /// [`RevgraphError::InvalidWindow`] when `from > to`, when `from`
    /// precedes the branch's fork point, or when the range covers more than
    /// [`MAX_WINDOW_WIDTH`] revisions.
    pub fn window(
        &self,
        entity: &Entity,
        filter: KeyFilter,
        branch: &str,
        from: u64,
        to: u64,
    ) -> Result<Window> {
        let invalid = |reason: String| RevgraphError::InvalidWindow {
            branch: branch.to_string(),
            from,
            to,
            reason,
        };
        if from > to {
            return Err(invalid("start is after end".to_string()));
        }
        let start = self.branch_start(branch)?;
        if from < start {
            return Err(invalid(format!("branch forks at revision {start}")));
        }
        let width = (to - from)
            .checked_add(1)
            .and_then(|w| usize::try_from(w).ok())
            .filter(|&w| w <= MAX_WINDOW_WIDTH)
            .ok_or_else(|| invalid(format!("wider than {MAX_WINDOW_WIDTH} revisions")))?;
        self.graph_kind(entity.graph_name())?;

        let lineage = self.bounded_lineage(&Position::new(branch, from))?;
        let keys: Vec<String> = match &filter {
            KeyFilter::All => self.all_keys(entity)?.into_iter().collect(),
            KeyFilter::Keys(keys) => keys.clone(),
        };
        let mut series = BTreeMap::new();
        for key in keys {
            let mut current = match self.lookup_with(entity, &key, &lineage)? {
                Some(stored) => self.codec().decode(&stored)?,
                None => None,
            };
            let mut values = vec![current.clone()];
            let mut next_rev = from.saturating_add(1);
            for (rev, stored) in self.branch_rows(entity, &key, branch, from, to)? {
                while next_rev < rev {
                    values.push(current.clone());
                    next_rev += 1;
                }
                current = self.codec().decode(&stored)?;
                values.push(current.clone());
                next_rev = rev.saturating_add(1);
            }
            while values.len() < width {
                values.push(current.clone());
            }
            if filter == KeyFilter::All && values.iter().all(Option::is_none) {
                continue;
            }
            series.insert(key, values);
        }
        trace!(%entity, branch, from, to, keys = series.len(), "built window");
        Ok(Window {
            branch: branch.to_string(),
            from,
            to,
            series,
        })
    }

    /// Keys of `entity` whose resolved value differs between revisions `a`
    /// and `b` of `branch`, sorted by key.
    ///
    /// A key deleted at one end and never set at the other does not count as
    /// a change.
    pub fn diff(&self, entity: &Entity, branch: &str, a: u64, b: u64) -> Result<Vec<DiffEntry>> {
        let before = self.bounded_lineage(&Position::new(branch, a))?;
        let after = self.bounded_lineage(&Position::new(branch, b))?;
        self.graph_kind(entity.graph_name())?;

        let keys: BTreeSet<String> = self.all_keys(entity)?;
        let mut out = Vec::new();
        for key in keys {
            let old = live(self.lookup_with(entity, &key, &before)?);
            let new = live(self.lookup_with(entity, &key, &after)?);
            if old == new {
                continue;
            }
            let decode = |stored: Option<StoredValue>| match stored {
                Some(s) => self.codec().decode(&s),
                None => Ok(None),
            };
            out.push(DiffEntry {
                before: decode(old)?,
                after: decode(new)?,
                key,
            });
        }
        trace!(%entity, branch, a, b, changed = out.len(), "computed diff");
        Ok(out)
    }
}

/// Tombstones compare equal to absence.
fn live(stored: Option<StoredValue>) -> Option<StoredValue> {
    stored.filter(|s| !s.is_tombstone())
}
