//! Branch lineage: which branches, up to which revision, an as-of query may
//! see.
//!
//! Every branch except `master` forks from a parent at a revision. Reading
//! branch `B` at revision `R` sees `B` up to `R`, then `B`'s parent up to the
//! fork point, then the grandparent up to the parent's fork point, and so on
//! until `master`.
//!
//! [`BranchIndex`] is an in-memory copy of the `branches` table. It is loaded
//! once at open and updated alongside every branch insert; the table stays
//! the source of truth.

use crate::{Result, RevgraphError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Name of the root branch.
pub const MASTER: &str = "master";

/// Fork metadata of one branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchRecord {
    /// Branch this one forked from. `master` names itself.
    pub parent: String,
    /// Revision of `parent` at the moment of the fork.
    pub parent_rev: u64,
}

impl BranchRecord {
    pub fn root() -> Self {
        Self {
            parent: MASTER.to_string(),
            parent_rev: 0,
        }
    }
}

/// One hop of a bounded lineage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineageStep {
    pub branch: String,
    /// Highest revision of `branch` visible from the queried position.
    pub ceiling: u64,
}

/// The bounded chain from a queried `(branch, rev)` back to `master`,
/// nearest branch first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lineage {
    steps: Vec<LineageStep>,
}

impl Lineage {
    pub fn steps(&self) -> &[LineageStep] {
        &self.steps
    }

    /// The branch the lineage was built for.
    pub fn head(&self) -> &LineageStep {
        // Constructed only by `BranchIndex::bounded`, which always pushes the head.
        &self.steps[0]
    }

    /// Position of `branch` in the chain, `0` being the queried branch.
    pub fn distance(&self, branch: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.branch == branch)
    }
}

#[derive(Debug, Clone, Default)]
pub struct BranchIndex {
    branches: BTreeMap<String, BranchRecord>,
}

impl BranchIndex {
    /// An index holding only `master`.
    pub fn new() -> Self {
        let mut branches = BTreeMap::new();
        branches.insert(MASTER.to_string(), BranchRecord::root());
        Self { branches }
    }

    pub fn insert(&mut self, name: String, record: BranchRecord) {
        self.branches.insert(name, record);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.branches.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.branches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &BranchRecord)> {
        self.branches.iter()
    }

    pub fn record(&self, name: &str) -> Result<&BranchRecord> {
        self.branches
            .get(name)
            .ok_or_else(|| RevgraphError::UnknownBranch(name.to_string()))
    }

    /// First revision at which `name` may be read or written.
    pub fn start(&self, name: &str) -> Result<u64> {
        if name == MASTER {
            return Ok(0);
        }
        Ok(self.record(name)?.parent_rev)
    }

    /// Reject `rev` when it precedes the fork point of `branch`.
    ///
    /// Only the branch's own fork point matters; ancestors may have been far
    /// ahead of it when it forked.
    pub fn check_revision(&self, branch: &str, rev: u64) -> Result<()> {
        let parent_rev = self.start(branch)?;
        if rev < parent_rev {
            return Err(RevgraphError::RevisionBeforeBranchStart {
                branch: branch.to_string(),
                rev,
                parent_rev,
            });
        }
        Ok(())
    }

    /// Names from `branch` back to `master`, both ends included.
    pub fn lineage(&self, branch: &str) -> Result<Vec<String>> {
        let mut out = Vec::new();
        self.walk(branch, |name, _| out.push(name.to_string()))?;
        Ok(out)
    }

    /// Bounded lineage for an as-of query at `(branch, rev)`.
    pub fn bounded(&self, branch: &str, rev: u64) -> Result<Lineage> {
        self.check_revision(branch, rev)?;
        let mut steps = Vec::new();
        let mut ceiling = rev;
        self.walk(branch, |name, record| {
            steps.push(LineageStep {
                branch: name.to_string(),
                ceiling,
            });
            ceiling = record.parent_rev;
        })?;
        Ok(Lineage { steps })
    }

    /// Whether `child` descends from `parent` at any remove. A branch is not
    /// its own ancestor.
    pub fn is_ancestor(&self, parent: &str, child: &str) -> Result<bool> {
        if parent == child {
            return Ok(false);
        }
        Ok(self.lineage(child)?.iter().skip(1).any(|b| b == parent))
    }

    /// Every branch descended from `branch`, children before grandchildren.
    pub fn descendants(&self, branch: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut frontier = vec![branch.to_string()];
        while !frontier.is_empty() {
            let mut next = Vec::new();
            for (name, record) in &self.branches {
                if name != MASTER && frontier.contains(&record.parent) && !out.contains(name) {
                    next.push(name.clone());
                }
            }
            out.extend(next.iter().cloned());
            frontier = next;
        }
        out
    }

    fn walk(&self, branch: &str, mut visit: impl FnMut(&str, &BranchRecord)) -> Result<()> {
        let mut current = branch.to_string();
        let mut hops = 0usize;
        loop {
            let record = self.record(&current)?;
            visit(&current, record);
            if current == MASTER {
                return Ok(());
            }
            hops += 1;
            if hops >= self.branches.len() {
                return Err(RevgraphError::CyclicBranch(branch.to_string()));
            }
            current = record.parent.clone();
        }
    }
}
