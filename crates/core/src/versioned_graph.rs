//! revgraph: versioned graph storage with branches and time travel.
//!
//! Graphs, nodes, edges and their attributes are stored as append-only rows
//! tagged with a **branch** and a **revision**. Any past state can be read
//! back exactly, and a branch can be forked from any revision of another
//! branch without copying data.
//!
//! Reads resolve "as of" a [`Position`]: the latest row not newer than the
//! revision, searched along the branch's lineage back to `master`. Values
//! are encoded by a codec that keeps lists and tuples apart, and compound
//! values can be edited in place through a [`MutableView`].
//!
//! # Quick start
//!
//! ```rust,no_run
//! use revgraph::{Entity, GraphKind, Value, VersionedGraph};
//!
//! let db = VersionedGraph::open("world.revgraph").unwrap();
//! db.new_graph("G", GraphKind::DiGraph).unwrap();
//! db.add_node("G", "n1").unwrap();
//!
//! let n1 = Entity::node("G", "n1");
//! db.set(&n1, "color", &Value::from("red")).unwrap();
//!
//! db.set_revision(1).unwrap();
//! db.set(&n1, "color", &Value::from("blue")).unwrap();
//!
//! // Fork, then diverge.
//! db.set_branch("alt").unwrap();
//! db.set_revision(2).unwrap();
//! db.set(&n1, "color", &Value::from("green")).unwrap();
//!
//! let then = db.get_at(&n1, "color", &revgraph::Position::new("master", 0)).unwrap();
//! assert_eq!(then, Some(Value::from("red")));
//! db.close().unwrap();
//! ```

mod codec;
mod interchange;
mod lineage;
mod table;
mod value;
mod view;
mod window;

pub use codec::{StoredValue, Tag, ValueCodec};
pub use interchange::InterchangeCache;
pub use lineage::{BranchIndex, BranchRecord, Lineage, LineageStep, MASTER};
pub use value::Value;
pub use view::{MutableView, ViewItem};
pub use window::{DiffEntry, KeyFilter, Window};

use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use table::TemporalTable;
use tracing::{debug, trace};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RevgraphError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("unknown storage flavor: {0}")]
    UnknownFlavor(String),
    #[error("revision {rev} occurs before the start of branch {branch} (forked at {parent_rev})")]
    RevisionBeforeBranchStart {
        branch: String,
        rev: u64,
        parent_rev: u64,
    },
    #[error("unknown graph: {0}")]
    UnknownGraph(String),
    #[error("graph already exists: {0}")]
    GraphExists(String),
    #[error("unknown branch: {0}")]
    UnknownBranch(String),
    #[error("branch already exists: {0}")]
    BranchExists(String),
    #[error("value is not serializable without opaque serialization: {0}")]
    NotSerializable(String),
    #[error("stored value is an opaque blob but opaque serialization is disabled")]
    SerializationDisabled,
    #[error("lineage of branch {0} does not terminate at master")]
    CyclicBranch(String),
    #[error("invalid window [{from}, {to}] on branch {branch}: {reason}")]
    InvalidWindow {
        branch: String,
        from: u64,
        to: u64,
        reason: String,
    },
    #[error("malformed encoding: {0}")]
    MalformedEncoding(String),
    #[error("constraint violation: {0}")]
    Constraint(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid view operation: {0}")]
    InvalidView(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<redb::DatabaseError> for RevgraphError {
    fn from(e: redb::DatabaseError) -> Self {
        RevgraphError::Storage(e.to_string())
    }
}
impl From<redb::TransactionError> for RevgraphError {
    fn from(e: redb::TransactionError) -> Self {
        RevgraphError::Storage(e.to_string())
    }
}
impl From<redb::TableError> for RevgraphError {
    fn from(e: redb::TableError) -> Self {
        RevgraphError::Storage(e.to_string())
    }
}
impl From<redb::StorageError> for RevgraphError {
    fn from(e: redb::StorageError) -> Self {
        RevgraphError::Storage(e.to_string())
    }
}
impl From<redb::CommitError> for RevgraphError {
    fn from(e: redb::CommitError) -> Self {
        RevgraphError::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RevgraphError>;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Which redb backend holds the data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageFlavor {
    /// A database file on disk.
    File,
    /// Process memory only; nothing survives the handle.
    Memory,
}

impl FromStr for StorageFlavor {
    type Err = RevgraphError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "redb" | "file" => Ok(StorageFlavor::File),
            "memory" => Ok(StorageFlavor::Memory),
            other => Err(RevgraphError::UnknownFlavor(other.to_string())),
        }
    }
}

/// Options fixed when a store is opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// `"redb"`/`"file"` or `"memory"`. Anything else fails at open.
    pub flavor: String,
    /// Permit the opaque `blob` fallback for values with no structured form.
    pub opaque_serialization: bool,
    /// Stop caching interchange encodings once this many are held.
    pub interchange_cache_limit: Option<usize>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            flavor: "redb".to_string(),
            opaque_serialization: false,
            interchange_cache_limit: None,
        }
    }
}

impl StoreConfig {
    pub fn with_flavor(mut self, flavor: impl Into<String>) -> Self {
        self.flavor = flavor.into();
        self
    }

    pub fn with_opaque_serialization(mut self, enabled: bool) -> Self {
        self.opaque_serialization = enabled;
        self
    }

    pub fn with_interchange_cache_limit(mut self, limit: usize) -> Self {
        self.interchange_cache_limit = Some(limit);
        self
    }

    /// Defaults overridden by `REVGRAPH_FLAVOR`, `REVGRAPH_OPAQUE`
    /// (`1`/`true`) and `REVGRAPH_CACHE_LIMIT`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(flavor) = std::env::var("REVGRAPH_FLAVOR") {
            config.flavor = flavor;
        }
        if let Ok(opaque) = std::env::var("REVGRAPH_OPAQUE") {
            config.opaque_serialization = matches!(opaque.as_str(), "1" | "true" | "yes");
        }
        if let Ok(limit) = std::env::var("REVGRAPH_CACHE_LIMIT") {
            let limit = limit.parse::<usize>().map_err(|e| {
                RevgraphError::Internal(format!("REVGRAPH_CACHE_LIMIT={limit:?}: {e}"))
            })?;
            config.interchange_cache_limit = Some(limit);
        }
        Ok(config)
    }
}

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Shape of a graph, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GraphKind {
    Graph,
    DiGraph,
    MultiGraph,
    MultiDiGraph,
}

impl GraphKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GraphKind::Graph => "Graph",
            GraphKind::DiGraph => "DiGraph",
            GraphKind::MultiGraph => "MultiGraph",
            GraphKind::MultiDiGraph => "MultiDiGraph",
        }
    }

    pub fn is_directed(&self) -> bool {
        matches!(self, GraphKind::DiGraph | GraphKind::MultiDiGraph)
    }

    /// Whether parallel edges (index > 0) are allowed.
    pub fn is_multigraph(&self) -> bool {
        matches!(self, GraphKind::MultiGraph | GraphKind::MultiDiGraph)
    }
}

impl FromStr for GraphKind {
    type Err = RevgraphError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Graph" => Ok(GraphKind::Graph),
            "DiGraph" => Ok(GraphKind::DiGraph),
            "MultiGraph" => Ok(GraphKind::MultiGraph),
            "MultiDiGraph" => Ok(GraphKind::MultiDiGraph),
            other => Err(RevgraphError::MalformedEncoding(format!(
                "unknown graph kind {other:?}"
            ))),
        }
    }
}

impl std::fmt::Display for GraphKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something that carries attributes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Entity {
    Graph {
        graph: String,
    },
    Node {
        graph: String,
        node: String,
    },
    /// `idx` tells parallel edges apart and is 0 outside multigraphs.
    Edge {
        graph: String,
        source: String,
        target: String,
        idx: u64,
    },
}

/// The flavor of an [`Entity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Graph,
    Node,
    Edge,
}

impl Entity {
    pub fn graph(graph: impl Into<String>) -> Self {
        Entity::Graph {
            graph: graph.into(),
        }
    }

    pub fn node(graph: impl Into<String>, node: impl Into<String>) -> Self {
        Entity::Node {
            graph: graph.into(),
            node: node.into(),
        }
    }

    pub fn edge(graph: impl Into<String>, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self::multi_edge(graph, source, target, 0)
    }

    pub fn multi_edge(
        graph: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
        idx: u64,
    ) -> Self {
        Entity::Edge {
            graph: graph.into(),
            source: source.into(),
            target: target.into(),
            idx,
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::Graph { .. } => EntityKind::Graph,
            Entity::Node { .. } => EntityKind::Node,
            Entity::Edge { .. } => EntityKind::Edge,
        }
    }

    /// Name of the graph the entity belongs to.
    pub fn graph_name(&self) -> &str {
        match self {
            Entity::Graph { graph } | Entity::Node { graph, .. } | Entity::Edge { graph, .. } => {
                graph
            }
        }
    }

    /// Owner column of the entity's rows within its graph.
    fn owner(&self) -> String {
        match self {
            Entity::Graph { .. } => String::new(),
            Entity::Node { node, .. } => node.clone(),
            Entity::Edge {
                source,
                target,
                idx,
                ..
            } => serde_json::json!([source, target, idx]).to_string(),
        }
    }

    fn from_owner(kind: EntityKind, graph: &str, owner: &str) -> Result<Self> {
        match kind {
            EntityKind::Graph => Ok(Entity::graph(graph)),
            EntityKind::Node => Ok(Entity::node(graph, owner)),
            EntityKind::Edge => {
                let (source, target, idx): (String, String, u64) = serde_json::from_str(owner)?;
                Ok(Entity::multi_edge(graph, source, target, idx))
            }
        }
    }

    fn value_table(&self) -> TemporalTable {
        match self.kind() {
            EntityKind::Graph => table::GRAPH_VAL,
            EntityKind::Node => table::NODE_VAL,
            EntityKind::Edge => table::EDGE_VAL,
        }
    }
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Entity::Graph { graph } => write!(f, "graph {graph}"),
            Entity::Node { graph, node } => write!(f, "node {graph}/{node}"),
            Entity::Edge {
                graph,
                source,
                target,
                idx,
            } => write!(f, "edge {graph}/{source}->{target}#{idx}"),
        }
    }
}

fn existence_table(kind: EntityKind) -> Result<TemporalTable> {
    match kind {
        EntityKind::Node => Ok(table::NODES),
        EntityKind::Edge => Ok(table::EDGES),
        EntityKind::Graph => Err(RevgraphError::Constraint(
            "graph existence is not versioned; use new_graph/delete_graph".to_string(),
        )),
    }
}

/// A point in history: a branch and a revision on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    pub branch: String,
    pub rev: u64,
}

impl Position {
    pub fn new(branch: impl Into<String>, rev: u64) -> Self {
        Self {
            branch: branch.into(),
            rev,
        }
    }
}

impl Default for Position {
    fn default() -> Self {
        Self::new(MASTER, 0)
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.branch, self.rev)
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Branch name -> JSON [`BranchRecord`].
const BRANCHES: TableDefinition<&str, &str> = TableDefinition::new("branches");
/// Graph name -> [`GraphKind`] name.
const GRAPHS: TableDefinition<&str, &str> = TableDefinition::new("graphs");
/// Store-wide settings; holds the persisted current position.
const GLOBALS: TableDefinition<&str, &str> = TableDefinition::new("globals");

/// Existence rows use the empty key.
const EXTANT_KEY: &str = "";

/// A versioned graph store.
///
/// One handle is one logical session: all reads and writes run inside a
/// single redb write transaction that becomes durable on [`commit`] or
/// [`close`]. Dropping the handle without either discards the session.
///
/// [`commit`]: VersionedGraph::commit
/// [`close`]: VersionedGraph::close
pub struct VersionedGraph {
    session: Mutex<Option<WriteTransaction>>,
    db: Database,
    /// In-memory copy of the `branches` table, rebuilt on every [`init`]
    /// and kept in sync by [`new_branch`].
    ///
    /// [`init`]: VersionedGraph::init
    /// [`new_branch`]: VersionedGraph::new_branch
    branches: Mutex<BranchIndex>,
    position: Mutex<Position>,
    codec: ValueCodec,
}

impl VersionedGraph {
    /// Open or create a file-backed store at `path` with default options.
    pub fn open(path: &str) -> Result<Self> {
        Self::open_with(path, &StoreConfig::default())
    }

    /// Create an in-memory store (no file I/O). Data is lost on drop.
    pub fn open_in_memory() -> Result<Self> {
        Self::open_with("", &StoreConfig::default().with_flavor("memory"))
    }

    /// Open a store with explicit options. `path` is ignored by the memory
    /// flavor.
    ///
    /// # Errors
    ///
    /// [`RevgraphError::UnknownFlavor`] before anything is created when the
    /// configured flavor is not recognised.
    pub fn open_with(path: &str, config: &StoreConfig) -> Result<Self> {
        let flavor: StorageFlavor = config.flavor.parse()?;
        let db = match flavor {
            StorageFlavor::File => Database::create(path)?,
            StorageFlavor::Memory => {
                let backend = redb::backends::InMemoryBackend::new();
                Database::builder().create_with_backend(backend)?
            }
        };
        Self::init(db, config)
    }

    fn init(db: Database, config: &StoreConfig) -> Result<Self> {
        let mut branches = BranchIndex::new();
        let position;
        {
            let write_txn = db.begin_write()?;
            write_txn.open_table(GRAPHS)?;
            for t in table::ALL {
                t.create(&write_txn)?;
            }
            {
                let mut table = write_txn.open_table(BRANCHES)?;
                for entry in table.iter()? {
                    let (name, record) = entry?;
                    let record: BranchRecord = serde_json::from_str(record.value())?;
                    branches.insert(name.value().to_string(), record);
                }
                if table.get(MASTER)?.is_none() {
                    let root = serde_json::to_string(&BranchRecord::root())?;
                    table.insert(MASTER, root.as_str())?;
                }
            }
            position = Self::load_position(&write_txn)?;
            write_txn.commit()?;
        }
        let cache = match config.interchange_cache_limit {
            Some(limit) => InterchangeCache::with_limit(limit),
            None => InterchangeCache::new(),
        };
        debug!(
            branches = branches.len(),
            position = %position,
            opaque = config.opaque_serialization,
            "opened versioned graph store"
        );
        Ok(Self {
            session: Mutex::new(None),
            db,
            branches: Mutex::new(branches),
            position: Mutex::new(position),
            codec: ValueCodec::new(cache, config.opaque_serialization),
        })
    }

    fn load_position(txn: &WriteTransaction) -> Result<Position> {
        let table = txn.open_table(GLOBALS)?;
        let branch = table.get("branch")?.map(|g| g.value().to_string());
        let rev = table.get("rev")?.map(|g| g.value().to_string());
        match (branch, rev) {
            (Some(branch), Some(rev)) => {
                let rev = rev
                    .parse()
                    .map_err(|e| RevgraphError::MalformedEncoding(format!("stored rev {rev:?}: {e}")))?;
                Ok(Position::new(branch, rev))
            }
            _ => Ok(Position::default()),
        }
    }

    /// Run `f` inside the session transaction, opening one if needed.
    ///
    /// `f` must not call back into anything that takes the session.
    fn with_session<T>(&self, f: impl FnOnce(&WriteTransaction) -> Result<T>) -> Result<T> {
        let mut session = self
            .session
            .lock()
            .map_err(|_| RevgraphError::Internal("session lock poisoned".into()))?;
        if session.is_none() {
            *session = Some(self.db.begin_write()?);
        }
        match session.as_ref() {
            Some(txn) => f(txn),
            None => Err(RevgraphError::Internal("session transaction missing".into())),
        }
    }

    fn branch_index(&self) -> Result<MutexGuard<'_, BranchIndex>> {
        self.branches
            .lock()
            .map_err(|_| RevgraphError::Internal("branch index lock poisoned".into()))
    }

    fn current(&self) -> Result<MutexGuard<'_, Position>> {
        self.position
            .lock()
            .map_err(|_| RevgraphError::Internal("position lock poisoned".into()))
    }

    pub(crate) fn codec(&self) -> &ValueCodec {
        &self.codec
    }

    /// Make everything written so far durable and start a new session.
    pub fn commit(&self) -> Result<()> {
        let txn = self
            .session
            .lock()
            .map_err(|_| RevgraphError::Internal("session lock poisoned".into()))?
            .take();
        if let Some(txn) = txn {
            txn.commit()?;
            debug!("committed session");
        }
        Ok(())
    }

    /// Commit and release the store.
    pub fn close(self) -> Result<()> {
        self.commit()
    }

    // -----------------------------------------------------------------------
    // Current position
    // -----------------------------------------------------------------------

    pub fn position(&self) -> Result<Position> {
        Ok(self.current()?.clone())
    }

    pub fn branch(&self) -> Result<String> {
        Ok(self.current()?.branch.clone())
    }

    pub fn revision(&self) -> Result<u64> {
        Ok(self.current()?.rev)
    }

    /// Move the current revision within the current branch.
    ///
    /// # Errors
    ///
    /// [`RevgraphError::RevisionBeforeBranchStart`] when `rev` precedes the
    /// current branch's fork point.
    pub fn set_revision(&self, rev: u64) -> Result<()> {
        let branch = self.branch()?;
        self.branch_index()?.check_revision(&branch, rev)?;
        self.move_to(Position::new(branch, rev))
    }

    /// Switch to `name`, forking it from the current position if it does not
    /// exist yet.
    ///
    /// # Errors
    ///
    /// [`RevgraphError::RevisionBeforeBranchStart`] when `name` exists and
    /// starts after the current revision.
    pub fn set_branch(&self, name: &str) -> Result<()> {
        let here = self.position()?;
        if self.has_branch(name)? {
            self.branch_index()?.check_revision(name, here.rev)?;
        } else {
            self.new_branch(name, &here.branch, here.rev)?;
        }
        self.move_to(Position::new(name, here.rev))
    }

    fn move_to(&self, to: Position) -> Result<()> {
        let rev = to.rev.to_string();
        self.with_session(|txn| {
            let mut table = txn.open_table(GLOBALS)?;
            table.insert("branch", to.branch.as_str())?;
            table.insert("rev", rev.as_str())?;
            Ok(())
        })?;
        debug!(position = %to, "moved current position");
        *self.current()? = to;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Branches
    // -----------------------------------------------------------------------

    /// Fork `name` from `parent` at `parent_rev`.
    pub fn new_branch(&self, name: &str, parent: &str, parent_rev: u64) -> Result<()> {
        {
            let index = self.branch_index()?;
            if index.contains(name) {
                return Err(RevgraphError::BranchExists(name.to_string()));
            }
            index.check_revision(parent, parent_rev)?;
        }
        let record = BranchRecord {
            parent: parent.to_string(),
            parent_rev,
        };
        let json = serde_json::to_string(&record)?;
        self.with_session(|txn| {
            let mut table = txn.open_table(BRANCHES)?;
            table.insert(name, json.as_str())?;
            Ok(())
        })?;
        self.branch_index()?.insert(name.to_string(), record);
        debug!(branch = name, parent, parent_rev, "created branch");
        Ok(())
    }

    pub fn has_branch(&self, name: &str) -> Result<bool> {
        Ok(self.branch_index()?.contains(name))
    }

    /// Every branch with its fork metadata, ordered by name.
    pub fn branches(&self) -> Result<Vec<(String, BranchRecord)>> {
        Ok(self
            .branch_index()?
            .iter()
            .map(|(name, record)| (name.clone(), record.clone()))
            .collect())
    }

    /// Branch names from `branch` back to `master`, both included.
    pub fn lineage(&self, branch: &str) -> Result<Vec<String>> {
        self.branch_index()?.lineage(branch)
    }

    pub fn is_ancestor(&self, parent: &str, child: &str) -> Result<bool> {
        self.branch_index()?.is_ancestor(parent, child)
    }

    /// Every branch descended from `branch`, nearest generations first.
    pub fn branch_descendants(&self, branch: &str) -> Result<Vec<String>> {
        let index = self.branch_index()?;
        index.record(branch)?;
        Ok(index.descendants(branch))
    }

    pub(crate) fn bounded_lineage(&self, at: &Position) -> Result<Lineage> {
        self.branch_index()?.bounded(&at.branch, at.rev)
    }

    pub(crate) fn branch_start(&self, branch: &str) -> Result<u64> {
        self.branch_index()?.start(branch)
    }

    // -----------------------------------------------------------------------
    // Graphs
    // -----------------------------------------------------------------------

    pub fn new_graph(&self, name: &str, kind: GraphKind) -> Result<()> {
        self.with_session(|txn| {
            let mut table = txn.open_table(GRAPHS)?;
            if table.get(name)?.is_some() {
                return Err(RevgraphError::GraphExists(name.to_string()));
            }
            table.insert(name, kind.as_str())?;
            Ok(())
        })?;
        debug!(graph = name, %kind, "created graph");
        Ok(())
    }

    pub fn graph_kind(&self, name: &str) -> Result<GraphKind> {
        let kind = self.with_session(|txn| {
            let table = txn.open_table(GRAPHS)?;
            let kind = table.get(name)?.map(|g| g.value().to_string());
            Ok(kind)
        })?;
        match kind {
            Some(kind) => kind.parse(),
            None => Err(RevgraphError::UnknownGraph(name.to_string())),
        }
    }

    pub fn has_graph(&self, name: &str) -> Result<bool> {
        match self.graph_kind(name) {
            Ok(_) => Ok(true),
            Err(RevgraphError::UnknownGraph(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Every graph with its kind, ordered by name.
    pub fn graphs(&self) -> Result<Vec<(String, GraphKind)>> {
        let rows = self.with_session(|txn| {
            let table = txn.open_table(GRAPHS)?;
            let mut rows = Vec::new();
            for entry in table.iter()? {
                let (name, kind) = entry?;
                rows.push((name.value().to_string(), kind.value().to_string()));
            }
            Ok(rows)
        })?;
        rows.into_iter()
            .map(|(name, kind)| Ok((name, kind.parse()?)))
            .collect()
    }

    /// Remove every trace of a graph, history included.
    pub fn delete_graph(&self, name: &str) -> Result<()> {
        self.graph_kind(name)?;
        let removed = self.with_session(|txn| {
            let mut removed = 0;
            for t in table::ALL {
                removed += t.remove_graph(txn, name)?;
            }
            let mut graphs = txn.open_table(GRAPHS)?;
            graphs.remove(name)?;
            Ok(removed)
        })?;
        debug!(graph = name, rows = removed, "deleted graph");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Attributes
    // -----------------------------------------------------------------------

    /// The raw row visible for `key` at `at`.
    ///
    /// `None` means the key was never set along the lineage; a tombstone
    /// comes back as `Some` with [`Tag::Unset`].
    pub fn lookup_at(&self, entity: &Entity, key: &str, at: &Position) -> Result<Option<StoredValue>> {
        let lineage = self.bounded_lineage(at)?;
        self.graph_kind(entity.graph_name())?;
        self.lookup_with(entity, key, &lineage)
    }

    pub(crate) fn lookup_with(
        &self,
        entity: &Entity,
        key: &str,
        lineage: &Lineage,
    ) -> Result<Option<StoredValue>> {
        let owner = entity.owner();
        let table = entity.value_table();
        let row = self.with_session(|txn| table.get(txn, entity.graph_name(), &owner, key, lineage))?;
        trace!(
            table = table.name(),
            %entity,
            key,
            found = ?row.as_ref().map(|r| (&r.branch, r.rev)),
            "resolved attribute"
        );
        Ok(row.map(|r| r.stored))
    }

    /// The value of `key` at `at`, or `None` when unset or deleted.
    pub fn get_at(&self, entity: &Entity, key: &str, at: &Position) -> Result<Option<Value>> {
        match self.lookup_at(entity, key, at)? {
            Some(stored) => self.codec.decode(&stored),
            None => Ok(None),
        }
    }

    pub fn set_at(&self, entity: &Entity, key: &str, value: &Value, at: &Position) -> Result<()> {
        let stored = self.codec.encode(value)?;
        self.write_attr(entity, key, &stored, at)
    }

    /// Record a tombstone for `key` at `at`.
    pub fn delete_at(&self, entity: &Entity, key: &str, at: &Position) -> Result<()> {
        self.write_attr(entity, key, &StoredValue::tombstone(), at)
    }

    fn write_attr(&self, entity: &Entity, key: &str, stored: &StoredValue, at: &Position) -> Result<()> {
        self.branch_index()?.check_revision(&at.branch, at.rev)?;
        self.check_owner(entity)?;
        let owner = entity.owner();
        let table = entity.value_table();
        self.with_session(|txn| {
            table.set(txn, entity.graph_name(), &owner, key, &at.branch, at.rev, stored)
        })?;
        trace!(table = table.name(), %entity, key, tag = %stored.tag, position = %at, "wrote attribute");
        Ok(())
    }

    /// Keys with a value (not deleted) at `at`.
    pub fn keys_at(&self, entity: &Entity, at: &Position) -> Result<Vec<String>> {
        let lineage = self.bounded_lineage(at)?;
        self.graph_kind(entity.graph_name())?;
        let mut out = Vec::new();
        for key in self.all_keys(entity)? {
            if let Some(stored) = self.lookup_with(entity, &key, &lineage)? {
                if !stored.is_tombstone() {
                    out.push(key);
                }
            }
        }
        Ok(out)
    }

    /// Every key ever written for `entity`, on any branch.
    pub(crate) fn all_keys(&self, entity: &Entity) -> Result<BTreeSet<String>> {
        let owner = entity.owner();
        let table = entity.value_table();
        self.with_session(|txn| table.keys(txn, entity.graph_name(), &owner))
    }

    pub(crate) fn branch_rows(
        &self,
        entity: &Entity,
        key: &str,
        branch: &str,
        after: u64,
        through: u64,
    ) -> Result<Vec<(u64, StoredValue)>> {
        let owner = entity.owner();
        let table = entity.value_table();
        self.with_session(|txn| {
            table.branch_rows(txn, entity.graph_name(), &owner, key, branch, after, through)
        })
    }

    /// Graph attributes may be written once the graph exists; node and edge
    /// attributes need an existence record for their owner.
    fn check_owner(&self, entity: &Entity) -> Result<()> {
        self.graph_kind(entity.graph_name())?;
        let kind = entity.kind();
        if kind == EntityKind::Graph {
            return Ok(());
        }
        let owner = entity.owner();
        let known = self.with_session(|txn| {
            existence_table(kind)?.has_owner(txn, entity.graph_name(), &owner)
        })?;
        if !known {
            return Err(RevgraphError::Constraint(format!("{entity} has no existence record")));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Existence
    // -----------------------------------------------------------------------

    /// Record whether a node or edge exists as of `at`.
    pub fn set_extant_at(&self, entity: &Entity, extant: bool, at: &Position) -> Result<()> {
        let table = existence_table(entity.kind())?;
        self.branch_index()?.check_revision(&at.branch, at.rev)?;
        let kind = self.graph_kind(entity.graph_name())?;
        if let Entity::Edge {
            graph,
            source,
            target,
            idx,
        } = entity
        {
            if *idx > 0 && !kind.is_multigraph() {
                return Err(RevgraphError::Constraint(format!(
                    "parallel edge index {idx} in {kind} {graph}"
                )));
            }
            if extant {
                let lineage = self.bounded_lineage(at)?;
                for endpoint in [source, target] {
                    let node = Entity::node(graph.as_str(), endpoint.as_str());
                    if !self.extant_with(&node, &lineage)? {
                        return Err(RevgraphError::Constraint(format!(
                            "{node} does not exist at {at}"
                        )));
                    }
                }
            } else {
                for endpoint in [source, target] {
                    self.check_owner(&Entity::node(graph.as_str(), endpoint.as_str()))?;
                }
            }
        }
        let stored = self.codec.encode(&Value::Bool(extant))?;
        let owner = entity.owner();
        self.with_session(|txn| {
            table.set(txn, entity.graph_name(), &owner, EXTANT_KEY, &at.branch, at.rev, &stored)
        })?;
        trace!(%entity, extant, position = %at, "wrote existence");
        Ok(())
    }

    /// Whether the entity exists at `at`. Graphs exist from creation until
    /// deletion; nodes and edges default to absent.
    pub fn exists_at(&self, entity: &Entity, at: &Position) -> Result<bool> {
        if entity.kind() == EntityKind::Graph {
            return self.has_graph(entity.graph_name());
        }
        let lineage = self.bounded_lineage(at)?;
        self.graph_kind(entity.graph_name())?;
        self.extant_with(entity, &lineage)
    }

    fn extant_with(&self, entity: &Entity, lineage: &Lineage) -> Result<bool> {
        let table = existence_table(entity.kind())?;
        let owner = entity.owner();
        let row = self.with_session(|txn| {
            table.get(txn, entity.graph_name(), &owner, EXTANT_KEY, lineage)
        })?;
        let Some(row) = row else {
            return Ok(false);
        };
        match self.codec.decode(&row.stored)? {
            Some(Value::Bool(extant)) => Ok(extant),
            other => Err(RevgraphError::MalformedEncoding(format!(
                "existence row of {entity} at {}@{} holds {}",
                row.branch,
                row.rev,
                other.as_ref().map_or("no value", Value::kind)
            ))),
        }
    }

    /// Lazily yield the nodes or edges of `graph` that exist at `at`.
    pub fn iter_entities_at(&self, graph: &str, kind: EntityKind, at: &Position) -> Result<EntityIter<'_>> {
        let table = existence_table(kind)?;
        let lineage = self.bounded_lineage(at)?;
        self.graph_kind(graph)?;
        let owners = self.with_session(|txn| table.owners(txn, graph))?;
        let candidates = owners
            .iter()
            .map(|owner| Entity::from_owner(kind, graph, owner))
            .collect::<Result<Vec<_>>>()?;
        Ok(EntityIter {
            store: self,
            lineage,
            candidates: candidates.into_iter(),
        })
    }

    pub fn nodes_at(&self, graph: &str, at: &Position) -> Result<EntityIter<'_>> {
        self.iter_entities_at(graph, EntityKind::Node, at)
    }

    pub fn edges_at(&self, graph: &str, at: &Position) -> Result<EntityIter<'_>> {
        self.iter_entities_at(graph, EntityKind::Edge, at)
    }

    /// Nodes reachable from `node` over one extant edge. In undirected
    /// graphs an edge leads both ways.
    pub fn successors_at(&self, graph: &str, node: &str, at: &Position) -> Result<Vec<String>> {
        let directed = self.graph_kind(graph)?.is_directed();
        let mut out = BTreeSet::new();
        for edge in self.edges_at(graph, at)? {
            if let Entity::Edge { source, target, .. } = edge? {
                if source == node {
                    out.insert(target);
                } else if !directed && target == node {
                    out.insert(source);
                }
            }
        }
        Ok(out.into_iter().collect())
    }

    /// Nodes with an extant edge into `node`. In undirected graphs this is
    /// the same set as [`successors_at`](Self::successors_at).
    pub fn predecessors_at(&self, graph: &str, node: &str, at: &Position) -> Result<Vec<String>> {
        let directed = self.graph_kind(graph)?.is_directed();
        let mut out = BTreeSet::new();
        for edge in self.edges_at(graph, at)? {
            if let Entity::Edge { source, target, .. } = edge? {
                if target == node {
                    out.insert(source);
                } else if !directed && source == node {
                    out.insert(target);
                }
            }
        }
        Ok(out.into_iter().collect())
    }

    /// Indices of the extant edges from `source` to `target`.
    pub fn parallel_edges_at(&self, graph: &str, source: &str, target: &str, at: &Position) -> Result<Vec<u64>> {
        let mut out = Vec::new();
        for edge in self.edges_at(graph, at)? {
            if let Entity::Edge {
                source: s,
                target: t,
                idx,
                ..
            } = edge?
            {
                if s == source && t == target {
                    out.push(idx);
                }
            }
        }
        out.sort_unstable();
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Current-position conveniences
    // -----------------------------------------------------------------------

    pub fn get(&self, entity: &Entity, key: &str) -> Result<Option<Value>> {
        self.get_at(entity, key, &self.position()?)
    }

    pub fn set(&self, entity: &Entity, key: &str, value: &Value) -> Result<()> {
        self.set_at(entity, key, value, &self.position()?)
    }

    pub fn delete(&self, entity: &Entity, key: &str) -> Result<()> {
        self.delete_at(entity, key, &self.position()?)
    }

    pub fn keys(&self, entity: &Entity) -> Result<Vec<String>> {
        self.keys_at(entity, &self.position()?)
    }

    pub fn exists(&self, entity: &Entity) -> Result<bool> {
        self.exists_at(entity, &self.position()?)
    }

    pub fn add_node(&self, graph: &str, node: &str) -> Result<()> {
        self.set_extant_at(&Entity::node(graph, node), true, &self.position()?)
    }

    pub fn remove_node(&self, graph: &str, node: &str) -> Result<()> {
        self.set_extant_at(&Entity::node(graph, node), false, &self.position()?)
    }

    pub fn add_edge(&self, graph: &str, source: &str, target: &str, idx: u64) -> Result<()> {
        let edge = Entity::multi_edge(graph, source, target, idx);
        self.set_extant_at(&edge, true, &self.position()?)
    }

    pub fn remove_edge(&self, graph: &str, source: &str, target: &str, idx: u64) -> Result<()> {
        let edge = Entity::multi_edge(graph, source, target, idx);
        self.set_extant_at(&edge, false, &self.position()?)
    }

    pub fn nodes(&self, graph: &str) -> Result<EntityIter<'_>> {
        self.nodes_at(graph, &self.position()?)
    }

    pub fn edges(&self, graph: &str) -> Result<EntityIter<'_>> {
        self.edges_at(graph, &self.position()?)
    }

    /// The value of `key` at the current position, wrapped in a
    /// [`MutableView`] when it is a list or a map.
    pub fn view(&self, entity: &Entity, key: &str) -> Result<Option<ViewItem<'_>>> {
        Ok(self
            .get(entity, key)?
            .map(|value| ViewItem::wrap(self, entity, key, Vec::new(), value)))
    }
}

impl std::fmt::Debug for VersionedGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionedGraph")
            .field("position", &self.position.lock().ok().map(|p| p.to_string()))
            .field("opaque", &self.codec.opaque_enabled())
            .finish_non_exhaustive()
    }
}

/// Iterator over the nodes or edges that exist at one position.
///
/// Candidates are collected up front (one per owner, so no duplicates);
/// existence is resolved one candidate at a time as the iterator advances.
pub struct EntityIter<'g> {
    store: &'g VersionedGraph,
    lineage: Lineage,
    candidates: std::vec::IntoIter<Entity>,
}

impl Iterator for EntityIter<'_> {
    type Item = Result<Entity>;

    fn next(&mut self) -> Option<Self::Item> {
        for entity in self.candidates.by_ref() {
            match self.store.extant_with(&entity, &self.lineage) {
                Ok(true) => return Some(Ok(entity)),
                Ok(false) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
        None
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
