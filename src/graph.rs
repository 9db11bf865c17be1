//! The dependency graph: an arena of module nodes addressed by stable ids
//!
//! Import entries reference other nodes (and entries in their export tables)
//! by id instead of by pointer, so two importers of the same physical file
//! share a single node.

use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Stable index of a node in the graph arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct NodeId(pub usize);

/// Reference to one entry in a node's export table
pub type ExportRef = (NodeId, usize);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum UnresolvedCause {
    /// No search path candidate exists on disk
    NotFound,
    /// The image does not match the run's locked machine type / address width
    ArchMismatch { expected: u16, found: u16 },
    /// The file exists but is not a usable PE image
    BadImage(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum NodeStatus {
    Unvisited,
    Unresolved(UnresolvedCause),
    Processed,
}

/// One exported symbol of a module
#[derive(Debug, Clone, Serialize)]
pub struct ExportEntry {
    /// Export address as an RVA, kept for display
    pub rva: u32,
    /// Preferred absolute address (image base + RVA)
    pub address: u64,
    pub name: Option<String>,
    pub ordinal: u32,
    /// Raw forwarder string ("TargetModule.TargetSymbol" or "TargetModule.#N")
    pub forward: Option<String>,
    /// Final target of the forwarder chain, filled in lazily
    pub forward_to: Option<ExportRef>,
    /// Index of the owning section
    pub section: Option<usize>,
}

/// One slot of a module's import table
#[derive(Debug, Clone, Serialize)]
pub struct ImportEntry {
    /// Thunk value as found in the import name table
    pub orig_thunk: u64,
    /// Bound value from the import address table
    pub thunk: u64,
    /// Symbol name; None for import-by-ordinal
    pub name: Option<String>,
    /// Requested ordinal; None for import-by-name
    pub ordinal: Option<u16>,
    /// Node exporting this symbol, once resolved
    pub dll: Option<NodeId>,
    /// Matched export entry, once resolved
    pub symbol: Option<ExportRef>,
    pub delayed: bool,
}

/// One module in the dependency graph
#[derive(Debug, Clone, Serialize)]
pub struct DepNode {
    /// Name as requested (import table entry or command-line argument)
    pub name: String,
    /// Resolved absolute path; None while unresolved
    pub path: Option<PathBuf>,
    /// Preferred load address, display only
    pub image_base: u64,
    pub status: NodeStatus,
    /// Imported modules, in import directory order
    pub children: Vec<NodeId>,
    pub imports: Vec<ImportEntry>,
    pub exports: Vec<ExportEntry>,
}

impl DepNode {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            path: None,
            image_base: 0,
            status: NodeStatus::Unvisited,
            children: Vec::new(),
            imports: Vec::new(),
            exports: Vec::new(),
        }
    }

    pub fn is_unresolved(&self) -> bool {
        matches!(self.status, NodeStatus::Unresolved(_))
    }
}

/// Arena of dependency nodes, deduplicated by resolved path
#[derive(Debug, Default, Serialize)]
pub struct DepGraph {
    nodes: Vec<DepNode>,
    /// lowercased requested name -> node
    #[serde(skip)]
    by_name: HashMap<String, NodeId>,
    /// lowercased canonical path -> node
    #[serde(skip)]
    by_path: HashMap<String, NodeId>,
}

impl DepGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &DepNode {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut DepNode {
        &mut self.nodes[id.0]
    }

    /// Node ids in discovery order
    pub fn ids(&self) -> impl Iterator<Item = NodeId> {
        (0..self.nodes.len()).map(NodeId)
    }

    pub fn add_node(&mut self, name: &str) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(DepNode::new(name));
        self.by_name.insert(name.to_lowercase(), id);
        id
    }

    pub fn find_by_name(&self, name: &str) -> Option<NodeId> {
        self.by_name.get(&name.to_lowercase()).copied()
    }

    pub fn find_by_path(&self, path: &Path) -> Option<NodeId> {
        self.by_path.get(&Self::path_key(path)).copied()
    }

    /// Record the resolved path of a node and index it for deduplication
    pub fn bind_path(&mut self, id: NodeId, path: PathBuf) {
        self.by_path.insert(Self::path_key(&path), id);
        self.nodes[id.0].path = Some(path);
    }

    /// Make `name` an alias for an existing node (same physical file)
    pub fn bind_name(&mut self, id: NodeId, name: &str) {
        self.by_name.insert(name.to_lowercase(), id);
    }

    fn path_key(path: &Path) -> String {
        path.to_string_lossy().to_lowercase()
    }
}
