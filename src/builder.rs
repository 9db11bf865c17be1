//! Recursive construction of the dependency graph
//!
//! Modules are resolved depth-first. A module that is already on the
//! in-progress stack is not descended into again, which is what keeps
//! mutually-importing DLLs from recursing forever; the import edge still
//! points at the partially built node. Failures to resolve a module or a
//! symbol are recorded as node/entry state and never abort the scan.

use crate::common::LddError;
use crate::context::BuildContext;
use crate::graph::{DepGraph, DepNode, ExportRef, ImportEntry, NodeId, NodeStatus, UnresolvedCause};
use crate::pe::PeImage;
use crate::tables;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

pub struct TreeBuilder<'a> {
    ctx: &'a mut BuildContext,
    graph: &'a mut DepGraph,
}

impl<'a> TreeBuilder<'a> {
    pub fn new(ctx: &'a mut BuildContext, graph: &'a mut DepGraph) -> Self {
        Self { ctx, graph }
    }

    /// Build the tree for one command-line argument
    ///
    /// Unlike an import table entry, the argument may be a relative or
    /// absolute path, so it is probed literally before the search order runs.
    pub fn build_root(&mut self, file: &str) -> NodeId {
        let literal = Path::new(file);
        if literal.is_file() {
            let path = fs_err::canonicalize(literal).unwrap_or_else(|_| literal.to_owned());
            return self.build_at(file, path);
        }
        self.build(file, None)
    }

    /// Resolve a module name and build (or reuse) its node
    fn build(&mut self, name: &str, importer_dir: Option<&Path>) -> NodeId {
        if let Some(id) = self.graph.find_by_name(name) {
            return id;
        }
        let wow64 = self.ctx.wants_wow64();
        match self.ctx.search_paths.resolve(name, importer_dir, wow64) {
            Ok(path) => {
                let path = fs_err::canonicalize(&path).unwrap_or(path);
                self.build_at(name, path)
            }
            Err(LddError::NotFound(_)) => self.give_up(name, UnresolvedCause::NotFound),
            Err(other) => self.give_up(name, UnresolvedCause::BadImage(other.to_string())),
        }
    }

    fn build_at(&mut self, name: &str, path: PathBuf) -> NodeId {
        if let Some(id) = self.graph.find_by_path(&path) {
            // One node per physical file. This also covers import cycles: a
            // module on the in-progress stack is found here and returned as
            // is instead of being descended into again.
            debug_assert!(
                self.graph.node(id).status != NodeStatus::Unvisited
                    || self.ctx.descending_into(&path)
            );
            self.graph.bind_name(id, name);
            return id;
        }

        let id = self.graph.add_node(name);
        self.graph.bind_path(id, path.clone());
        match self.process(id, &path) {
            Ok(()) => self.graph.node_mut(id).status = NodeStatus::Processed,
            Err(cause) => {
                // an unresolved node carries no imports/exports/children
                let node = self.graph.node_mut(id);
                node.status = NodeStatus::Unresolved(cause);
                node.children.clear();
                node.imports.clear();
                node.exports.clear();
            }
        }
        id
    }

    fn give_up(&mut self, name: &str, cause: UnresolvedCause) -> NodeId {
        let id = self.graph.add_node(name);
        self.graph.node_mut(id).status = NodeStatus::Unresolved(cause);
        id
    }

    fn process(&mut self, id: NodeId, path: &Path) -> Result<(), UnresolvedCause> {
        let bad = |e: LddError| UnresolvedCause::BadImage(e.to_string());
        let image = PeImage::parse(path).map_err(bad)?;
        self.ctx.check_arch(image.machine, image.pe32_plus)?;

        let exports = tables::extract_exports(&image).map_err(bad)?;
        let modules = tables::extract_imports(&image).map_err(bad)?;
        {
            let node = self.graph.node_mut(id);
            node.image_base = image.image_base;
            node.exports = exports;
        }
        drop(image);

        let importer_dir = path.parent().map(Path::to_owned);
        self.ctx.in_progress.push(path.to_owned());
        for group in modules {
            let dll_id = self.build(&group.dll, importer_dir.as_deref());
            if !self.graph.node(id).children.contains(&dll_id) {
                self.graph.node_mut(id).children.push(dll_id);
            }
            let dll_resolved = !self.graph.node(dll_id).is_unresolved();
            for mut entry in group.entries {
                if dll_resolved {
                    entry.dll = Some(dll_id);
                    entry.symbol = self.match_import(&entry, dll_id, importer_dir.as_deref());
                }
                self.graph.node_mut(id).imports.push(entry);
            }
        }
        self.ctx.in_progress.pop();
        Ok(())
    }

    /// Match one import slot against the exporting module, following
    /// forwarder chains to the first non-forwarding export
    fn match_import(
        &mut self,
        entry: &ImportEntry,
        dll_id: NodeId,
        importer_dir: Option<&Path>,
    ) -> Option<ExportRef> {
        let index = find_export(self.graph.node(dll_id), entry.name.as_deref(), entry.ordinal)?;
        self.chase_forwarders((dll_id, index), importer_dir)
    }

    fn chase_forwarders(
        &mut self,
        start: ExportRef,
        importer_dir: Option<&Path>,
    ) -> Option<ExportRef> {
        let mut seen: HashSet<ExportRef> = HashSet::new();
        let mut current = start;
        loop {
            let export = &self.graph.node(current.0).exports[current.1];
            let forward = match &export.forward {
                None => return Some(current),
                Some(f) => f.clone(),
            };
            // the cycle check must also cover hops with a cached link, or a
            // cyclic chain would be followed forever on its second traversal
            if !seen.insert(current) {
                return None;
            }
            if let Some(next) = export.forward_to {
                current = next;
                continue;
            }

            let (module, target) = parse_forwarder(&forward)?;
            let exporter_dir = self
                .graph
                .node(current.0)
                .path
                .as_ref()
                .and_then(|p| p.parent())
                .map(Path::to_owned);
            let next_id = self.build(&module, exporter_dir.as_deref().or(importer_dir));
            if self.graph.node(next_id).is_unresolved() {
                return None;
            }
            let (name, ordinal) = match &target {
                ForwardTarget::Name(n) => (Some(n.as_str()), None),
                ForwardTarget::Ordinal(o) => (None, Some(*o)),
            };
            let index = find_export(self.graph.node(next_id), name, ordinal)?;
            self.graph.node_mut(current.0).exports[current.1].forward_to = Some((next_id, index));
            current = (next_id, index);
        }
    }
}

enum ForwardTarget {
    Name(String),
    Ordinal(u16),
}

/// Split a forwarder string into its module (with the implied .dll extension
/// restored) and its target symbol or ordinal
fn parse_forwarder(forward: &str) -> Option<(String, ForwardTarget)> {
    let (module, symbol) = forward.split_once('.')?;
    if module.is_empty() || symbol.is_empty() {
        return None;
    }
    let target = if let Some(ordinal) = symbol.strip_prefix('#') {
        ForwardTarget::Ordinal(ordinal.parse().ok()?)
    } else {
        ForwardTarget::Name(symbol.to_owned())
    };
    Some((format!("{}.dll", module), target))
}

/// Locate the export matching an import slot: by exact name when the import
/// carries one, by ordinal equality otherwise
fn find_export(node: &DepNode, name: Option<&str>, ordinal: Option<u16>) -> Option<usize> {
    if let Some(name) = name {
        node.exports
            .iter()
            .position(|e| e.name.as_deref() == Some(name))
    } else {
        let ordinal = ordinal? as u32;
        node.exports.iter().position(|e| e.ordinal == ordinal)
    }
}
