//! winldd is ldd for Windows binaries: it parses PE executables and DLLs,
//! walks their (delay-)import tables recursively along the standard Windows
//! search order, and exposes the result as a graph of modules with matched
//! import/export symbols. It runs on Windows and, for cross builds, on any
//! host with the target DLLs on disk.

pub mod builder;
pub mod common;
pub mod context;
pub mod graph;
pub mod lookup_path;
pub mod pe;
pub mod system;
pub mod tables;

#[cfg(test)]
pub(crate) mod testimage;

pub use builder::TreeBuilder;
pub use common::LddError;
pub use context::BuildContext;
pub use graph::{
    DepGraph, DepNode, ExportEntry, ExportRef, ImportEntry, NodeId, NodeStatus, UnresolvedCause,
};
pub use lookup_path::SearchPaths;
pub use pe::PeImage;

/// Build one shared dependency graph for a set of root files
///
/// Roots are processed in argument order and share nodes for common
/// dependencies. The returned ids index the per-file trees; failures are
/// recorded on the nodes themselves.
pub fn build_dependency_graph(
    ctx: &mut BuildContext,
    files: &[String],
) -> (DepGraph, Vec<NodeId>) {
    let mut graph = DepGraph::new();
    let roots = {
        let mut builder = TreeBuilder::new(ctx, &mut graph);
        files.iter().map(|f| builder.build_root(f)).collect()
    };
    (graph, roots)
}
