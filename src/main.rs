use anyhow::Context;
use clap::Parser;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use winldd::common::{decanonicalize, path_to_string};
use winldd::{
    build_dependency_graph, BuildContext, DepGraph, NodeId, NodeStatus, SearchPaths,
};

#[derive(Parser, Debug)]
#[command(
    name = "winldd",
    version,
    about = "List the DLLs a Windows executable or DLL depends on, ldd-style"
)]
struct Cli {
    /// Does not do anything, for compatibility
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Not implemented
    #[arg(short = 'u', long)]
    unused: bool,

    /// Not implemented
    #[arg(short = 'd', long)]
    data_relocs: bool,

    /// Not implemented
    #[arg(short = 'r', long)]
    function_relocs: bool,

    /// List dependencies of dependencies, recursively
    #[arg(short = 'R', long)]
    recursive: bool,

    /// Additional directories to search for DLLs, semicolon-separated
    #[arg(short = 'D', long = "search-dir", value_name = "DIR[;DIR...]")]
    search_dir: Vec<String>,

    /// List exports of every printed module
    #[arg(short = 'e', long = "list-exports")]
    list_exports: bool,

    /// List imports of every printed module
    #[arg(short = 'i', long = "list-imports")]
    list_imports: bool,

    /// Write a module definition (.def) file for each argument instead of a tree
    #[arg(long = "def-output")]
    def_output: bool,

    /// Undecorate MSVC-mangled symbol names in listings
    #[arg(long)]
    demangle: bool,

    /// Dump the whole dependency graph as JSON to PATH
    #[arg(long = "output-json", value_name = "PATH")]
    output_json: Option<PathBuf>,

    #[arg(required = true, value_name = "FILE")]
    files: Vec<String>,
}

struct PrintOptions {
    recursive: bool,
    list_exports: bool,
    list_imports: bool,
    demangle: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut search_paths = SearchPaths::from_environment();
    for arg in &cli.search_dir {
        search_paths.add_search_dir_arg(arg);
    }
    // each argument's own directory is also searched, like -D
    for file in &cli.files {
        if let Some(parent) = Path::new(file).parent() {
            if !parent.as_os_str().is_empty() && parent.is_dir() {
                search_paths.add_user_dir(parent);
            }
        }
    }

    let mut ctx = BuildContext::new(search_paths);
    ctx.recursive = cli.recursive;
    ctx.data_relocs = cli.data_relocs;
    ctx.function_relocs = cli.function_relocs;

    let (graph, roots) = build_dependency_graph(&mut ctx, &cli.files);

    let options = PrintOptions {
        recursive: cli.recursive,
        list_exports: cli.list_exports,
        list_imports: cli.list_imports,
        demangle: cli.demangle,
    };
    let mut lines = Vec::new();
    let mut visited = HashSet::new();
    for (file, root) in cli.files.iter().zip(&roots) {
        if cli.files.len() > 1 {
            lines.push(format!("{}:", file));
        }
        if cli.def_output {
            render_def(&graph, *root, &mut lines);
        } else {
            render_tree(&graph, *root, &options, &mut visited, &mut lines);
        }
    }
    for line in &lines {
        println!("{}", line);
    }

    if let Some(path) = &cli.output_json {
        let file = fs_err::File::create(path)
            .with_context(|| format!("cannot create {}", path_to_string(path)))?;
        serde_json::to_writer_pretty(file, &graph)
            .with_context(|| format!("cannot write {}", path_to_string(path)))?;
    }

    // scan failures are part of the report, not an error
    Ok(())
}

fn render_tree(
    graph: &DepGraph,
    root: NodeId,
    options: &PrintOptions,
    visited: &mut HashSet<NodeId>,
    out: &mut Vec<String>,
) {
    let node = graph.node(root);
    if node.is_unresolved() {
        out.push(format!("{}: not found", node.name));
        return;
    }
    visited.insert(root);
    if options.list_imports {
        render_imports(graph, root, options.demangle, 0, out);
    }
    // an export listing replaces the tree entirely
    if options.list_exports {
        render_exports(graph, root, options.demangle, 0, out);
        return;
    }
    for &child in &node.children {
        render_node(graph, child, 1, options, visited, out);
    }
}

fn render_node(
    graph: &DepGraph,
    id: NodeId,
    depth: usize,
    options: &PrintOptions,
    visited: &mut HashSet<NodeId>,
    out: &mut Vec<String>,
) {
    let node = graph.node(id);
    let indent = "\t".repeat(depth);
    match (&node.status, &node.path) {
        (NodeStatus::Unresolved(_), _) | (_, None) => {
            out.push(format!("{}{} => not found", indent, node.name));
            return;
        }
        (_, Some(path)) => {
            let shown = decanonicalize(&path.to_string_lossy());
            if shown.to_lowercase() == node.name.to_lowercase() {
                out.push(format!("{}{} (0x{:x})", indent, node.name, node.image_base));
            } else {
                out.push(format!(
                    "{}{} => {} (0x{:x})",
                    indent, node.name, shown, node.image_base
                ));
            }
        }
    }
    // expand each module once per print run
    if !visited.insert(id) {
        return;
    }
    if options.list_imports {
        render_imports(graph, id, options.demangle, depth, out);
    }
    if options.recursive {
        for &child in &graph.node(id).children {
            render_node(graph, child, depth + 1, options, visited, out);
        }
    }
}

fn render_exports(
    graph: &DepGraph,
    id: NodeId,
    demangle: bool,
    depth: usize,
    out: &mut Vec<String>,
) {
    let indent = "\t".repeat(depth + 1);
    for export in &graph.node(id).exports {
        let name = export
            .name
            .as_deref()
            .map(|n| display_symbol(n, demangle))
            .unwrap_or_else(|| "<unnamed>".to_owned());
        let mut line = format!("{}[{}] {} (0x{:x})", indent, export.ordinal, name, export.rva);
        if let Some(forward) = &export.forward {
            line.push_str(&format!(" -> {}", forward));
        }
        if let Some(section) = export.section {
            line.push_str(&format!(" <{}>", section));
        }
        out.push(line);
    }
}

fn render_imports(
    graph: &DepGraph,
    id: NodeId,
    demangle: bool,
    depth: usize,
    out: &mut Vec<String>,
) {
    let indent = "\t".repeat(depth + 1);
    for import in &graph.node(id).imports {
        let name = import
            .name
            .as_deref()
            .map(|n| display_symbol(n, demangle))
            .unwrap_or_default();
        let ordinal = import
            .ordinal
            .map(|o| o.to_string())
            .unwrap_or_default();
        let marker = if import.symbol.is_none() {
            " <UNRESOLVED>"
        } else {
            ""
        };
        let dll = match import.dll {
            Some(dll) => graph.node(dll).name.as_str(),
            None => "<MODULE MISSING>",
        };
        out.push(format!(
            "{}0x{:08x} 0x{:08x} {:>5} {}{} {}",
            indent, import.orig_thunk, import.thunk, ordinal, name, marker, dll
        ));
    }
}

/// Write the module's exports in module-definition (.def) syntax
fn render_def(graph: &DepGraph, root: NodeId, out: &mut Vec<String>) {
    let node = graph.node(root);
    if node.is_unresolved() {
        out.push(format!("{}: not found", node.name));
        return;
    }
    let library = Path::new(&node.name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| node.name.clone());
    out.push(format!("LIBRARY {}", library));
    out.push("EXPORTS".to_owned());
    for export in &node.exports {
        let name = match export.name.as_deref() {
            Some(name) => name,
            // anonymous exports cannot be expressed in a .def file
            None => continue,
        };
        match &export.forward {
            Some(forward) => out.push(format!("{}={}", name, forward)),
            None => out.push(format!("{} @{}", name, export.ordinal)),
        }
    }
}

fn display_symbol(name: &str, demangle: bool) -> String {
    if demangle {
        if let Ok(undecorated) = msvc_demangler::demangle(name, msvc_demangler::DemangleFlags::llvm())
        {
            return undecorated;
        }
    }
    name.to_owned()
}
