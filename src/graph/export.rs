//! Region graph export to DOT format for Graphviz
//!
//! Advisory debug artifacts: one `Region-<name>-<phase>.dot` per pass phase,
//! written only when `debug.dump_dots` is enabled. Directories are created
//! on demand.

use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::graph::{NodeKind, RegionGraph};

/// Render a region graph as a DOT digraph.
pub fn export_dot(graph: &RegionGraph) -> String {
    let mut dot = String::from("digraph RegionGraph {\n");
    dot.push_str("  rankdir=TB;\n");
    dot.push_str("  node [shape=box, style=rounded];\n\n");

    for ix in graph.node_indices() {
        let node = graph.node(ix);
        let label = escape_dot_string(&format!(
            "ID: {} Name: {}\\n{}",
            node.id.0,
            node.name,
            format_node_kind(&node.kind)
        ));
        let style = if graph.try_entry() == Some(ix) {
            ", fillcolor=green, style=filled"
        } else {
            ""
        };
        writeln!(dot, "  \"{}\" [label=\"{}\"{}];", node.id.0, label, style).ok();
    }

    dot.push('\n');
    for (edge, src, dst) in graph.edge_indices() {
        let info = graph.edge_info(edge);
        // Inlined edges are invisible to the filtered post-dominator tree;
        // keep them visually distinct.
        let color = if info.inlined { "purple" } else { "green" };
        let label = if info.labels.is_empty() {
            String::new()
        } else {
            let cases: Vec<String> = info.labels.iter().map(|l| l.to_string()).collect();
            format!(", label=\"{}\"", cases.join(","))
        };
        writeln!(
            dot,
            "  \"{}\" -> \"{}\" [color={}{}];",
            graph.node(src).id.0,
            graph.node(dst).id.0,
            color,
            label
        )
        .ok();
    }

    dot.push_str("}\n");
    dot
}

/// Write the graph to `<dir>/<function>/Region-<region>-<phase>.dot`,
/// creating directories as needed. Returns the written path.
pub fn dump_dot_file(graph: &RegionGraph, dir: &Path, phase: &str) -> io::Result<PathBuf> {
    let folder = dir.join(graph.function_name());
    fs::create_dir_all(&folder)?;
    let path = folder.join(format!("Region-{}-{}.dot", graph.region_name(), phase));
    fs::write(&path, export_dot(graph))?;
    Ok(path)
}

fn escape_dot_string(s: &str) -> String {
    s.replace('"', "\\\"")
}

fn format_node_kind(kind: &NodeKind) -> String {
    match kind {
        NodeKind::Code => "CODE".to_string(),
        NodeKind::Dispatcher => "DISPATCHER".to_string(),
        NodeKind::ArtificialEntry => "ENTRY".to_string(),
        NodeKind::ArtificialExit => "EXIT".to_string(),
        NodeKind::Break { exit_index } => format!("BREAK({exit_index})"),
        NodeKind::Continue => "CONTINUE".to_string(),
        NodeKind::SetVariable { value } => format!("SET({value})"),
        NodeKind::Collapsed => "COLLAPSED".to_string(),
        NodeKind::DummyJoin => "JOIN".to_string(),
    }
}
