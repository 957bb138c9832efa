//! Pass pipeline: from raw region input to a structured AST
//!
//! Fixed ordering per region:
//!
//! 1. build + validate the graph
//! 2. cycle-equivalence analysis and edge bundling
//! 3. single-exit enforcement (when needed)
//! 4. inline divergent branches (when scope closers exist)
//! 5. cycle collapsing (recursively)
//! 6. untangle -> weave -> inflate, innermost graphs first
//! 7. AST build
//!
//! Each region is processed to completion with exclusive access to its
//! graph; a failing region is yielded back unrestructured with its
//! diagnostic and processing continues with the next one.

pub mod bundle;
pub mod collapse;
pub mod inflate;
pub mod inline_divergent;
pub mod single_exit;
pub mod untangle;
pub mod weave;

use std::path::PathBuf;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::analysis::CycleEquivalence;
use crate::ast::{build_ast, AstNode};
use crate::config::RestructureConfig;
use crate::error::RegionError;
use crate::graph::export::dump_dot_file;
use crate::graph::scope_closer::has_scope_closers;
use crate::graph::RegionGraph;
use crate::input::{build_region_graph, RegionInput};

/// Outcome of one region
#[derive(Debug, Serialize)]
pub enum RegionStatus {
    /// The region restructured cleanly into goto-free scopes.
    Restructured(AstNode),
    /// The region was rejected; the caller keeps the raw CFG fragment.
    Unrestructured {
        error: String,
        /// Last phase dump that succeeded, if dots were enabled
        last_dot: Option<PathBuf>,
    },
}

/// Per-region report returned to the caller
#[derive(Debug, Serialize)]
pub struct RegionReport {
    pub function: String,
    pub region: String,
    pub status: RegionStatus,
}

/// Restructure a batch of regions, one report each.
pub fn restructure_all(regions: &[RegionInput], config: &RestructureConfig) -> Vec<RegionReport> {
    regions
        .iter()
        .map(|region| restructure_region(region, config))
        .collect()
}

/// Restructure a single region.
pub fn restructure_region(input: &RegionInput, config: &RestructureConfig) -> RegionReport {
    let mut dots = DotTracker::new(config);
    match run_pipeline(input, config, &mut dots) {
        Ok(ast) => {
            info!(function = %input.function, region = %input.region, "region restructured");
            RegionReport {
                function: input.function.clone(),
                region: input.region.clone(),
                status: RegionStatus::Restructured(ast),
            }
        }
        Err(error) => {
            warn!(
                function = %input.function,
                region = %input.region,
                %error,
                "region left unrestructured"
            );
            RegionReport {
                function: input.function.clone(),
                region: input.region.clone(),
                status: RegionStatus::Unrestructured {
                    error: error.to_string(),
                    last_dot: dots.last,
                },
            }
        }
    }
}

fn run_pipeline(
    input: &RegionInput,
    config: &RestructureConfig,
    dots: &mut DotTracker,
) -> Result<AstNode, RegionError> {
    let mut graph = build_region_graph(input)?;
    dots.dump(&graph, "initial");

    let mut classes = CycleEquivalence::compute(&graph);
    bundle::bundle_edges_by_cycle(&mut graph, &mut classes);
    bundle::purge_pass_through_dispatchers(&mut graph);
    dots.dump(&graph, "bundled");

    if single_exit::enforce_single_exit(&mut graph) {
        dots.dump(&graph, "single-exit");
    }

    if has_scope_closers(&graph) {
        let guards = inline_divergent::inline_divergent_branches(&mut graph);
        debug!(guards, "divergent branches inlined");
        dots.dump(&graph, "idb");
    }

    collapse::collapse_cycles(&mut graph);
    graph.remove_dangling_nodes();
    dots.dump(&graph, "collapsed");

    shape_passes(&mut graph, config, dots)?;

    dots.dump(&graph, "final");
    Ok(build_ast(&graph))
}

/// Untangle, weave and inflate one graph, nested bodies first.
fn shape_passes(
    graph: &mut RegionGraph,
    config: &RestructureConfig,
    dots: &mut DotTracker,
) -> Result<(), RegionError> {
    for ix in graph.nested_indices() {
        let mut body = graph
            .take_nested(ix)
            .expect("nested index without a body");
        let result = shape_passes(&mut body, config, dots);
        graph.set_nested(ix, body);
        result?;
    }

    untangle::untangle(graph, config)?;
    dots.dump(graph, "untangled");

    weave::weave(graph)?;
    dots.dump(graph, "weaved");

    inflate::inflate(graph, config)?;
    dots.dump(graph, "inflated");
    Ok(())
}

/// Writes phase dumps when enabled, remembering the last one that worked.
struct DotTracker {
    directory: Option<PathBuf>,
    last: Option<PathBuf>,
}

impl DotTracker {
    fn new(config: &RestructureConfig) -> Self {
        Self {
            directory: config.dump_dots.then(|| config.dot_directory.clone()),
            last: None,
        }
    }

    fn dump(&mut self, graph: &RegionGraph, phase: &str) {
        let Some(dir) = &self.directory else { return };
        match dump_dot_file(graph, dir, phase) {
            Ok(path) => self.last = Some(path),
            Err(error) => warn!(%error, phase, "could not write dot dump"),
        }
    }
}
