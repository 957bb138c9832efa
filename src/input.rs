//! Region input records and graph construction
//!
//! The core consumes a CFG region as an ordered sequence of block records
//! plus an entry id. Payloads are opaque: the core only reads the declared
//! weight. Validation failures here are fatal for the region and surface as
//! [`RegionError::Malformed`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::RegionError;
use crate::graph::scope_closer::set_scope_closer_target;
use crate::graph::{CaseLabels, EdgeInfo, PayloadId, RegionGraph};

/// One CFG region as handed over by the caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionInput {
    /// Function display name
    pub function: String,
    /// Region display name
    #[serde(default = "default_region_name")]
    pub region: String,
    /// Id of the entry block
    pub entry: u64,
    /// Blocks in declaration order
    pub blocks: Vec<BlockRecord>,
}

fn default_region_name() -> String {
    "root".to_string()
}

/// One basic block record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockRecord {
    /// Caller-chosen id, unique within the region
    pub id: u64,
    /// Opaque payload reference; defaults to the block id
    #[serde(default)]
    pub payload: Option<u64>,
    /// Display name; defaults to `bb<id>`
    #[serde(default)]
    pub name: Option<String>,
    /// Size estimate (instruction count)
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Outgoing labeled edges in successor order
    #[serde(default)]
    pub edges: Vec<EdgeRecord>,
    /// Dashed scope-closer target, if the upstream scope analysis set one
    #[serde(default)]
    pub scope_closer: Option<u64>,
}

fn default_weight() -> u32 {
    1
}

/// One labeled successor edge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeRecord {
    pub target: u64,
    /// Case labels; empty = default/unlabeled edge
    #[serde(default)]
    pub labels: Vec<i64>,
    /// Pre-marked inlined edges are honored but normally absent in input
    #[serde(default)]
    pub inlined: bool,
}

/// Build a [`RegionGraph`] from the input records.
///
/// Rejects duplicate block ids, dangling edge targets and a missing entry.
pub fn build_region_graph(input: &RegionInput) -> Result<RegionGraph, RegionError> {
    let mut graph = RegionGraph::new(&input.function, &input.region);
    let mut by_id = HashMap::new();
    let mut max_id = 0u64;

    for block in &input.blocks {
        if by_id.contains_key(&block.id) {
            return Err(RegionError::Malformed(format!("duplicate node id {}", block.id)));
        }
        let name = block
            .name
            .clone()
            .unwrap_or_else(|| format!("bb{}", block.id));
        let payload = Some(PayloadId(block.payload.unwrap_or(block.id)));
        let ix = graph.add_node(payload, name, block.weight);
        // Input ids are authoritative; synthetic nodes allocate above them.
        graph.node_mut(ix).id = crate::graph::NodeId(block.id);
        by_id.insert(block.id, ix);
        max_id = max_id.max(block.id);
    }
    graph.reserve_ids_through(max_id);

    for block in &input.blocks {
        let src = by_id[&block.id];
        for edge in &block.edges {
            let dst = *by_id.get(&edge.target).ok_or_else(|| {
                RegionError::Malformed(format!(
                    "edge {} -> {} targets an unknown node",
                    block.id, edge.target
                ))
            })?;
            let labels: CaseLabels = edge.labels.iter().copied().collect();
            graph.add_edge(src, dst, EdgeInfo { labels, inlined: edge.inlined });
        }
    }

    for block in &input.blocks {
        if let Some(target) = block.scope_closer {
            let src = by_id[&block.id];
            let dst = *by_id.get(&target).ok_or_else(|| {
                RegionError::Malformed(format!(
                    "scope closer of {} targets an unknown node {}",
                    block.id, target
                ))
            })?;
            set_scope_closer_target(&mut graph, src, dst);
        }
    }

    let entry = *by_id
        .get(&input.entry)
        .ok_or_else(|| RegionError::Malformed(format!("missing entry node {}", input.entry)))?;
    graph.set_entry(entry);
    Ok(graph)
}
