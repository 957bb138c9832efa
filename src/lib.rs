// Comber: CFG restructuring engine for binary decompilation
//
// Transforms arbitrary, possibly irreducible control-flow graphs recovered
// from machine code into semantically equivalent reducible graphs, and
// emits a structured AST translatable to if/while/switch with no goto.

pub mod analysis;
pub mod ast;
pub mod config;
pub mod error;
pub mod graph;
pub mod input;
pub mod passes;

pub use ast::{build_ast, AstNode, LoopKind};
pub use config::RestructureConfig;
pub use error::RegionError;
pub use graph::RegionGraph;
pub use input::{build_region_graph, RegionInput};
pub use passes::{restructure_all, restructure_region, RegionReport, RegionStatus};
