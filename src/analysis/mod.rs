//! Edge analyses feeding the restructuring passes

pub mod cycle_equivalence;

pub use cycle_equivalence::CycleEquivalence;
