//! `slotsat` is an equality saturation engine over a slotted, hash-consed
//! e-graph: e-classes carry named bound variables (slots), discovered slot
//! symmetries are folded into per-class permutation groups, and rewriting is
//! driven by compiled pattern programs and batched command schedules.

mod group;
mod parallel;
mod slot;
mod tree;
mod utils;

pub mod egraph;

#[cfg(test)]
pub(crate) mod testing;

pub use group::{Perm, PermGroup};
pub use parallel::{Canceled, CancellationToken, ParallelMap, TimingReport};
pub use slot::{Slot, SlotMap, SlotSet};
pub use tree::{MixedTree, NodeT, Tree};
pub use utils::{sample_shifted_geometric, RandomSource};

pub mod prelude {
    pub use crate::egraph::{
        Analysis, Applier, EClassCall, EClassRef, EGraph, ENode, Extractor, Pattern, PatternMatch,
        Rule, Searcher, Strategy,
    };
    pub use crate::{MixedTree, NodeT, ParallelMap, Slot, SlotMap, SlotSet, Tree};
}
