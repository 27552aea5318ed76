//! Deferred additions and unions: appliers describe their effect as a
//! [`CommandSchedule`] built out of symbolic nodes, and the schedule is run
//! against a snapshot later, level by level.

use std::fmt::{self, Debug, Formatter};

use indexmap::IndexMap;

use crate::{
    egraph::{EClassCall, EGraph, ENode},
    tree::{NodeT, SlotVec},
};

/// An argument position of a symbolic node: either a call into the existing
/// graph or a handle to a node added earlier in the same schedule.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeSymbol {
    Real(EClassCall),
    Virtual(SymbolHandle),
}

/// Identifies one addition within a schedule.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymbolHandle(pub(crate) u32);

/// An e-node whose argument positions are symbols, so it can be described
/// before anything is added.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SymbolicNode<N> {
    pub op: N,
    pub defs: SlotVec,
    pub uses: SlotVec,
    pub args: Vec<NodeSymbol>,
}

/// Accumulates one rule application's (or one whole rule's) deferred
/// effect. Identical symbolic nodes are shared.
pub struct ScheduleBuilder<N> {
    adds: IndexMap<SymbolicNode<N>, usize>,
    levels: Vec<usize>,
    unions: Vec<(NodeSymbol, NodeSymbol)>,
}

impl<N: NodeT> Default for ScheduleBuilder<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<N: NodeT> ScheduleBuilder<N> {
    pub fn new() -> Self {
        Self {
            adds: IndexMap::new(),
            levels: Vec::new(),
            unions: Vec::new(),
        }
    }

    /// Record an addition; the returned symbol can appear in later nodes
    /// and unions.
    pub fn add_node(&mut self, node: SymbolicNode<N>) -> NodeSymbol {
        if let Some(index) = self.adds.get_index_of(&node) {
            return NodeSymbol::Virtual(SymbolHandle(index as u32));
        }
        let level = node
            .args
            .iter()
            .map(|a| match a {
                NodeSymbol::Real(_) => 0,
                NodeSymbol::Virtual(h) => self.levels[h.0 as usize] + 1,
            })
            .max()
            .unwrap_or(0);
        let (index, _) = self.adds.insert_full(node, level);
        self.levels.push(level);
        NodeSymbol::Virtual(SymbolHandle(index as u32))
    }

    pub fn union(&mut self, a: NodeSymbol, b: NodeSymbol) {
        self.unions.push((a, b));
    }

    pub fn is_empty(&self) -> bool {
        self.adds.is_empty() && self.unions.is_empty()
    }

    pub fn finish(self) -> CommandSchedule<N> {
        let depth = self.levels.iter().map(|&l| l + 1).max().unwrap_or(0);
        let mut levels: Vec<Vec<(SymbolHandle, SymbolicNode<N>)>> = (0..depth).map(|_| vec![]).collect();
        for (index, (node, level)) in self.adds.into_iter().enumerate() {
            levels[level].push((SymbolHandle(index as u32), node));
        }
        CommandSchedule {
            levels,
            unions: self.unions,
        }
    }
}

/// A deferred batch of additions (level-indexed by virtual-dependency
/// depth) followed by a batch of unions.
///
/// Level 0 nodes depend only on classes that already exist; level k+1 nodes
/// mention at least one level-k symbol.
#[derive(Clone)]
pub struct CommandSchedule<N> {
    levels: Vec<Vec<(SymbolHandle, SymbolicNode<N>)>>,
    unions: Vec<(NodeSymbol, NodeSymbol)>,
}

impl<N: NodeT> Default for CommandSchedule<N> {
    fn default() -> Self {
        ScheduleBuilder::new().finish()
    }
}

impl<N: NodeT> CommandSchedule<N> {
    pub fn is_empty(&self) -> bool {
        self.levels.iter().all(|l| l.is_empty()) && self.unions.is_empty()
    }

    pub fn addition_count(&self) -> usize {
        self.levels.iter().map(|l| l.len()).sum()
    }

    pub fn union_count(&self) -> usize {
        self.unions.len()
    }

    /// Append another schedule; its handles are shifted past ours.
    pub fn extend(&mut self, other: CommandSchedule<N>) {
        let offset = self.addition_count() as u32;
        let shift_symbol = |s: NodeSymbol| match s {
            NodeSymbol::Virtual(h) => NodeSymbol::Virtual(SymbolHandle(h.0 + offset)),
            real => real,
        };
        if self.levels.len() < other.levels.len() {
            self.levels.resize_with(other.levels.len(), Vec::new);
        }
        for (depth, level) in other.levels.into_iter().enumerate() {
            for (h, mut node) in level {
                node.args = node.args.into_iter().map(&shift_symbol).collect();
                self.levels[depth].push((SymbolHandle(h.0 + offset), node));
            }
        }
        self.unions.extend(
            other
                .unions
                .into_iter()
                .map(|(a, b)| (shift_symbol(a), shift_symbol(b))),
        );
    }

    /// Run against `egraph`: batch-add level by level, reify symbols, then
    /// resolve and apply the union pairs. True iff any addition created a
    /// fresh class or any union changed equivalences.
    pub fn apply(&self, egraph: &mut EGraph<N>) -> bool {
        let mut resolved: IndexMap<SymbolHandle, EClassCall> = IndexMap::new();
        let resolve = |resolved: &IndexMap<SymbolHandle, EClassCall>, s: &NodeSymbol| match s {
            NodeSymbol::Real(c) => c.clone(),
            NodeSymbol::Virtual(h) => resolved
                .get(h)
                .cloned()
                .expect("schedule refers to a symbol from a later level"),
        };

        let mut changed = false;
        for level in &self.levels {
            let nodes: Vec<ENode<N>> = level
                .iter()
                .map(|(_, node)| ENode {
                    op: node.op.clone(),
                    defs: node.defs.clone(),
                    uses: node.uses.clone(),
                    args: node.args.iter().map(|a| resolve(&resolved, a)).collect(),
                })
                .collect();
            let (calls, fresh) = egraph.try_add_many(nodes);
            changed |= fresh;
            for ((h, _), call) in level.iter().zip(calls) {
                resolved.insert(*h, call);
            }
        }

        let pairs: Vec<(EClassCall, EClassCall)> = self
            .unions
            .iter()
            .map(|(a, b)| (resolve(&resolved, a), resolve(&resolved, b)))
            .collect();
        if !pairs.is_empty() {
            changed |= egraph.union_many(&pairs);
        }
        changed
    }
}

impl<N: Debug> Debug for CommandSchedule<N> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "CommandSchedule:")?;
        for (depth, level) in self.levels.iter().enumerate() {
            for (h, node) in level {
                writeln!(f, "  [{depth}] #{} = {:?}{:?}", h.0, node.op, node.args)?;
            }
        }
        for (a, b) in &self.unions {
            writeln!(f, "  union {a:?} = {b:?}")?;
        }
        Ok(())
    }
}
