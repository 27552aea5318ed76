//! The abstract machine behind pattern search: patterns compile to a flat
//! instruction program executed against one e-class at a time.

use std::cell::RefCell;
use std::collections::VecDeque;

use indexmap::IndexMap;
use symbol_table::GlobalSymbol;

use crate::{
    egraph::{pattern::Pattern, EClassCall, EGraph, ENode},
    slot::{Slot, SlotMap},
    tree::{NodeT, SlotVec},
};

/// One step of a compiled pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction<N> {
    /// Match a node of `op` in the class held by `reg`, unify its
    /// definition/use slots with the pattern's, and append one register per
    /// argument.
    BindNode {
        reg: usize,
        op: N,
        defs: SlotVec,
        uses: SlotVec,
        arg_count: usize,
    },
    /// Bind a pattern variable to whatever `reg` holds.
    BindVar { reg: usize, var: GlobalSymbol },
    /// Require two registers to hold the same canonical class call.
    Compare { a: usize, b: usize },
}

/// A partial match under construction: the register file, variable and slot
/// bindings, and the nodes bound so far.
#[derive(Debug, Clone)]
pub struct MachineState<N> {
    pub regs: Vec<EClassCall>,
    pub subst: IndexMap<GlobalSymbol, EClassCall>,
    /// Pattern slot -> concrete slot; kept injective.
    pub slot_binds: SlotMap,
    pub bound_nodes: Vec<ENode<N>>,
}

impl<N> Default for MachineState<N> {
    fn default() -> Self {
        Self {
            regs: Vec::new(),
            subst: IndexMap::new(),
            slot_binds: SlotMap::new(),
            bound_nodes: Vec::new(),
        }
    }
}

impl<N: NodeT> MachineState<N> {
    fn reset(&mut self, seed: EClassCall) {
        self.regs.clear();
        self.regs.push(seed);
        self.subst.clear();
        self.slot_binds = SlotMap::new();
        self.bound_nodes.clear();
    }

    /// Unify pattern slots against concrete slots, injectively and
    /// consistently with earlier bindings.
    fn bind_slots(&mut self, pattern: &[Slot], concrete: &[Slot]) -> bool {
        debug_assert_eq!(pattern.len(), concrete.len());
        for (&p, &c) in pattern.iter().zip(concrete) {
            match self.slot_binds.get(p) {
                Some(prev) if prev == c => {}
                Some(_) => return false,
                None => {
                    if self.slot_binds.iter().any(|(_, v)| v == c) {
                        return false;
                    }
                    self.slot_binds.insert(p, c);
                }
            }
        }
        true
    }
}

/// A pool of machine states owned by a single search phase. States returned
/// here keep their allocations for the next branch.
///
/// Pools are an optimization only; every entry point takes one explicitly
/// and semantics never depend on reuse.
#[derive(Debug)]
pub struct MachineStatePool<N> {
    free: RefCell<Vec<MachineState<N>>>,
}

impl<N> Default for MachineStatePool<N> {
    fn default() -> Self {
        Self {
            free: RefCell::new(Vec::new()),
        }
    }
}

impl<N: NodeT> MachineStatePool<N> {
    pub fn new() -> Self {
        Self {
            free: RefCell::new(Vec::new()),
        }
    }

    fn take(&self) -> MachineState<N> {
        self.free.borrow_mut().pop().unwrap_or_default()
    }

    fn take_clone(&self, proto: &MachineState<N>) -> MachineState<N> {
        let mut st = self.take();
        st.regs.clear();
        st.regs.extend(proto.regs.iter().cloned());
        st.subst.clone_from(&proto.subst);
        st.slot_binds = proto.slot_binds.clone();
        st.bound_nodes.clear();
        st.bound_nodes.extend(proto.bound_nodes.iter().cloned());
        st
    }

    fn give(&self, st: MachineState<N>) {
        self.free.borrow_mut().push(st);
    }
}

/// A compiled pattern: a contiguous instruction array, executed with an
/// explicit `(pc, state)` stack so deep patterns never recurse on the host
/// stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program<N> {
    pub(crate) instructions: Vec<Instruction<N>>,
    pub(crate) vars: Vec<GlobalSymbol>,
}

impl<N: NodeT> Program<N> {
    /// Compile a pattern. Registers are assigned breadth-first, matching
    /// the order `BindNode` appends argument registers at run time.
    pub fn compile(pattern: &Pattern<N>) -> Self {
        let mut instructions = Vec::new();
        let mut vars = Vec::new();
        let mut first_occurrence: IndexMap<GlobalSymbol, usize> = IndexMap::new();
        let mut next_reg = 1usize;
        let mut todo: VecDeque<(usize, &Pattern<N>)> = VecDeque::new();
        todo.push_back((0, pattern));

        while let Some((reg, p)) = todo.pop_front() {
            match p {
                Pattern::Node {
                    op,
                    defs,
                    uses,
                    args,
                } => {
                    instructions.push(Instruction::BindNode {
                        reg,
                        op: op.clone(),
                        defs: defs.clone(),
                        uses: uses.clone(),
                        arg_count: args.len(),
                    });
                    for arg in args {
                        todo.push_back((next_reg, arg));
                        next_reg += 1;
                    }
                }
                Pattern::Var(v) => match first_occurrence.get(v) {
                    Some(&first) => instructions.push(Instruction::Compare { a: first, b: reg }),
                    None => {
                        first_occurrence.insert(*v, reg);
                        vars.push(*v);
                        instructions.push(Instruction::BindVar { reg, var: *v });
                    }
                },
            }
        }

        Self { instructions, vars }
    }

    pub fn vars(&self) -> &[GlobalSymbol] {
        &self.vars
    }

    /// Execute against `seed` (register 0). `on_match` runs on every
    /// terminal state; returning false unwinds the whole search. The return
    /// value is false iff the continuation stopped the run.
    pub fn run(
        &self,
        egraph: &EGraph<N>,
        seed: EClassCall,
        pool: &MachineStatePool<N>,
        on_match: &mut dyn FnMut(&MachineState<N>) -> bool,
    ) -> bool {
        let mut init = pool.take();
        init.reset(seed);
        let mut stack: Vec<(usize, MachineState<N>)> = vec![(0, init)];

        while let Some((pc, mut state)) = stack.pop() {
            if pc == self.instructions.len() {
                let keep_going = on_match(&state);
                pool.give(state);
                if !keep_going {
                    for (_, st) in stack {
                        pool.give(st);
                    }
                    return false;
                }
                continue;
            }
            match &self.instructions[pc] {
                Instruction::BindNode {
                    reg,
                    op,
                    defs,
                    uses,
                    arg_count,
                } => {
                    for node in egraph.enodes_of(&state.regs[*reg]) {
                        if node.op != *op
                            || node.defs.len() != defs.len()
                            || node.uses.len() != uses.len()
                            || node.args.len() != *arg_count
                        {
                            continue;
                        }
                        let mut branch = pool.take_clone(&state);
                        if branch.bind_slots(defs, &node.defs)
                            && branch.bind_slots(uses, &node.uses)
                        {
                            branch.regs.extend(node.args.iter().cloned());
                            branch.bound_nodes.push(node.clone());
                            stack.push((pc + 1, branch));
                        } else {
                            pool.give(branch);
                        }
                    }
                    pool.give(state);
                }
                Instruction::BindVar { reg, var } => {
                    let call = state.regs[*reg].clone();
                    match state.subst.get(var) {
                        // The compiler only emits BindVar on the first
                        // occurrence, but re-binding stays sound.
                        Some(prev) if !egraph.are_same(prev, &call) => {
                            pool.give(state);
                        }
                        _ => {
                            state.subst.insert(*var, call);
                            stack.push((pc + 1, state));
                        }
                    }
                }
                Instruction::Compare { a, b } => {
                    if egraph.are_same(&state.regs[*a], &state.regs[*b]) {
                        stack.push((pc + 1, state));
                    } else {
                        pool.give(state);
                    }
                }
            }
        }
        true
    }
}
