//! The slotted, hash-consed e-graph and everything that runs on top of it.

use std::fmt::{self, Debug, Display, Formatter};

use crate::{
    group::{Perm, PermGroup},
    slot::{Slot, SlotMap, SlotSet},
    tree::{MixedTree, NodeT, SlotVec, Tree},
    utils::{HashMap, HashSet},
};

mod analysis;
mod command;
mod extract;
mod machine;
mod multipattern;
mod pattern;
mod rebuild;
mod rewrite;
mod run;
mod union_find;

pub use analysis::{
    join_max, join_min, join_option, Analysis, AnalysisMetadata, EGraphWithMetadata, MetadataLike,
    MetadataRegistry,
};
pub use command::{CommandSchedule, NodeSymbol, ScheduleBuilder, SymbolHandle, SymbolicNode};
pub use extract::{AstDepth, AstSize, CostFunction, CostedTree, ExtractionAnalysis, Extractor};
pub use machine::{Instruction, MachineState, MachineStatePool, Program};
pub use multipattern::MultiPattern;
pub use pattern::{CompiledPattern, MatchRecord, Pattern, PatternMatch, SearchItem, Searcher};
pub use rewrite::{Applier, Condition, ConditionalApplier, Rule, RuleError, TryApplyError};
pub use run::{
    rebase, BackoffRuleApplication, MaximalRuleApplication, MaximalRuleApplicationWithCaching,
    NodeLimited, Report, RepeatUntilStable, SaturationError, Saturator, StochasticRuleApplication,
    StopReason, Strategy, StrategyResult, ThenRebase, WithAnalyses,
};

use union_find::UnionFind;

/// Enumerating group-compatible variants of a node is exponential in the
/// worst case; past this many variants canonicalization falls back to the
/// identity variant.
pub(crate) const MAX_CANON_VARIANTS: usize = 64;

/// The identity of an e-class within one e-graph.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EClassRef(pub(crate) u32);

impl Display for EClassRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

impl Debug for EClassRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

/// An e-class specialized to a slot binding: `args` maps the class's public
/// slots to the slots visible at the call site.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EClassCall {
    pub class: EClassRef,
    pub args: SlotMap,
}

impl EClassCall {
    pub fn new(class: EClassRef, args: SlotMap) -> Self {
        Self { class, args }
    }
}

impl Debug for EClassCall {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.class, self.args)
    }
}

/// One operator application inside an e-class.
///
/// `defs` are slots the node binds locally (invisible to parents), `uses`
/// are slots defined elsewhere, and each argument is an [`EClassCall`].
/// A node is a *shape* when its slots are the numbered slots `$0, $1, …` in
/// first-appearance order.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ENode<N> {
    pub op: N,
    pub defs: SlotVec,
    pub uses: SlotVec,
    pub args: Vec<EClassCall>,
}

impl<N: NodeT> ENode<N> {
    pub fn new(
        op: N,
        defs: impl IntoIterator<Item = Slot>,
        uses: impl IntoIterator<Item = Slot>,
        args: Vec<EClassCall>,
    ) -> Self {
        Self {
            op,
            defs: defs.into_iter().collect(),
            uses: uses.into_iter().collect(),
            args,
        }
    }

    pub fn leaf(op: N) -> Self {
        Self::new(op, [], [], vec![])
    }

    /// Every slot occurrence in a fixed traversal order: definitions, uses,
    /// then each argument's renaming targets in key order. This order is
    /// what shape numbering is derived from.
    fn slot_occurrences(&self) -> Vec<Slot> {
        let mut out: Vec<Slot> = self.defs.iter().chain(self.uses.iter()).copied().collect();
        for arg in &self.args {
            out.extend(arg.args.iter().map(|(_, v)| v));
        }
        out
    }

    pub fn slots(&self) -> SlotSet {
        self.slot_occurrences().into_iter().collect()
    }

    /// Rename every slot occurrence through `m`; panics on uncovered slots.
    pub fn apply_slotmap(&self, m: &SlotMap) -> ENode<N> {
        let get = |s: Slot| {
            m.get(s)
                .unwrap_or_else(|| panic!("apply_slotmap: {s} not covered by {m}"))
        };
        ENode {
            op: self.op.clone(),
            defs: self.defs.iter().map(|&s| get(s)).collect(),
            uses: self.uses.iter().map(|&s| get(s)).collect(),
            args: self
                .args
                .iter()
                .map(|c| EClassCall {
                    class: c.class,
                    args: c.args.iter().map(|(k, v)| (k, get(v))).collect(),
                })
                .collect(),
        }
    }

    /// Like [`ENode::apply_slotmap`] but uncovered slots become fresh
    /// uniques, consistently across the node.
    pub fn apply_slotmap_fresh(&self, m: &SlotMap) -> ENode<N> {
        let mut m = m.clone();
        for s in self.slot_occurrences() {
            if m.get(s).is_none() {
                m.insert(s, Slot::fresh());
            }
        }
        self.apply_slotmap(&m)
    }

    /// Decompose into `(shape, renaming)` with `renaming` mapping the
    /// shape's numbered slots back to this node's slots.
    pub fn shape(&self) -> (ENode<N>, SlotMap) {
        let mut numbering = SlotMap::new();
        let mut next = 0u32;
        for s in self.slot_occurrences() {
            if numbering.get(s).is_none() {
                numbering.insert(s, Slot::numbered(next));
                next += 1;
            }
        }
        (self.apply_slotmap(&numbering), numbering.inverse())
    }

    /// The leading type arguments, per the node-type contract.
    pub fn type_args(&self) -> &[EClassCall] {
        &self.args[..self.op.type_arg_count().min(self.args.len())]
    }

    /// The arguments after the leading type arguments.
    pub fn value_args(&self) -> &[EClassCall] {
        &self.args[self.op.type_arg_count().min(self.args.len())..]
    }

    /// The distinct classes referenced by the arguments.
    pub fn arg_classes(&self) -> Vec<EClassRef> {
        let mut out: Vec<EClassRef> = self.args.iter().map(|c| c.class).collect();
        out.sort_unstable();
        out.dedup();
        out
    }
}

impl<N: Debug> Debug for ENode<N> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "({:?}", self.op)?;
        for d in &self.defs {
            write!(f, " [{d}]")?;
        }
        for u in &self.uses {
            write!(f, " {u}")?;
        }
        for a in &self.args {
            write!(f, " {a:?}")?;
        }
        write!(f, ")")
    }
}

/// Everything the graph knows about one canonical e-class.
#[derive(Debug, Clone)]
pub(crate) struct EClassData<N> {
    /// Public slots; always a subset of every member's renaming targets.
    pub(crate) slots: SlotSet,
    /// Shape member -> renaming from shape slots into the class frame.
    pub(crate) nodes: HashMap<ENode<N>, SlotMap>,
    /// Shapes (owned by other classes) that reference this class.
    pub(crate) users: HashSet<ENode<N>>,
    /// Discovered slot symmetries of this class.
    pub(crate) group: PermGroup,
}

/// The slotted, hash-consed e-graph.
///
/// A value type: cloning takes a snapshot, and all queries on a snapshot are
/// lock-free. Mutators take `&mut self`; the saturation layer clones first
/// and returns the mutated copy only when something changed, so observable
/// behavior is a series of immutable snapshots.
#[derive(Clone)]
pub struct EGraph<N: NodeT> {
    uf: UnionFind,
    hashcons: HashMap<ENode<N>, EClassRef>,
    classes: HashMap<EClassRef, EClassData<N>>,
    /// Canonical classes touched since the journal was last drained; feeds
    /// incremental metadata updates.
    dirty: Vec<EClassRef>,
}

impl<N: NodeT> Default for EGraph<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<N: NodeT> EGraph<N> {
    pub fn new() -> Self {
        Self {
            uf: UnionFind::new(),
            hashcons: HashMap::default(),
            classes: HashMap::default(),
            dirty: Vec::new(),
        }
    }

    /// A fresh graph over the same vocabulary.
    pub fn emptied(&self) -> Self {
        Self::new()
    }

    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    pub fn total_node_count(&self) -> usize {
        self.classes.values().map(|d| d.nodes.len()).sum()
    }

    /// All canonical classes.
    pub fn classes(&self) -> impl Iterator<Item = EClassRef> + '_ {
        self.classes.keys().copied()
    }

    /// Public slots of a canonical class.
    pub fn slots_of(&self, r: EClassRef) -> &SlotSet {
        &self.classes[&r].slots
    }

    /// The permutation group of a canonical class.
    pub fn group_of(&self, r: EClassRef) -> &PermGroup {
        &self.classes[&r].group
    }

    /// Resolve a possibly-stale ref to a canonical call. `None` iff the ref
    /// never belonged to this graph.
    pub fn canonicalize_ref(&self, r: EClassRef) -> Option<EClassCall> {
        self.uf.find(r)
    }

    /// Canonicalize a call, composing the union-find renaming into `args`.
    pub fn canonicalize(&self, call: &EClassCall) -> Option<EClassCall> {
        let up = self.uf.find(call.class)?;
        Some(EClassCall {
            class: up.class,
            args: up.args.compose_fresh(&call.args),
        })
    }

    /// Canonicalize every argument call of `node`.
    pub fn canonicalize_node(&self, node: &ENode<N>) -> Option<ENode<N>> {
        let args = node
            .args
            .iter()
            .map(|c| self.canonicalize(c))
            .collect::<Option<Vec<_>>>()?;
        Some(ENode {
            op: node.op.clone(),
            defs: node.defs.clone(),
            uses: node.uses.clone(),
            args,
        })
    }

    /// Enumerate the group-compatible variants of a node (args canonical),
    /// capped at [`MAX_CANON_VARIANTS`].
    fn compatible_variants(&self, node: &ENode<N>) -> Vec<ENode<N>> {
        let mut fanout = 1usize;
        for arg in &node.args {
            fanout = fanout.saturating_mul(self.classes[&arg.class].group.size());
        }
        if fanout > MAX_CANON_VARIANTS {
            return vec![node.clone()];
        }

        let mut variants = vec![node.clone()];
        for i in 0..node.args.len() {
            let data = &self.classes[&node.args[i].class];
            if data.group.is_trivial() {
                continue;
            }
            let base = node.args[i].clone();
            let arg_variants: Vec<SlotMap> = data
                .group
                .all_perms()
                .iter()
                .map(|p| p.as_map_on(&data.slots).compose(&base.args))
                .collect();
            variants = variants
                .into_iter()
                .flat_map(|v| {
                    arg_variants.iter().map(|args| {
                        let mut v2 = v.clone();
                        v2.args[i] = EClassCall {
                            class: base.class,
                            args: args.clone(),
                        };
                        v2
                    }).collect::<Vec<_>>()
                })
                .collect();
        }
        variants
    }

    /// Pick the canonical `(shape, renaming)` of a node whose args are
    /// canonical, together with the shape-level self-symmetries the variant
    /// sweep exposed.
    fn canonical_shape_of(&self, node: &ENode<N>) -> (ENode<N>, SlotMap, Vec<SlotMap>) {
        let shaped: Vec<(ENode<N>, SlotMap)> = self
            .compatible_variants(node)
            .iter()
            .map(|v| v.shape())
            .collect();
        let (best_shape, best_ren) = shaped
            .iter()
            .min_by(|a, b| a.0.cmp(&b.0))
            .expect("a node always has at least one variant")
            .clone();

        let inv_best = best_ren.inverse();
        let mut syms = Vec::new();
        for (shape, ren) in &shaped {
            if *shape == best_shape {
                // apply `ren` then `best_ren^-1`: a shape -> shape map
                let sigma = ren.compose_partial(&inv_best);
                if sigma.len() == ren.len() && !syms.contains(&sigma) {
                    syms.push(sigma);
                }
            }
        }
        syms.retain(|s| s.iter().any(|(k, v)| k != v));
        (best_shape, best_ren, syms)
    }

    /// Add a node (and hence possibly a fresh class). Arguments must refer
    /// to classes of this graph; slots of `node` are the caller's frame.
    pub fn add(&mut self, node: ENode<N>) -> EClassCall {
        self.add_internal(node).0
    }

    pub(crate) fn add_internal(&mut self, node: ENode<N>) -> (EClassCall, bool) {
        let node = self
            .canonicalize_node(&node)
            .expect("add: argument refers to an unknown class");
        let (shape, ren, syms) = self.canonical_shape_of(&node);

        if let Some(&c) = self.hashcons.get(&shape) {
            let stored = &self.classes[&c].nodes[&shape];
            let args = stored.inverse().compose(&ren).restrict(&self.classes[&c].slots);
            return (EClassCall { class: c, args }, false);
        }

        // Fresh class: its frame is a fresh unique slot per shape slot, and
        // the definition slots are subtracted to form the public set.
        let to_class = SlotMap::bijection_to_fresh(&shape.slots());
        let def_images: SlotSet = shape
            .defs
            .iter()
            .map(|&d| to_class.get(d).unwrap())
            .collect();
        let public = to_class.values().difference(&def_images);

        let c = self.uf.make_root(public.clone());
        let mut group = PermGroup::identity(&public);
        for sigma in syms {
            let candidate = to_class
                .inverse()
                .compose(&sigma)
                .compose(&to_class)
                .restrict(&public);
            if let Some(p) = Perm::try_new(candidate) {
                group.add(p);
            }
        }

        for arg_class in shape.arg_classes() {
            self.classes
                .get_mut(&arg_class)
                .expect("canonical arg class must exist")
                .users
                .insert(shape.clone());
        }
        self.hashcons.insert(shape.clone(), c);
        let mut nodes = HashMap::default();
        nodes.insert(shape, to_class.clone());
        self.classes.insert(
            c,
            EClassData {
                slots: public.clone(),
                nodes,
                users: HashSet::default(),
                group,
            },
        );
        self.dirty.push(c);

        let args = to_class.inverse().compose(&ren).restrict(&public);
        (EClassCall { class: c, args }, true)
    }

    /// Batch addition; the bool is true iff any node created a fresh class.
    pub fn try_add_many(&mut self, nodes: Vec<ENode<N>>) -> (Vec<EClassCall>, bool) {
        let mut changed = false;
        let calls = nodes
            .into_iter()
            .map(|n| {
                let (call, fresh) = self.add_internal(n);
                changed |= fresh;
                call
            })
            .collect();
        (calls, changed)
    }

    /// Insert a whole tree bottom-up.
    pub fn add_tree(&mut self, t: &Tree<N>) -> EClassCall {
        let args = t.args.iter().map(|a| self.add_tree(a)).collect();
        self.add(ENode {
            op: t.op.clone(),
            defs: t.defs.clone(),
            uses: t.uses.clone(),
            args,
        })
    }

    /// Insert a mixed tree whose leaves may already live in the graph.
    /// Panics on pattern-variable leaves, which only make sense inside
    /// patterns.
    pub fn add_mixed_tree(&mut self, t: &MixedTree<N>) -> EClassCall {
        match t {
            MixedTree::Node {
                op,
                defs,
                uses,
                args,
            } => {
                let args = args.iter().map(|a| self.add_mixed_tree(a)).collect();
                self.add(ENode {
                    op: op.clone(),
                    defs: defs.clone(),
                    uses: uses.clone(),
                    args,
                })
            }
            MixedTree::Call(c) => self
                .canonicalize(c)
                .expect("add_mixed_tree: call into an unknown class"),
            MixedTree::Var(v) => panic!("pattern variable ?{} outside a pattern", v.as_str()),
        }
    }

    /// Find the class of a node without inserting. `None` when the node is
    /// not represented.
    pub fn lookup(&self, node: &ENode<N>) -> Option<EClassCall> {
        let node = self.canonicalize_node(node)?;
        let (shape, ren, _) = self.canonical_shape_of(&node);
        let c = *self.hashcons.get(&shape)?;
        let stored = &self.classes[&c].nodes[&shape];
        let args = stored.inverse().compose(&ren).restrict(&self.classes[&c].slots);
        Some(EClassCall { class: c, args })
    }

    pub fn lookup_tree(&self, t: &Tree<N>) -> Option<EClassCall> {
        let args = t
            .args
            .iter()
            .map(|a| self.lookup_tree(a))
            .collect::<Option<Vec<_>>>()?;
        self.lookup(&ENode {
            op: t.op.clone(),
            defs: t.defs.clone(),
            uses: t.uses.clone(),
            args,
        })
    }

    pub fn contains(&self, t: &Tree<N>) -> bool {
        self.lookup_tree(t).is_some()
    }

    /// The members of the class behind `call`, instantiated into the call's
    /// frame. Local definition slots come out as fresh uniques.
    pub fn enodes_of(&self, call: &EClassCall) -> Vec<ENode<N>> {
        let call = match self.canonicalize(call) {
            Some(c) => c,
            None => return vec![],
        };
        let data = &self.classes[&call.class];
        let mut out: Vec<ENode<N>> = data
            .nodes
            .iter()
            .map(|(shape, ren)| shape.apply_slotmap(&ren.compose_fresh(&call.args)))
            .collect();
        out.sort_unstable();
        out
    }

    /// Members of a canonical class instantiated into the class's own
    /// frame. Unlike [`EGraph::enodes_of`] this is stable across calls
    /// (definition slots keep their internal names), which analyses rely
    /// on for change detection.
    pub(crate) fn class_nodes_in_frame(&self, r: EClassRef) -> Vec<ENode<N>> {
        let data = &self.classes[&r];
        let mut out: Vec<ENode<N>> = data
            .nodes
            .iter()
            .map(|(shape, ren)| shape.apply_slotmap(ren))
            .collect();
        out.sort_unstable();
        out
    }

    /// Bundle this graph with a (initially empty) metadata registry.
    pub fn with_metadata(self) -> EGraphWithMetadata<N>
    where
        N: 'static,
    {
        EGraphWithMetadata::new(self)
    }

    /// The users of a class, each as `(owning class, node instantiated in
    /// the owner's frame)`.
    pub fn users(&self, r: EClassRef) -> Vec<(EClassRef, ENode<N>)> {
        let call = match self.canonicalize_ref(r) {
            Some(c) => c,
            None => return vec![],
        };
        let mut out: Vec<(EClassRef, ENode<N>)> = self.classes[&call.class]
            .users
            .iter()
            .filter_map(|shape| {
                let owner = *self.hashcons.get(shape)?;
                let ren = &self.classes[&owner].nodes[shape];
                Some((owner, shape.apply_slotmap(ren)))
            })
            .collect();
        out.sort_unstable();
        out
    }

    /// Do two calls denote the same class under the same slot binding,
    /// modulo the class's discovered symmetries?
    pub fn are_same(&self, a: &EClassCall, b: &EClassCall) -> bool {
        let (Some(ca), Some(cb)) = (self.canonicalize(a), self.canonicalize(b)) else {
            return false;
        };
        if ca.class != cb.class {
            return false;
        }
        if ca.args == cb.args {
            return true;
        }
        let Some(inv) = ca.args.try_inverse() else {
            return false;
        };
        let candidate = cb.args.compose_partial(&inv);
        if candidate.len() != cb.args.len() {
            return false;
        }
        match Perm::try_new(candidate) {
            Some(p) => self.classes[&ca.class].group.contains(&p),
            None => false,
        }
    }

    pub fn are_same_tree(&self, a: &Tree<N>, b: &Tree<N>) -> bool {
        match (self.lookup_tree(a), self.lookup_tree(b)) {
            (Some(ca), Some(cb)) => self.are_same(&ca, &cb),
            _ => false,
        }
    }

    /// Drain the touched-class journal (canonicalized, deduplicated).
    pub fn take_dirty(&mut self) -> Vec<EClassRef> {
        let mut out: Vec<EClassRef> = std::mem::take(&mut self.dirty)
            .into_iter()
            .filter_map(|r| self.uf.find(r).map(|c| c.class))
            .collect();
        out.sort_unstable();
        out.dedup();
        out
    }

    /// Exhaustive invariant sweep used by tests and debug assertions.
    pub fn check_invariants(&self) {
        for (&c, data) in &self.classes {
            assert!(self.uf.is_root(c), "{c} has class data but is not a root");
            assert_eq!(*self.uf.slots_of(c), data.slots);
            for (shape, ren) in &data.nodes {
                assert_eq!(self.hashcons.get(shape), Some(&c), "hashcons disagrees for {shape:?}");
                assert!(
                    data.slots.is_subset(&ren.values()),
                    "renaming of {shape:?} does not cover the slots of {c}"
                );
                for arg in &shape.args {
                    assert!(self.uf.is_root(arg.class), "non-canonical arg in {shape:?}");
                    assert!(
                        self.classes[&arg.class].users.contains(shape),
                        "missing users entry for {shape:?} in {}",
                        arg.class
                    );
                }
            }
            for user in &data.users {
                let owner = self.hashcons.get(user).expect("user shape not in hashcons");
                assert!(
                    self.classes[owner].nodes.contains_key(user),
                    "user {user:?} not a member of its owner"
                );
                assert!(
                    user.args.iter().any(|a| a.class == c),
                    "user {user:?} does not mention {c}"
                );
            }
            for p in data.group.generators() {
                assert!(p.moved().is_subset(&data.slots), "group of {c} moves foreign slots");
            }
        }
        for (shape, &c) in &self.hashcons {
            assert!(
                self.classes.get(&c).map_or(false, |d| d.nodes.contains_key(shape)),
                "hashcons entry {shape:?} missing from class data"
            );
        }
    }
}

impl<N: NodeT> Debug for EGraph<N> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "EGraph ({} classes):", self.classes.len())?;
        let mut refs: Vec<_> = self.classes.keys().collect();
        refs.sort();
        for c in refs {
            let data = &self.classes[c];
            writeln!(f, "  {c}{}: {:?}", data.slots, data.nodes.keys().collect::<Vec<_>>())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parallel::ParallelMap;
    use crate::testing::{self, TestOp};
    use crate::Tree;

    #[test]
    fn canonicalize_is_idempotent() {
        let mut eg = EGraph::new();
        let root = testing::add_tree(&mut eg, &testing::mul(testing::num(1), testing::num(2)));
        let two = testing::add_tree(&mut eg, &testing::num(2));
        eg.union(&root, &two);

        for c in eg.classes().collect::<Vec<_>>() {
            let call = eg.canonicalize_ref(c).unwrap();
            let again = eg.canonicalize(&call).unwrap();
            assert_eq!(call.class, again.class);
            assert_eq!(call.args, again.args);
        }
        assert_eq!(eg.canonicalize_ref(EClassRef(999)), None);
    }

    #[test]
    fn hashconsing_deduplicates() {
        let mut eg = EGraph::new();
        let a = testing::add_tree(&mut eg, &testing::mul(testing::num(1), testing::num(2)));
        let b = testing::add_tree(&mut eg, &testing::mul(testing::num(1), testing::num(2)));
        assert_eq!(a, b);
        assert_eq!(eg.class_count(), 3);
        eg.check_invariants();
    }

    #[test]
    fn alpha_equivalent_trees_share_a_class() {
        let mut eg = EGraph::new();
        let s1 = Slot::fresh();
        let s2 = Slot::fresh();
        // lam s1. var s1 and lam s2. var s2 are the same shape
        let a = testing::add_tree(&mut eg, &testing::lam(s1, testing::var(s1)));
        let b = testing::add_tree(&mut eg, &testing::lam(s2, testing::var(s2)));
        assert_eq!(a.class, b.class);
        assert!(eg.are_same(&a, &b));
        // the binder's slot is not public
        assert!(eg.slots_of(a.class).is_empty());
    }

    // S1: constant folding via union.
    #[test]
    fn s1_constant_folding_via_union() {
        let mut eg = EGraph::new();
        let expr = testing::mul(testing::num(1), testing::num(2));
        let root = testing::add_tree(&mut eg, &expr);
        let two = testing::add_tree(&mut eg, &testing::num(2));

        assert!(eg.union(&root, &two));
        eg.check_invariants();

        assert!(eg.contains(&expr));
        assert!(eg.are_same_tree(&expr, &testing::num(2)));

        let extractor = Extractor::new(&eg, AstSize);
        let call = eg.canonicalize(&root).unwrap();
        assert_eq!(extractor.extract(&call, &eg), Some(testing::num(2)));
    }

    // S2 lives with the rewrite tests; S6 with the strategy tests.

    // S3: commutativity folds into the permutation group.
    #[test]
    fn s3_commutativity_becomes_a_symmetry() {
        let mut eg = EGraph::new();
        let a = Slot::fresh();
        let b = Slot::fresh();
        let expr = testing::mul(testing::var(a), testing::var(b));
        let root = testing::add_tree(&mut eg, &expr);
        assert_eq!(eg.group_of(root.class).size(), 1);

        let rule = Rule::rewrite(
            "mul-comm",
            Pattern::node(TestOp::Mul, [], [], vec![Pattern::var("x"), Pattern::var("y")]),
            Pattern::node(TestOp::Mul, [], [], vec![Pattern::var("y"), Pattern::var("x")]),
        );
        let next = rule
            .try_apply(&eg, &ParallelMap::sequential())
            .unwrap()
            .expect("commutativity changes the graph once");
        next.check_invariants();

        let call = next.canonicalize(&root).unwrap();
        // the class acquired the 2-element swap group instead of a second
        // node
        assert_eq!(next.group_of(call.class).size(), 2);
        let swapped = testing::mul(testing::var(b), testing::var(a));
        assert!(next.are_same_tree(&expr, &swapped));

        // a second application discovers nothing new
        assert!(rule.try_apply(&next, &ParallelMap::sequential()).unwrap().is_none());
    }

    // S4: redundant slot elimination propagates to parents.
    #[test]
    fn s4_redundant_slots_shrink() {
        let mut eg = EGraph::new();
        let s = Slot::fresh();
        let var = testing::add_tree(&mut eg, &testing::var(s));
        let parent_expr = testing::mul(testing::var(s), testing::num(3));
        let parent = testing::add_tree(&mut eg, &parent_expr);
        assert_eq!(eg.slots_of(var.class).len(), 1);

        // the class turns out to equal a node that does not use s
        let two = testing::add_tree(&mut eg, &testing::num(2));
        assert!(eg.union(&var, &two));
        eg.check_invariants();

        let var_root = eg.canonicalize(&var).unwrap().class;
        assert!(eg.slots_of(var_root).is_empty(), "s was redundant");

        // extraction from the parent no longer mentions s
        let extractor = Extractor::new(&eg, AstSize);
        let tree = extractor
            .extract(&eg.canonicalize(&parent).unwrap(), &eg)
            .unwrap();
        assert!(tree.free_slots().is_empty(), "extracted {tree:?}");
    }

    // S5: idiom detection gated on a type side condition.
    #[test]
    fn s5_idiom_detection_with_type_gate() {
        fn fold_of(ty: TestOp, x: Slot, y: Slot) -> Tree<TestOp> {
            Tree::new(
                TestOp::Fold,
                [],
                [],
                vec![
                    Tree::leaf(ty),
                    testing::var(x),
                    testing::var(y),
                ],
            )
        }

        let mut eg = EGraph::new();
        let x = Slot::fresh();
        let y = Slot::fresh();
        let double_fold = fold_of(TestOp::DoubleTy, x, y);
        let float_fold = fold_of(TestOp::FloatTy, x, y);
        testing::add_tree(&mut eg, &double_fold);
        testing::add_tree(&mut eg, &float_fold);

        let require_double_type = |eg: &EGraph<TestOp>, m: &PatternMatch<TestOp>| {
            m.var("t")
                .map(|t| {
                    eg.enodes_of(t)
                        .iter()
                        .any(|n| n.op == TestOp::DoubleTy)
                })
                .unwrap_or(false)
        };
        let rule = Rule::rewrite_if(
            "dot-idiom",
            Pattern::node(
                TestOp::Fold,
                [],
                [],
                vec![Pattern::var("t"), Pattern::var("x"), Pattern::var("y")],
            ),
            Pattern::node(TestOp::Dot, [], [], vec![Pattern::var("x"), Pattern::var("y")]),
            require_double_type,
        );
        let next = rule
            .try_apply(&eg, &ParallelMap::sequential())
            .unwrap()
            .expect("the double fold is rewritten");

        let dot_tree = Tree::new(TestOp::Dot, [], [], vec![testing::var(x), testing::var(y)]);
        assert!(next.are_same_tree(&double_fold, &dot_tree));
        // the float fold failed the gate and gained no Dot equivalent
        assert!(!next.are_same_tree(&float_fold, &dot_tree));

        // a time-complexity flavored cost prefers the idiom
        struct TimeCost;
        impl CostFunction<TestOp> for TimeCost {
            type Cost = usize;
            fn cost(&self, node: &ENode<TestOp>, child_costs: &[usize]) -> usize {
                let own = match node.op {
                    TestOp::Fold | TestOp::Build => 100,
                    _ => 1,
                };
                child_costs.iter().sum::<usize>() + own
            }
        }
        let extractor = Extractor::new(&next, TimeCost);
        let call = next.lookup_tree(&double_fold).unwrap();
        let best = extractor.extract(&call, &next).unwrap();
        assert_eq!(best.op, TestOp::Dot);
    }

    #[test]
    fn users_are_tracked_through_unions() {
        let mut eg = EGraph::new();
        let one = testing::add_tree(&mut eg, &testing::num(1));
        testing::add_tree(&mut eg, &testing::mul(testing::num(1), testing::num(2)));
        let users = eg.users(one.class);
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].1.op, TestOp::Mul);

        // merge 1 with a fresh leaf; the Mul user follows the union
        let zero = testing::add_tree(&mut eg, &testing::num(0));
        eg.union(&one, &zero);
        let root = eg.canonicalize(&one).unwrap().class;
        let users = eg.users(root);
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].1.op, TestOp::Mul);
        eg.check_invariants();
    }

    #[test]
    fn upward_merging_discovers_congruences() {
        let mut eg = EGraph::new();
        let m1 = testing::mul(testing::num(1), testing::num(3));
        let m2 = testing::mul(testing::num(2), testing::num(3));
        let a = testing::add_tree(&mut eg, &m1);
        let b = testing::add_tree(&mut eg, &m2);
        assert!(!eg.are_same(&a, &b));

        // 1 = 2 forces mul(1,3) = mul(2,3) by congruence
        let one = eg.lookup_tree(&testing::num(1)).unwrap();
        let two = eg.lookup_tree(&testing::num(2)).unwrap();
        eg.union(&one, &two);
        eg.check_invariants();
        assert!(eg.are_same(&a, &b));
    }

    #[test]
    fn congruence_propagates_through_chains() {
        let mut eg = EGraph::new();
        // two levels of structure above the unioned leaves
        let deep1 = testing::mul(testing::mul(testing::num(1), testing::num(3)), testing::num(5));
        let deep2 = testing::mul(testing::mul(testing::num(2), testing::num(3)), testing::num(5));
        let a = testing::add_tree(&mut eg, &deep1);
        let b = testing::add_tree(&mut eg, &deep2);
        let before = eg.class_count();

        let one = eg.lookup_tree(&testing::num(1)).unwrap();
        let two = eg.lookup_tree(&testing::num(2)).unwrap();
        assert!(eg.union(&one, &two));
        eg.check_invariants();

        assert!(eg.are_same(&a, &b));
        // leaves merged, then both mul levels merged: three fewer classes
        assert_eq!(eg.class_count(), before - 3);
    }

    #[test]
    fn rebuild_survives_a_union_storm() {
        // A pile of overlapping expressions unioned pairwise; every batch
        // must leave the graph with its invariants intact.
        let mut eg = EGraph::new();
        let s = Slot::fresh();
        let exprs = vec![
            testing::num(0),
            testing::num(1),
            testing::add(testing::num(0), testing::num(1)),
            testing::mul(testing::num(1), testing::num(1)),
            testing::var(s),
            testing::add(testing::var(s), testing::num(0)),
            testing::mul(testing::var(s), testing::num(1)),
            testing::add(testing::add(testing::num(0), testing::num(1)), testing::var(s)),
            testing::lam(s, testing::var(s)),
        ];
        let calls: Vec<EClassCall> = exprs.iter().map(|e| eg.add_tree(e)).collect();
        eg.check_invariants();

        // 1 = mul(1,1), 0+1 = 1, s = s+0, s = s*1
        for (i, j) in [(1usize, 3usize), (2, 1), (4, 5), (4, 6)] {
            eg.union(&calls[i], &calls[j]);
            eg.check_invariants();
        }

        assert!(eg.are_same(&calls[1], &calls[2]));
        assert!(eg.are_same(&calls[4], &calls[6]));
        // congruence: (0+1)+s collapses with 1+s-like structure only if
        // built; at minimum it canonicalizes without damage
        assert!(eg.contains(&exprs[7]));

        let extractor = Extractor::new(&eg, AstSize);
        for call in &calls {
            let tree = extractor.extract(&eg.canonicalize(call).unwrap(), &eg);
            assert!(tree.is_some(), "every class still extracts");
        }
    }

    #[test]
    fn symmetries_reflect_into_parents() {
        let mut eg = EGraph::new();
        let a = Slot::fresh();
        let b = Slot::fresh();
        let prod = testing::mul(testing::var(a), testing::var(b));
        let root = testing::add_tree(&mut eg, &prod);

        // fold commutativity in as a symmetry
        let swapped_call = eg
            .add_tree(&testing::mul(testing::var(b), testing::var(a)));
        eg.union(&root, &swapped_call);
        let call = eg.canonicalize(&root).unwrap();
        assert_eq!(eg.group_of(call.class).size(), 2);

        // a parent built over one ordering is found for the other, with no
        // further union
        let p1 = testing::add_tree(&mut eg, &testing::add(prod.clone(), testing::num(1)));
        let swapped = testing::mul(testing::var(b), testing::var(a));
        let p2 = testing::add_tree(&mut eg, &testing::add(swapped, testing::num(1)));
        assert_eq!(p1.class, p2.class);
        eg.check_invariants();
    }
}
