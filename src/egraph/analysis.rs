//! Bottom-up semilattice analyses, kept consistent with the graph through
//! an incremental worklist.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt::Debug;

use indexmap::IndexMap;
use log::trace;

use crate::{
    egraph::{EClassCall, EClassRef, EGraph},
    slot::SlotMap,
    tree::NodeT,
    utils::HashMap,
};

use super::ENode;

/// A class's analysis value may legitimately be recomputed many times; past
/// this many worklist steps per class the join is assumed non-monotone,
/// which is a caller bug.
const ANALYSIS_STEPS_PER_CLASS: usize = 10_000;

/// A bottom-up semilattice computation over the e-graph.
///
/// `join` must be associative, commutative and idempotent; `rename`
/// transports a result across a slot renaming (identity for slot-free
/// domains).
pub trait Analysis<N: NodeT>: Send + Sync {
    type Data: Clone + Debug + PartialEq + Send;

    /// Value of one node, given the (frame-adjusted) values of its
    /// argument classes.
    fn make(&self, node: &ENode<N>, arg_data: &[Self::Data]) -> Self::Data;

    fn join(&self, a: Self::Data, b: Self::Data) -> Self::Data;

    /// Apply a slot renaming inside a result.
    fn rename(&self, data: &Self::Data, map: &SlotMap) -> Self::Data;
}

/// Per-class results of one analysis over one graph snapshot.
#[derive(Debug, Clone)]
pub struct AnalysisMetadata<N: NodeT, A: Analysis<N>> {
    pub analysis: A,
    results: HashMap<EClassRef, A::Data>,
}

impl<N: NodeT, A: Analysis<N>> AnalysisMetadata<N, A> {
    /// Seed from nullary nodes and run to fixpoint.
    pub fn compute(analysis: A, egraph: &EGraph<N>) -> Self {
        let mut this = Self {
            analysis,
            results: HashMap::default(),
        };
        let all: Vec<EClassRef> = egraph.classes().collect();
        this.fixpoint(egraph, all);
        this
    }

    /// The result for a canonical class, in the class's own frame.
    pub fn get(&self, r: EClassRef) -> Option<&A::Data> {
        self.results.get(&r)
    }

    /// The result for a call, renamed into the call-site frame.
    pub fn for_call(&self, egraph: &EGraph<N>, call: &EClassCall) -> Option<A::Data> {
        let call = egraph.canonicalize(call)?;
        let data = self.results.get(&call.class)?;
        Some(self.analysis.rename(data, &call.args))
    }

    /// Bring the results up to date after the graph changed; `touched` is
    /// the drained dirty journal.
    pub fn update(&mut self, egraph: &EGraph<N>, touched: &[EClassRef]) {
        // Results keyed by retired refs are dropped; their values are
        // re-joined into the surviving class from its nodes.
        self.results.retain(|r, _| {
            egraph
                .canonicalize_ref(*r)
                .is_some_and(|c| c.class == *r)
        });
        self.fixpoint(egraph, touched.to_vec());
    }

    fn fixpoint(&mut self, egraph: &EGraph<N>, seeds: Vec<EClassRef>) {
        let cap = ANALYSIS_STEPS_PER_CLASS * (egraph.class_count() + 1);
        let mut steps = 0usize;
        let mut worklist: VecDeque<EClassRef> = seeds.into_iter().collect();
        while let Some(c) = worklist.pop_front() {
            steps += 1;
            assert!(steps <= cap, "analysis did not converge: non-monotone join?");
            let Some(c) = egraph.canonicalize_ref(c).map(|f| f.class) else {
                continue;
            };
            if self.recompute(egraph, c) {
                for (owner, _) in egraph.users(c) {
                    worklist.push_back(owner);
                }
                // A self-referential class re-joins through its own users
                // entry; nothing extra to do.
            }
        }
        trace!("analysis fixpoint after {steps} steps");
    }

    /// Re-join the value of `c` from its member nodes; true iff it changed.
    fn recompute(&mut self, egraph: &EGraph<N>, c: EClassRef) -> bool {
        let mut acc: Option<A::Data> = None;
        'nodes: for node in egraph.class_nodes_in_frame(c) {
            let mut arg_data = Vec::with_capacity(node.args.len());
            for arg in &node.args {
                match self.results.get(&arg.class) {
                    Some(d) => arg_data.push(self.analysis.rename(d, &arg.args)),
                    // Not yet computable through this node.
                    None => continue 'nodes,
                }
            }
            let v = self.analysis.make(&node, &arg_data);
            acc = Some(match acc {
                None => v,
                Some(prev) => self.analysis.join(prev, v),
            });
        }
        match acc {
            None => false,
            Some(v) => {
                if self.results.get(&c) == Some(&v) {
                    false
                } else {
                    self.results.insert(c, v);
                    true
                }
            }
        }
    }
}

/// A utility for implementing [`Analysis::join`] when the data type has a
/// total ordering: keep the maximum.
pub fn join_max<T: Ord>(a: T, b: T) -> T {
    a.max(b)
}

/// A utility for implementing [`Analysis::join`] when the data type has a
/// total ordering: keep the minimum.
pub fn join_min<T: Ord>(a: T, b: T) -> T {
    a.min(b)
}

/// A utility for implementing [`Analysis::join`] on `Option` data: a `Some`
/// always wins over a `None`, and two `Some`s are combined with `f`.
pub fn join_option<T>(a: Option<T>, b: Option<T>, f: impl FnOnce(T, T) -> T) -> Option<T> {
    match (a, b) {
        (Some(x), Some(y)) => Some(f(x, y)),
        (x, y) => x.or(y),
    }
}

/// Type-erased handle so differently-typed analyses can live in one
/// registry.
pub trait MetadataLike<N: NodeT>: Send + Sync {
    fn update(&mut self, egraph: &EGraph<N>, touched: &[EClassRef]);
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<N, A> MetadataLike<N> for AnalysisMetadata<N, A>
where
    N: NodeT + 'static,
    A: Analysis<N> + 'static,
    A::Data: Sync,
    A: Sync + Send,
{
    fn update(&mut self, egraph: &EGraph<N>, touched: &[EClassRef]) {
        AnalysisMetadata::update(self, egraph, touched);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Named registry of analyses kept in lockstep with a graph.
#[derive(Default)]
pub struct MetadataRegistry<N: NodeT> {
    entries: IndexMap<&'static str, Box<dyn MetadataLike<N>>>,
}

impl<N: NodeT + 'static> MetadataRegistry<N> {
    pub fn new() -> Self {
        Self {
            entries: IndexMap::new(),
        }
    }

    pub fn register<A>(&mut self, name: &'static str, analysis: A, egraph: &EGraph<N>)
    where
        A: Analysis<N> + 'static,
        A::Data: Sync,
    {
        let metadata = AnalysisMetadata::compute(analysis, egraph);
        self.entries.insert(name, Box::new(metadata));
    }

    pub fn get<A>(&self, name: &str) -> Option<&AnalysisMetadata<N, A>>
    where
        A: Analysis<N> + 'static,
        A::Data: Sync,
    {
        self.entries
            .get(name)
            .and_then(|m| m.as_any().downcast_ref())
    }

    /// Drain the graph's dirty journal into every registered analysis.
    pub fn update_all(&mut self, egraph: &mut EGraph<N>) {
        let touched = egraph.take_dirty();
        if touched.is_empty() {
            return;
        }
        for (_, m) in self.entries.iter_mut() {
            m.update(egraph, &touched);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// An e-graph bundled with registered metadata, updated atomically after
/// the underlying graph.
pub struct EGraphWithMetadata<N: NodeT> {
    pub egraph: EGraph<N>,
    pub metadata: MetadataRegistry<N>,
}

impl<N: NodeT + 'static> EGraphWithMetadata<N> {
    pub fn new(egraph: EGraph<N>) -> Self {
        Self {
            egraph,
            metadata: MetadataRegistry::new(),
        }
    }

    /// Re-synchronize every analysis with the graph.
    pub fn refresh(&mut self) {
        self.metadata.update_all(&mut self.egraph);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, TestOp};
    use pretty_assertions::assert_eq;

    /// Constant folding over the test vocabulary.
    struct ConstFold;

    impl Analysis<TestOp> for ConstFold {
        type Data = Option<i64>;

        fn make(&self, node: &ENode<TestOp>, arg_data: &[Self::Data]) -> Self::Data {
            match node.op {
                TestOp::Num(i) => Some(i),
                TestOp::Add => Some(arg_data[0]? + arg_data[1]?),
                TestOp::Mul => Some(arg_data[0]? * arg_data[1]?),
                _ => None,
            }
        }

        fn join(&self, a: Self::Data, b: Self::Data) -> Self::Data {
            join_option(a, b, |x, y| {
                assert_eq!(x, y, "constant folding joined unequal constants");
                x
            })
        }

        fn rename(&self, data: &Self::Data, _map: &SlotMap) -> Self::Data {
            *data
        }
    }

    #[test]
    fn bottom_up_fixpoint() {
        let mut eg = EGraph::new();
        let expr = testing::add(
            testing::mul(testing::num(2), testing::num(3)),
            testing::num(4),
        );
        let root = testing::add_tree(&mut eg, &expr);
        let md = AnalysisMetadata::compute(ConstFold, &eg);
        assert_eq!(md.get(root.class), Some(&Some(10)));
    }

    #[test]
    fn incremental_update_after_union() {
        let mut eg = EGraph::new();
        let s = crate::Slot::fresh();
        let var = testing::add_tree(&mut eg, &testing::var(s));
        let two = testing::add_tree(&mut eg, &testing::num(2));
        eg.take_dirty();
        let mut md = AnalysisMetadata::compute(ConstFold, &eg);
        assert_eq!(md.get(var.class), None);

        // the variable turns out to be 2
        eg.union(&var, &two);
        let touched = eg.take_dirty();
        md.update(&eg, &touched);
        let root = eg.canonicalize(&var).unwrap().class;
        assert_eq!(md.get(root), Some(&Some(2)));
    }
}
