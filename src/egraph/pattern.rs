//! Patterns and searchers. A [`Pattern`] compiles to a [`Program`]; running
//! it over an e-graph yields [`PatternMatch`]es, and searchers compose into
//! pipelines via `filter` / `map` / `flat_map` / `and_then` / `product` /
//! merge.

use std::marker::PhantomData;

use indexmap::IndexMap;
use symbol_table::GlobalSymbol;

use crate::{
    egraph::{
        machine::{MachineStatePool, Program},
        EClassCall, EClassRef, EGraph,
    },
    parallel::{Canceled, ParallelMap},
    slot::{Slot, SlotMap},
    tree::{NodeT, SlotVec},
};

/// A for-all quantified expression over pattern variables and pattern
/// slots. The most common searcher and applier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pattern<N> {
    Node {
        op: N,
        defs: SlotVec,
        uses: SlotVec,
        args: Vec<Pattern<N>>,
    },
    Var(GlobalSymbol),
}

impl<N: NodeT> Pattern<N> {
    pub fn node(
        op: N,
        defs: impl IntoIterator<Item = Slot>,
        uses: impl IntoIterator<Item = Slot>,
        args: Vec<Pattern<N>>,
    ) -> Self {
        Pattern::Node {
            op,
            defs: defs.into_iter().collect(),
            uses: uses.into_iter().collect(),
            args,
        }
    }

    pub fn var(name: impl Into<GlobalSymbol>) -> Self {
        Pattern::Var(name.into())
    }

    /// The distinct variables, in first-appearance order.
    pub fn vars(&self) -> Vec<GlobalSymbol> {
        fn go<N>(p: &Pattern<N>, out: &mut Vec<GlobalSymbol>) {
            match p {
                Pattern::Var(v) => {
                    if !out.contains(v) {
                        out.push(*v);
                    }
                }
                Pattern::Node { args, .. } => args.iter().for_each(|a| go(a, out)),
            }
        }
        let mut out = vec![];
        go(self, &mut out);
        out
    }

    /// Compile into an executable searcher/applier.
    pub fn compile(&self) -> CompiledPattern<N> {
        CompiledPattern {
            program: Program::compile(self),
            ast: self.clone(),
        }
    }
}

/// Ground trees convert to variable-free patterns.
impl<N: NodeT> From<&crate::tree::Tree<N>> for Pattern<N> {
    fn from(t: &crate::tree::Tree<N>) -> Self {
        Pattern::Node {
            op: t.op.clone(),
            defs: t.defs.clone(),
            uses: t.uses.clone(),
            args: t.args.iter().map(Pattern::from).collect(),
        }
    }
}

/// A pattern together with its compiled instruction program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledPattern<N> {
    pub ast: Pattern<N>,
    pub(crate) program: Program<N>,
}

/// One successful match: the matched class, the variable bindings, and the
/// pattern-slot bindings.
#[derive(Debug, Clone)]
pub struct PatternMatch<N> {
    pub class: EClassCall,
    pub subst: IndexMap<GlobalSymbol, EClassCall>,
    pub slots: SlotMap,
    _marker: PhantomData<N>,
}

/// A hashable, canonical fingerprint of a match, used by the caching layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MatchRecord {
    pub class: EClassRef,
    pub subst: Vec<(GlobalSymbol, EClassCall)>,
    pub slots: SlotMap,
}

impl<N: NodeT> PatternMatch<N> {
    pub fn new(
        class: EClassCall,
        subst: IndexMap<GlobalSymbol, EClassCall>,
        slots: SlotMap,
    ) -> Self {
        Self {
            class,
            subst,
            slots,
            _marker: PhantomData,
        }
    }

    pub fn var(&self, v: impl Into<GlobalSymbol>) -> Option<&EClassCall> {
        self.subst.get(&v.into())
    }

    /// Combine two matches, requiring every shared variable and slot
    /// binding to agree.
    pub fn merge(&self, other: &Self, egraph: &EGraph<N>) -> Option<Self> {
        let mut subst = self.subst.clone();
        for (v, call) in &other.subst {
            match subst.get(v) {
                Some(prev) if !egraph.are_same(prev, call) => return None,
                Some(_) => {}
                None => {
                    subst.insert(*v, call.clone());
                }
            }
        }
        let mut slots = self.slots.clone();
        for (p, c) in other.slots.iter() {
            match slots.get(p) {
                Some(prev) if prev != c => return None,
                Some(_) => {}
                None => {
                    if slots.iter().any(|(_, v)| v == c) {
                        return None;
                    }
                    slots.insert(p, c);
                }
            }
        }
        Some(Self::new(self.class.clone(), subst, slots))
    }

    /// Re-express this match against another snapshot of the graph,
    /// canonicalizing every class reference. `None` when a referenced class
    /// does not exist over there.
    pub fn port(&self, egraph: &EGraph<N>) -> Option<Self> {
        let class = egraph.canonicalize(&self.class)?;
        let subst = self
            .subst
            .iter()
            .map(|(v, c)| Some((*v, egraph.canonicalize(c)?)))
            .collect::<Option<IndexMap<_, _>>>()?;
        Some(Self::new(class, subst, self.slots.clone()))
    }

    pub fn record(&self) -> MatchRecord {
        let mut subst: Vec<(GlobalSymbol, EClassCall)> =
            self.subst.iter().map(|(v, c)| (*v, c.clone())).collect();
        subst.sort_unstable_by_key(|(v, _)| v.as_str());
        MatchRecord {
            class: self.class.class,
            subst,
            slots: self.slots.clone(),
        }
    }
}

/// Something that enumerates matches over an e-graph.
///
/// `search_call` streams matches for one seed class through a continuation;
/// returning false from the continuation unwinds the search. The provided
/// `search` fans out over all canonical classes through a [`ParallelMap`],
/// preserving class order.
pub trait Searcher<N: NodeT + Send + Sync>: Send + Sync {
    type Match: Send;

    /// Returns false iff the continuation stopped the search.
    fn search_call(
        &self,
        egraph: &EGraph<N>,
        seed: &EClassCall,
        f: &mut dyn FnMut(Self::Match) -> bool,
    ) -> bool;

    fn search(&self, egraph: &EGraph<N>, par: &ParallelMap) -> Result<Vec<Self::Match>, Canceled> {
        let mut classes: Vec<EClassRef> = egraph.classes().collect();
        classes.sort_unstable();
        let per_class = par.apply(classes, |c| {
            let seed = identity_call(egraph, c);
            let mut out = Vec::new();
            self.search_call(egraph, &seed, &mut |m| {
                out.push(m);
                true
            });
            out
        })?;
        Ok(per_class.into_iter().flatten().collect())
    }

    /// Sequential search stopping after `limit` matches.
    fn search_with_limit(&self, egraph: &EGraph<N>, limit: usize) -> Vec<Self::Match> {
        let mut classes: Vec<EClassRef> = egraph.classes().collect();
        classes.sort_unstable();
        let mut out = Vec::new();
        for c in classes {
            let seed = identity_call(egraph, c);
            let keep_going = self.search_call(egraph, &seed, &mut |m| {
                out.push(m);
                out.len() < limit
            });
            if !keep_going {
                break;
            }
        }
        out
    }

    fn filter<F>(self, pred: F) -> Filter<Self, F>
    where
        Self: Sized,
        F: Fn(&Self::Match) -> bool + Send + Sync,
    {
        Filter { inner: self, pred }
    }

    fn map<T, F>(self, f: F) -> Map<Self, F, T>
    where
        Self: Sized,
        T: Send,
        F: Fn(Self::Match) -> T + Send + Sync,
    {
        Map {
            inner: self,
            f,
            _marker: PhantomData,
        }
    }

    fn flat_map<T, F>(self, f: F) -> FlatMap<Self, F, T>
    where
        Self: Sized,
        T: Send,
        F: Fn(Self::Match) -> Vec<T> + Send + Sync,
    {
        FlatMap {
            inner: self,
            f,
            _marker: PhantomData,
        }
    }

    /// Run `next` as a second phase, seeded per first-phase match.
    fn and_then<S2, F>(self, seed: F, next: S2) -> AndThen<Self, S2, F>
    where
        Self: Sized,
        Self::Match: Clone,
        S2: Searcher<N>,
        F: Fn(&Self::Match) -> EClassCall + Send + Sync,
    {
        AndThen {
            first: self,
            second: next,
            seed,
        }
    }

    /// Both searchers on the same seed, emitting the cartesian product.
    fn product<S2>(self, other: S2) -> Product<Self, S2>
    where
        Self: Sized,
        Self::Match: Clone,
        S2: Searcher<N>,
        S2::Match: Clone,
    {
        Product { a: self, b: other }
    }

    /// Unify pairs of matches via [`PatternMatch::merge`], dropping
    /// inconsistent pairs.
    fn merged(self) -> Merged<Self>
    where
        Self: Sized + Searcher<N, Match = (PatternMatch<N>, PatternMatch<N>)>,
    {
        Merged { inner: self }
    }
}

pub(crate) fn identity_call<N: NodeT>(egraph: &EGraph<N>, c: EClassRef) -> EClassCall {
    EClassCall {
        class: c,
        args: SlotMap::identity(egraph.slots_of(c)),
    }
}

/// What a search pipeline stage carries between phases.
pub type SearchItem<N> = PatternMatch<N>;

impl<N: NodeT + Send + Sync> Searcher<N> for CompiledPattern<N> {
    type Match = PatternMatch<N>;

    fn search_call(
        &self,
        egraph: &EGraph<N>,
        seed: &EClassCall,
        f: &mut dyn FnMut(Self::Match) -> bool,
    ) -> bool {
        let pool = MachineStatePool::new();
        self.program.run(egraph, seed.clone(), &pool, &mut |state| {
            f(PatternMatch::new(
                seed.clone(),
                state.subst.clone(),
                state.slot_binds.clone(),
            ))
        })
    }
}

pub struct Filter<S, F> {
    inner: S,
    pred: F,
}

impl<N, S, F> Searcher<N> for Filter<S, F>
where
    N: NodeT + Send + Sync,
    S: Searcher<N>,
    F: Fn(&S::Match) -> bool + Send + Sync,
{
    type Match = S::Match;

    fn search_call(
        &self,
        egraph: &EGraph<N>,
        seed: &EClassCall,
        f: &mut dyn FnMut(Self::Match) -> bool,
    ) -> bool {
        self.inner.search_call(egraph, seed, &mut |m| {
            if (self.pred)(&m) {
                f(m)
            } else {
                true
            }
        })
    }
}

pub struct Map<S, F, T> {
    inner: S,
    f: F,
    _marker: PhantomData<fn() -> T>,
}

impl<N, S, F, T> Searcher<N> for Map<S, F, T>
where
    N: NodeT + Send + Sync,
    S: Searcher<N>,
    T: Send,
    F: Fn(S::Match) -> T + Send + Sync,
{
    type Match = T;

    fn search_call(
        &self,
        egraph: &EGraph<N>,
        seed: &EClassCall,
        f: &mut dyn FnMut(Self::Match) -> bool,
    ) -> bool {
        self.inner.search_call(egraph, seed, &mut |m| f((self.f)(m)))
    }
}

pub struct FlatMap<S, F, T> {
    inner: S,
    f: F,
    _marker: PhantomData<fn() -> T>,
}

impl<N, S, F, T> Searcher<N> for FlatMap<S, F, T>
where
    N: NodeT + Send + Sync,
    S: Searcher<N>,
    T: Send,
    F: Fn(S::Match) -> Vec<T> + Send + Sync,
{
    type Match = T;

    fn search_call(
        &self,
        egraph: &EGraph<N>,
        seed: &EClassCall,
        f: &mut dyn FnMut(Self::Match) -> bool,
    ) -> bool {
        self.inner.search_call(egraph, seed, &mut |m| {
            for t in (self.f)(m) {
                if !f(t) {
                    return false;
                }
            }
            true
        })
    }
}

pub struct AndThen<A, B, F> {
    first: A,
    second: B,
    seed: F,
}

impl<N, A, B, F> Searcher<N> for AndThen<A, B, F>
where
    N: NodeT + Send + Sync,
    A: Searcher<N>,
    A::Match: Clone,
    B: Searcher<N>,
    F: Fn(&A::Match) -> EClassCall + Send + Sync,
{
    type Match = (A::Match, B::Match);

    fn search_call(
        &self,
        egraph: &EGraph<N>,
        seed: &EClassCall,
        f: &mut dyn FnMut(Self::Match) -> bool,
    ) -> bool {
        self.first.search_call(egraph, seed, &mut |m1| {
            let next_seed = (self.seed)(&m1);
            self.second
                .search_call(egraph, &next_seed, &mut |m2| f((m1.clone(), m2)))
        })
    }
}

pub struct Product<A, B> {
    a: A,
    b: B,
}

impl<N, A, B> Searcher<N> for Product<A, B>
where
    N: NodeT + Send + Sync,
    A: Searcher<N>,
    A::Match: Clone,
    B: Searcher<N>,
    B::Match: Clone,
{
    type Match = (A::Match, B::Match);

    fn search_call(
        &self,
        egraph: &EGraph<N>,
        seed: &EClassCall,
        f: &mut dyn FnMut(Self::Match) -> bool,
    ) -> bool {
        let mut rights = Vec::new();
        self.b.search_call(egraph, seed, &mut |m| {
            rights.push(m);
            true
        });
        self.a.search_call(egraph, seed, &mut |m1| {
            for m2 in &rights {
                if !f((m1.clone(), m2.clone())) {
                    return false;
                }
            }
            true
        })
    }
}

pub struct Merged<S> {
    inner: S,
}

impl<N, S> Searcher<N> for Merged<S>
where
    N: NodeT + Send + Sync,
    S: Searcher<N, Match = (PatternMatch<N>, PatternMatch<N>)>,
{
    type Match = PatternMatch<N>;

    fn search_call(
        &self,
        egraph: &EGraph<N>,
        seed: &EClassCall,
        f: &mut dyn FnMut(Self::Match) -> bool,
    ) -> bool {
        self.inner
            .search_call(egraph, seed, &mut |(a, b)| match a.merge(&b, egraph) {
                Some(m) => f(m),
                None => true,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, TestOp};
    use pretty_assertions::assert_eq;

    fn s(i: u32) -> Slot {
        Slot::numbered(i)
    }

    #[test]
    fn pattern_vars_in_order() {
        let p = Pattern::node(
            TestOp::Add,
            [],
            [],
            vec![
                Pattern::var("y"),
                Pattern::node(
                    TestOp::Mul,
                    [],
                    [],
                    vec![Pattern::var("x"), Pattern::var("y")],
                ),
            ],
        );
        let vars: Vec<GlobalSymbol> = vec!["y".into(), "x".into()];
        assert_eq!(p.vars(), vars);
    }

    #[test]
    fn search_finds_ground_match() {
        let mut eg = EGraph::new();
        let expr = testing::mul(testing::num(1), testing::num(2));
        testing::add_tree(&mut eg, &expr);

        // (mul ?a ?b)
        let pat = Pattern::node(
            TestOp::Mul,
            [],
            [],
            vec![Pattern::var("a"), Pattern::var("b")],
        )
        .compile();
        let found = pat.search(&eg, &ParallelMap::sequential()).unwrap();
        assert_eq!(found.len(), 1);
        let m = &found[0];
        assert_eq!(
            m.var("a").map(|c| c.class),
            eg.lookup_tree(&testing::num(1)).map(|c| c.class)
        );
        assert_eq!(
            m.var("b").map(|c| c.class),
            eg.lookup_tree(&testing::num(2)).map(|c| c.class)
        );
    }

    #[test]
    fn repeated_var_requires_same_class() {
        let mut eg = EGraph::new();
        testing::add_tree(&mut eg, &testing::mul(testing::num(1), testing::num(2)));
        testing::add_tree(&mut eg, &testing::mul(testing::num(3), testing::num(3)));

        // (mul ?a ?a)
        let pat = Pattern::node(
            TestOp::Mul,
            [],
            [],
            vec![Pattern::var("a"), Pattern::var("a")],
        )
        .compile();
        let found = pat.search(&eg, &ParallelMap::sequential()).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(
            found[0].var("a").map(|c| c.class),
            eg.lookup_tree(&testing::num(3)).map(|c| c.class)
        );
    }

    #[test]
    fn slot_patterns_bind_injectively() {
        let mut eg = EGraph::new();
        let x = Slot::fresh();
        let y = Slot::fresh();
        let z = Slot::fresh();
        testing::add_tree(&mut eg, &testing::mul(testing::var(x), testing::var(y)));
        testing::add_tree(&mut eg, &testing::mul(testing::var(z), testing::var(z)));

        // (mul (var $0) (var $1)): injectivity forbids $0 and $1 sharing a
        // concrete slot
        let pat = Pattern::node(
            TestOp::Mul,
            [],
            [],
            vec![
                Pattern::node(TestOp::Var, [], [s(0)], vec![]),
                Pattern::node(TestOp::Var, [], [s(1)], vec![]),
            ],
        )
        .compile();
        let found = pat.search(&eg, &ParallelMap::sequential()).unwrap();
        assert_eq!(found.len(), 1, "only the two-slot product matches: {found:?}");
    }

    #[test]
    fn parallel_search_agrees_with_sequential() {
        let mut eg = EGraph::new();
        for i in 0..20 {
            testing::add_tree(&mut eg, &testing::mul(testing::num(i), testing::num(i + 1)));
        }
        let pat = Pattern::node(
            TestOp::Mul,
            [],
            [],
            vec![Pattern::var("a"), Pattern::var("b")],
        )
        .compile();

        let seq = pat.search(&eg, &ParallelMap::sequential()).unwrap();
        let par = pat.search(&eg, &ParallelMap::work_stealing()).unwrap();
        assert_eq!(seq.len(), 20);
        // `apply` preserves input order, so the two agree element-wise
        let seq_classes: Vec<_> = seq.iter().map(|m| m.class.class).collect();
        let par_classes: Vec<_> = par.iter().map(|m| m.class.class).collect();
        assert_eq!(seq_classes, par_classes);
    }

    #[test]
    fn filter_and_map_compose() {
        let mut eg = EGraph::new();
        testing::add_tree(&mut eg, &testing::mul(testing::num(1), testing::num(2)));

        let searcher = Pattern::node(
            TestOp::Mul,
            [],
            [],
            vec![Pattern::var("a"), Pattern::var("b")],
        )
        .compile()
        .filter(|_m: &PatternMatch<TestOp>| true)
        .map(|m: PatternMatch<TestOp>| m.class.class);
        let found = searcher.search(&eg, &ParallelMap::sequential()).unwrap();
        assert_eq!(found.len(), 1);
    }
}
