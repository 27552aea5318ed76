//! Multipatterns bind several patterns to variables, searching or applying
//! many terms constrained to one substitution. Good for graph rewrites and
//! datalog-style rules.

use symbol_table::GlobalSymbol;

use crate::{
    egraph::{
        command::{NodeSymbol, ScheduleBuilder},
        pattern::{CompiledPattern, Pattern, PatternMatch, Searcher},
        rewrite::{Applier, RuleError},
        EClassCall, EGraph,
    },
    tree::NodeT,
};

/// A set of open patterns, each rooted at a variable.
///
/// As a searcher, every pattern must match with all bindings consistent;
/// patterns rooted at an already-bound variable are searched inside that
/// binding only. As an applier, each pattern is instantiated and unioned
/// with its root variable's class.
#[derive(Debug, Clone)]
pub struct MultiPattern<N> {
    patterns: Vec<(GlobalSymbol, CompiledPattern<N>)>,
}

impl<N: NodeT> MultiPattern<N> {
    /// `patterns` pairs a root variable with the pattern bound to it. The
    /// first root variable anchors the search.
    pub fn new(patterns: Vec<(GlobalSymbol, Pattern<N>)>) -> Self {
        assert!(!patterns.is_empty(), "a multipattern needs at least one pattern");
        Self {
            patterns: patterns
                .into_iter()
                .map(|(v, p)| (v, p.compile()))
                .collect(),
        }
    }

    pub fn vars(&self) -> Vec<GlobalSymbol> {
        let mut out = vec![];
        for (root, pat) in &self.patterns {
            if !out.contains(root) {
                out.push(*root);
            }
            for v in pat.ast.vars() {
                if !out.contains(&v) {
                    out.push(v);
                }
            }
        }
        out
    }

    /// Depth-first product of the per-pattern matches, threading one
    /// accumulated match through all phases.
    fn search_phase(
        &self,
        egraph: &EGraph<N>,
        index: usize,
        acc: PatternMatch<N>,
        f: &mut dyn FnMut(PatternMatch<N>) -> bool,
    ) -> bool
    where
        N: Send + Sync,
    {
        let Some((root, pat)) = self.patterns.get(index) else {
            return f(acc);
        };
        let seed = match acc.subst.get(root) {
            Some(bound) => bound.clone(),
            // An unbound root ranges over every class.
            None => {
                let mut classes: Vec<_> = egraph.classes().collect();
                classes.sort_unstable();
                for c in classes {
                    let seed = super::pattern::identity_call(egraph, c);
                    let keep_going = self.phase_on_seed(egraph, index, &acc, root, pat, seed, f);
                    if !keep_going {
                        return false;
                    }
                }
                return true;
            }
        };
        self.phase_on_seed(egraph, index, &acc, root, pat, seed, f)
    }

    #[allow(clippy::too_many_arguments)]
    fn phase_on_seed(
        &self,
        egraph: &EGraph<N>,
        index: usize,
        acc: &PatternMatch<N>,
        root: &GlobalSymbol,
        pat: &CompiledPattern<N>,
        seed: EClassCall,
        f: &mut dyn FnMut(PatternMatch<N>) -> bool,
    ) -> bool
    where
        N: Send + Sync,
    {
        pat.search_call(egraph, &seed, &mut |m| {
            let mut m = m;
            m.subst.insert(*root, seed.clone());
            match acc.merge(&m, egraph) {
                Some(merged) => self.search_phase(egraph, index + 1, merged, f),
                None => true,
            }
        })
    }
}

impl<N: NodeT + Send + Sync> Searcher<N> for MultiPattern<N> {
    type Match = PatternMatch<N>;

    fn search_call(
        &self,
        egraph: &EGraph<N>,
        seed: &EClassCall,
        f: &mut dyn FnMut(Self::Match) -> bool,
    ) -> bool {
        let (root, pat) = &self.patterns[0];
        let start = PatternMatch::new(seed.clone(), Default::default(), Default::default());
        self.phase_on_seed(egraph, 0, &start, root, pat, seed.clone(), f)
    }
}

impl<N: NodeT> Applier<N> for MultiPattern<N> {
    fn apply_match(
        &self,
        egraph: &EGraph<N>,
        m: &PatternMatch<N>,
        schedule: &mut ScheduleBuilder<N>,
    ) -> Result<(), RuleError> {
        for (root, pat) in &self.patterns {
            let mut fresh = crate::slot::SlotMap::new();
            let sym = super::rewrite::instantiate(&pat.ast, m, schedule, &mut fresh)?;
            match m.subst.get(root) {
                Some(bound) => schedule.union(sym, NodeSymbol::Real(bound.clone())),
                None => return Err(RuleError::UnboundVariable(*root)),
            }
        }
        Ok(())
    }
}
