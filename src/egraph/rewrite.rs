//! Rewrite rules: a named searcher/applier pair whose effect is built as a
//! deferred command schedule and applied in batches.

use log::trace;
use symbol_table::GlobalSymbol;

use crate::{
    egraph::{
        command::{CommandSchedule, NodeSymbol, ScheduleBuilder, SymbolicNode},
        pattern::{CompiledPattern, Pattern, PatternMatch, Searcher},
        EGraph,
    },
    parallel::{Canceled, ParallelMap},
    slot::{Slot, SlotMap},
    tree::NodeT,
};

/// Why an applier could not construct its commands.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuleError {
    #[error("applier variable ?{0} is not bound by the searcher")]
    UnboundVariable(GlobalSymbol),
    #[error("{0}")]
    Failed(String),
}

/// Turns one match into schedule contributions.
pub trait Applier<N: NodeT>: Send + Sync {
    fn apply_match(
        &self,
        egraph: &EGraph<N>,
        m: &PatternMatch<N>,
        schedule: &mut ScheduleBuilder<N>,
    ) -> Result<(), RuleError>;
}

/// A side condition gating an applier.
pub trait Condition<N: NodeT>: Send + Sync {
    fn check(&self, egraph: &EGraph<N>, m: &PatternMatch<N>) -> bool;
}

impl<N: NodeT, F> Condition<N> for F
where
    F: Fn(&EGraph<N>, &PatternMatch<N>) -> bool + Send + Sync,
{
    fn check(&self, egraph: &EGraph<N>, m: &PatternMatch<N>) -> bool {
        self(egraph, m)
    }
}

/// Applies the inner applier only where the condition holds.
pub struct ConditionalApplier<C, A> {
    pub condition: C,
    pub applier: A,
}

impl<N, C, A> Applier<N> for ConditionalApplier<C, A>
where
    N: NodeT,
    C: Condition<N>,
    A: Applier<N>,
{
    fn apply_match(
        &self,
        egraph: &EGraph<N>,
        m: &PatternMatch<N>,
        schedule: &mut ScheduleBuilder<N>,
    ) -> Result<(), RuleError> {
        if self.condition.check(egraph, m) {
            self.applier.apply_match(egraph, m, schedule)
        } else {
            Ok(())
        }
    }
}

impl<N: NodeT> Applier<N> for CompiledPattern<N> {
    /// Instantiate the pattern under the match's bindings and union the
    /// result with the matched class. Slots the match does not bind are
    /// freshened per match.
    fn apply_match(
        &self,
        _egraph: &EGraph<N>,
        m: &PatternMatch<N>,
        schedule: &mut ScheduleBuilder<N>,
    ) -> Result<(), RuleError> {
        let mut fresh = SlotMap::new();
        let root = instantiate(&self.ast, m, schedule, &mut fresh)?;
        schedule.union(root, NodeSymbol::Real(m.class.clone()));
        Ok(())
    }
}

pub(crate) fn instantiate<N: NodeT>(
    pattern: &Pattern<N>,
    m: &PatternMatch<N>,
    schedule: &mut ScheduleBuilder<N>,
    fresh: &mut SlotMap,
) -> Result<NodeSymbol, RuleError> {
    match pattern {
        Pattern::Var(v) => m
            .subst
            .get(v)
            .map(|c| NodeSymbol::Real(c.clone()))
            .ok_or(RuleError::UnboundVariable(*v)),
        Pattern::Node {
            op,
            defs,
            uses,
            args,
        } => {
            let args = args
                .iter()
                .map(|a| instantiate(a, m, schedule, fresh))
                .collect::<Result<Vec<_>, _>>()?;
            let mut resolve = |s: Slot| {
                m.slots.get(s).unwrap_or_else(|| match fresh.get(s) {
                    Some(f) => f,
                    None => {
                        let f = Slot::fresh();
                        fresh.insert(s, f);
                        f
                    }
                })
            };
            let defs = defs.iter().map(|&s| resolve(s)).collect();
            let uses = uses.iter().map(|&s| resolve(s)).collect();
            Ok(schedule.add_node(SymbolicNode {
                op: op.clone(),
                defs,
                uses,
                args,
            }))
        }
    }
}

/// A named rewrite rule.
pub struct Rule<N: NodeT> {
    pub name: GlobalSymbol,
    searcher: Box<dyn Searcher<N, Match = PatternMatch<N>>>,
    applier: Box<dyn Applier<N>>,
    /// Present for plain pattern-to-pattern rules; enables reversal.
    patterns: Option<(Pattern<N>, Pattern<N>)>,
}

impl<N: NodeT + Send + Sync + 'static> Rule<N> {
    pub fn new(
        name: impl Into<GlobalSymbol>,
        searcher: impl Searcher<N, Match = PatternMatch<N>> + 'static,
        applier: impl Applier<N> + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            searcher: Box::new(searcher),
            applier: Box::new(applier),
            patterns: None,
        }
    }

    /// The common case: rewrite one pattern into another.
    pub fn rewrite(name: impl Into<GlobalSymbol>, lhs: Pattern<N>, rhs: Pattern<N>) -> Self {
        Self {
            name: name.into(),
            searcher: Box::new(lhs.compile()),
            applier: Box::new(rhs.compile()),
            patterns: Some((lhs, rhs)),
        }
    }

    /// A pattern rewrite gated by a side condition. Not reversible.
    pub fn rewrite_if(
        name: impl Into<GlobalSymbol>,
        lhs: Pattern<N>,
        rhs: Pattern<N>,
        condition: impl Condition<N> + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            searcher: Box::new(lhs.compile()),
            applier: Box::new(ConditionalApplier {
                condition,
                applier: rhs.compile(),
            }),
            patterns: None,
        }
    }

    /// Only structural pattern-to-pattern rules reverse; everything else
    /// returns `None` and the driver skips it.
    pub fn try_reverse(&self) -> Option<Rule<N>> {
        let (lhs, rhs) = self.patterns.as_ref()?;
        // The reversed searcher must bind every variable the reversed
        // applier mentions.
        let rhs_vars = rhs.vars();
        if !lhs.vars().iter().all(|v| rhs_vars.contains(v)) {
            return None;
        }
        Some(Rule::rewrite(
            format!("{} (reversed)", self.name.as_str()),
            rhs.clone(),
            lhs.clone(),
        ))
    }

    pub fn search(
        &self,
        egraph: &EGraph<N>,
        par: &ParallelMap,
    ) -> Result<Vec<PatternMatch<N>>, Canceled> {
        self.searcher.search(egraph, par)
    }

    pub fn search_with_limit(&self, egraph: &EGraph<N>, limit: usize) -> Vec<PatternMatch<N>> {
        self.searcher.search_with_limit(egraph, limit)
    }

    /// Build the deferred schedule for a batch of matches.
    pub fn delayed(
        &self,
        matches: &[PatternMatch<N>],
        egraph: &EGraph<N>,
    ) -> Result<CommandSchedule<N>, RuleError> {
        let mut sb = ScheduleBuilder::new();
        for m in matches {
            self.applier.apply_match(egraph, m, &mut sb)?;
        }
        trace!("rule {}: {} matches -> schedule", self.name.as_str(), matches.len());
        Ok(sb.finish())
    }

    /// Apply a batch of matches immediately; true iff the graph changed.
    pub fn apply(
        &self,
        egraph: &mut EGraph<N>,
        matches: &[PatternMatch<N>],
    ) -> Result<bool, RuleError> {
        let schedule = self.delayed(matches, egraph)?;
        Ok(schedule.apply(egraph))
    }

    /// Search and apply against a fresh snapshot; `Ok(None)` when the rule
    /// changed nothing.
    pub fn try_apply(
        &self,
        egraph: &EGraph<N>,
        par: &ParallelMap,
    ) -> Result<Option<EGraph<N>>, TryApplyError> {
        let matches = self.search(egraph, par)?;
        let mut next = egraph.clone();
        if self.apply(&mut next, &matches)? {
            Ok(Some(next))
        } else {
            Ok(None)
        }
    }
}

/// Failure of an immediate [`Rule::try_apply`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TryApplyError {
    #[error(transparent)]
    Canceled(#[from] Canceled),
    #[error(transparent)]
    Rule(#[from] RuleError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, TestOp};

    fn pvar(name: &str) -> Pattern<TestOp> {
        Pattern::var(name)
    }

    #[test]
    fn rewrite_applies_and_reverses() {
        // x + 0 -> x
        let rule = Rule::rewrite(
            "add-zero",
            Pattern::node(
                TestOp::Add,
                [],
                [],
                vec![pvar("x"), Pattern::node(TestOp::Num(0), [], [], vec![])],
            ),
            pvar("x"),
        );

        let mut eg = EGraph::new();
        let s = Slot::fresh();
        let expr = testing::add(testing::var(s), testing::num(0));
        testing::add_tree(&mut eg, &expr);

        let next = rule
            .try_apply(&eg, &ParallelMap::sequential())
            .unwrap()
            .expect("one application");
        assert!(next.are_same_tree(&expr, &testing::var(s)));

        // size extraction settles on the bare variable
        let extractor = crate::egraph::Extractor::new(&next, crate::egraph::AstSize);
        let call = next.lookup_tree(&expr).unwrap();
        assert_eq!(extractor.extract(&call, &next), Some(testing::var(s)));

        let rev = rule.try_reverse().expect("pattern rules reverse");
        assert_eq!(rev.name.as_str(), "add-zero (reversed)");
        // applying the reverse to a lone var introduces x + 0
        let mut eg2 = EGraph::new();
        testing::add_tree(&mut eg2, &testing::var(s));
        let next2 = rev
            .try_apply(&eg2, &ParallelMap::sequential())
            .unwrap()
            .expect("one application");
        assert!(next2.are_same_tree(&testing::var(s), &testing::add(testing::var(s), testing::num(0))));
    }

    #[test]
    fn unbound_applier_var_is_an_error() {
        let rule: Rule<TestOp> = Rule::rewrite("bad", pvar("x"), pvar("y"));
        let mut eg = EGraph::new();
        testing::add_tree(&mut eg, &testing::num(1));
        let matches = rule.search(&eg, &ParallelMap::sequential()).unwrap();
        assert!(!matches.is_empty());
        let err = rule.delayed(&matches, &eg).unwrap_err();
        assert_eq!(err, RuleError::UnboundVariable("y".into()));
    }

    #[test]
    fn appliers_freshen_unmatched_slots() {
        use crate::Slot;
        // ?x -> (lam [$9] (add ?x (var $9))): $9 is not bound by the
        // searcher, so each application introduces a fresh binder
        let rule = Rule::rewrite(
            "wrap",
            pvar("x"),
            Pattern::node(
                TestOp::Lam,
                [Slot::numbered(9)],
                [],
                vec![Pattern::node(
                    TestOp::Add,
                    [],
                    [],
                    vec![
                        pvar("x"),
                        Pattern::node(TestOp::Var, [], [Slot::numbered(9)], vec![]),
                    ],
                )],
            ),
        );

        let mut eg = EGraph::new();
        testing::add_tree(&mut eg, &testing::num(1));
        let next = rule
            .try_apply(&eg, &ParallelMap::sequential())
            .unwrap()
            .expect("one application");
        next.check_invariants();

        // alpha-equivalence makes the concrete binder name irrelevant
        let s = Slot::fresh();
        let wrapped = testing::lam(s, testing::add(testing::num(1), testing::var(s)));
        assert!(next.are_same_tree(&testing::num(1), &wrapped));
    }

    #[test]
    fn conditional_rule_respects_gate() {
        let never = |_: &EGraph<TestOp>, _: &PatternMatch<TestOp>| false;
        let rule = Rule::rewrite_if("gated", pvar("x"), pvar("x"), never);
        let mut eg = EGraph::new();
        testing::add_tree(&mut eg, &testing::num(1));
        assert!(rule.try_apply(&eg, &ParallelMap::sequential()).unwrap().is_none());
        assert!(rule.try_reverse().is_none());
    }
}
