//! Extraction: pick, per class, the minimum-cost tree it represents.
//!
//! Implemented as an analysis whose data is a cost-annotated tree, with a
//! total deterministic tie-break so extraction is stable across runs.

use std::cmp::Ordering;
use std::fmt::Debug;
use std::marker::PhantomData;

use crate::{
    egraph::{Analysis, AnalysisMetadata, EClassCall, EGraph, ENode},
    slot::SlotMap,
    tree::{NodeT, Tree},
};

/// A cost function usable by the extractor. Costs must be totally ordered;
/// `cost` should be monotone in its children.
pub trait CostFunction<N: NodeT>: Send + Sync {
    type Cost: Ord + Clone + Debug + Send;

    fn cost(&self, node: &ENode<N>, child_costs: &[Self::Cost]) -> Self::Cost;

    /// Transport a cost across a slot renaming. Identity unless the cost
    /// domain mentions slots.
    fn rename(&self, cost: Self::Cost, _map: &SlotMap) -> Self::Cost {
        cost
    }
}

/// Total AST size.
#[derive(Debug, Clone, Copy, Default)]
pub struct AstSize;

impl<N: NodeT> CostFunction<N> for AstSize {
    type Cost = usize;

    fn cost(&self, _node: &ENode<N>, child_costs: &[usize]) -> usize {
        child_costs
            .iter()
            .fold(1usize, |sum, c| sum.saturating_add(*c))
    }
}

/// Maximum AST depth.
#[derive(Debug, Clone, Copy, Default)]
pub struct AstDepth;

impl<N: NodeT> CostFunction<N> for AstDepth {
    type Cost = usize;

    fn cost(&self, _node: &ENode<N>, child_costs: &[usize]) -> usize {
        1 + child_costs.iter().copied().max().unwrap_or(0)
    }
}

/// A candidate extraction: the cost and the tree realizing it.
#[derive(Debug, Clone, PartialEq)]
pub struct CostedTree<N, C> {
    pub cost: C,
    pub tree: Tree<N>,
}

impl<N: NodeT, C: Ord> CostedTree<N, C> {
    /// The total order behind `join`: cost, then size, depth, and finally
    /// the tree's own ordering, so ties break deterministically.
    fn cmp(&self, other: &Self) -> Ordering {
        self.cost
            .cmp(&other.cost)
            .then_with(|| self.tree.size().cmp(&other.tree.size()))
            .then_with(|| self.tree.depth().cmp(&other.tree.depth()))
            .then_with(|| self.tree.cmp(&other.tree))
    }
}

/// The extraction analysis: `make` assembles a costed tree from children,
/// `join` keeps the lesser.
pub struct ExtractionAnalysis<N, CF> {
    pub cost_function: CF,
    _marker: PhantomData<fn() -> N>,
}

impl<N, CF> ExtractionAnalysis<N, CF> {
    pub fn new(cost_function: CF) -> Self {
        Self {
            cost_function,
            _marker: PhantomData,
        }
    }
}

impl<N: NodeT> ExtractionAnalysis<N, AstSize> {
    /// Prefer the smallest tree.
    pub fn smallest() -> Self {
        Self::new(AstSize)
    }
}

impl<N: NodeT> ExtractionAnalysis<N, AstDepth> {
    /// Prefer the shallowest tree.
    pub fn shallowest() -> Self {
        Self::new(AstDepth)
    }
}

impl<N, CF> Analysis<N> for ExtractionAnalysis<N, CF>
where
    N: NodeT + Send + Sync,
    CF: CostFunction<N>,
{
    type Data = CostedTree<N, CF::Cost>;

    fn make(&self, node: &ENode<N>, arg_data: &[Self::Data]) -> Self::Data {
        let child_costs: Vec<CF::Cost> = arg_data.iter().map(|d| d.cost.clone()).collect();
        let cost = self.cost_function.cost(node, &child_costs);
        let tree = Tree {
            op: node.op.clone(),
            defs: node.defs.clone(),
            uses: node.uses.clone(),
            args: arg_data.iter().map(|d| d.tree.clone()).collect(),
        };
        CostedTree { cost, tree }
    }

    fn join(&self, a: Self::Data, b: Self::Data) -> Self::Data {
        match a.cmp(&b) {
            Ordering::Greater => b,
            _ => a,
        }
    }

    fn rename(&self, data: &Self::Data, map: &SlotMap) -> Self::Data {
        CostedTree {
            cost: self.cost_function.rename(data.cost.clone(), map),
            tree: data.tree.map_free_slots(map),
        }
    }
}

/// Extracts minimal-cost trees from a snapshot. All work happens on
/// construction (the greedy fixpoint over classes); extraction per call is
/// then a rename.
pub struct Extractor<N: NodeT, CF: CostFunction<N>>
where
    N: Send + Sync,
{
    metadata: AnalysisMetadata<N, ExtractionAnalysis<N, CF>>,
}

impl<N, CF> Extractor<N, CF>
where
    N: NodeT + Send + Sync,
    CF: CostFunction<N>,
{
    pub fn new(egraph: &EGraph<N>, cost_function: CF) -> Self {
        Self {
            metadata: AnalysisMetadata::compute(ExtractionAnalysis::new(cost_function), egraph),
        }
    }

    /// The best tree the class behind `call` represents, in the call-site
    /// frame. `None` when no finite tree exists (empty cyclic classes).
    pub fn extract(&self, call: &EClassCall, egraph: &EGraph<N>) -> Option<Tree<N>> {
        self.metadata.for_call(egraph, call).map(|d| d.tree)
    }

    pub fn cost_of(&self, call: &EClassCall, egraph: &EGraph<N>) -> Option<CF::Cost> {
        self.metadata.for_call(egraph, call).map(|d| d.cost)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, TestOp};
    use pretty_assertions::assert_eq;

    #[test]
    fn smallest_picks_the_constant() {
        let mut eg = EGraph::new();
        let expr = testing::mul(testing::num(1), testing::num(2));
        let root = testing::add_tree(&mut eg, &expr);
        let two = testing::add_tree(&mut eg, &testing::num(2));
        eg.union(&root, &two);

        let extractor = Extractor::new(&eg, AstSize);
        let call = eg.canonicalize(&root).unwrap();
        assert_eq!(extractor.extract(&call, &eg), Some(testing::num(2)));
        assert_eq!(extractor.cost_of(&call, &eg), Some(1));
    }

    #[test]
    fn extraction_renames_into_call_frame() {
        let mut eg = EGraph::new();
        let s = crate::Slot::fresh();
        let root = testing::add_tree(&mut eg, &testing::var(s));
        let extractor = Extractor::new(&eg, AstSize);
        let call = eg.canonicalize(&root).unwrap();
        let tree = extractor.extract(&call, &eg).unwrap();
        assert_eq!(tree, testing::var(s));
    }

    #[test]
    fn depth_and_size_can_disagree() {
        // (1+2)+(3+4) vs ((1+2)+3)+4: same size, different depth
        let balanced = testing::add(
            testing::add(testing::num(1), testing::num(2)),
            testing::add(testing::num(3), testing::num(4)),
        );
        let skewed = testing::add(
            testing::add(testing::add(testing::num(1), testing::num(2)), testing::num(3)),
            testing::num(4),
        );
        let mut eg = EGraph::new();
        let a = testing::add_tree(&mut eg, &balanced);
        let b = testing::add_tree(&mut eg, &skewed);
        eg.union(&a, &b);

        let call = eg.canonicalize(&a).unwrap();
        let shallow = Extractor::new(&eg, AstDepth);
        assert_eq!(shallow.extract(&call, &eg), Some(balanced));
    }
}
