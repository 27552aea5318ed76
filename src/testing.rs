//! A small node vocabulary for tests: arithmetic, a binder, and the
//! build/fold/dot trio used by the idiom-detection scenario.

use crate::{
    egraph::{EClassCall, EGraph},
    slot::Slot,
    tree::{NodeT, Tree},
};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TestOp {
    Num(i64),
    /// References one slot through `uses`.
    Var,
    Add,
    Mul,
    /// Binds one slot through `defs`.
    Lam,
    /// Type token used as a leading type argument.
    DoubleTy,
    FloatTy,
    /// `Build(ty, len, body)` and `Fold(ty, acc, xs)`, with a leading type
    /// argument each.
    Build,
    Fold,
    Dot,
}

impl NodeT for TestOp {
    fn type_arg_count(&self) -> usize {
        match self {
            TestOp::Build | TestOp::Fold => 1,
            _ => 0,
        }
    }
}

pub fn num(i: i64) -> Tree<TestOp> {
    Tree::leaf(TestOp::Num(i))
}

pub fn var(s: Slot) -> Tree<TestOp> {
    Tree::new(TestOp::Var, [], [s], vec![])
}

pub fn add(a: Tree<TestOp>, b: Tree<TestOp>) -> Tree<TestOp> {
    Tree::new(TestOp::Add, [], [], vec![a, b])
}

pub fn mul(a: Tree<TestOp>, b: Tree<TestOp>) -> Tree<TestOp> {
    Tree::new(TestOp::Mul, [], [], vec![a, b])
}

pub fn lam(s: Slot, body: Tree<TestOp>) -> Tree<TestOp> {
    Tree::new(TestOp::Lam, [s], [], vec![body])
}

pub fn add_tree(eg: &mut EGraph<TestOp>, t: &Tree<TestOp>) -> EClassCall {
    eg.add_tree(t)
}
