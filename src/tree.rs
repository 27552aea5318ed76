use std::fmt::{self, Debug, Display, Formatter};
use std::hash::Hash;

use smallvec::SmallVec;
use symbol_table::GlobalSymbol;

use crate::{
    egraph::EClassCall,
    slot::{Slot, SlotMap, SlotSet},
};

/// The contract a host node vocabulary implements.
///
/// The engine only ever inspects nodes through equality, hashing and total
/// ordering; [`NodeT::type_arg_count`] lets analyses split leading "type"
/// arguments from value arguments.
pub trait NodeT: Debug + Clone + Eq + Ord + Hash + Send + Sync {
    /// How many leading argument positions of this node carry types rather
    /// than values.
    fn type_arg_count(&self) -> usize {
        0
    }
}

pub(crate) type SlotVec = SmallVec<[Slot; 2]>;

/// A pure expression tree.
///
/// `defs` are the slots this node binds for its subtrees; `uses` are slots
/// defined elsewhere.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tree<N> {
    pub op: N,
    pub defs: SlotVec,
    pub uses: SlotVec,
    pub args: Vec<Tree<N>>,
}

impl<N: NodeT> Tree<N> {
    pub fn new(
        op: N,
        defs: impl IntoIterator<Item = Slot>,
        uses: impl IntoIterator<Item = Slot>,
        args: Vec<Tree<N>>,
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

    pub fn size(&self) -> usize {
        1 + self.args.iter().map(Tree::size).sum::<usize>()
    }

    pub fn depth(&self) -> usize {
        1 + self.args.iter().map(Tree::depth).max().unwrap_or(0)
    }

    /// Slots used but not bound by any enclosing definition.
    pub fn free_slots(&self) -> SlotSet {
        fn go<N: NodeT>(t: &Tree<N>, bound: &SlotSet, out: &mut Vec<Slot>) {
            out.extend(t.uses.iter().copied().filter(|s| !bound.contains(*s)));
            let bound = bound.union(&t.defs.iter().copied().collect());
            for a in &t.args {
                go(a, &bound, out);
            }
        }
        let mut out = Vec::new();
        go(self, &SlotSet::empty(), &mut out);
        out.into_iter().collect()
    }

    /// Rename free slot occurrences through `m`; bound occurrences are left
    /// alone. Free slots missing from `m` are kept.
    pub fn map_free_slots(&self, m: &SlotMap) -> Tree<N> {
        let shadowed: SlotSet = self.defs.iter().copied().collect();
        let m = m
            .iter()
            .filter(|(k, _)| !shadowed.contains(*k))
            .collect::<SlotMap>();
        Tree {
            op: self.op.clone(),
            defs: self.defs.clone(),
            uses: self
                .uses
                .iter()
                .map(|&s| m.get(s).unwrap_or(s))
                .collect(),
            args: self.args.iter().map(|a| a.map_free_slots(&m)).collect(),
        }
    }
}

impl<N: Debug> Debug for Tree<N> {
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

/// A tree whose leaves may also be e-class calls or pattern variables.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum MixedTree<N> {
    Node {
        op: N,
        defs: SlotVec,
        uses: SlotVec,
        args: Vec<MixedTree<N>>,
    },
    /// A leaf standing for everything an e-class represents.
    Call(EClassCall),
    /// A pattern variable, only meaningful inside patterns.
    Var(GlobalSymbol),
}

impl<N: NodeT> MixedTree<N> {
    pub fn node(
        op: N,
        defs: impl IntoIterator<Item = Slot>,
        uses: impl IntoIterator<Item = Slot>,
        args: Vec<MixedTree<N>>,
    ) -> Self {
        MixedTree::Node {
            op,
            defs: defs.into_iter().collect(),
            uses: uses.into_iter().collect(),
            args,
        }
    }

    /// Purely structural conversion; `None` as soon as a call or variable
    /// leaf appears.
    pub fn to_tree(&self) -> Option<Tree<N>> {
        match self {
            MixedTree::Node {
                op,
                defs,
                uses,
                args,
            } => Some(Tree {
                op: op.clone(),
                defs: defs.clone(),
                uses: uses.clone(),
                args: args.iter().map(MixedTree::to_tree).collect::<Option<_>>()?,
            }),
            MixedTree::Call(_) | MixedTree::Var(_) => None,
        }
    }
}

impl<N: NodeT> From<Tree<N>> for MixedTree<N> {
    fn from(t: Tree<N>) -> Self {
        MixedTree::Node {
            op: t.op,
            defs: t.defs,
            uses: t.uses,
            args: t.args.into_iter().map(MixedTree::from).collect(),
        }
    }
}

impl<N: Debug> Debug for MixedTree<N> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            MixedTree::Node {
                op,
                defs,
                uses,
                args,
            } => {
                write!(f, "({op:?}")?;
                for d in defs {
                    write!(f, " [{d}]")?;
                }
                for u in uses {
                    write!(f, " {u}")?;
                }
                for a in args {
                    write!(f, " {a:?}")?;
                }
                write!(f, ")")
            }
            MixedTree::Call(c) => write!(f, "{c:?}"),
            MixedTree::Var(v) => write!(f, "?{}", v.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestOp;
    use pretty_assertions::assert_eq;

    fn n(i: u32) -> Slot {
        Slot::numbered(i)
    }

    #[test]
    fn size_and_depth() {
        let two = Tree::leaf(TestOp::Num(2));
        let x = Tree::new(TestOp::Var, [], [n(0)], vec![]);
        let t = Tree::new(TestOp::Mul, [], [], vec![two, x]);
        assert_eq!(t.size(), 3);
        assert_eq!(t.depth(), 2);
        assert_eq!(t.free_slots(), SlotSet::singleton(n(0)));
    }

    #[test]
    fn binders_shadow_renames() {
        // lam [0] (mul (var 0) (var 1))
        let body = Tree::new(
            TestOp::Mul,
            [],
            [],
            vec![
                Tree::new(TestOp::Var, [], [n(0)], vec![]),
                Tree::new(TestOp::Var, [], [n(1)], vec![]),
            ],
        );
        let lam = Tree::new(TestOp::Lam, [n(0)], [], vec![body]);
        assert_eq!(lam.free_slots(), SlotSet::singleton(n(1)));

        let m: SlotMap = [(n(0), n(5)), (n(1), n(6))].into_iter().collect();
        let renamed = lam.map_free_slots(&m);
        // the bound slot is untouched, the free one is renamed
        assert_eq!(renamed.args[0].args[0].uses[0], n(0));
        assert_eq!(renamed.args[0].args[1].uses[0], n(6));
    }
}
