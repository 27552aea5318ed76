use crate::{
    egraph::{EClassCall, EClassRef},
    slot::{SlotMap, SlotSet},
};

/// A disjoint-set forest whose links carry the slot renaming from the child
/// root into the parent root's frame.
///
/// Refs are arena indices; entries are never removed. The read-side
/// [`UnionFind::find`] is pure so snapshots can be shared across threads;
/// path compression only happens through [`UnionFind::find_compress`] inside
/// rebuild.
#[derive(Debug, Clone, Default)]
pub(crate) struct UnionFind {
    entries: Vec<Entry>,
}

#[derive(Debug, Clone)]
enum Entry {
    Root { slots: SlotSet },
    /// The call's `args` map the (then-current) parent slots into this
    /// class's frame.
    Link(EClassCall),
}

impl UnionFind {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn make_root(&mut self, slots: SlotSet) -> EClassRef {
        let r = EClassRef(self.entries.len() as u32);
        self.entries.push(Entry::Root { slots });
        r
    }

    pub fn contains(&self, r: EClassRef) -> bool {
        (r.0 as usize) < self.entries.len()
    }

    pub fn is_root(&self, r: EClassRef) -> bool {
        matches!(self.entries.get(r.0 as usize), Some(Entry::Root { .. }))
    }

    /// Public slots of a root. Panics on links: internal callers only ever
    /// ask about canonical refs.
    pub fn slots_of(&self, r: EClassRef) -> &SlotSet {
        match &self.entries[r.0 as usize] {
            Entry::Root { slots } => slots,
            Entry::Link(_) => panic!("slots_of on non-root {r}"),
        }
    }

    /// Resolve `r` to a call of its root, composing the renamings along the
    /// path. `None` iff `r` was never allocated here.
    pub fn find(&self, r: EClassRef) -> Option<EClassCall> {
        let entry = self.entries.get(r.0 as usize)?;
        match entry {
            Entry::Root { slots } => Some(EClassCall {
                class: r,
                args: SlotMap::identity(slots),
            }),
            Entry::Link(call) => {
                let up = self.find(call.class).expect("link to unallocated class");
                Some(EClassCall {
                    class: up.class,
                    args: up.args.compose(&call.args),
                })
            }
        }
    }

    /// Like [`UnionFind::find`], additionally re-pointing every link on the
    /// path directly at the root.
    pub fn find_compress(&mut self, r: EClassRef) -> EClassCall {
        let mut path = vec![];
        let mut cur = r;
        while let Entry::Link(call) = &self.entries[cur.0 as usize] {
            path.push(cur);
            cur = call.class;
        }
        for node in path {
            let direct = self.find(node).expect("find_compress on unallocated class");
            self.entries[node.0 as usize] = Entry::Link(direct);
        }
        self.find(r).expect("find_compress on unallocated class")
    }

    /// Link the root `child` under the root `parent`.
    ///
    /// `map` renames `slots(child)` into `slots(parent)` and must be a
    /// bijection onto a subset of the parent's slots.
    pub fn union(&mut self, child: EClassRef, parent: EClassRef, map: &SlotMap) {
        assert!(self.is_root(child) && self.is_root(parent), "union of non-roots");
        assert!(child != parent, "union of a class with itself");
        assert_eq!(map.keys(), *self.slots_of(child), "union map must cover the child slots");
        assert!(
            map.values().is_subset(self.slots_of(parent)),
            "union map must land in the parent slots"
        );
        let args = map.inverse();
        self.entries[child.0 as usize] = Entry::Link(EClassCall { class: parent, args });
    }

    /// Replace a root's public slot set, keeping the identity rename.
    pub fn shrink_slots(&mut self, root: EClassRef, new_slots: SlotSet) {
        match &mut self.entries[root.0 as usize] {
            Entry::Root { slots } => {
                assert!(new_slots.is_subset(slots), "slots may only shrink");
                *slots = new_slots;
            }
            Entry::Link(_) => panic!("shrink_slots on non-root {root}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slot::Slot;

    fn n(i: u32) -> Slot {
        Slot::numbered(i)
    }

    fn slots(is: &[u32]) -> SlotSet {
        is.iter().map(|&i| n(i)).collect()
    }

    #[test]
    fn find_root_is_identity() {
        let mut uf = UnionFind::new();
        let a = uf.make_root(slots(&[0, 1]));
        let f = uf.find(a).unwrap();
        assert_eq!(f.class, a);
        assert_eq!(f.args, SlotMap::identity(&slots(&[0, 1])));
    }

    #[test]
    fn union_composes_renamings() {
        let mut uf = UnionFind::new();
        let a = uf.make_root(slots(&[0]));
        let b = uf.make_root(slots(&[1]));
        let c = uf.make_root(slots(&[2]));
        // a's $0 is b's $1; b's $1 is c's $2
        uf.union(a, b, &[(n(0), n(1))].into_iter().collect());
        uf.union(b, c, &[(n(1), n(2))].into_iter().collect());

        let f = uf.find(a).unwrap();
        assert_eq!(f.class, c);
        // slots(c) -> a's frame
        assert_eq!(f.args, [(n(2), n(0))].into_iter().collect());

        let g = uf.find_compress(a);
        assert_eq!(g, f);
        // compressed: the same answer without the intermediate hop
        assert_eq!(uf.find(a).unwrap(), f);
    }

    #[test]
    fn shrink_then_find_restricts() {
        let mut uf = UnionFind::new();
        let a = uf.make_root(slots(&[0, 1]));
        let b = uf.make_root(slots(&[2, 3]));
        uf.union(a, b, &[(n(0), n(2)), (n(1), n(3))].into_iter().collect());
        uf.shrink_slots(b, slots(&[2]));
        let f = uf.find(a).unwrap();
        assert_eq!(f.args, [(n(2), n(0))].into_iter().collect());
    }
}
