//! Union with upward merging: the worklist fixpoint that restores every
//! invariant after a batch of unions.

use std::collections::VecDeque;

use log::{debug, trace, warn};

use crate::{
    group::Perm,
    slot::{SlotMap, SlotSet},
    tree::NodeT,
    utils::HashMap,
};

use super::{EClassCall, EClassRef, EGraph, ENode};

/// Hard cap on rebuild steps; hitting it means a non-terminating repair
/// cycle, which is a core bug.
const REBUILD_STEP_CAP: usize = 10_000_000;

/// The five interacting worklists of a rebuild, plus the shape-rewrite
/// chains used to chase stale entries.
struct Rebuild<N> {
    unions: VecDeque<(EClassCall, EClassCall)>,
    perms: VecDeque<(EClassRef, SlotMap)>,
    shrinks: VecDeque<(EClassRef, SlotSet)>,
    node_repairs: VecDeque<ENode<N>>,
    user_repairs: VecDeque<EClassRef>,
    rewrites: HashMap<ENode<N>, ENode<N>>,
    changed: bool,
}

impl<N: NodeT> Default for Rebuild<N> {
    fn default() -> Self {
        Self {
            unions: VecDeque::new(),
            perms: VecDeque::new(),
            shrinks: VecDeque::new(),
            node_repairs: VecDeque::new(),
            user_repairs: VecDeque::new(),
            rewrites: HashMap::default(),
            changed: false,
        }
    }
}

impl<N: NodeT> Rebuild<N> {
    fn follow(&self, mut shape: ENode<N>) -> ENode<N> {
        let mut hops = 0;
        while let Some(next) = self.rewrites.get(&shape) {
            shape = next.clone();
            hops += 1;
            assert!(hops <= self.rewrites.len(), "cycle in shape rewrites");
        }
        shape
    }
}

impl<N: NodeT> EGraph<N> {
    /// Assert that two calls denote the same thing; returns true iff the
    /// graph changed.
    pub fn union(&mut self, a: &EClassCall, b: &EClassCall) -> bool {
        self.union_many(&[(a.clone(), b.clone())])
    }

    /// Batch union. Processes the union, permutation-addition,
    /// slot-shrinking, node-repair and user-repair worklists to emptiness.
    pub fn union_many(&mut self, pairs: &[(EClassCall, EClassCall)]) -> bool {
        let mut q = Rebuild::default();
        q.unions.extend(pairs.iter().cloned());
        self.run_rebuild(&mut q);
        #[cfg(debug_assertions)]
        self.check_invariants();
        q.changed
    }

    fn run_rebuild(&mut self, q: &mut Rebuild<N>) {
        let mut steps = 0usize;
        loop {
            steps += 1;
            assert!(steps < REBUILD_STEP_CAP, "rebuild did not converge");
            if let Some((l, r)) = q.unions.pop_front() {
                self.unify(l, r, q);
            } else if let Some((c, p)) = q.perms.pop_front() {
                self.apply_perm_addition(c, p, q);
            } else if let Some((c, keep)) = q.shrinks.pop_front() {
                self.apply_shrink(c, keep, q);
            } else if let Some(shape) = q.node_repairs.pop_front() {
                self.repair_node(shape, q);
            } else if let Some(c) = q.user_repairs.pop_front() {
                self.repair_users(c, q);
            } else {
                break;
            }
        }
        trace!("rebuild finished after {steps} steps");
    }

    fn unify(&mut self, l: EClassCall, r: EClassCall, q: &mut Rebuild<N>) {
        let (Some(l), Some(r)) = (self.canonicalize(&l), self.canonicalize(&r)) else {
            panic!("union of a call into an unknown class");
        };

        // A slot present on one side but not the other is redundant: shrink
        // the wider side to the common image, then try again.
        let lv = l.args.values();
        let rv = r.args.values();
        let inter = lv.intersection(&rv);
        if inter != lv {
            let keep: SlotSet = l
                .args
                .iter()
                .filter(|(_, v)| inter.contains(*v))
                .map(|(k, _)| k)
                .collect();
            // Applied immediately: the retried union must observe the
            // narrowed frame.
            self.apply_shrink(l.class, keep, q);
            q.unions.push_back((l, r));
            return;
        }
        if inter != rv {
            let keep: SlotSet = r
                .args
                .iter()
                .filter(|(_, v)| inter.contains(*v))
                .map(|(k, _)| k)
                .collect();
            self.apply_shrink(r.class, keep, q);
            q.unions.push_back((l, r));
            return;
        }

        if l.class == r.class {
            // The pair defines a self-symmetry of the class.
            if l.args == r.args {
                return;
            }
            let Some(inv) = r.args.try_inverse() else {
                warn!("cannot fold symmetry of non-bijective call {r:?}");
                return;
            };
            let candidate = l.args.compose(&inv);
            match Perm::try_new(candidate.clone()) {
                Some(p) if !self.classes[&l.class].group.contains(&p) => {
                    q.perms.push_back((l.class, candidate));
                }
                _ => {}
            }
            return;
        }

        self.merge(l, r, q);
    }

    fn merge(&mut self, l: EClassCall, r: EClassCall, q: &mut Rebuild<N>) {
        // The class with more nodes dominates, so the smaller side is the
        // one whose members get translated.
        let (dom, sub) = if self.classes[&l.class].nodes.len() >= self.classes[&r.class].nodes.len()
        {
            (l, r)
        } else {
            (r, l)
        };
        debug!("merging {} into {}", sub.class, dom.class);

        // slots(sub) -> slots(dom), via the shared call-site frame.
        let m = sub.args.compose(&dom.args.inverse());
        assert!(m.is_bijection(), "slot identification across a union is unsupported");

        let sub_data = self
            .classes
            .remove(&sub.class)
            .expect("canonical class without data");
        self.uf.union(sub.class, dom.class, &m);

        // Everything that touched either class may canonicalize differently
        // now.
        for shape in self.classes[&dom.class].nodes.keys() {
            q.node_repairs.push_back(shape.clone());
        }
        for user in &self.classes[&dom.class].users {
            q.node_repairs.push_back(user.clone());
        }

        for (shape, ren) in sub_data.nodes {
            let ren2 = ren.compose_fresh(&m);
            self.hashcons.insert(shape.clone(), dom.class);
            let dom_data = self.classes.get_mut(&dom.class).unwrap();
            if let Some(existing) = dom_data.nodes.get(&shape) {
                // Same shape on both sides: the two readings induce a
                // symmetry candidate.
                let candidate = existing.inverse().compose(&ren2);
                q.perms.push_back((dom.class, candidate));
            } else {
                dom_data.nodes.insert(shape.clone(), ren2);
            }
            for arg_class in shape.arg_classes() {
                q.user_repairs.push_back(arg_class);
            }
            q.node_repairs.push_back(shape);
        }

        let dom_data = self.classes.get_mut(&dom.class).unwrap();
        for user in sub_data.users {
            dom_data.users.insert(user.clone());
            q.node_repairs.push_back(user);
        }

        for g in sub_data.group.generators() {
            q.perms.push_back((dom.class, g.renamed(&m).as_map_on(&self.classes[&dom.class].slots)));
        }

        self.dirty.push(dom.class);
        q.changed = true;
    }

    fn apply_perm_addition(&mut self, c: EClassRef, p: SlotMap, q: &mut Rebuild<N>) {
        // The permutation was queued in the frame `c` had at queue time;
        // transport it into the current root frame.
        let Some(f) = self.uf.find(c) else { return };
        let root = f.class;
        let inv = f.args.inverse();

        let mut candidate = SlotMap::new();
        for (old, new) in inv.iter() {
            let image = p.get(old).unwrap_or(old);
            match inv.get(image) {
                Some(new_image) => {
                    candidate.insert(new, new_image);
                }
                // The permutation moves a surviving slot onto a dropped
                // one; the orbit-based shrink has already retired it.
                None => return,
            }
        }
        let Some(p) = Perm::try_new(candidate) else { return };
        if p.is_identity() {
            return;
        }

        let data = self.classes.get_mut(&root).unwrap();
        if data.group.add(p) {
            // Canonicalization may now pick different variants everywhere
            // this class appears.
            for shape in data.nodes.keys() {
                q.node_repairs.push_back(shape.clone());
            }
            for user in &data.users {
                q.node_repairs.push_back(user.clone());
            }
            self.dirty.push(root);
            q.changed = true;
        }
    }

    fn apply_shrink(&mut self, c: EClassRef, keep: SlotSet, q: &mut Rebuild<N>) {
        let Some(f) = self.uf.find(c) else { return };
        let root = f.class;
        let inv = f.args.inverse();
        let keep: SlotSet = keep.iter().filter_map(|s| inv.get(s)).collect();

        let data = self.classes.get_mut(&root).unwrap();
        let current = data.slots.clone();
        let requested = keep.intersection(&current);
        if requested == current {
            return;
        }

        // A slot sharing an orbit with a redundant slot is itself
        // redundant.
        let dropped = current.difference(&requested);
        let mut redundant = SlotSet::empty();
        for s in dropped.iter() {
            redundant = redundant.union(&data.group.orbit(s));
        }
        let kept = current.difference(&redundant);
        debug!("shrinking {root} from {current} to {kept}");

        data.group = data.group.restricted(&kept);
        data.slots = kept.clone();
        self.uf.shrink_slots(root, kept);

        for shape in data.nodes.keys() {
            q.node_repairs.push_back(shape.clone());
        }
        for user in &self.classes[&root].users {
            q.node_repairs.push_back(user.clone());
        }
        self.dirty.push(root);
        q.changed = true;
    }

    fn repair_node(&mut self, shape: ENode<N>, q: &mut Rebuild<N>) {
        let shape = q.follow(shape);
        let Some(&c) = self.hashcons.get(&shape) else {
            return;
        };
        debug_assert!(self.uf.is_root(c), "hashcons entry went stale");

        let ren = self.classes[&c].nodes[&shape].clone();
        let instance = shape.apply_slotmap(&ren);
        let instance = self
            .canonicalize_node(&instance)
            .expect("member node refers to an unknown class");
        let (new_shape, new_ren, syms) = self.canonical_shape_of(&instance);

        if new_shape == shape {
            if new_ren != ren {
                // Two readings of the same member: a symmetry candidate.
                q.perms.push_back((c, ren.inverse().compose_fresh(&new_ren)));
            }
            return;
        }

        match self.hashcons.get(&new_shape).copied() {
            Some(d) if d == c => {
                // The member collapses onto another member of its own
                // class.
                self.hashcons.remove(&shape);
                self.classes.get_mut(&c).unwrap().nodes.remove(&shape);
                self.remove_user_entries(&shape);
                let existing = self.classes[&c].nodes[&new_shape].clone();
                q.perms.push_back((c, existing.inverse().compose_fresh(&new_ren)));
                q.rewrites.insert(shape, new_shape);
                q.changed = true;
            }
            Some(d) => {
                // The same canonical shape lives in another class: the two
                // classes are equal. Align their public slots through the
                // shape's slots and queue the union.
                let ren_d = self.classes[&d].nodes[&new_shape].clone();
                let a: SlotMap = new_ren
                    .iter()
                    .filter(|(_, v)| self.classes[&c].slots.contains(*v))
                    .map(|(s, v)| (v, s))
                    .collect();
                let b: SlotMap = ren_d
                    .iter()
                    .filter(|(_, v)| self.classes[&d].slots.contains(*v))
                    .map(|(s, v)| (v, s))
                    .collect();
                q.unions.push_back((
                    EClassCall { class: c, args: a },
                    EClassCall { class: d, args: b },
                ));
            }
            None => {
                // Plain re-canonicalization: move the hashcons and class
                // entries over to the new shape.
                self.hashcons.remove(&shape);
                self.hashcons.insert(new_shape.clone(), c);
                {
                    let data = self.classes.get_mut(&c).unwrap();
                    data.nodes.remove(&shape);
                    data.nodes.insert(new_shape.clone(), new_ren.clone());
                }
                self.remove_user_entries(&shape);
                for arg_class in new_shape.arg_classes() {
                    self.classes
                        .get_mut(&arg_class)
                        .expect("canonical arg class must exist")
                        .users
                        .insert(new_shape.clone());
                }
                q.rewrites.insert(shape, new_shape.clone());

                // The new reading may no longer touch every public slot.
                let covered = new_ren.values().intersection(&self.classes[&c].slots);
                if covered != self.classes[&c].slots {
                    q.shrinks.push_back((c, covered));
                }

                for sigma in syms {
                    let candidate = new_ren.inverse().compose(&sigma).compose(&new_ren);
                    q.perms.push_back((c, candidate));
                }
            }
        }
    }

    /// Drop `shape` from the users sets of its (canonicalized) argument
    /// classes.
    fn remove_user_entries(&mut self, shape: &ENode<N>) {
        for arg in &shape.args {
            if let Some(f) = self.uf.find(arg.class) {
                if let Some(data) = self.classes.get_mut(&f.class) {
                    data.users.remove(shape);
                }
            }
        }
    }

    fn repair_users(&mut self, c: EClassRef, q: &mut Rebuild<N>) {
        let Some(f) = self.uf.find(c) else { return };
        let root = f.class;
        let Some(data) = self.classes.get_mut(&root) else {
            return;
        };
        let old = std::mem::take(&mut data.users);
        let mut new = crate::utils::HashSet::default();
        for u in old {
            let u = q.follow(u);
            if self.hashcons.contains_key(&u) {
                new.insert(u);
            }
        }
        self.classes.get_mut(&root).unwrap().users = new;
    }
}
