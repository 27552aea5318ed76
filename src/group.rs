use std::fmt::{self, Debug, Display, Formatter};

use crate::{
    slot::{Slot, SlotMap, SlotSet},
    utils::HashMap,
};

/// A permutation of slots, stored without its fixed points so that equal
/// permutations over different ambient sets compare equal.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct Perm(SlotMap);

impl Perm {
    pub fn identity() -> Self {
        Self(SlotMap::new())
    }

    /// Panics unless `m` is a permutation.
    pub fn new(m: SlotMap) -> Self {
        Self::try_new(m).expect("Perm::new on a non-permutation")
    }

    pub fn try_new(m: SlotMap) -> Option<Self> {
        if !m.is_perm() {
            return None;
        }
        Some(Self(m.iter().filter(|(k, v)| k != v).collect()))
    }

    pub fn is_identity(&self) -> bool {
        self.0.is_empty()
    }

    /// The slots this permutation does not fix.
    pub fn moved(&self) -> SlotSet {
        self.0.keys()
    }

    /// Total application: slots outside the stored support are fixed.
    pub fn apply(&self, s: Slot) -> Slot {
        self.0.get(s).unwrap_or(s)
    }

    /// `self` first, then `other`.
    pub fn then(&self, other: &Perm) -> Perm {
        let support = self.moved().union(&other.moved());
        Self(
            support
                .iter()
                .filter_map(|x| {
                    let y = other.apply(self.apply(x));
                    (y != x).then_some((x, y))
                })
                .collect(),
        )
    }

    pub fn inverse(&self) -> Perm {
        Self(self.0.inverse())
    }

    /// Keep only the action on `set`. The caller must ensure the cycles
    /// through `set` stay within `set`.
    pub fn restrict(&self, set: &SlotSet) -> Perm {
        let restricted = self.0.restrict(set);
        debug_assert!(restricted.is_perm());
        Self(restricted)
    }

    /// Transport through a renaming `m` covering the support:
    /// the result maps `m(x) ↦ m(p(x))`.
    pub fn renamed(&self, m: &SlotMap) -> Perm {
        Perm::new(
            self.0
                .iter()
                .map(|(k, v)| {
                    let k2 = m.get(k).unwrap_or_else(|| panic!("Perm::renamed: {k} uncovered"));
                    let v2 = m.get(v).unwrap_or_else(|| panic!("Perm::renamed: {v} uncovered"));
                    (k2, v2)
                })
                .collect(),
        )
    }

    /// The full map on `set`, fixed points included.
    pub fn as_map_on(&self, set: &SlotSet) -> SlotMap {
        set.iter().map(|s| (s, self.apply(s))).collect()
    }
}

impl Display for Perm {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.is_identity() {
            write!(f, "id")
        } else {
            Display::fmt(&self.0, f)
        }
    }
}

impl Debug for Perm {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

/// A finite permutation group over a slot set, kept as its generators plus a
/// stabilizer chain rebuilt to closure on every extension.
///
/// The chain fixes one base point per level; membership is decided by
/// sifting, so [`PermGroup::contains`] costs one transversal lookup per
/// level instead of an enumeration.
#[derive(Clone)]
pub struct PermGroup {
    slots: SlotSet,
    generators: Vec<Perm>,
    chain: Option<Box<StabChain>>,
}

#[derive(Clone)]
struct StabChain {
    point: Slot,
    /// orbit element -> coset representative carrying `point` there.
    transversal: HashMap<Slot, Perm>,
    stab: PermGroup,
}

impl PermGroup {
    /// The trivial group over `slots`.
    pub fn identity(slots: &SlotSet) -> Self {
        Self {
            slots: slots.clone(),
            generators: Vec::new(),
            chain: None,
        }
    }

    pub fn slots(&self) -> &SlotSet {
        &self.slots
    }

    pub fn generators(&self) -> &[Perm] {
        &self.generators
    }

    pub fn is_trivial(&self) -> bool {
        self.chain.is_none()
    }

    pub fn size(&self) -> usize {
        match &self.chain {
            None => 1,
            Some(c) => c.transversal.len() * c.stab.size(),
        }
    }

    pub fn contains(&self, p: &Perm) -> bool {
        match &self.chain {
            None => p.is_identity(),
            Some(c) => {
                let img = p.apply(c.point);
                match c.transversal.get(&img) {
                    None => false,
                    Some(rep) => c.stab.contains(&p.then(&rep.inverse())),
                }
            }
        }
    }

    /// Extend the group by `p`. Returns false when `p` was already a member.
    pub fn add(&mut self, p: Perm) -> bool {
        assert!(
            p.moved().is_subset(&self.slots),
            "permutation {p} moves slots outside {}",
            self.slots
        );
        if self.contains(&p) {
            return false;
        }
        self.generators.push(p);
        self.chain = build_chain(&self.slots, &self.generators);
        true
    }

    /// Extend by every permutation in `perms`; true iff the group grew.
    pub fn try_add_set(&mut self, perms: impl IntoIterator<Item = Perm>) -> bool {
        let mut grew = false;
        for p in perms {
            grew |= self.add(p);
        }
        grew
    }

    /// The orbit of `s` under the group.
    pub fn orbit(&self, s: Slot) -> SlotSet {
        let mut seen = vec![s];
        let mut i = 0;
        while i < seen.len() {
            let x = seen[i];
            i += 1;
            for g in &self.generators {
                let y = g.apply(x);
                if !seen.contains(&y) {
                    seen.push(y);
                }
            }
        }
        seen.into_iter().collect()
    }

    /// Enumerate every element. Exponential in the worst case; callers cap
    /// their own fanout.
    pub fn all_perms(&self) -> Vec<Perm> {
        match &self.chain {
            None => vec![Perm::identity()],
            Some(c) => {
                let subs = c.stab.all_perms();
                let mut out = Vec::with_capacity(subs.len() * c.transversal.len());
                for u in &subs {
                    for rep in c.transversal.values() {
                        out.push(u.then(rep));
                    }
                }
                out
            }
        }
    }

    /// The same group acting on a smaller slot set. `keep` must be closed
    /// under the group (a union of orbits).
    pub fn restricted(&self, keep: &SlotSet) -> PermGroup {
        let generators: Vec<Perm> = self
            .generators
            .iter()
            .map(|g| g.restrict(keep))
            .filter(|g| !g.is_identity())
            .collect();
        let chain = build_chain(keep, &generators);
        PermGroup {
            slots: keep.clone(),
            generators,
            chain,
        }
    }

    /// Transport the group through a bijection from its slot set.
    pub fn renamed(&self, m: &SlotMap, new_slots: &SlotSet) -> PermGroup {
        let generators: Vec<Perm> = self.generators.iter().map(|g| g.renamed(m)).collect();
        let chain = build_chain(new_slots, &generators);
        PermGroup {
            slots: new_slots.clone(),
            generators,
            chain,
        }
    }
}

fn build_chain(slots: &SlotSet, generators: &[Perm]) -> Option<Box<StabChain>> {
    let gens: Vec<&Perm> = generators.iter().filter(|g| !g.is_identity()).collect();
    let point = slots.iter().find(|&s| gens.iter().any(|g| g.apply(s) != s))?;

    // Orbit of the base point, with coset representatives.
    let mut transversal: HashMap<Slot, Perm> = HashMap::default();
    transversal.insert(point, Perm::identity());
    let mut queue = vec![point];
    while let Some(x) = queue.pop() {
        let rep_x = transversal[&x].clone();
        for &g in &gens {
            let y = g.apply(x);
            if !transversal.contains_key(&y) {
                transversal.insert(y, rep_x.then(g));
                queue.push(y);
            }
        }
    }

    // Schreier's lemma: the stabilizer of `point` is generated by
    // rep(x) * g * rep(g(x))^-1.
    let mut schreier: Vec<Perm> = Vec::new();
    let mut seen: crate::utils::HashSet<Perm> = crate::utils::HashSet::default();
    for (x, rep_x) in &transversal {
        for &g in &gens {
            let y = g.apply(*x);
            let s = rep_x.then(g).then(&transversal[&y].inverse());
            debug_assert_eq!(s.apply(point), point);
            if !s.is_identity() && seen.insert(s.clone()) {
                schreier.push(s);
            }
        }
    }

    let stab = PermGroup {
        slots: slots.clone(),
        chain: build_chain(slots, &schreier),
        generators: schreier,
    };
    Some(Box::new(StabChain {
        point,
        transversal,
        stab,
    }))
}

impl Debug for PermGroup {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "PermGroup(|G|={}, gens=", self.size())?;
        f.debug_list().entries(self.generators.iter()).finish()?;
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n(i: u32) -> Slot {
        Slot::numbered(i)
    }

    fn perm(pairs: &[(u32, u32)]) -> Perm {
        Perm::new(pairs.iter().map(|&(k, v)| (n(k), n(v))).collect())
    }

    fn slots(is: &[u32]) -> SlotSet {
        is.iter().map(|&i| n(i)).collect()
    }

    #[test]
    fn swap_generates_two_elements() {
        let mut g = PermGroup::identity(&slots(&[0, 1]));
        assert_eq!(g.size(), 1);
        assert!(g.add(perm(&[(0, 1), (1, 0)])));
        assert_eq!(g.size(), 2);
        assert!(g.contains(&perm(&[(0, 1), (1, 0)])));
        assert!(g.contains(&Perm::identity()));
        // a second add of the same symmetry is a no-op
        assert!(!g.add(perm(&[(0, 1), (1, 0)])));
    }

    #[test]
    fn transpositions_generate_symmetric_group() {
        let mut g = PermGroup::identity(&slots(&[0, 1, 2]));
        g.add(perm(&[(0, 1), (1, 0)]));
        g.add(perm(&[(1, 2), (2, 1)]));
        assert_eq!(g.size(), 6);
        // the 3-cycle is in the closure even though it was never added
        assert!(g.contains(&perm(&[(0, 1), (1, 2), (2, 0)])));
        assert_eq!(g.all_perms().len(), 6);
        assert_eq!(g.orbit(n(0)), slots(&[0, 1, 2]));
    }

    #[test]
    fn disjoint_cycles_restrict() {
        let mut g = PermGroup::identity(&slots(&[0, 1, 2, 3]));
        g.add(perm(&[(0, 1), (1, 0)]));
        g.add(perm(&[(2, 3), (3, 2)]));
        assert_eq!(g.size(), 4);
        assert_eq!(g.orbit(n(2)), slots(&[2, 3]));

        let r = g.restricted(&slots(&[0, 1]));
        assert_eq!(r.size(), 2);
        assert!(r.contains(&perm(&[(0, 1), (1, 0)])));
    }

    #[test]
    fn renamed_transports_action() {
        let mut g = PermGroup::identity(&slots(&[0, 1]));
        g.add(perm(&[(0, 1), (1, 0)]));
        let m: SlotMap = [(n(0), n(10)), (n(1), n(11))].into_iter().collect();
        let g2 = g.renamed(&m, &slots(&[10, 11]));
        assert!(g2.contains(&perm(&[(10, 11), (11, 10)])));
        assert_eq!(g2.size(), 2);
    }

    #[test]
    fn perm_algebra() {
        let p = perm(&[(0, 1), (1, 2), (2, 0)]);
        assert!(p.then(&p.inverse()).is_identity());
        assert_eq!(p.then(&p).apply(n(0)), n(2));
        assert_eq!(p.apply(n(7)), n(7));
    }
}
