use std::{
    fmt::{self, Debug, Display, Formatter},
    sync::atomic::{AtomicU64, Ordering},
};

use smallvec::SmallVec;

use crate::utils::write_delimited;

/// An identifier for a bound variable.
///
/// Numbered slots are interned by their integer and are what shapes are
/// normalized to. Unique slots are fresh on every creation and never compare
/// equal to anything but themselves. Numbered slots order before unique
/// slots, so slot sets have a canonical form.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Slot {
    Numbered(u32),
    Unique(u64),
}

static NEXT_UNIQUE: AtomicU64 = AtomicU64::new(0);

impl Slot {
    pub fn numbered(n: u32) -> Self {
        Slot::Numbered(n)
    }

    /// A slot that is equal only to itself.
    pub fn fresh() -> Self {
        Slot::Unique(NEXT_UNIQUE.fetch_add(1, Ordering::Relaxed))
    }

    pub fn is_numbered(&self) -> bool {
        matches!(self, Slot::Numbered(_))
    }
}

impl Display for Slot {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Numbered(n) => write!(f, "${n}"),
            Slot::Unique(u) => write!(f, "%{u}"),
        }
    }
}

impl Debug for Slot {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

/// An immutable sorted, deduplicated set of slots.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct SlotSet(SmallVec<[Slot; 4]>);

impl SlotSet {
    pub fn empty() -> Self {
        Self(SmallVec::new())
    }

    pub fn singleton(s: Slot) -> Self {
        Self(SmallVec::from_slice(&[s]))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, s: Slot) -> bool {
        self.0.binary_search(&s).is_ok()
    }

    pub fn iter(&self) -> impl Iterator<Item = Slot> + '_ {
        self.0.iter().copied()
    }

    pub fn union(&self, other: &Self) -> Self {
        let mut out = self.0.to_vec();
        out.extend(other.iter());
        Self::from_iter(out)
    }

    pub fn intersection(&self, other: &Self) -> Self {
        Self(self.0.iter().copied().filter(|s| other.contains(*s)).collect())
    }

    pub fn difference(&self, other: &Self) -> Self {
        Self(self.0.iter().copied().filter(|s| !other.contains(*s)).collect())
    }

    pub fn is_subset(&self, other: &Self) -> bool {
        self.iter().all(|s| other.contains(s))
    }

    /// Apply `m` to every member. Members missing from `m` are a caller bug.
    ///
    /// When `m` fixes every member the receiver is returned unchanged, so
    /// identity renamings cost nothing.
    pub fn map(&self, m: &SlotMap) -> Self {
        if self.iter().all(|s| m.get(s) == Some(s)) {
            return self.clone();
        }
        Self::from_iter(self.iter().map(|s| {
            m.get(s)
                .unwrap_or_else(|| panic!("SlotSet::map: {s} not mapped by {m}"))
        }))
    }
}

impl FromIterator<Slot> for SlotSet {
    fn from_iter<T: IntoIterator<Item = Slot>>(iter: T) -> Self {
        let mut v: SmallVec<[Slot; 4]> = iter.into_iter().collect();
        v.sort_unstable();
        v.dedup();
        Self(v)
    }
}

impl Display for SlotSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write_delimited(f, "{", "}", self.iter(), |f, s| write!(f, "{s}"))
    }
}

impl Debug for SlotSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

/// A finite mapping from slots to slots, stored as a sorted association
/// list.
///
/// `a.compose(b)` applies `a` first: `x ↦ b[a[x]]`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct SlotMap(SmallVec<[(Slot, Slot); 4]>);

impl SlotMap {
    pub fn new() -> Self {
        Self(SmallVec::new())
    }

    /// The identity map on `set`.
    pub fn identity(set: &SlotSet) -> Self {
        Self(set.iter().map(|s| (s, s)).collect())
    }

    /// A bijection from every member of `set` to a fresh unique slot.
    pub fn bijection_to_fresh(set: &SlotSet) -> Self {
        Self(set.iter().map(|s| (s, Slot::fresh())).collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, k: Slot) -> Option<Slot> {
        self.0
            .binary_search_by_key(&k, |(k, _)| *k)
            .ok()
            .map(|i| self.0[i].1)
    }

    /// Insert a binding, returning the previous value for `k` if any.
    pub fn insert(&mut self, k: Slot, v: Slot) -> Option<Slot> {
        match self.0.binary_search_by_key(&k, |(k, _)| *k) {
            Ok(i) => Some(std::mem::replace(&mut self.0[i].1, v)),
            Err(i) => {
                self.0.insert(i, (k, v));
                None
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Slot, Slot)> + '_ {
        self.0.iter().copied()
    }

    pub fn keys(&self) -> SlotSet {
        SlotSet(self.0.iter().map(|(k, _)| *k).collect())
    }

    pub fn values(&self) -> SlotSet {
        SlotSet::from_iter(self.0.iter().map(|(_, v)| *v))
    }

    /// True iff no two keys map to the same value.
    pub fn is_bijection(&self) -> bool {
        self.values().len() == self.len()
    }

    /// True iff this is a bijection from a set onto itself.
    pub fn is_perm(&self) -> bool {
        self.is_bijection() && self.keys() == self.values()
    }

    /// Invert a bijection. Panics otherwise; use [`SlotMap::try_inverse`]
    /// when bijectivity is not an invariant at the call site.
    pub fn inverse(&self) -> SlotMap {
        self.try_inverse()
            .unwrap_or_else(|| panic!("SlotMap::inverse on non-bijection {self}"))
    }

    pub fn try_inverse(&self) -> Option<SlotMap> {
        if !self.is_bijection() {
            return None;
        }
        let mut v: SmallVec<[(Slot, Slot); 4]> =
            self.0.iter().map(|(k, val)| (*val, *k)).collect();
        v.sort_unstable_by_key(|(k, _)| *k);
        Some(SlotMap(v))
    }

    /// Strict composition: every value of `self` must be a key of `other`.
    pub fn compose(&self, other: &SlotMap) -> SlotMap {
        Self(
            self.0
                .iter()
                .map(|(k, v)| {
                    let w = other.get(*v).unwrap_or_else(|| {
                        panic!("SlotMap::compose: {v} not covered by {other}")
                    });
                    (*k, w)
                })
                .collect(),
        )
    }

    /// Composition dropping entries whose value `other` does not cover.
    pub fn compose_partial(&self, other: &SlotMap) -> SlotMap {
        Self(
            self.0
                .iter()
                .filter_map(|(k, v)| other.get(*v).map(|w| (*k, w)))
                .collect(),
        )
    }

    /// Composition mapping uncovered values to fresh unique slots.
    ///
    /// Identical uncovered values map to the same fresh slot.
    pub fn compose_fresh(&self, other: &SlotMap) -> SlotMap {
        let mut other = other.clone();
        Self(
            self.0
                .iter()
                .map(|(k, v)| match other.get(*v) {
                    Some(w) => (*k, w),
                    None => {
                        let w = Slot::fresh();
                        other.insert(*v, w);
                        (*k, w)
                    }
                })
                .collect(),
        )
    }

    /// Keep only the entries whose key is in `keys`.
    pub fn restrict(&self, keys: &SlotSet) -> SlotMap {
        Self(self.0.iter().copied().filter(|(k, _)| keys.contains(*k)).collect())
    }
}

impl FromIterator<(Slot, Slot)> for SlotMap {
    fn from_iter<T: IntoIterator<Item = (Slot, Slot)>>(iter: T) -> Self {
        let mut v: SmallVec<[(Slot, Slot); 4]> = iter.into_iter().collect();
        v.sort_unstable_by_key(|(k, _)| *k);
        for w in v.windows(2) {
            assert!(w[0].0 != w[1].0, "duplicate key {} in SlotMap", w[0].0);
        }
        Self(v)
    }
}

impl Display for SlotMap {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write_delimited(f, "[", "]", self.iter(), |f, (k, v)| write!(f, "{k}->{v}"))
    }
}

impl Debug for SlotMap {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}
