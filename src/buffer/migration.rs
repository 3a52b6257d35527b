//! The page migration policy (tier-bypass probabilities) and the HyMem
//! admission set gating DRAM→NVM promotion (spec.md §4.2, §4.3, §9).
//!
//! Grounded on `examples/original_source/include/buf/buf_mgr.h`'s
//! `PageMigrationPolicy` (four independent bypass probabilities sampled per
//! access) and `ConcurrentAdmissionSet` (a bounded set a page must appear in
//! twice before promotion — the two-hit rule this module calls
//! `HyMemAdmissionSet`), adapted to a `HashSet` + ring buffer rather than
//! the original's raw slot array since capacity here is small (tens to low
//! hundreds of entries) and correctness of membership matters more than
//! avoiding a hash lookup.

use std::collections::{HashSet, VecDeque};

use parking_lot::RwLock;
use rand::Rng;

use crate::common::PageId;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolicySnapshot {
    /// P(bypass DRAM on a read miss, going straight to NVM/SSD).
    pub dr: f64,
    /// P(bypass DRAM on a write miss).
    pub dw: f64,
    /// P(bypass NVM on a read miss, going straight to SSD).
    pub nr: f64,
    /// P(bypass NVM on a write miss).
    pub nw: f64,
}

impl Default for PolicySnapshot {
    fn default() -> Self {
        Self { dr: 0.0, dw: 0.0, nr: 0.0, nw: 0.0 }
    }
}

impl PolicySnapshot {
    pub fn clamped(self) -> Self {
        let c = |p: f64| p.clamp(0.0, 1.0);
        Self { dr: c(self.dr), dw: c(self.dw), nr: c(self.nr), nw: c(self.nw) }
    }
}

/// The currently active tier-bypass policy, tuned over time by the
/// adaptive policy controller (spec.md §4.6). Reads are the hot path (one
/// lookup per buffer-manager access), writes happen once per annealing
/// step, so a reader-writer lock is the right tool.
pub struct PageMigrationPolicy {
    current: RwLock<PolicySnapshot>,
}

impl PageMigrationPolicy {
    pub fn new(initial: PolicySnapshot) -> Self {
        Self { current: RwLock::new(initial.clamped()) }
    }

    pub fn snapshot(&self) -> PolicySnapshot {
        *self.current.read()
    }

    pub fn set(&self, policy: PolicySnapshot) {
        *self.current.write() = policy.clamped();
    }

    pub fn should_bypass_dram(&self, is_write: bool, rng: &mut impl Rng) -> bool {
        let p = self.snapshot();
        rng.random::<f64>() < if is_write { p.dw } else { p.dr }
    }

    pub fn should_bypass_nvm(&self, is_write: bool, rng: &mut impl Rng) -> bool {
        let p = self.snapshot();
        rng.random::<f64>() < if is_write { p.nw } else { p.nr }
    }
}

impl Default for PageMigrationPolicy {
    fn default() -> Self {
        Self::new(PolicySnapshot::default())
    }
}

/// Bounded two-hit admission gate: a page evicted from DRAM is only
/// promoted into the NVM tier once it has been *touched* (re-requested
/// after a prior eviction) while still present in this set. Capacity-bound,
/// oldest entries are evicted first.
///
/// Per the accompanying grounding ledger's open-question decision, this set
/// is touched only on DRAM eviction, not on every access — admission is a
/// cold-path decision, not a hot-path one.
pub struct HyMemAdmissionSet {
    capacity: usize,
    state: RwLock<AdmissionState>,
}

struct AdmissionState {
    order: VecDeque<PageId>,
    members: HashSet<PageId>,
}

impl HyMemAdmissionSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: RwLock::new(AdmissionState {
                order: VecDeque::with_capacity(capacity),
                members: HashSet::with_capacity(capacity),
            }),
        }
    }

    /// Records that `pid` was just evicted from DRAM. Returns `true` if
    /// `pid` was already a member (a second hit: promote to NVM) or `false`
    /// if this is its first recorded eviction (just track it for next time).
    pub fn touch_on_eviction(&self, pid: PageId) -> bool {
        let mut s = self.state.write();
        if s.members.contains(&pid) {
            return true;
        }
        if s.order.len() >= self.capacity {
            if let Some(oldest) = s.order.pop_front() {
                s.members.remove(&oldest);
            }
        }
        s.order.push_back(pid);
        s.members.insert(pid);
        false
    }

    /// Removes `pid`, e.g. once it has actually been promoted to NVM and no
    /// longer needs tracking here.
    pub fn remove(&self, pid: PageId) {
        let mut s = self.state.write();
        if s.members.remove(&pid) {
            s.order.retain(|&p| p != pid);
        }
    }

    pub fn contains(&self, pid: PageId) -> bool {
        self.state.read().members.contains(&pid)
    }

    pub fn len(&self) -> usize {
        self.state.read().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bypass_probability_zero_never_bypasses() {
        let policy = PageMigrationPolicy::default();
        let mut rng = rand::rng();
        for _ in 0..100 {
            assert!(!policy.should_bypass_dram(false, &mut rng));
            assert!(!policy.should_bypass_nvm(true, &mut rng));
        }
    }

    #[test]
    fn bypass_probability_one_always_bypasses() {
        let policy = PageMigrationPolicy::new(PolicySnapshot { dr: 1.0, dw: 1.0, nr: 1.0, nw: 1.0 });
        let mut rng = rand::rng();
        for _ in 0..100 {
            assert!(policy.should_bypass_dram(false, &mut rng));
            assert!(policy.should_bypass_nvm(true, &mut rng));
        }
    }

    #[test]
    fn policy_set_clamps_out_of_range_probabilities() {
        let policy = PageMigrationPolicy::default();
        policy.set(PolicySnapshot { dr: 1.5, dw: -0.5, nr: 0.3, nw: 0.7 });
        let snap = policy.snapshot();
        assert_eq!(snap.dr, 1.0);
        assert_eq!(snap.dw, 0.0);
    }

    #[test]
    fn first_eviction_does_not_admit_second_does() {
        let set = HyMemAdmissionSet::new(4);
        assert!(!set.touch_on_eviction(1));
        assert!(set.touch_on_eviction(1));
    }

    #[test]
    fn capacity_eviction_forgets_the_oldest_entry() {
        let set = HyMemAdmissionSet::new(2);
        set.touch_on_eviction(1);
        set.touch_on_eviction(2);
        set.touch_on_eviction(3);
        assert!(!set.contains(1));
        assert!(set.contains(2));
        assert!(set.contains(3));
    }
}
