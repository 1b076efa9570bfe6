//! Per-vCPU quantum budget bookkeeping.
//!
//! [`QuantumAccount`] is owned by a single vCPU's driver thread. Translated
//! guest code calls its deduction helpers directly (conceptually — the
//! translator is an external collaborator; these are the entry points it
//! would call). Peers may only observe a `QuantumAccount`'s `(budget,
//! generation)` pair through a single atomic 64-bit load, never field by
//! field, so a torn read is impossible even without any lock.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// Wraps a value on its own cache line to avoid false sharing between
/// adjacent vCPU accounts or adjacent hot fields within one account.
#[repr(align(64))]
#[derive(Debug, Default)]
struct CacheAligned<T>(T);

impl<T> std::ops::Deref for CacheAligned<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.0
    }
}

fn pack(budget: i32, generation: u32) -> u64 {
    ((budget as u32 as u64) << 32) | generation as u64
}

fn unpack(word: u64) -> (i32, u32) {
    let budget = (word >> 32) as u32 as i32;
    let generation = word as u32;
    (budget, generation)
}

/// Per-vCPU budget and generation state.
///
/// `budget` and `generation` are packed into one 64-bit atomic word (low 32
/// bits are `generation`, high 32 bits are `budget` as a signed value) so
/// that a peer reading both at once can never observe a torn combination.
#[derive(Debug)]
pub struct QuantumAccount {
    /// Packed `(budget: i32, generation: u32)`.
    word: CacheAligned<AtomicU64>,
    /// Pending per-block debit staged by the translator before a deduction
    /// helper fires. Always reset to 0 after the debit.
    required: CacheAligned<AtomicU32>,
    /// Instructions-per-cycle weight. `0` means "not participating".
    ipc: AtomicU32,
    /// Set by a deduction helper when `budget <= 0`, cleared by the driver
    /// after a settle.
    depleted: AtomicBool,
    /// Monotone counter of target cycles attributed to this vCPU.
    virtual_time_base: CacheAligned<AtomicU64>,
    /// True while this vCPU is blocked on host I/O, so its virtual time
    /// cannot be authoritatively reported; peers treat it as unknown when
    /// computing catch-up budgets.
    unknown_time: AtomicBool,
}

impl QuantumAccount {
    /// Creates a new account with `budget = 0`, `generation = 0`.
    ///
    /// Call [`QuantumAccount::init_runnable`] on the first runnable
    /// transition to set the starting budget.
    pub fn new(ipc: u32) -> Self {
        Self {
            word: CacheAligned(AtomicU64::new(pack(0, 0))),
            required: CacheAligned(AtomicU32::new(0)),
            ipc: AtomicU32::new(ipc),
            depleted: AtomicBool::new(false),
            virtual_time_base: CacheAligned(AtomicU64::new(0)),
            unknown_time: AtomicBool::new(false),
        }
    }

    /// Initializes the account on the vCPU's first runnable transition:
    /// `budget = Q * ipc`, `generation = 0`.
    ///
    /// # Panics
    ///
    /// Panics if `quantum_size * ipc` overflows `i32`.
    pub fn init_runnable(&self, quantum_size: u64) {
        let ipc = self.ipc.load(Ordering::Relaxed) as u64;
        let budget = quantum_size
            .checked_mul(ipc)
            .and_then(|b| i32::try_from(b).ok())
            .expect("initial budget must fit in a signed 32-bit value");
        self.word.store(pack(budget, 0), Ordering::Release);
        self.unknown_time.store(false, Ordering::Relaxed);
    }

    /// Atomically reads `(budget, generation)`.
    pub fn load(&self) -> (i32, u32) {
        unpack(self.word.load(Ordering::Acquire))
    }

    /// The current budget.
    pub fn budget(&self) -> i32 {
        self.load().0
    }

    /// The generation this account's budget refers to.
    pub fn generation(&self) -> u32 {
        self.load().1
    }

    /// Atomically stores `(budget, generation)`.
    pub fn store(&self, budget: i32, generation: u32) {
        self.word.store(pack(budget, generation), Ordering::Release);
    }

    /// Instructions-per-cycle weight. `0` means not participating.
    pub fn ipc(&self) -> u32 {
        self.ipc.load(Ordering::Relaxed)
    }

    /// Stages `required` instructions for the next deduction helper call.
    pub fn set_required(&self, required: u32) {
        self.required.store(required, Ordering::Relaxed);
    }

    /// The currently staged `required` debit.
    pub fn required(&self) -> u32 {
        self.required.load(Ordering::Relaxed)
    }

    /// Whether the account was marked depleted by a deduction helper.
    pub fn is_depleted(&self) -> bool {
        self.depleted.load(Ordering::Relaxed)
    }

    /// Clears the depleted flag. Called by the driver after a settle.
    pub fn clear_depleted(&self) {
        self.depleted.store(false, Ordering::Relaxed);
    }

    /// The monotone counter of target cycles attributed to this vCPU.
    pub fn virtual_time_base(&self) -> u64 {
        self.virtual_time_base.load(Ordering::Relaxed)
    }

    /// Whether this vCPU is currently blocked on host I/O.
    pub fn is_unknown_time(&self) -> bool {
        self.unknown_time.load(Ordering::Relaxed)
    }

    /// Marks this vCPU as blocked on (or returned from) host I/O.
    pub fn set_unknown_time(&self, unknown: bool) {
        self.unknown_time.store(unknown, Ordering::Relaxed);
    }

    /// Silent deduct: debits `required` from `budget`, resets `required` to
    /// 0, and advances `virtual_time_base`. Does not set `depleted`.
    ///
    /// Used when a preceding analysis already guarantees the block will not
    /// deplete the budget.
    pub fn helper_deduct(&self) {
        let required = self.required.swap(0, Ordering::Relaxed);
        let (budget, generation) = self.load();
        let new_budget = budget.wrapping_sub(required as i32);
        self.store(new_budget, generation);
        self.advance_virtual_time(required);
    }

    /// Checked deduct: same debit as [`QuantumAccount::helper_deduct`], but
    /// returns `true` (and sets `depleted`) if `budget <= 0` afterward.
    /// Returns `false` without deducting if `ipc == 0`.
    pub fn helper_check_and_deduct(&self) -> bool {
        if self.ipc() == 0 {
            return false;
        }
        let required = self.required.swap(0, Ordering::Relaxed);
        let (budget, generation) = self.load();
        let new_budget = budget.wrapping_sub(required as i32);
        self.store(new_budget, generation);
        self.advance_virtual_time(required);
        if new_budget <= 0 {
            self.depleted.store(true, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Force-deplete: unconditionally sets `budget = 0` and `depleted =
    /// true`, injecting a forced quantum boundary.
    pub fn helper_force_deplete(&self) {
        let generation = self.generation();
        self.store(0, generation);
        self.depleted.store(true, Ordering::Relaxed);
    }

    fn advance_virtual_time(&self, required: u32) {
        let ipc = self.ipc();
        if ipc == 0 {
            return;
        }
        let advance = (required as u64) * 100 / ipc as u64;
        self.virtual_time_base.fetch_add(advance, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_round_trips_negative_budget() {
        let word = pack(-5, 42);
        assert_eq!(unpack(word), (-5, 42));
    }

    #[test]
    fn init_runnable_sets_budget_and_zero_generation() {
        let acc = QuantumAccount::new(2);
        acc.init_runnable(1000);
        assert_eq!(acc.load(), (2000, 0));
    }

    #[test]
    fn silent_deduct_decrements_budget_and_advances_virtual_time() {
        let acc = QuantumAccount::new(100);
        acc.init_runnable(1000);
        acc.set_required(300);
        acc.helper_deduct();
        assert_eq!(acc.budget(), 99_700);
        assert_eq!(acc.required(), 0);
        assert_eq!(acc.virtual_time_base(), 300);
        assert!(!acc.is_depleted());
    }

    #[test]
    fn checked_deduct_reports_depletion() {
        let acc = QuantumAccount::new(1);
        acc.init_runnable(10);
        acc.set_required(15);
        let depleted = acc.helper_check_and_deduct();
        assert!(depleted);
        assert!(acc.is_depleted());
        assert_eq!(acc.budget(), -5);
    }

    #[test]
    fn checked_deduct_is_a_no_op_for_non_participants() {
        let acc = QuantumAccount::new(0);
        acc.init_runnable(10);
        acc.set_required(15);
        let depleted = acc.helper_check_and_deduct();
        assert!(!depleted);
        assert_eq!(acc.budget(), 0);
        assert_eq!(acc.required(), 15);
    }

    #[test]
    fn force_deplete_zeroes_budget_and_sets_flag_unconditionally() {
        let acc = QuantumAccount::new(1);
        acc.init_runnable(1000);
        acc.helper_force_deplete();
        assert_eq!(acc.budget(), 0);
        assert!(acc.is_depleted());
    }

    #[test]
    fn clear_depleted_resets_the_flag() {
        let acc = QuantumAccount::new(1);
        acc.init_runnable(1);
        acc.helper_force_deplete();
        acc.clear_depleted();
        assert!(!acc.is_depleted());
    }
}
