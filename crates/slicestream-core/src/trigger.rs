//! # Triggering
//!
//! Decides when a slice's contents become a window result, and guarantees
//! each window finalizes exactly once.
//!
//! Every slice carries a [`FiringState`] machine:
//!
//! ```text
//! Open -> Eligible -> Firing -> Finalized
//!           ^            |
//!           +------------+   (intermediate firings release the claim)
//! ```
//!
//! Concurrent trigger paths (watermark advance, processing-time poll,
//! count thresholds) race to [`FiringState::try_claim_firing`]; the
//! compare-and-swap admits exactly one claimant at a time, so a window can
//! never fire twice concurrently and never finalizes twice at all.

use crate::window::SliceRange;
use std::sync::atomic::{AtomicU8, Ordering};

/// Phase of a slice's firing lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiringPhase {
    /// Accepting records, not yet due.
    Open,
    /// Due to fire, claim not yet taken.
    Eligible,
    /// One trigger path holds the firing claim.
    Firing,
    /// Final result emitted; state reclaimed.
    Finalized,
}

const OPEN: u8 = 0;
const ELIGIBLE: u8 = 1;
const FIRING: u8 = 2;
const FINALIZED: u8 = 3;

/// Lock-free per-slice firing state machine.
#[derive(Debug)]
pub struct FiringState(AtomicU8);

impl Default for FiringState {
    fn default() -> Self {
        Self::new()
    }
}

impl FiringState {
    /// Creates the state machine in [`FiringPhase::Open`].
    #[must_use]
    pub fn new() -> Self {
        Self(AtomicU8::new(OPEN))
    }

    /// Returns the current phase.
    #[must_use]
    pub fn phase(&self) -> FiringPhase {
        match self.0.load(Ordering::Acquire) {
            ELIGIBLE => FiringPhase::Eligible,
            FIRING => FiringPhase::Firing,
            FINALIZED => FiringPhase::Finalized,
            _ => FiringPhase::Open,
        }
    }

    /// Marks an open slice as due to fire. No-op in any later phase.
    pub fn mark_eligible(&self) {
        let _ = self
            .0
            .compare_exchange(OPEN, ELIGIBLE, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Attempts to take the firing claim.
    ///
    /// Succeeds from `Open` or `Eligible`; fails while another path is
    /// firing or once the slice is finalized. At most one caller can hold
    /// the claim at a time.
    #[must_use]
    pub fn try_claim_firing(&self) -> bool {
        for from in [ELIGIBLE, OPEN] {
            if self
                .0
                .compare_exchange(from, FIRING, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
        false
    }

    /// Releases the claim after an intermediate (non-consuming) firing.
    pub fn release_intermediate(&self) {
        let _ = self
            .0
            .compare_exchange(FIRING, OPEN, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Moves a firing slice to its terminal phase.
    pub fn finalize(&self) {
        let _ = self
            .0
            .compare_exchange(FIRING, FINALIZED, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Returns true once the slice has emitted its final result.
    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.0.load(Ordering::Acquire) == FINALIZED
    }
}

/// Everything a policy may consult when deciding whether to fire.
#[derive(Debug, Clone, Copy)]
pub struct TriggerContext {
    /// The slice's time range.
    pub range: SliceRange,
    /// Records merged into the slice so far.
    pub record_count: u64,
    /// Current global watermark.
    pub watermark: i64,
    /// Current processing time, unix milliseconds.
    pub processing_time: i64,
    /// Processing time of the slice's last intermediate firing, or
    /// `i64::MIN` if it has not fired.
    pub last_intermediate_fire: i64,
    /// Configured allowed lateness in milliseconds.
    pub allowed_lateness_ms: i64,
}

/// What the policy decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TriggerDecision {
    /// Not due.
    Hold,
    /// Emit a snapshot of the current state, keep the slice open.
    FireIntermediate,
    /// Emit the final result and reclaim the slice.
    FireFinal,
}

/// A pluggable firing condition.
///
/// Policies are pure decision functions over a [`TriggerContext`]; claim
/// arbitration and state mutation stay in the store and handler.
pub trait TriggerPolicy: Send + Sync + std::fmt::Debug {
    /// Evaluates the policy for one slice.
    fn evaluate(&self, ctx: &TriggerContext) -> TriggerDecision;
}

/// Fires finally when the watermark passes the end of the range plus
/// allowed lateness. The default policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventTimePolicy;

impl TriggerPolicy for EventTimePolicy {
    fn evaluate(&self, ctx: &TriggerContext) -> TriggerDecision {
        if ctx.watermark != i64::MIN
            && ctx.watermark >= ctx.range.end.saturating_add(ctx.allowed_lateness_ms)
        {
            TriggerDecision::FireFinal
        } else {
            TriggerDecision::Hold
        }
    }
}

/// Fires an intermediate snapshot every `interval_ms` of processing time.
///
/// Final emission still comes from the event-time path; this policy only
/// adds periodic early results.
#[derive(Debug, Clone, Copy)]
pub struct ProcessingTimePolicy {
    /// Interval between intermediate firings in milliseconds.
    pub interval_ms: i64,
}

impl TriggerPolicy for ProcessingTimePolicy {
    fn evaluate(&self, ctx: &TriggerContext) -> TriggerDecision {
        if ctx.record_count == 0 {
            return TriggerDecision::Hold;
        }
        if ctx.processing_time.saturating_sub(ctx.last_intermediate_fire) >= self.interval_ms {
            TriggerDecision::FireIntermediate
        } else {
            TriggerDecision::Hold
        }
    }
}

/// Fires an intermediate snapshot once a slice has accumulated
/// `threshold` records since its last firing.
#[derive(Debug, Clone, Copy)]
pub struct CountPolicy {
    /// Record count that makes the slice due.
    pub threshold: u64,
}

impl TriggerPolicy for CountPolicy {
    fn evaluate(&self, ctx: &TriggerContext) -> TriggerDecision {
        if ctx.record_count >= self.threshold {
            TriggerDecision::FireIntermediate
        } else {
            TriggerDecision::Hold
        }
    }
}

/// Composes policies: the strongest decision of any member wins.
#[derive(Debug, Default)]
pub struct AnyOf(pub Vec<Box<dyn TriggerPolicy>>);

impl TriggerPolicy for AnyOf {
    fn evaluate(&self, ctx: &TriggerContext) -> TriggerDecision {
        self.0
            .iter()
            .map(|p| p.evaluate(ctx))
            .max()
            .unwrap_or(TriggerDecision::Hold)
    }
}

/// A one-shot unit of trigger work: fire the window over `range`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowTriggerTask {
    /// Slice sequence number, for ordering and dedup.
    pub sequence_number: u64,
    /// Range to fire.
    pub range: SliceRange,
}

/// A one-shot unit of merge work: combine the partials received for `range`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceMergeTask {
    /// Slice sequence number, for ordering and dedup.
    pub sequence_number: u64,
    /// Range whose partials are complete.
    pub range: SliceRange,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(watermark: i64, record_count: u64) -> TriggerContext {
        TriggerContext {
            range: SliceRange::new(0, 10),
            record_count,
            watermark,
            processing_time: 0,
            last_intermediate_fire: i64::MIN,
            allowed_lateness_ms: 0,
        }
    }

    #[test]
    fn test_firing_claim_is_exclusive() {
        let state = FiringState::new();
        assert_eq!(state.phase(), FiringPhase::Open);

        assert!(state.try_claim_firing());
        assert_eq!(state.phase(), FiringPhase::Firing);
        // Second claim fails while the first is held.
        assert!(!state.try_claim_firing());

        state.finalize();
        assert!(state.is_finalized());
        // Finalized slices can never fire again.
        assert!(!state.try_claim_firing());
    }

    #[test]
    fn test_intermediate_release_reopens() {
        let state = FiringState::new();
        assert!(state.try_claim_firing());
        state.release_intermediate();
        assert_eq!(state.phase(), FiringPhase::Open);
        assert!(state.try_claim_firing());
    }

    #[test]
    fn test_eligible_then_claim() {
        let state = FiringState::new();
        state.mark_eligible();
        assert_eq!(state.phase(), FiringPhase::Eligible);
        assert!(state.try_claim_firing());
        // mark_eligible after finalize is a no-op.
        state.finalize();
        state.mark_eligible();
        assert!(state.is_finalized());
    }

    #[test]
    fn test_event_time_policy() {
        let policy = EventTimePolicy;
        assert_eq!(policy.evaluate(&ctx(9, 1)), TriggerDecision::Hold);
        assert_eq!(policy.evaluate(&ctx(10, 1)), TriggerDecision::FireFinal);
        // Unset watermark never fires.
        assert_eq!(policy.evaluate(&ctx(i64::MIN, 1)), TriggerDecision::Hold);
    }

    #[test]
    fn test_event_time_policy_respects_lateness() {
        let policy = EventTimePolicy;
        let mut c = ctx(10, 1);
        c.allowed_lateness_ms = 5;
        assert_eq!(policy.evaluate(&c), TriggerDecision::Hold);
        c.watermark = 15;
        assert_eq!(policy.evaluate(&c), TriggerDecision::FireFinal);
    }

    #[test]
    fn test_count_policy() {
        let policy = CountPolicy { threshold: 3 };
        assert_eq!(policy.evaluate(&ctx(i64::MIN, 2)), TriggerDecision::Hold);
        assert_eq!(
            policy.evaluate(&ctx(i64::MIN, 3)),
            TriggerDecision::FireIntermediate
        );
    }

    #[test]
    fn test_processing_time_policy() {
        let policy = ProcessingTimePolicy { interval_ms: 100 };
        let mut c = ctx(i64::MIN, 5);
        c.processing_time = 1000;
        assert_eq!(c.last_intermediate_fire, i64::MIN);
        assert_eq!(policy.evaluate(&c), TriggerDecision::FireIntermediate);

        c.last_intermediate_fire = 950;
        assert_eq!(policy.evaluate(&c), TriggerDecision::Hold);
        c.processing_time = 1050;
        assert_eq!(policy.evaluate(&c), TriggerDecision::FireIntermediate);

        // Empty slices produce no intermediate snapshots.
        c.record_count = 0;
        assert_eq!(policy.evaluate(&c), TriggerDecision::Hold);
    }

    #[test]
    fn test_any_of_takes_strongest() {
        let policy = AnyOf(vec![
            Box::new(CountPolicy { threshold: 1 }),
            Box::new(EventTimePolicy),
        ]);
        // Count says intermediate, event time says final: final wins.
        assert_eq!(policy.evaluate(&ctx(100, 5)), TriggerDecision::FireFinal);
        assert_eq!(
            policy.evaluate(&ctx(5, 5)),
            TriggerDecision::FireIntermediate
        );
        assert_eq!(AnyOf(vec![]).evaluate(&ctx(100, 5)), TriggerDecision::Hold);
    }
}
