//! Checkpoint coordinator.
//!
//! A single *current* epoch exists at all times. Every I/O brackets
//! itself with `io_enter`/`io_exit`; triggering a checkpoint atomically
//! publishes a fresh epoch and closes the old one, and the flush for the
//! old epoch starts only when its last I/O exits. At most one checkpoint
//! runs at a time (`in_flight`), and a trigger that loses the race leaves
//! a follow-up request behind.
//!
//! The current-epoch pointer lives in an [`ArcSwap`]: readers take a full
//! `Arc` (reclamation safety comes from the reference count) and then
//! re-validate the epoch state after incrementing its enter counter,
//! retrying if the epoch moved to `preparing` in the meantime. That
//! validate-after-increment loop is the grace-period guarantee: once an
//! epoch is `preparing`, no new I/O can hold it.

use arc_swap::ArcSwap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

/// Lifecycle of one epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CpState {
    Init = 0,
    /// I/Os may enter
    IoReady = 1,
    /// A trigger is closing this epoch; late I/Os may still enter
    Triggered = 2,
    /// Closed; waiting for the enter counter to drain
    Preparing = 3,
    /// Flush in progress
    Flushing = 4,
    Done = 5,
}

impl CpState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::IoReady,
            2 => Self::Triggered,
            3 => Self::Preparing,
            4 => Self::Flushing,
            5 => Self::Done,
            _ => Self::Init,
        }
    }
}

/// One checkpoint epoch carrying the attached subsystem state `S`
pub struct CpEpoch<S> {
    state: AtomicU8,
    enter_cnt: AtomicI64,
    pub ctx: S,
}

impl<S> CpEpoch<S> {
    fn new(ctx: S, state: CpState) -> Self {
        Self {
            state: AtomicU8::new(state as u8),
            enter_cnt: AtomicI64::new(0),
            ctx,
        }
    }

    #[must_use]
    pub fn state(&self) -> CpState {
        CpState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, s: CpState) {
        self.state.store(s as u8, Ordering::Release);
    }

    fn transition(&self, from: CpState, to: CpState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[must_use]
    pub fn enter_count(&self) -> i64 {
        self.enter_cnt.load(Ordering::Acquire)
    }
}

/// The subsystem side of the protocol: building the next epoch's state
/// when a checkpoint is triggered, and flushing a closed epoch once its
/// I/Os have drained.
pub trait CpHandler<S>: Send + Sync {
    /// Called once per trigger, before the new epoch is published
    fn attach_prepare(&self, cur: &CpEpoch<S>) -> S;
    /// Called exactly once per epoch, after its last `io_exit`
    fn cp_start(&self, epoch: Arc<CpEpoch<S>>);
}

/// Epoch barrier and checkpoint lifecycle
pub struct CpCoordinator<S> {
    cur: ArcSwap<CpEpoch<S>>,
    in_flight: AtomicBool,
    /// A trigger arrived while a checkpoint was already running
    follow_up: AtomicBool,
    handler: RwLock<Option<Weak<dyn CpHandler<S>>>>,
}

impl<S: Send + Sync + 'static> CpCoordinator<S> {
    #[must_use]
    pub fn new(initial: S) -> Arc<Self> {
        Arc::new(Self {
            cur: ArcSwap::from_pointee(CpEpoch::new(initial, CpState::IoReady)),
            in_flight: AtomicBool::new(false),
            follow_up: AtomicBool::new(false),
            handler: RwLock::new(None),
        })
    }

    /// Late-bind the handler (the handler usually owns the coordinator)
    pub fn set_handler(&self, handler: Weak<dyn CpHandler<S>>) {
        *self.handler.write() = Some(handler);
    }

    /// Peek at the current epoch without entering it
    #[must_use]
    pub fn current(&self) -> Arc<CpEpoch<S>> {
        self.cur.load_full()
    }

    /// Enter the current epoch for one I/O. Returns an epoch in
    /// `io_ready` or `triggered` state with its enter counter bumped.
    pub fn io_enter(&self) -> Arc<CpEpoch<S>> {
        loop {
            let ep = self.cur.load_full();
            ep.enter_cnt.fetch_add(1, Ordering::AcqRel);
            match ep.state() {
                CpState::IoReady | CpState::Triggered => return ep,
                _ => {
                    // The epoch closed between the load and the
                    // increment; back out and take the fresh pointer.
                    self.io_exit(&ep);
                }
            }
        }
    }

    /// Exit an epoch. The last exit of a `preparing` epoch starts its
    /// flush, exactly once.
    pub fn io_exit(&self, ep: &Arc<CpEpoch<S>>) {
        let prev = ep.enter_cnt.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev >= 1);
        if prev == 1
            && ep.state() == CpState::Preparing
            && ep.transition(CpState::Preparing, CpState::Flushing)
        {
            trace!("epoch drained, starting flush");
            if let Some(handler) = self.handler() {
                handler.cp_start(ep.clone());
            }
        }
    }

    fn handler(&self) -> Option<Arc<dyn CpHandler<S>>> {
        self.handler.read().as_ref().and_then(Weak::upgrade)
    }

    /// Trigger a checkpoint. Returns true when this call closed the
    /// epoch; a losing racer records a follow-up request instead.
    pub fn trigger(&self) -> bool {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.follow_up.store(true, Ordering::Release);
            return false;
        }
        let Some(handler) = self.handler() else {
            self.in_flight.store(false, Ordering::Release);
            return false;
        };

        let prev = self.io_enter();
        prev.set_state(CpState::Triggered);
        debug!("checkpoint triggered");

        let next_ctx = handler.attach_prepare(&prev);
        let next = Arc::new(CpEpoch::new(next_ctx, CpState::IoReady));
        self.cur.store(next);

        // New I/Os now land in the fresh epoch; stragglers that read the
        // old pointer re-validate against this state and retry.
        prev.set_state(CpState::Preparing);
        self.io_exit(&prev);
        true
    }

    /// Finish a flushed epoch. Called exactly once by the flush
    /// orchestrator; re-triggers when a follow-up request arrived during
    /// this checkpoint.
    pub fn cp_end(&self, ep: &Arc<CpEpoch<S>>) {
        debug_assert_eq!(ep.state(), CpState::Flushing);
        ep.set_state(CpState::Done);
        self.in_flight.store(false, Ordering::Release);
        debug!("checkpoint complete");
        if self.follow_up.swap(false, Ordering::AcqRel) {
            self.trigger();
        }
    }

    /// Whether a checkpoint is currently between trigger and cp_end
    #[must_use]
    pub fn in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }
}
