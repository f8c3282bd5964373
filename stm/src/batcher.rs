// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Epoch Batcher
//!
//! The batcher gates transactions into epochs. It counts the members of the running
//! epoch, and the member that leaves last performs the epoch transition. While the
//! transition drains, arriving transactions are parked and admitted together into
//! the next epoch.

use crate::Admission;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct EpochState {
    epoch: u64,

    /// active members of the running epoch
    remaining: usize,

    /// parked transactions, admitted by the next transition
    waiting: usize,

    /// set while the last member performs the transition
    draining: bool,
}

pub(crate) struct Batcher {
    admission: Admission,
    state: Mutex<EpochState>,
    turn: Condvar,
}

impl Batcher {
    pub(crate) fn new(admission: Admission) -> Self {
        Self {
            admission,
            state: Mutex::new(EpochState::default()),
            turn: Condvar::new(),
        }
    }

    /// Joins an epoch and returns its number. Blocks while an epoch transition drains, or
    /// with [`Admission::Batched`], while the running epoch has members.
    pub(crate) fn enter(&self) -> u64 {
        let mut state = self.lock();

        if !self.must_wait(&state) {
            state.remaining += 1;
            return state.epoch;
        }

        state.waiting += 1;
        let parked = state.epoch;
        while state.epoch == parked {
            state = self.turn.wait(state).unwrap_or_else(PoisonError::into_inner);
        }

        // the transition has already counted us as a member
        state.epoch
    }

    /// Leaves the running epoch. The last member to leave runs `transition` with the
    /// number of the closing epoch, then opens the next epoch and wakes all parked
    /// transactions.
    ///
    /// Returns `true`, if this call performed the transition.
    pub(crate) fn leave<F>(&self, transition: F) -> bool
    where
        F: FnOnce(u64),
    {
        let mut state = self.lock();

        debug_assert!(state.remaining > 0, "leaving an epoch without being a member");
        state.remaining = state.remaining.saturating_sub(1);
        if state.remaining > 0 {
            return false;
        }

        state.draining = true;
        let closing = state.epoch;
        drop(state);

        transition(closing);

        let mut state = self.lock();
        state.epoch += 1;
        state.remaining = state.waiting;
        state.waiting = 0;
        state.draining = false;
        drop(state);

        self.turn.notify_all();
        true
    }

    /// Blocks until `epoch` has closed. An epoch without members has nothing to wait for.
    pub(crate) fn await_transition(&self, epoch: u64) {
        let mut state = self.lock();
        while state.epoch <= epoch && (state.remaining > 0 || state.draining) {
            state = self.turn.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Number of the running epoch
    pub(crate) fn epoch(&self) -> u64 {
        self.lock().epoch
    }

    fn must_wait(&self, state: &EpochState) -> bool {
        match self.admission {
            Admission::Open => state.draining,
            Admission::Batched => state.draining || state.remaining > 0,
        }
    }

    fn lock(&self) -> MutexGuard<'_, EpochState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            mpsc, Arc,
        },
        thread,
        time::Duration,
    };

    #[test]
    fn test_last_member_transitions() {
        let batcher = Batcher::new(Admission::Open);

        assert_eq!(batcher.enter(), 0);
        assert_eq!(batcher.enter(), 0);

        let mut closed = None;
        assert!(!batcher.leave(|epoch| closed = Some(epoch)));
        assert_eq!(closed, None);

        assert!(batcher.leave(|epoch| closed = Some(epoch)));
        assert_eq!(closed, Some(0));
        assert_eq!(batcher.epoch(), 1);

        // an empty batcher opens a fresh epoch for the next arrival
        assert_eq!(batcher.enter(), 1);
        assert!(batcher.leave(|_| {}));
        assert_eq!(batcher.epoch(), 2);
    }

    #[test]
    fn test_arrivals_wait_for_draining_transition() {
        let batcher = Arc::new(Batcher::new(Admission::Open));
        let in_transition = Arc::new(AtomicBool::new(false));
        let (started_tx, started_rx) = mpsc::channel();

        batcher.enter();

        let b = batcher.clone();
        let flag = in_transition.clone();
        let leaver = thread::spawn(move || {
            b.leave(|_| {
                flag.store(true, Ordering::SeqCst);
                started_tx.send(()).expect("channel closed");
                thread::sleep(Duration::from_millis(100));
                flag.store(false, Ordering::SeqCst);
            })
        });

        started_rx.recv().expect("channel closed");

        // arrives while the transition drains, must observe the finished transition
        let epoch = batcher.enter();
        assert!(!in_transition.load(Ordering::SeqCst));
        assert_eq!(epoch, 1);

        assert!(leaver.join().expect("Failed to join leaving thread"));

        // the parked transaction has been admitted as a member of epoch 1
        assert!(batcher.leave(|epoch| assert_eq!(epoch, 1)));
    }

    #[test]
    fn test_await_transition() {
        let batcher = Arc::new(Batcher::new(Admission::Open));

        // nothing to wait for without members
        batcher.await_transition(0);

        let epoch = batcher.enter();
        let b = batcher.clone();
        let waiter = thread::spawn(move || {
            b.await_transition(epoch);
            b.epoch()
        });

        thread::sleep(Duration::from_millis(50));
        batcher.leave(|_| {});

        assert_eq!(waiter.join().expect("Failed to join waiting thread"), 1);
    }

    #[test]
    fn test_batched_admission_waits_for_next_epoch() {
        let batcher = Arc::new(Batcher::new(Admission::Batched));
        let admitted = Arc::new(AtomicUsize::new(0));

        assert_eq!(batcher.enter(), 0);

        let mut workers = Vec::new();
        for _ in 0..4 {
            let b = batcher.clone();
            let a = admitted.clone();
            workers.push(thread::spawn(move || {
                let epoch = b.enter();
                a.fetch_add(1, Ordering::SeqCst);
                b.leave(|_| {});
                epoch
            }));
        }

        thread::sleep(Duration::from_millis(100));
        assert_eq!(admitted.load(Ordering::SeqCst), 0);

        batcher.leave(|_| {});

        for worker in workers {
            let epoch = worker.join().expect("Failed to join worker thread");
            assert!(epoch >= 1);
        }
        assert_eq!(admitted.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_concurrent_members_balance() {
        let batcher = Arc::new(Batcher::new(Admission::Open));
        let transitions = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::new();
        for _ in 0..8 {
            let b = batcher.clone();
            let t = transitions.clone();
            workers.push(thread::spawn(move || {
                for _ in 0..500 {
                    b.enter();
                    b.leave(|_| {
                        t.fetch_add(1, Ordering::SeqCst);
                    });
                }
            }));
        }

        for worker in workers {
            worker.join().expect("Failed to join worker thread");
        }

        let state = batcher.lock();
        assert_eq!(state.remaining, 0);
        assert_eq!(state.waiting, 0);
        assert_eq!(state.epoch as usize, transitions.load(Ordering::SeqCst));
    }
}
