//! One-shot initialization gate.
//!
//! State machine:
//! `UNINIT -> INITIALIZING -> READY`
//!
//! The first caller runs the bootstrap closure. Callers on other threads wait
//! until the gate is ready. Calls made by the bootstrapping thread itself
//! while the closure is still running (the bootstrap's own dependencies
//! calling back into the allocator) are told so and must not wait.

use std::cell::Cell;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

const STATE_UNINIT: u8 = 0;
const STATE_INITIALIZING: u8 = 1;
const STATE_READY: u8 = 2;

/// Observable gate state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Uninitialized,
    Initializing,
    Ready,
}

/// What an entry point should do after passing the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateStatus {
    /// Bootstrap has completed; use the full runtime.
    Ready,
    /// The caller is the bootstrapping thread re-entering; use the
    /// pre-initialization path.
    Bootstrapping,
}

thread_local! {
    static THREAD_TOKEN: Cell<u8> = const { Cell::new(0) };
}

/// A per-thread identity that needs no allocation: the address of a
/// thread-local byte.
fn thread_token() -> usize {
    THREAD_TOKEN.with(|cell| cell as *const Cell<u8> as usize)
}

#[derive(Debug)]
pub struct InitGate {
    state: AtomicU8,
    owner: AtomicUsize,
}

impl InitGate {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(STATE_UNINIT),
            owner: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn state(&self) -> GateState {
        match self.state.load(Ordering::Acquire) {
            STATE_UNINIT => GateState::Uninitialized,
            STATE_INITIALIZING => GateState::Initializing,
            _ => GateState::Ready,
        }
    }

    #[inline]
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_READY
    }

    /// Pass the gate, running `bootstrap` if nobody has yet.
    ///
    /// `bootstrap` runs at most once per gate. It must not return until the
    /// state it publishes is complete; failures inside it are expected to
    /// terminate the process.
    pub fn enter(&self, bootstrap: impl FnOnce()) -> GateStatus {
        if self.is_ready() {
            return GateStatus::Ready;
        }
        let me = thread_token();
        match self.state.compare_exchange(
            STATE_UNINIT,
            STATE_INITIALIZING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                self.owner.store(me, Ordering::Release);
                bootstrap();
                self.owner.store(0, Ordering::Release);
                self.state.store(STATE_READY, Ordering::Release);
                GateStatus::Ready
            }
            Err(STATE_READY) => GateStatus::Ready,
            Err(_) if self.owner.load(Ordering::Acquire) == me => GateStatus::Bootstrapping,
            Err(_) => {
                self.wait_ready();
                GateStatus::Ready
            }
        }
    }

    fn wait_ready(&self) {
        let mut spins = 0_u32;
        while !self.is_ready() {
            spins = spins.wrapping_add(1);
            if spins % 32 == 0 {
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }
    }
}

impl Default for InitGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[test]
    fn fresh_gate_is_uninitialized() {
        let gate = InitGate::new();
        assert_eq!(gate.state(), GateState::Uninitialized);
        assert!(!gate.is_ready());
    }

    #[test]
    fn bootstrap_runs_once_across_threads_and_calls() {
        let gate = Arc::new(InitGate::new());
        let runs = Arc::new(AtomicU32::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gate = Arc::clone(&gate);
                let runs = Arc::clone(&runs);
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        let status = gate.enter(|| {
                            std::thread::sleep(Duration::from_millis(20));
                            runs.fetch_add(1, Ordering::SeqCst);
                        });
                        assert_eq!(status, GateStatus::Ready);
                        assert!(gate.is_ready());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(gate.state(), GateState::Ready);
    }

    #[test]
    fn reentry_from_bootstrap_thread_is_reported() {
        let gate = InitGate::new();
        let mut inner = None;
        let outer = gate.enter(|| {
            assert_eq!(gate.state(), GateState::Initializing);
            inner = Some(gate.enter(|| panic!("nested bootstrap must not run")));
        });
        assert_eq!(inner, Some(GateStatus::Bootstrapping));
        assert_eq!(outer, GateStatus::Ready);
        assert_eq!(gate.enter(|| unreachable!()), GateStatus::Ready);
    }

    #[test]
    fn other_threads_wait_for_bootstrap_to_finish() {
        let gate = Arc::new(InitGate::new());
        let published = Arc::new(AtomicU32::new(0));
        let started = Arc::new(AtomicU32::new(0));

        let bootstrapper = {
            let gate = Arc::clone(&gate);
            let published = Arc::clone(&published);
            let started = Arc::clone(&started);
            std::thread::spawn(move || {
                gate.enter(|| {
                    started.store(1, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(50));
                    published.store(42, Ordering::SeqCst);
                });
            })
        };
        while started.load(Ordering::SeqCst) == 0 {
            std::thread::yield_now();
        }
        assert_eq!(gate.enter(|| unreachable!()), GateStatus::Ready);
        assert_eq!(published.load(Ordering::SeqCst), 42);
        bootstrapper.join().expect("join");
    }
}
