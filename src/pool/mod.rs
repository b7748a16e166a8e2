//! Bounded pool of reusable decode sessions.
//!
//! At most `capacity` sessions are checked out at once. Excess `acquire` calls
//! wait in arrival order; a released session goes straight to the longest
//! waiter and only lands in the idle list when nobody is waiting.

pub mod session;

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use smol::channel::{Receiver, Sender};

use crate::config::PoolConfig;
use crate::decoder::EngineFactory;

pub use session::{Session, SessionPhase};

/// Snapshot of the pool's bookkeeping
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub available: usize,
    pub checked_out: usize,
    pub idle: usize,
    pub waiting: usize,
    /// Sessions created over the pool's lifetime
    pub sessions: usize,
}

struct PoolState<F: EngineFactory> {
    available: usize,
    idle: Vec<Session<F>>,
    waiters: VecDeque<Sender<Session<F>>>,
    created: usize,
}

struct Shared<F: EngineFactory> {
    factory: Arc<F>,
    capacity: usize,
    state: Mutex<PoolState<F>>,
}

impl<F: EngineFactory> Shared<F> {
    fn release(&self, session: Session<F>) {
        session.reset();

        let mut session = session;
        let mut state = self.state.lock();
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.try_send(session) {
                Ok(()) => {
                    log::debug!("Handed session directly to a waiter, {} still waiting", state.waiters.len());
                    return;
                }
                // The waiter gave up; try the next one
                Err(err) => session = err.into_inner(),
            }
        }

        log::debug!("Session #{} returned to idle list", session.id());
        state.idle.push(session);
        state.available += 1;
    }
}

/// A queued `acquire`. Dropping it before it is served gives the slot back.
struct Waiter<F: EngineFactory> {
    rx: Receiver<Session<F>>,
    shared: Arc<Shared<F>>,
}

impl<F: EngineFactory> Drop for Waiter<F> {
    fn drop(&mut self) {
        self.rx.close();
        if let Ok(session) = self.rx.try_recv() {
            log::debug!("Waiter dropped after hand-off, releasing session #{}", session.id());
            self.shared.release(session);
            return;
        }
        self.shared.state.lock().waiters.retain(|w| !w.is_closed());
    }
}

/// Admission control over a fixed number of decode sessions
pub struct WorkerPool<F: EngineFactory> {
    shared: Arc<Shared<F>>,
}

impl<F: EngineFactory> Clone for WorkerPool<F> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<F: EngineFactory> WorkerPool<F> {
    pub fn new(factory: F, config: PoolConfig) -> Self {
        let capacity = config.capacity.get();
        log::info!("Creating worker pool with {} slots", capacity);

        Self {
            shared: Arc::new(Shared {
                factory: Arc::new(factory),
                capacity,
                state: Mutex::new(PoolState {
                    available: capacity,
                    idle: Vec::new(),
                    waiters: VecDeque::new(),
                    created: 0,
                }),
            }),
        }
    }

    /// Check out a session, waiting in line if the pool is at capacity.
    ///
    /// Never fails. There is no timeout; race the future against a timer if
    /// one is needed. Dropping the future while queued is safe.
    pub async fn acquire(&self) -> Session<F> {
        loop {
            let rx = {
                let mut state = self.shared.state.lock();
                if state.available > 0 {
                    state.available -= 1;
                    return match state.idle.pop() {
                        Some(session) => session,
                        None => {
                            state.created += 1;
                            log::info!("Spawning decode session #{}", state.created);
                            Session::new(state.created, Arc::clone(&self.shared.factory))
                        }
                    };
                }

                let (tx, rx) = smol::channel::bounded(1);
                state.waiters.push_back(tx);
                log::debug!("Pool at capacity, {} waiting", state.waiters.len());
                rx
            };

            let waiter = Waiter {
                rx,
                shared: Arc::clone(&self.shared),
            };
            if let Ok(session) = waiter.rx.recv().await {
                return session;
            }
        }
    }

    /// Reset `session` and hand it to the next waiter, or park it as idle.
    pub fn release(&self, session: Session<F>) {
        self.shared.release(session);
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        PoolStats {
            capacity: self.shared.capacity,
            available: state.available,
            checked_out: self.shared.capacity - state.available,
            idle: state.idle.len(),
            waiting: state.waiters.iter().filter(|w| !w.is_closed()).count(),
            sessions: state.created,
        }
    }

    /// Ask the engine for its version through a transiently acquired session.
    pub async fn version(&self) -> String {
        let session = self.acquire().await;
        let version = session.version().await;
        self.release(session);
        version
    }
}
