//! Coalesces concurrent loads of the same key into one.
//!
//! The first caller for a key becomes the leader and runs the load; callers
//! arriving while it runs wait on the same flight and receive a clone of its
//! result, success or error. If the leader unwinds without a result the
//! flight is abandoned and the waiters race to become the next leader.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Condvar, Mutex, PoisonError};

enum FlightState<V, E> {
    Pending,
    Done(Result<V, E>),
    Abandoned,
}

struct Flight<V, E> {
    state: Mutex<FlightState<V, E>>,
    done: Condvar,
}

impl<V, E> Flight<V, E> {
    fn new() -> Self {
        Self {
            state: Mutex::new(FlightState::Pending),
            done: Condvar::new(),
        }
    }

    fn settle(&self, state: FlightState<V, E>) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
        self.done.notify_all();
    }
}

pub struct LoadGate<K, V, E> {
    inflight: Mutex<HashMap<K, Arc<Flight<V, E>>>>,
}

impl<K, V, E> Default for LoadGate<K, V, E> {
    fn default() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V, E> LoadGate<K, V, E>
where
    K: Eq + Hash + Clone,
    V: Clone,
    E: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys with a load currently running.
    pub fn in_flight(&self) -> usize {
        self.inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn load<F>(&self, key: &K, load: F) -> Result<V, E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        let mut load = Some(load);
        loop {
            let (flight, leader) = {
                let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
                match inflight.get(key) {
                    Some(flight) => (flight.clone(), false),
                    None => {
                        let flight = Arc::new(Flight::new());
                        inflight.insert(key.clone(), flight.clone());
                        (flight, true)
                    }
                }
            };

            if leader {
                if let Some(load) = load.take() {
                    let mut guard = LeaderGuard {
                        gate: self,
                        key,
                        flight: &flight,
                        settled: false,
                    };
                    let result = load();
                    guard.settle(FlightState::Done(result.clone()));
                    return result;
                }
            }

            let mut state = flight.state.lock().unwrap_or_else(PoisonError::into_inner);
            while matches!(*state, FlightState::Pending) {
                state = flight
                    .done
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            if let FlightState::Done(result) = &*state {
                return result.clone();
            }
        }
    }

    fn retire(&self, key: &K, flight: &Arc<Flight<V, E>>) {
        let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        if inflight
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, flight))
        {
            inflight.remove(key);
        }
    }
}

struct LeaderGuard<'a, K, V, E>
where
    K: Eq + Hash + Clone,
    V: Clone,
    E: Clone,
{
    gate: &'a LoadGate<K, V, E>,
    key: &'a K,
    flight: &'a Arc<Flight<V, E>>,
    settled: bool,
}

impl<K, V, E> LeaderGuard<'_, K, V, E>
where
    K: Eq + Hash + Clone,
    V: Clone,
    E: Clone,
{
    fn settle(&mut self, state: FlightState<V, E>) {
        self.gate.retire(self.key, self.flight);
        self.flight.settle(state);
        self.settled = true;
    }
}

impl<K, V, E> Drop for LeaderGuard<'_, K, V, E>
where
    K: Eq + Hash + Clone,
    V: Clone,
    E: Clone,
{
    fn drop(&mut self) {
        if !self.settled {
            self.settle(FlightState::Abandoned);
        }
    }
}
