//! Mutual exclusion between foreground client operations and the
//! background rebalance.
//!
//! Stores and removes hold an in-flight count for their whole
//! acknowledgement wait. A rebalance pass first raises the `rebalancing`
//! flag so no new operation is admitted, then waits for the count to drain
//! to zero. Parked sessions are all woken when the pass releases the gate;
//! nothing polls.

use tokio::sync::{Mutex, Notify};

#[derive(Debug, Default)]
struct GateState {
    in_flight: usize,
    rebalancing: bool,
}

#[derive(Debug, Default)]
pub struct OpGate {
    state: Mutex<GateState>,
    changed: Notify,
}

impl OpGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits a counted client operation, waiting out any running
    /// rebalance. Every call must be paired with [`OpGate::end_op`].
    pub async fn begin_op(&self) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock().await;
                if !state.rebalancing {
                    state.in_flight += 1;
                    return;
                }
            }
            notified.await;
        }
    }

    pub async fn end_op(&self) {
        {
            let mut state = self.state.lock().await;
            state.in_flight = state.in_flight.saturating_sub(1);
        }
        self.changed.notify_waiters();
    }

    /// Waits until no rebalance is running, without counting the caller as
    /// an in-flight operation. Used by reads that a rebalance must still
    /// not interleave with.
    pub async fn wait_admitted(&self) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.state.lock().await;
                if !state.rebalancing {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Takes the gate exclusively: blocks new admissions, then waits for
    /// every in-flight operation to finish.
    pub async fn begin_exclusive(&self) {
        {
            let mut state = self.state.lock().await;
            state.rebalancing = true;
        }
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.state.lock().await;
                if state.in_flight == 0 {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Releases exclusivity and wakes every parked session.
    pub async fn end_exclusive(&self) {
        {
            let mut state = self.state.lock().await;
            state.rebalancing = false;
        }
        self.changed.notify_waiters();
    }

    #[cfg(test)]
    async fn in_flight(&self) -> usize {
        self.state.lock().await.in_flight
    }
}
