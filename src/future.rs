//! The future state machine.
//!
//! A future transitions monotonically Pending → Ready → Done, or from any
//! non-terminal state to Errored; session close moves non-terminal futures
//! to Cancelled. Once terminal, the result or error is immutable.
//!
//! Edges between futures live in the session graph; a future itself only
//! carries the count of its unresolved children plus the waiters to notify
//! on completion.

use tracing::debug;

use crate::error::Error;
use crate::value::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// Some children have not resolved yet.
    Pending,
    /// Every child is done; the future may produce its value.
    Ready,
    /// Terminal failure.
    Errored,
    /// Result stored, immutable from here on.
    Done,
    /// Terminated by session close; not an error.
    Cancelled,
}

impl State {
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Errored | State::Done | State::Cancelled)
    }
}

/// Channel half notified when the future reaches a terminal state.
pub(crate) type Waiter = crossbeam_channel::Sender<Result<Value, Error>>;

#[derive(Debug)]
pub(crate) struct Future {
    state: State,
    unresolved: usize,
    result: Option<Value>,
    error: Option<Error>,
    waiters: Vec<Waiter>,
}

impl Future {
    pub fn new() -> Self {
        Future {
            state: State::Pending,
            unresolved: 0,
            result: None,
            error: None,
            waiters: Vec::new(),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    pub fn unresolved(&self) -> usize {
        self.unresolved
    }

    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// Record one more unresolved child. Only legal before termination.
    pub fn add_pending_child(&mut self) {
        debug_assert!(!self.state.is_terminal());
        self.unresolved += 1;
    }

    /// A child resolved; returns true when no unresolved children remain.
    pub fn child_done(&mut self) -> bool {
        debug_assert!(self.unresolved > 0);
        self.unresolved -= 1;
        self.unresolved == 0
    }

    /// Pending → Ready once the unresolved counter reaches zero.
    pub fn mark_ready(&mut self) {
        debug_assert_eq!(self.state, State::Pending);
        debug_assert_eq!(self.unresolved, 0);
        self.state = State::Ready;
    }

    /// Ready → Done. Returns the number of waiters notified, or `None` when
    /// the future was already terminal and the result was discarded.
    pub fn set_result(&mut self, value: Value) -> Option<usize> {
        if self.state.is_terminal() {
            return None;
        }
        debug_assert_eq!(self.state, State::Ready);
        self.state = State::Done;
        self.result = Some(value);
        Some(self.drain_waiters())
    }

    /// Any non-terminal state → Errored. Returns the number of waiters
    /// notified, or `None` when already terminal.
    pub fn set_error(&mut self, error: Error) -> Option<usize> {
        if self.state.is_terminal() {
            return None;
        }
        self.state = State::Errored;
        self.error = Some(error);
        Some(self.drain_waiters())
    }

    /// Any non-terminal state → Cancelled.
    pub fn cancel(&mut self) -> Option<usize> {
        if self.state.is_terminal() {
            return None;
        }
        self.state = State::Cancelled;
        self.error = Some(Error::Cancelled);
        Some(self.drain_waiters())
    }

    /// Attach a completion hook. Fires immediately when already terminal.
    pub fn register_waiter(&mut self, waiter: Waiter) {
        if self.state.is_terminal() {
            let _ = waiter.send(self.outcome());
        } else {
            self.waiters.push(waiter);
        }
    }

    fn outcome(&self) -> Result<Value, Error> {
        match self.state {
            State::Done => Ok(self.result.clone().expect("done future has a result")),
            _ => Err(self.error.clone().unwrap_or(Error::Cancelled)),
        }
    }

    fn drain_waiters(&mut self) -> usize {
        let waiters = std::mem::take(&mut self.waiters);
        let notified = waiters.len();
        if notified > 0 {
            debug!(notified, "future settled, waking waiters");
        }
        for waiter in waiters {
            // A dropped receiver just means nobody cares anymore.
            let _ = waiter.send(self.outcome());
        }
        notified
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_children_down_to_ready() {
        let mut fut = Future::new();
        fut.add_pending_child();
        fut.add_pending_child();
        assert!(!fut.child_done());
        assert!(fut.child_done());
        fut.mark_ready();
        assert_eq!(fut.state(), State::Ready);
    }

    #[test]
    fn result_is_immutable_once_done() {
        let mut fut = Future::new();
        fut.mark_ready();
        assert!(fut.set_result(Value::Int(1)).is_some());
        assert!(fut.set_result(Value::Int(2)).is_none());
        assert!(fut.set_error(Error::Cancelled).is_none());
        assert_eq!(fut.result(), Some(&Value::Int(1)));
    }

    #[test]
    fn error_preempts_pending_and_ready() {
        let mut fut = Future::new();
        fut.add_pending_child();
        assert!(fut.set_error(Error::Cancelled).is_some());
        assert_eq!(fut.state(), State::Errored);
    }

    #[test]
    fn waiters_fire_on_completion_and_late_registration() {
        let mut fut = Future::new();
        fut.mark_ready();

        let (tx, rx) = crossbeam_channel::bounded(1);
        fut.register_waiter(tx);
        fut.set_result(Value::Int(7));
        assert_eq!(rx.recv().unwrap().unwrap(), Value::Int(7));

        // Registration after completion fires immediately.
        let (tx, rx) = crossbeam_channel::bounded(1);
        fut.register_waiter(tx);
        assert_eq!(rx.recv().unwrap().unwrap(), Value::Int(7));
    }
}
