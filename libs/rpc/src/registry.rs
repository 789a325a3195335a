//! Pending call registry.
//!
//! Owns every call that has been sent but not yet answered, the sequence
//! counter and the two lifecycle flags. A call leaves the registry exactly
//! once; whoever takes it out is the only one allowed to complete it.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// How a call ended, as seen by the code completing it
pub(crate) enum Outcome {
    /// Response body, still encoded
    Body(Vec<u8>),
    Failed(Error),
}

/// A registered call with its reply type erased
#[async_trait::async_trait]
pub(crate) trait PendingCall: Send {
    /// Record the sequence number chosen at registration
    fn assign(&mut self, seq: u64);

    /// Fill in the outcome and notify the caller. Consumes the call, so it
    /// can only happen once.
    async fn complete(self: Box<Self>, outcome: Outcome);
}

struct State {
    next_seq: u64,
    pending: HashMap<u64, Box<dyn PendingCall>>,
    /// Set by the user closing the client
    closing: bool,
    /// Set when the connection failed
    shutdown: bool,
}

pub(crate) struct Registry {
    state: Mutex<State>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(State {
                // 0 is never assigned so it can mean "no call"
                next_seq: 1,
                pending: HashMap::new(),
                closing: false,
                shutdown: false,
            }),
        }
    }

    /// Store a call under the next sequence number.
    ///
    /// Hands the call back untouched if the client is unavailable.
    pub(crate) fn register(
        &self,
        mut call: Box<dyn PendingCall>,
    ) -> std::result::Result<u64, Box<dyn PendingCall>> {
        let mut state = self.state.lock();
        if state.closing || state.shutdown {
            return Err(call);
        }

        let seq = state.next_seq;
        call.assign(seq);
        state.pending.insert(seq, call);
        state.next_seq += 1;
        Ok(seq)
    }

    /// Take a call out of the registry. A second remove of the same sequence
    /// returns `None`.
    pub(crate) fn remove(&self, seq: u64) -> Option<Box<dyn PendingCall>> {
        self.state.lock().pending.remove(&seq)
    }

    /// Mark the connection as failed and take every pending call.
    ///
    /// Callers hold the send lock so that no call is left queued for writing
    /// after the registry is drained.
    pub(crate) fn shut_down(&self) -> Vec<Box<dyn PendingCall>> {
        let mut state = self.state.lock();
        state.shutdown = true;
        state.pending.drain().map(|(_, call)| call).collect()
    }

    /// Mark the client as closing. Fails if it already was.
    pub(crate) fn mark_closing(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.closing {
            return Err(Error::Shutdown);
        }
        state.closing = true;
        Ok(())
    }

    pub(crate) fn is_available(&self) -> bool {
        let state = self.state.lock();
        !state.closing && !state.shutdown
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.state.lock().pending.len()
    }
}
