//! Deferred acknowledgment: a per-adapter registry from correlation token to the
//! source-native message handle, resolved once the pipeline reports a verdict.
//!
//! Message arrival (insert) and completion notices (lookup-and-remove) run on
//! different tasks, so every access goes through one mutex. An entry whose
//! notice never arrives stays until [`DeferredAckRegistry::drain`] at shutdown;
//! the source redelivers it after its own ack deadline.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, error, warn};

use crate::contract::{CompletionNotice, CorrelationToken};

/// Outcome of applying a completion notice to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Acked,
    Nacked,
    /// `finished = false`; the entry is left in place.
    InFlight,
    /// No entry for the token (duplicate or stray notice).
    Unknown,
}

/// A claimed entry and what must happen to it.
#[derive(Debug)]
pub enum Settlement<H> {
    Ack(H),
    Nack(H),
    InFlight,
    Unknown,
}

impl<H> Settlement<H> {
    pub fn verdict(&self) -> Verdict {
        match self {
            Settlement::Ack(_) => Verdict::Acked,
            Settlement::Nack(_) => Verdict::Nacked,
            Settlement::InFlight => Verdict::InFlight,
            Settlement::Unknown => Verdict::Unknown,
        }
    }
}

pub struct DeferredAckRegistry<H> {
    entries: Mutex<HashMap<CorrelationToken, H>>,
}

impl<H> Default for DeferredAckRegistry<H> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<H> DeferredAckRegistry<H> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CorrelationToken, H>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores `handle` under a freshly generated token and returns the token.
    pub fn defer(&self, handle: H) -> CorrelationToken {
        let mut entries = self.lock();
        let mut token = CorrelationToken::new();
        while entries.contains_key(&token) {
            token = CorrelationToken::new();
        }
        entries.insert(token, handle);
        debug!(%token, in_flight = entries.len(), "Deferred acknowledgment");
        token
    }

    /// Removes and returns the entry for `token`, if any.
    pub fn take(&self, token: &CorrelationToken) -> Option<H> {
        self.lock().remove(token)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Removes every outstanding entry.
    pub fn drain(&self) -> Vec<(CorrelationToken, H)> {
        self.lock().drain().collect()
    }

    /// Removes the entry a finished notice refers to and says whether to ack or nack it.
    ///
    /// The caller performs the acknowledgment, so it may be awaited outside the lock.
    pub fn claim(&self, notice: CompletionNotice) -> Settlement<H> {
        if !notice.finished {
            return Settlement::InFlight;
        }
        let Some(token) = notice.token else {
            warn!("Finished notice without a correlation token");
            return Settlement::Unknown;
        };
        let Some(handle) = self.take(&token) else {
            error!(%token, "Message not found for finished session");
            return Settlement::Unknown;
        };
        match notice.error {
            Some(e) => {
                error!(%token, error = %e, "Session finished with error, negatively acknowledging");
                Settlement::Nack(handle)
            }
            None => {
                debug!(%token, "Session finished, acknowledging");
                Settlement::Ack(handle)
            }
        }
    }

    /// Applies a completion notice: acks on success, nacks on error, removing the entry first.
    pub fn resolve(
        &self,
        notice: CompletionNotice,
        ack: impl FnOnce(H),
        nack: impl FnOnce(H),
    ) -> Verdict {
        let settlement = self.claim(notice);
        let verdict = settlement.verdict();
        match settlement {
            Settlement::Ack(handle) => ack(handle),
            Settlement::Nack(handle) => nack(handle),
            Settlement::InFlight | Settlement::Unknown => {}
        }
        verdict
    }
}
