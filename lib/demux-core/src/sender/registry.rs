use std::{
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use snafu::Snafu;
use tracing::{debug, info};

use super::{CheckId, Sender};
use crate::{error::GenericError, hash::FastHashMap, router::SampleRouter};

const DEFAULT_SENDER_ID: &str = "default";

/// A sender registry error.
#[derive(Debug, Eq, PartialEq, Snafu)]
#[snafu(context(suffix(false)))]
pub enum SenderError {
    /// A sender is already registered for the identity.
    #[snafu(display("Sender already exists for check '{}'.", id))]
    AlreadyExists {
        /// Identity of the producer.
        id: CheckId,
    },

    /// No sender is registered for the identity.
    #[snafu(display("No sender found for check '{}'.", id))]
    NotFound {
        /// Identity of the producer.
        id: CheckId,
    },

    /// The registry was closed and no longer hands out senders.
    #[snafu(display("Sender registry is closed."))]
    Closed,
}

struct State {
    senders: FastHashMap<CheckId, Sender>,
    default_sender: Option<Sender>,
    default_hostname: String,
    closed: bool,
}

/// Registry of live senders, keyed by producer identity.
///
/// At most one sender is registered per identity at any time. All operations go through a single lock, held only for
/// the duration of the map operation.
pub struct SenderRegistry {
    state: Mutex<State>,
    router: SampleRouter,
    expiry: Duration,
}

impl SenderRegistry {
    /// Creates an empty registry.
    ///
    /// Senders created by the registry route through `router` and start with `default_hostname`. Senders that have not
    /// committed for longer than `expiry` are removed by [`clean_senders`][Self::clean_senders]; a zero expiry disables
    /// that.
    pub fn new(router: SampleRouter, default_hostname: &str, expiry: Duration) -> Self {
        Self {
            state: Mutex::new(State {
                senders: FastHashMap::default(),
                default_sender: None,
                default_hostname: default_hostname.to_string(),
                closed: false,
            }),
            router,
            expiry,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Gets the sender registered for `id`.
    ///
    /// # Errors
    ///
    /// If no sender is registered for `id`, `SenderError::NotFound` is returned.
    pub fn get_sender(&self, id: &CheckId) -> Result<Sender, SenderError> {
        self.state()
            .senders
            .get(id)
            .cloned()
            .ok_or_else(|| SenderError::NotFound { id: id.clone() })
    }

    /// Registers `sender` under `id`.
    ///
    /// When called concurrently for the same identity, exactly one caller succeeds.
    ///
    /// # Errors
    ///
    /// If a sender is already registered for `id`, `SenderError::AlreadyExists` is returned and the registered sender
    /// is left untouched.
    pub fn set_sender(&self, sender: Sender, id: CheckId) -> Result<(), SenderError> {
        let mut state = self.state();
        if state.closed {
            return Err(SenderError::Closed);
        }
        if state.senders.contains_key(&id) {
            return Err(SenderError::AlreadyExists { id });
        }

        state.senders.insert(id, sender);
        Ok(())
    }

    /// Creates a sender for `id` and registers it.
    ///
    /// # Errors
    ///
    /// If a sender is already registered for `id`, `SenderError::AlreadyExists` is returned.
    pub fn create_sender(&self, id: CheckId) -> Result<Sender, SenderError> {
        let mut state = self.state();
        if state.closed {
            return Err(SenderError::Closed);
        }
        if state.senders.contains_key(&id) {
            return Err(SenderError::AlreadyExists { id });
        }

        let sender = Sender::new(id.clone(), &state.default_hostname, self.router.clone());
        state.senders.insert(id, sender.clone());
        Ok(sender)
    }

    /// Removes the sender registered for `id`, if any.
    ///
    /// Clones of the removed sender held elsewhere keep working, but the identity becomes available again.
    pub fn destroy_sender(&self, id: &CheckId) {
        if self.state().senders.remove(id).is_some() {
            debug!(sender = %id, "Destroyed sender.");
        }
    }

    /// Gets the default sender, creating it on first use.
    ///
    /// Every caller observes the same sender.
    ///
    /// # Errors
    ///
    /// If the registry is closed and the default sender was never created, an error is returned.
    pub fn get_default_sender(&self) -> Result<Sender, GenericError> {
        let mut state = self.state();
        if let Some(sender) = &state.default_sender {
            return Ok(sender.clone());
        }
        if state.closed {
            return Err(SenderError::Closed.into());
        }

        let sender = Sender::new(
            CheckId::new(DEFAULT_SENDER_ID),
            &state.default_hostname,
            self.router.clone(),
        );
        state.default_sender = Some(sender.clone());
        Ok(sender)
    }

    /// Changes the default hostname of every sender, including the default sender and any created afterwards.
    pub fn change_all_senders_default_hostname(&self, hostname: &str) {
        let mut state = self.state();
        state.default_hostname = hostname.to_string();
        for sender in state.senders.values().chain(state.default_sender.iter()) {
            sender.set_default_hostname(hostname);
        }

        info!(hostname, senders = state.senders.len(), "Changed default hostname of all senders.");
    }

    /// Removes senders that have not committed since before `now - expiry`.
    ///
    /// Returns the number of senders removed. The default sender is never removed.
    pub(crate) fn clean_senders(&self, now: u64) -> usize {
        if self.expiry.is_zero() {
            return 0;
        }

        let expiry_secs = self.expiry.as_secs();
        let mut state = self.state();
        let before = state.senders.len();
        state
            .senders
            .retain(|_, sender| now.saturating_sub(sender.last_commit()) <= expiry_secs);
        let removed = before - state.senders.len();

        if removed > 0 {
            debug!(removed, "Removed stale senders.");
        }
        removed
    }

    /// Number of registered senders, excluding the default sender.
    pub fn len(&self) -> usize {
        self.state().senders.len()
    }

    /// Returns `true` if no sender is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops handing out new senders and drops every registered one.
    pub(crate) fn close(&self) {
        let mut state = self.state();
        state.closed = true;
        state.senders.clear();
    }
}
