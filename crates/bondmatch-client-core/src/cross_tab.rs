//! Propagation of login, logout, and refresh between client instances that
//! share one persisted storage area.

use std::sync::Arc;

use futures::StreamExt as _;
use futures::stream::{self, BoxStream};
use tokio::sync::broadcast;

use crate::session::SessionManager;
use crate::storage::{ACCESS_TOKEN_KEY, KeyValueStore, REFRESH_TOKEN_KEY, StorageChange, TabId};

const SIGNAL_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSignal {
    SignedIn,
    SignedOut,
    TokensChanged,
}

impl SessionSignal {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SignedIn => "signed_in",
            Self::SignedOut => "signed_out",
            Self::TokensChanged => "tokens_changed",
        }
    }
}

/// Fan-out of session changes to other instances. A publisher never receives
/// its own signals.
pub trait SessionChannel: Send + Sync {
    fn publish(&self, signal: SessionSignal);
    fn subscribe(&self) -> BoxStream<'static, SessionSignal>;
}

/// Derives signals from credential-key changes in a shared [`KeyValueStore`].
///
/// Publishing is a no-op: the write that changed the session already reached
/// every other instance through the store.
pub struct StorageSessionChannel {
    store: Arc<dyn KeyValueStore>,
}

impl StorageSessionChannel {
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }
}

impl SessionChannel for StorageSessionChannel {
    fn publish(&self, _signal: SessionSignal) {}

    fn subscribe(&self) -> BoxStream<'static, SessionSignal> {
        self.store
            .subscribe()
            .filter_map(|change| futures::future::ready(signal_for_change(&change)))
            .boxed()
    }
}

/// `None` for changes that do not touch the credential pair.
#[must_use]
pub fn signal_for_change(change: &StorageChange) -> Option<SessionSignal> {
    match change.key.as_deref() {
        None => Some(SessionSignal::SignedOut),
        Some(ACCESS_TOKEN_KEY | REFRESH_TOKEN_KEY) => {
            Some(match (&change.old_value, &change.new_value) {
                (_, None) => SessionSignal::SignedOut,
                (None, Some(_)) => SessionSignal::SignedIn,
                (Some(_), Some(_)) => SessionSignal::TokensChanged,
            })
        }
        Some(_) => None,
    }
}

/// In-process channel for instances that do not share a change-announcing store.
#[derive(Clone)]
pub struct LocalSessionChannel {
    hub: broadcast::Sender<(TabId, SessionSignal)>,
    tab: TabId,
}

impl Default for LocalSessionChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalSessionChannel {
    #[must_use]
    pub fn new() -> Self {
        let (hub, _) = broadcast::channel(SIGNAL_CHANNEL_CAPACITY);
        Self {
            hub,
            tab: TabId::next(),
        }
    }

    /// A sibling endpoint on the same hub.
    #[must_use]
    pub fn join(&self) -> Self {
        Self {
            hub: self.hub.clone(),
            tab: TabId::next(),
        }
    }
}

impl SessionChannel for LocalSessionChannel {
    fn publish(&self, signal: SessionSignal) {
        let _ = self.hub.send((self.tab, signal));
    }

    fn subscribe(&self) -> BoxStream<'static, SessionSignal> {
        let own_tab = self.tab;
        stream::unfold(self.hub.subscribe(), move |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok((origin, _)) if origin == own_tab => {}
                    Ok((_, signal)) => return Some((signal, receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "session signal listener lagged");
                        return Some((SessionSignal::TokensChanged, receiver));
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }
}

/// Keeps one [`SessionManager`] in step with changes made by other instances.
pub struct CrossTabNotifier;

impl CrossTabNotifier {
    /// Re-derives session state for every signal until the stream ends.
    /// Never redirects: the instance that ended the session already did.
    pub async fn run(session: SessionManager, mut signals: BoxStream<'static, SessionSignal>) {
        while let Some(signal) = signals.next().await {
            let state = session.resync_from_store();
            tracing::debug!(
                signal = signal.as_str(),
                state = state.as_str(),
                "session changed in another tab"
            );
        }
    }

    /// Subscribes before returning, so no change after this call is missed.
    #[cfg(not(target_arch = "wasm32"))]
    pub fn spawn(session: SessionManager) -> tokio::task::JoinHandle<()> {
        let signals = session.channel().subscribe();
        tokio::spawn(Self::run(session, signals))
    }

    #[cfg(target_arch = "wasm32")]
    pub fn spawn(session: SessionManager) {
        let signals = session.channel().subscribe();
        wasm_bindgen_futures::spawn_local(Self::run(session, signals));
    }
}
