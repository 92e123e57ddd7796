#![cfg_attr(test, allow(clippy::expect_used))]

pub mod auth;
pub mod authorized;
pub mod bonds;
pub mod config;
pub mod credential;
pub mod cross_tab;
pub mod error;
pub mod history;
pub mod session;
pub mod storage;
pub mod token_store;
#[cfg(target_arch = "wasm32")]
pub mod web_storage;

pub use authorized::{ApiRequest, ApiResponse, AuthorizedClient, HttpMethod, RequestSender};
pub use credential::{Claims, Clock, Credential, SystemClock};
pub use cross_tab::{CrossTabNotifier, SessionChannel, SessionSignal};
pub use error::{SessionError, StorageError, TransportError};
pub use history::{HistoryCache, HistorySync, SearchHistoryEntry};
pub use session::{Navigator, RouteDecision, SessionManager, SessionState};
pub use storage::{KeyValueStore, MemoryStore, StorageChange};
pub use token_store::TokenStore;
