//! Spotify session management
//!
//! Keeps a persisted list of authorized sessions alive: interactive
//! sign-in through `AuthorizationFlowCoordinator`, background refresh
//! through `RefreshScheduler`, and change events through
//! `SessionChangeNotifier`. `AuthProvider` ties them together over the
//! host's secret storage, redirect listener, browser, and HTTP transport.

pub mod error;
pub mod flow;
pub mod notifier;
pub mod provider;
pub mod scheduler;
pub mod session;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{Error, Result};
pub use flow::{
    AuthorizationFlowCoordinator, BrowserOpener, DEFAULT_REDIRECT_TIMEOUT, FlowState, FlowStatus,
    NONCE_PARAM, PendingAuthorization, RedirectWaiter, extract_code,
};
pub use notifier::{SessionChangeEvent, SessionChangeNotifier, Subscription};
pub use provider::{AuthProvider, Collaborators, ProviderConfig};
pub use scheduler::{RefreshOutcome, RefreshPolicy, RefreshScheduler};
pub use session::{Account, ScopeSet, Session};
pub use store::{DEFAULT_STORAGE_KEY, MemorySecretStorage, SecretStorage, SessionStore};
