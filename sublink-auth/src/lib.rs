// Session and token types shared by every component
pub mod common;

// Account service client, session persistence and the auth state machine
mod client;
mod error;

pub use client::{
    keys, AccountClient, AppIdentity, AuthPhase, AuthService, AuthState, FileStore,
    KeyValueStore, MemoryStore, Outcome, PlatformSignals, RefreshCoordinator, SessionStore,
    Settings, StoreError, DEVELOPMENT_BASE_URL, PRODUCTION_BASE_URL, REFRESH_LOOKAHEAD_SECS,
};
pub use common::{Session, TokenGrant, User, DEFAULT_EXPIRES_IN_SECS};
pub use error::AuthError;

// In-process account service for tests
#[cfg(any(test, feature = "testing"))]
pub mod testing;
