pub mod app_identity;
pub mod auth_client;
mod auth_service;
mod config;
mod refresh;
pub mod token_storage;

pub use app_identity::{AppIdentity, PlatformSignals};
pub use auth_client::{AccountClient, Outcome};
pub use auth_service::{AuthPhase, AuthService, AuthState, REFRESH_LOOKAHEAD_SECS};
pub use config::{Settings, DEVELOPMENT_BASE_URL, PRODUCTION_BASE_URL};
pub use refresh::RefreshCoordinator;
pub use token_storage::{keys, FileStore, KeyValueStore, MemoryStore, SessionStore, StoreError};
