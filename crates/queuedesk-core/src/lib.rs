//! Session lifecycle manager for the queuedesk staff portal.
//!
//! The portal signs staff in through SSO and hands this crate short-lived
//! access tokens. [`auth::SessionStore`] keeps them fresh, caps every login
//! at a fixed window, warns before the forced logout, and restores the
//! session after a restart from a single persisted timestamp.

pub mod api;
pub mod auth;
pub mod clock;
pub mod config;
pub mod utils;

pub use api::{ApiError, AuthBackend, PortalClient};
pub use auth::{
    FileStorage, KeyringStorage, LoginOptions, LogoutReason, MemoryStorage, Session,
    SessionSnapshot, SessionStorage, SessionStore, TokenResponse,
};
pub use clock::{Clock, EpochMillis, ManualClock, SystemClock};
pub use config::{Config, SessionConfig, StorageKind};
