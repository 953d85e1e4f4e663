//! Authentication module for the client-side session lifecycle.
//!
//! This module provides:
//! - `SessionStore`: owns the session, refreshes tokens, enforces the
//!   10-hour window and drives logout
//! - `AuthTimers`: the refresh / warning / logout deadline timers
//! - `SessionStorage`: durable storage for the window anchor, backed by a
//!   JSON file, the OS keychain, or memory

pub mod session;
pub mod storage;
pub mod store;
pub mod timers;

pub use session::{LoginOptions, LogoutReason, Session, SessionSnapshot, TokenResponse};
pub use storage::{FileStorage, KeyringStorage, MemoryStorage, SessionStorage, StorageError};
pub use store::SessionStore;
pub use timers::{AuthTimers, TimerPlan, TimerTarget};
