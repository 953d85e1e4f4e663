//! Portal API module.
//!
//! This module provides the two network calls the session lifecycle
//! depends on: minting a new access token from the server-held refresh
//! cookie, and telling the portal a session has ended.
//!
//! `AuthBackend` is the seam; `PortalClient` is the HTTP implementation.

pub mod backend;
pub mod client;
pub mod error;

pub use backend::AuthBackend;
pub use client::PortalClient;
pub use error::ApiError;
