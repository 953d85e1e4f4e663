use std::future::Future;
use std::sync::Arc;

use crate::auth::TokenResponse;

use super::ApiError;

/// Network operations the session store depends on.
///
/// The refresh credential never passes through here: the portal resolves
/// it from a cookie the transport attaches on its own.
pub trait AuthBackend: Send + Sync + 'static {
    /// Mint a fresh access token.
    ///
    /// `Ok(None)` means there is no usable refresh credential (the user is
    /// simply logged out).
    fn refresh_tokens(
        &self,
    ) -> impl Future<Output = Result<Option<TokenResponse>, ApiError>> + Send;

    /// Tell the portal to invalidate the session server-side.
    fn notify_logout(
        &self,
        id_token_hint: Option<String>,
    ) -> impl Future<Output = Result<(), ApiError>> + Send;
}

impl<B: AuthBackend> AuthBackend for Arc<B> {
    fn refresh_tokens(
        &self,
    ) -> impl Future<Output = Result<Option<TokenResponse>, ApiError>> + Send {
        (**self).refresh_tokens()
    }

    fn notify_logout(
        &self,
        id_token_hint: Option<String>,
    ) -> impl Future<Output = Result<(), ApiError>> + Send {
        (**self).notify_logout(id_token_hint)
    }
}
