//! HTTP client for the portal's auth endpoints.
//!
//! The refresh credential is an HttpOnly cookie set by the portal at
//! login. The client keeps it in a cookie jar so it is sent automatically;
//! the session store never sees it. With cookie storage attached, the jar
//! is saved after every refresh so a later process can pick it back up.

use std::sync::Arc;
use std::time::Duration;

use reqwest::cookie::{CookieStore, Jar};
use reqwest::{header, Client, StatusCode, Url};
use serde::Serialize;
use tracing::{debug, warn};

use crate::auth::storage::PORTAL_COOKIES_KEY;
use crate::auth::{SessionStorage, TokenResponse};
use crate::config::Config;

use super::{ApiError, AuthBackend};

// ============================================================================
// Constants
// ============================================================================

/// Path of the token refresh route, relative to the portal URL
const REFRESH_PATH: &str = "/api/auth/refresh";

/// Path of the logout notification route
const LOGOUT_PATH: &str = "/api/auth/logout";

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

#[derive(Debug, Serialize)]
struct LogoutRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    id_token_hint: Option<&'a str>,
}

/// Portal API client.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling,
/// and clones share one cookie jar.
#[derive(Clone)]
pub struct PortalClient {
    client: Client,
    base_url: String,
    /// URL the auth cookies are scoped to when saved and restored
    cookie_url: Url,
    jar: Arc<Jar>,
    cookie_storage: Option<Arc<dyn SessionStorage>>,
}

impl PortalClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ApiError::InvalidUrl(base_url));
        }
        let cookie_url = Url::parse(&format!("{}{}", base_url, REFRESH_PATH))
            .map_err(|_| ApiError::InvalidUrl(base_url.clone()))?;

        let jar = Arc::new(Jar::default());
        let client = Client::builder()
            .timeout(timeout)
            .cookie_provider(Arc::clone(&jar))
            .build()?;

        Ok(Self {
            client,
            base_url,
            cookie_url,
            jar,
            cookie_storage: None,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, ApiError> {
        Self::new(&config.portal_url, config.request_timeout())
    }

    /// Keep the portal's cookies in `storage` across restarts.
    ///
    /// Cookies already saved there are loaded into the jar now.
    pub fn with_cookie_storage(mut self, storage: Arc<dyn SessionStorage>) -> Self {
        match storage.get(PORTAL_COOKIES_KEY) {
            Ok(Some(saved)) => self.add_cookies(&saved),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Failed to read saved portal cookies"),
        }
        self.cookie_storage = Some(storage);
        self
    }

    /// Add cookies from a `Cookie` header value (`a=1; b=2`), e.g. the
    /// refresh cookie handed over together with a login token response.
    pub fn import_cookies(&self, header_value: &str) {
        self.add_cookies(header_value);
        self.save_cookies();
    }

    /// The `Cookie` header the next auth request would carry.
    pub fn cookie_header(&self) -> Option<String> {
        self.jar
            .cookies(&self.cookie_url)
            .and_then(|value| value.to_str().ok().map(str::to_string))
    }

    // Only name=value survives a save; expiry is left to the portal.
    fn add_cookies(&self, header_value: &str) {
        for pair in header_value.split(';').map(str::trim).filter(|p| p.contains('=')) {
            self.jar.add_cookie_str(pair, &self.cookie_url);
        }
    }

    fn save_cookies(&self) {
        let Some(storage) = self.cookie_storage.as_ref() else {
            return;
        };
        let result = match self.cookie_header() {
            Some(header_value) => storage.set(PORTAL_COOKIES_KEY, &header_value),
            None => storage.remove(PORTAL_COOKIES_KEY),
        };
        if let Err(e) = result {
            warn!(error = %e, "Failed to save portal cookies");
        }
    }

    fn forget_cookies(&self) {
        if let Some(storage) = self.cookie_storage.as_ref() {
            if let Err(e) = storage.remove(PORTAL_COOKIES_KEY) {
                warn!(error = %e, "Failed to clear saved portal cookies");
            }
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Returns Ok(Some(response)) for success, Ok(None) for rate limit (should retry),
    /// or Err for other errors.
    async fn check_response_for_retry(
        response: reqwest::Response,
    ) -> Result<Option<reqwest::Response>, ApiError> {
        if response.status().is_success() {
            Ok(Some(response))
        } else if response.status() == StatusCode::TOO_MANY_REQUESTS {
            Ok(None)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    async fn post<B: Serialize>(&self, url: &str, body: &B) -> Result<reqwest::Response, ApiError> {
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let response = self
                .client
                .post(url)
                .header(header::ACCEPT, "application/json")
                .json(body)
                .send()
                .await?;

            match Self::check_response_for_retry(response).await? {
                Some(response) => return Ok(response),
                None => {
                    retries += 1;
                    if retries > MAX_RATE_LIMIT_RETRIES {
                        return Err(ApiError::RateLimited);
                    }
                    warn!(
                        url = url,
                        retry = retries,
                        backoff_ms = backoff_ms,
                        "Rate limited, backing off"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms *= 2; // Exponential backoff
                }
            }
        }
    }

    /// Parse the refresh route's body. An empty body or JSON `null` means
    /// the portal had no session to refresh.
    fn parse_refresh_body(text: &str) -> Result<Option<TokenResponse>, ApiError> {
        if text.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str::<Option<TokenResponse>>(text)
            .map_err(|e| ApiError::InvalidResponse(format!("refresh body: {}", e)))
    }
}

impl AuthBackend for PortalClient {
    async fn refresh_tokens(&self) -> Result<Option<TokenResponse>, ApiError> {
        let url = self.endpoint(REFRESH_PATH);
        let result = self.post(&url, &serde_json::json!({})).await;
        // The portal may have rotated or expired the cookie either way
        self.save_cookies();
        let response = match result {
            Ok(response) => response,
            Err(e) if e.is_auth_rejection() => {
                debug!(error = %e, "Refresh credential rejected");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }

        let text = response.text().await?;
        let tokens = Self::parse_refresh_body(&text)?;
        debug!(refreshed = tokens.is_some(), "Refresh response received");
        Ok(tokens)
    }

    async fn notify_logout(&self, id_token_hint: Option<String>) -> Result<(), ApiError> {
        let url = self.endpoint(LOGOUT_PATH);
        let body = LogoutRequest {
            id_token_hint: id_token_hint.as_deref(),
        };
        let result = self.post(&url, &body).await;
        self.forget_cookies();
        result.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MemoryStorage;

    #[test]
    fn test_new_normalises_base_url() {
        let client =
            PortalClient::new(" https://portal.example.com/ ", Duration::from_secs(5)).unwrap();
        assert_eq!(client.base_url(), "https://portal.example.com");
        assert_eq!(client.endpoint(REFRESH_PATH), "https://portal.example.com/api/auth/refresh");
    }

    #[test]
    fn test_new_rejects_non_http_url() {
        assert!(matches!(
            PortalClient::new("ftp://portal", Duration::from_secs(5)),
            Err(ApiError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_parse_refresh_body() {
        assert_eq!(PortalClient::parse_refresh_body("").unwrap(), None);
        assert_eq!(PortalClient::parse_refresh_body("null").unwrap(), None);

        let tokens = PortalClient::parse_refresh_body(
            r#"{"access_token":"a","expires_in":300,"refresh_expires_in":1800,"id_token":"i"}"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(tokens.access_token, "a");
        assert_eq!(tokens.id_token.as_deref(), Some("i"));

        assert!(matches!(
            PortalClient::parse_refresh_body(r#"{"access_token":1}"#),
            Err(ApiError::InvalidResponse(_))
        ));
    }

    fn memory_storage() -> Arc<MemoryStorage> {
        Arc::new(MemoryStorage::new())
    }

    #[test]
    fn test_imported_cookie_is_saved_and_restored() {
        let storage = memory_storage();
        let client = PortalClient::new("https://portal.example.com", Duration::from_secs(5))
            .unwrap()
            .with_cookie_storage(storage.clone());
        assert_eq!(client.cookie_header(), None);

        client.import_cookies("refresh_token=abc; other=1");
        let saved = storage.get(PORTAL_COOKIES_KEY).unwrap().unwrap();
        assert!(saved.contains("refresh_token=abc"));
        assert!(saved.contains("other=1"));

        // A later process starts from the saved jar
        let restored = PortalClient::new("https://portal.example.com", Duration::from_secs(5))
            .unwrap()
            .with_cookie_storage(storage.clone());
        let header_value = restored.cookie_header().unwrap();
        assert!(header_value.contains("refresh_token=abc"));
    }

    #[test]
    fn test_forget_cookies_clears_storage() {
        let storage = memory_storage();
        storage.set(PORTAL_COOKIES_KEY, "refresh_token=abc").unwrap();
        let client = PortalClient::new("https://portal.example.com", Duration::from_secs(5))
            .unwrap()
            .with_cookie_storage(storage.clone());

        client.forget_cookies();
        assert!(storage.is_empty());
    }

    #[test]
    fn test_cookies_stay_in_memory_without_storage() {
        let client = PortalClient::new("http://localhost:3000", Duration::from_secs(5)).unwrap();
        client.import_cookies("refresh_token=xyz");
        assert_eq!(client.cookie_header().as_deref(), Some("refresh_token=xyz"));
    }

    #[test]
    fn test_logout_request_omits_missing_hint() {
        let json = serde_json::to_string(&LogoutRequest { id_token_hint: None }).unwrap();
        assert_eq!(json, "{}");
        let json = serde_json::to_string(&LogoutRequest { id_token_hint: Some("t") }).unwrap();
        assert_eq!(json, r#"{"id_token_hint":"t"}"#);
    }
}
