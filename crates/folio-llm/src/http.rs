//! Shared HTTP client construction for consistent timeout and TLS configuration.

use std::time::Duration;

/// Create a shared HTTP client with standard Folio configuration.
///
/// Config: 30s connect timeout, `request_timeout` per request, rustls TLS,
/// `folio/{version}` user-agent, redirect limit 10.
#[must_use]
pub fn client_with_timeout(request_timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .timeout(request_timeout)
        .user_agent(concat!("folio/", env!("CARGO_PKG_VERSION")))
        .redirect(reqwest::redirect::Policy::limited(10))
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!("HTTP client builder failed, using defaults: {e}");
            reqwest::Client::new()
        })
}

#[must_use]
pub fn default_client() -> reqwest::Client {
    client_with_timeout(Duration::from_secs(60))
}
