//! API client for the admin dashboard REST API.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{header, Client, RequestBuilder, Response};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use super::ApiError;
use crate::auth::SessionGuard;

/// HTTP request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// API client that authenticates every request with the guarded session token.
/// Clone is cheap - reqwest::Client and the guard are both shared.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    guard: Arc<SessionGuard>,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, guard: Arc<SessionGuard>) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into(),
            guard,
        })
    }

    pub fn guard(&self) -> &SessionGuard {
        &self.guard
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let request = self.client.get(self.url(path));
        let response = self.send(request).await?;
        Ok(response.json().await?)
    }

    pub async fn post_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let request = self.client.post(self.url(path)).json(body);
        let response = self.send(request).await?;
        Ok(response.json().await?)
    }

    pub async fn put_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let request = self.client.put(self.url(path)).json(body);
        let response = self.send(request).await?;
        Ok(response.json().await?)
    }

    pub async fn delete(&self, path: &str) -> Result<(), ApiError> {
        let request = self.client.delete(self.url(path));
        self.send(request).await?;
        Ok(())
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn auth_headers(&self) -> Result<header::HeaderMap, ApiError> {
        let token = self.guard.get_valid_token().ok_or(ApiError::Unauthorized)?;

        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            header::HeaderValue::from_str(&format!("Bearer {}", token))?,
        );
        headers.insert(header::CACHE_CONTROL, header::HeaderValue::from_static("no-store"));
        Ok(headers)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, ApiError> {
        let headers = self.auth_headers()?;
        let response = request.headers(headers).send().await?;
        debug!(url = %response.url(), status = %response.status(), "API response");
        self.check_response(response).await
    }

    /// Check if response is successful, returning an error with body if not.
    /// A 401 means the server no longer accepts the token, so the stored
    /// credential is cleared.
    async fn check_response(&self, response: Response) -> Result<Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let error = ApiError::from_status(status, &body);
        if matches!(error, ApiError::Unauthorized) {
            warn!("Server rejected the session token, clearing credentials");
            self.guard.clear_credentials();
        }
        Err(error)
    }
}
