//! # HTTP Retrieval Utilities
//!
//! An asynchronous API client around `reqwest` with exponential-backoff retry
//! middleware. It joins paths onto a base URL, attaches Basic credentials and
//! encodes form bodies. Non-2xx responses are not
//! errors at this layer: they come back as an [`ApiResponse`] with
//! `success == false` and the raw error body.

use std::time::Duration;

use base64::{engine::general_purpose, Engine as _};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, Url};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Failures that prevent an HTTP exchange from producing a response.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("failed to build http client: {0}")]
    Build(reqwest::Error),
    #[error("request failed: {0}")]
    Transport(#[from] reqwest_middleware::Error),
    #[error("failed to decode response body: {0}")]
    Decode(#[from] reqwest::Error),
}

/// A standardized container for API responses.
#[derive(Debug)]
pub struct ApiResponse<T> {
    /// The deserialized body of a successful response.
    pub data: Option<T>,
    /// The raw body returned by the server if the request failed.
    pub error_body: Option<String>,
    pub status: u16,
    /// Whether the status code was in the 2xx range.
    pub success: bool,
}

/// Credentials attached to a single request.
#[derive(Debug, Clone)]
pub enum Auth {
    Basic { username: String, password: String },
}

impl Auth {
    fn header_value(&self) -> String {
        match self {
            Auth::Basic { username, password } => format!(
                "Basic {}",
                general_purpose::STANDARD.encode(format!("{}:{}", username, password))
            ),
        }
    }
}

/// Request payloads supported by the client.
#[derive(Debug, Clone)]
pub enum RequestBody {
    /// `application/x-www-form-urlencoded` key/value pairs.
    Form(Vec<(String, String)>),
}

/// A flexible asynchronous HTTP client with automatic retries of transient failures.
pub struct ApiClient {
    inner: ClientWithMiddleware,
    base_url: Url,
}

impl ApiClient {
    /// Creates a client rooted at `base_url` with a request timeout and three retries.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        let base_url = Url::parse(base_url)?;
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(ApiError::Build)?;
        let inner = ClientBuilder::new(http)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self { inner, base_url })
    }

    /// Performs a request and deserializes a successful body into `T`.
    pub async fn request<T>(
        &self,
        method: Method,
        path: &str,
        auth: Option<&Auth>,
        body: Option<RequestBody>,
    ) -> Result<ApiResponse<T>, ApiError>
    where
        T: DeserializeOwned,
    {
        let full_url = self.base_url.join(path)?;
        let mut req = self.inner.request(method, full_url);

        if let Some(auth) = auth {
            req = req.header(AUTHORIZATION, auth.header_value());
        }

        if let Some(RequestBody::Form(pairs)) = body {
            let encoded = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                .finish();
            req = req
                .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(encoded);
        }

        let response: reqwest::Response = req.send().await?;
        let status = response.status();

        if status.is_success() {
            let data = response.json::<T>().await?;
            Ok(ApiResponse {
                data: Some(data),
                error_body: None,
                status: status.as_u16(),
                success: true,
            })
        } else {
            let error_body = response.text().await.ok();
            Ok(ApiResponse {
                data: None,
                error_body,
                status: status.as_u16(),
                success: false,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_auth_header_is_base64_encoded() {
        let auth = Auth::Basic {
            username: "client".into(),
            password: "secret".into(),
        };
        assert_eq!(auth.header_value(), "Basic Y2xpZW50OnNlY3JldA==");
    }

    #[test]
    fn relative_base_url_is_rejected() {
        assert!(matches!(
            ApiClient::new("not a url", Duration::from_secs(1)),
            Err(ApiError::Url(_))
        ));
    }
}
