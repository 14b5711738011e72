//! JSON-over-HTTP helper shared by the backends.

use std::time::Duration;

use reqwest::header::HeaderMap;
use serde::{Serialize, de::DeserializeOwned};

use crate::error::{BackendError, Result};

/// Longest error body echoed back in a `Connection` error.
const MAX_ERROR_BODY: usize = 200;

/// At most `max` characters of `text`.
fn clip(text: &str, max: usize) -> &str {
    text.char_indices().nth(max).map_or(text, |(end, _)| &text[..end])
}

/// Thin wrapper around `reqwest::Client` with timeout-aware error mapping.
#[derive(Clone)]
pub(crate) struct HttpClient {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpClient {
    pub(crate) fn new(timeout: Duration, headers: HeaderMap) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| BackendError::Validation(format!("cannot build HTTP client: {e}")))?;
        Ok(Self { client, timeout })
    }

    fn map_err(&self, err: &reqwest::Error) -> BackendError {
        BackendError::from_reqwest(err, self.timeout)
    }

    async fn decode<T: DeserializeOwned>(&self, what: &str, response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Connection(format!(
                "{what} returned {status}: {}",
                clip(&body, MAX_ERROR_BODY).trim()
            )));
        }
        response.json::<T>().await.map_err(|e| self.map_err(&e))
    }

    pub(crate) async fn get_json<T, Q>(&self, url: &str, query: &Q) -> Result<T>
    where
        T: DeserializeOwned,
        Q: Serialize + ?Sized,
    {
        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|e| self.map_err(&e))?;
        self.decode(&format!("GET {url}"), response).await
    }

    pub(crate) async fn post_json<T, B>(&self, url: &str, body: &B) -> Result<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| self.map_err(&e))?;
        self.decode(&format!("POST {url}"), response).await
    }

    /// GET that treats any non-success status as a connection error.
    pub(crate) async fn probe(&self, url: &str) -> Result<reqwest::Response> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| self.map_err(&e))?;
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(BackendError::Connection(format!(
                "GET {url} returned {}",
                response.status()
            )))
        }
    }
}
