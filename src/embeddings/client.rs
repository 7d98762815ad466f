//! Client for OpenAI-compatible embedding endpoints.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use super::Embedder;
use crate::error::EmbeddingError;
use crate::{Error, Result};

/// Longest response body quoted in an error.
const MAX_ERROR_BODY: usize = 200;

/// Embeds text by calling a remote `/embeddings` endpoint.
#[derive(Debug, Clone)]
pub struct HttpEmbedder {
    client: Client,
    endpoint: String,
    model: String,
    dimension: usize,
}

impl HttpEmbedder {
    /// Build a client for `base_url`. `/embeddings` is appended unless the
    /// URL already ends with it.
    ///
    /// # Errors
    ///
    /// Returns an error if the model is empty, the key is not a valid header
    /// value, or the HTTP client cannot be built.
    pub fn new(
        base_url: &str,
        model: &str,
        api_key: Option<&str>,
        dimension: usize,
        timeout: Duration,
    ) -> Result<Self> {
        if model.trim().is_empty() {
            return Err(Error::config("embedding model name is empty"));
        }

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = api_key.map(str::trim).filter(|k| !k.is_empty()) {
            let value = HeaderValue::from_str(&format!("Bearer {key}"))
                .map_err(|_| Error::config("embedding API key is not a valid header value"))?;
            headers.insert(AUTHORIZATION, value);
        }

        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| Error::config(format!("failed to build embedding HTTP client: {e}")))?;

        let base = base_url.trim_end_matches('/');
        let endpoint = if base.ends_with("/embeddings") {
            base.to_string()
        } else {
            format!("{base}/embeddings")
        };

        Ok(Self {
            client,
            endpoint,
            model: model.to_string(),
            dimension,
        })
    }

    /// Full endpoint URL.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: [&'a str; 1],
    dimensions: usize,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

fn classify_send_error(err: &reqwest::Error) -> EmbeddingError {
    if err.is_builder() {
        EmbeddingError::Permanent(err.to_string())
    } else {
        EmbeddingError::Transient(err.to_string())
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, EmbeddingError> {
        let request = EmbeddingRequest {
            model: &self.model,
            input: [text],
            dimensions: self.dimension,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| classify_send_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            let body: String = body.chars().take(MAX_ERROR_BODY).collect();
            let message = format!("embedding request failed ({status}): {body}");
            return Err(if is_retryable_status(status) {
                EmbeddingError::Transient(message)
            } else {
                EmbeddingError::Permanent(message)
            });
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::Permanent(format!("malformed embedding response: {e}")))?;

        parsed
            .data
            .into_iter()
            .next()
            .map(|entry| entry.embedding)
            .ok_or_else(|| EmbeddingError::Permanent("embedding response contained no data".to_string()))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}/v1")
    }

    fn client(url: &str) -> HttpEmbedder {
        HttpEmbedder::new(url, "test-model", Some("secret"), 3, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_embed_success() {
        let router = Router::new().route(
            "/v1/embeddings",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["model"], "test-model");
                assert_eq!(body["input"][0], "hello");
                assert_eq!(body["dimensions"], 3);
                Json(json!({"data": [{"embedding": [0.1, 0.2, 0.3], "index": 0}]}))
            }),
        );
        let url = serve(router).await;

        let vector = client(&url).embed("hello").await.unwrap();
        assert_eq!(vector, vec![0.1, 0.2, 0.3]);
    }

    #[tokio::test]
    async fn test_rate_limit_is_transient() {
        let router = Router::new().route(
            "/v1/embeddings",
            post(|| async { (AxumStatus::TOO_MANY_REQUESTS, "slow down") }),
        );
        let url = serve(router).await;

        let err = client(&url).embed("hello").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_bad_request_is_permanent() {
        let router = Router::new().route(
            "/v1/embeddings",
            post(|| async { (AxumStatus::BAD_REQUEST, "input too long") }),
        );
        let url = serve(router).await;

        let err = client(&url).embed("hello").await.unwrap_err();
        assert!(matches!(err, EmbeddingError::Permanent(ref msg) if msg.contains("input too long")));
    }

    #[tokio::test]
    async fn test_malformed_response_is_permanent() {
        let router = Router::new().route("/v1/embeddings", post(|| async { Json(json!({"oops": true})) }));
        let url = serve(router).await;

        let err = client(&url).embed("hello").await.unwrap_err();
        assert!(matches!(err, EmbeddingError::Permanent(_)));
    }

    #[tokio::test]
    async fn test_connection_refused_is_transient() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = client(&format!("http://{addr}")).embed("hello").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_endpoint_suffix() {
        assert_eq!(client("http://h/v1/").endpoint(), "http://h/v1/embeddings");
        assert_eq!(client("http://h/v1/embeddings").endpoint(), "http://h/v1/embeddings");
        assert!(HttpEmbedder::new("http://h", " ", None, 3, Duration::from_secs(1)).is_err());
    }
}
