use anyhow::Context;
use lazy_static::lazy_static;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::StatusCode;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_tracing::TracingMiddleware;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error as ThisError;
use url::Url;

lazy_static! {
    // Exactly one request per call.
    static ref CLIENT: ClientWithMiddleware = ClientBuilder::new(reqwest::Client::new())
        .with(TracingMiddleware::default())
        .build();
}

pub struct HttpClient;

#[derive(ThisError, Debug)]
pub enum HttpClientError {
    #[error(transparent)]
    ResponseError(#[from] anyhow::Error),
    #[error("httpBuilderError {0}")]
    HTTPBuilderError(String),
    #[error("request to {url} was rejected with {status}: {body}")]
    UnsuccessfulStatus {
        url: Url,
        status: StatusCode,
        body: String,
    },
}

struct HeadersMapGenerator(HeaderMap);

impl HeadersMapGenerator {
    fn into_inner(self) -> HeaderMap {
        self.0
    }
}

impl TryFrom<HashMap<&'static str, String>> for HeadersMapGenerator {
    type Error = HttpClientError;

    fn try_from(value: HashMap<&'static str, String>) -> Result<Self, Self::Error> {
        let mut header_map = HeaderMap::new();

        for (key, value) in value.into_iter() {
            let value = HeaderValue::from_str(&value)
                .map_err(|err| HttpClientError::HTTPBuilderError(format!("{err} {key}")))?;
            header_map.insert(key, value);
        }
        Ok(Self(header_map))
    }
}

impl HttpClient {
    /// POSTs `body` as JSON. Any non-2xx answer is turned into
    /// [`HttpClientError::UnsuccessfulStatus`] carrying the raw response body,
    /// so callers can surface provider error details.
    #[tracing::instrument(skip(headers, body), level = "debug")]
    pub async fn post_json<DTO: DeserializeOwned>(
        url: Url,
        headers: HashMap<&'static str, String>,
        body: &(impl Serialize + ?Sized),
    ) -> Result<DTO, HttpClientError> {
        let generator = HeadersMapGenerator::try_from(headers)?;
        let header_map = generator.into_inner();
        let response = CLIENT
            .post(url.clone())
            .headers(header_map)
            .json(body)
            .send()
            .await
            .with_context(|| format!("Failed to send request to {url}"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HttpClientError::UnsuccessfulStatus { url, status, body });
        }

        response
            .json::<DTO>()
            .await
            .context("Failed to deserialize response")
            .map_err(HttpClientError::ResponseError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize, Debug)]
    struct Accepted {
        id: String,
    }

    #[tokio::test]
    async fn test_post_json_sends_headers_and_body() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/messages")
                    .header("authorization", "Bearer secret")
                    .json_body(json!({ "hello": "world" }));
                then.status(200)
                    .header("content-type", "application/json")
                    .json_body(json!({ "id": "abc" }));
            })
            .await;

        let url = Url::parse(&server.url("/messages")).unwrap();
        let headers = HashMap::from([("authorization", "Bearer secret".to_string())]);
        let response: Accepted = HttpClient::post_json(url, headers, &json!({ "hello": "world" }))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(response.id, "abc");
    }

    #[tokio::test]
    async fn test_client_errors_keep_the_response_body() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/messages");
                then.status(401).body(r#"{"error":{"message":"bad token"}}"#);
            })
            .await;

        let url = Url::parse(&server.url("/messages")).unwrap();
        let result = HttpClient::post_json::<Accepted>(url, HashMap::new(), &json!({})).await;

        match result {
            Err(HttpClientError::UnsuccessfulStatus { status, body, .. }) => {
                assert_eq!(status, StatusCode::UNAUTHORIZED);
                assert!(body.contains("bad token"));
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_server_errors_are_not_retried() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/messages");
                then.status(503).body("unavailable");
            })
            .await;

        let url = Url::parse(&server.url("/messages")).unwrap();
        let result = HttpClient::post_json::<Accepted>(url, HashMap::new(), &json!({})).await;

        assert!(matches!(
            result,
            Err(HttpClientError::UnsuccessfulStatus { status, .. }) if status == StatusCode::SERVICE_UNAVAILABLE
        ));
        assert_eq!(mock.hits_async().await, 1);
    }

    #[test]
    fn test_invalid_header_values_are_rejected() {
        let headers = HashMap::from([("authorization", "line\nbreak".to_string())]);
        assert!(HeadersMapGenerator::try_from(headers).is_err());
    }
}
