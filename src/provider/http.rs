//! JSON resource API adapter.
//!
//! Each kind is served under `/v1/{kind}`:
//!
//! | Call     | Request                          | Success             |
//! |----------|----------------------------------|---------------------|
//! | describe | `GET /v1/{kind}/{handle}`        | `{"attributes": …}` |
//! | create   | `POST /v1/{kind}`                | `{"handle": "…"}`   |
//! | update   | `PATCH /v1/{kind}/{handle}`      | any 2xx             |
//! | delete   | `DELETE /v1/{kind}/{handle}`     | any 2xx or 404      |
//!
//! Creates carry an `Idempotency-Key` header (also sent as `client_token` in
//! the body) that stays the same across retries of one create.

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode, Url, header};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{ConfigError, ProviderError, Result};
use crate::graph::{Attributes, ResourceId, ResourceKind};
use crate::planner::AttributeDiff;

use super::ProviderSettings;
use super::adapter::{Observed, ProviderAdapter};

/// Header carrying the create token.
const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// Adapter for one kind of the HTTP resource API.
#[derive(Debug, Clone)]
pub struct HttpAdapter {
    client: Client,
    base: Url,
    kind: ResourceKind,
    api_token: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateRequest<'a> {
    name: &'a str,
    client_token: &'a str,
    attributes: &'a Attributes,
}

#[derive(Debug, Serialize)]
struct UpdateRequest<'a> {
    changes: &'a AttributeDiff,
    attributes: &'a Attributes,
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    handle: String,
}

#[derive(Debug, Deserialize)]
struct DescribeResponse {
    #[serde(default)]
    attributes: Attributes,
}

impl HttpAdapter {
    /// Creates an adapter for `kind`.
    ///
    /// # Errors
    ///
    /// Returns an error if no endpoint is configured, the endpoint is not a
    /// valid base URL, or the HTTP client cannot be created.
    pub fn new(kind: ResourceKind, settings: &ProviderSettings) -> Result<Self> {
        let endpoint = settings.endpoint.as_deref().ok_or_else(|| {
            ConfigError::validation("http provider requires an endpoint", "provider.endpoint")
        })?;
        let base = Url::parse(endpoint)
            .ok()
            .filter(|url| !url.cannot_be_a_base())
            .ok_or_else(|| {
                ConfigError::validation(
                    format!("Invalid endpoint URL: {endpoint}"),
                    "provider.endpoint",
                )
            })?;

        let client = Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| ProviderError::fatal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base,
            kind,
            api_token: settings.api_token.clone(),
        })
    }

    fn url(&self, handle: Option<&str>) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend(["v1", self.kind.as_str()]);
            if let Some(handle) = handle {
                segments.push(handle);
            }
        }
        url
    }

    fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, url)
            .header(header::ACCEPT, "application/json");
        match &self.api_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> std::result::Result<Response, ProviderError> {
        builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::retryable(format!("Request timed out: {e}"))
            } else {
                ProviderError::retryable(format!("Request failed: {e}"))
            }
        })
    }

    async fn check(response: Response) -> std::result::Result<Response, ProviderError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ProviderError::from_status(status.as_u16(), body))
    }
}

#[async_trait]
impl ProviderAdapter for HttpAdapter {
    fn kind(&self) -> ResourceKind {
        self.kind
    }

    async fn describe(&self, handle: &str) -> std::result::Result<Observed, ProviderError> {
        let url = self.url(Some(handle));
        trace!("GET {url}");

        let response = self.send(self.request(reqwest::Method::GET, url)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Observed::NotFound);
        }
        let body: DescribeResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::fatal(format!("Invalid describe response: {e}")))?;
        Ok(Observed::Found(body.attributes))
    }

    async fn create(
        &self,
        id: &ResourceId,
        desired: &Attributes,
        client_token: &str,
    ) -> std::result::Result<String, ProviderError> {
        let url = self.url(None);
        debug!("POST {url} for {id} (token {client_token})");

        let request = CreateRequest {
            name: &id.name,
            client_token,
            attributes: desired,
        };
        let builder = self
            .request(reqwest::Method::POST, url)
            .header(IDEMPOTENCY_KEY_HEADER, client_token)
            .json(&request);
        let response = self.send(builder).await?;
        // The backend accepted the token, so a retry returns the same handle.
        let body: CreateResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::retryable(format!("Invalid create response: {e}")))?;
        Ok(body.handle)
    }

    async fn update(
        &self,
        handle: &str,
        diff: &AttributeDiff,
        desired: &Attributes,
    ) -> std::result::Result<(), ProviderError> {
        let url = self.url(Some(handle));
        debug!("PATCH {url} ({} field(s))", diff.len());

        let request = UpdateRequest {
            changes: diff,
            attributes: desired,
        };
        let response = self
            .send(self.request(reqwest::Method::PATCH, url).json(&request))
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn delete(&self, handle: &str) -> std::result::Result<(), ProviderError> {
        let url = self.url(Some(handle));
        debug!("DELETE {url}");

        let response = self.send(self.request(reqwest::Method::DELETE, url)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::AttrValue;
    use crate::provider::RetryPolicy;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, header, method, path, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter(server: &MockServer, kind: ResourceKind) -> HttpAdapter {
        let settings = ProviderSettings {
            account_id: String::from("000000000000"),
            region: String::from("us-east-1"),
            endpoint: Some(server.uri()),
            timeout: Duration::from_secs(5),
            api_token: Some(String::from("secret")),
        };
        HttpAdapter::new(kind, &settings).expect("adapter")
    }

    #[test]
    fn test_handle_is_a_single_path_segment() {
        let settings = ProviderSettings {
            endpoint: Some(String::from("http://localhost:9000/api/")),
            ..ProviderSettings::sandbox("000000000000", "us-east-1")
        };
        let adapter = HttpAdapter::new(ResourceKind::Network, &settings).expect("adapter");
        let url = adapter.url(Some("arn:aws:ec2:us-east-1:000000000000:vpc/main"));
        assert_eq!(
            url.path(),
            "/api/v1/network/arn:aws:ec2:us-east-1:000000000000:vpc%2Fmain"
        );
    }

    #[test]
    fn test_invalid_endpoint_rejected() {
        let settings = ProviderSettings {
            endpoint: Some(String::from("not a url")),
            ..ProviderSettings::sandbox("000000000000", "us-east-1")
        };
        assert!(HttpAdapter::new(ResourceKind::Network, &settings).is_err());
    }

    #[tokio::test]
    async fn test_create_posts_name_and_attributes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/managed_cluster"))
            .and(header("authorization", "Bearer secret"))
            .and(header("idempotency-key", "tok-1"))
            .and(body_partial_json(json!({
                "name": "ray",
                "client_token": "tok-1",
                "attributes": {"version": "1.29"}
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"handle": "cl-123"})))
            .expect(1)
            .mount(&server)
            .await;

        let attrs = Attributes::from([(String::from("version"), AttrValue::from("1.29"))]);
        let handle = adapter(&server, ResourceKind::ManagedCluster)
            .create(&ResourceId::new(ResourceKind::ManagedCluster, "ray"), &attrs, "tok-1")
            .await
            .expect("create");
        assert_eq!(handle, "cl-123");
    }

    #[tokio::test]
    async fn test_retried_create_reuses_idempotency_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/network"))
            .respond_with(
                ResponseTemplate::new(201)
                    .set_body_json(json!({"handle": "vpc-1"}))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let policy = RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            call_timeout: Duration::from_millis(200),
            visibility_timeout: Duration::from_millis(200),
        };
        let adapter = adapter(&server, ResourceKind::Network);
        let id = ResourceId::new(ResourceKind::Network, "vpc");
        let attrs = Attributes::new();
        let token = uuid::Uuid::new_v4().to_string();

        let outcome = policy
            .run("create network/vpc", || adapter.create(&id, &attrs, &token))
            .await;
        assert_eq!(outcome.attempts, 3);
        assert!(outcome.result.is_err());

        let requests = server.received_requests().await.expect("recorded requests");
        let posts: Vec<_> = requests
            .iter()
            .filter(|r| r.method.as_str() == "POST")
            .collect();
        assert_eq!(posts.len(), 3);
        for post in posts {
            let key = post
                .headers
                .get("idempotency-key")
                .and_then(|v| v.to_str().ok());
            assert_eq!(key, Some(token.as_str()));
            let body: serde_json::Value = serde_json::from_slice(&post.body).expect("json body");
            assert_eq!(body["client_token"], token.as_str());
        }
    }

    #[tokio::test]
    async fn test_undecodable_create_response_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/network"))
            .respond_with(ResponseTemplate::new(201).set_body_string("accepted"))
            .mount(&server)
            .await;

        let err = adapter(&server, ResourceKind::Network)
            .create(&ResourceId::new(ResourceKind::Network, "vpc"), &Attributes::new(), "tok-2")
            .await
            .expect_err("not json");
        assert!(err.retryable);
    }

    #[tokio::test]
    async fn test_describe_maps_404_to_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/network/vpc-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"attributes": {"cidr": "10.0.0.0/16"}})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/network/vpc-2"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let adapter = adapter(&server, ResourceKind::Network);
        let found = adapter.describe("vpc-1").await.expect("describe");
        assert_eq!(
            found.attributes().and_then(|a| a.get("cidr")),
            Some(&AttrValue::from("10.0.0.0/16"))
        );
        assert_eq!(adapter.describe("vpc-2").await, Ok(Observed::NotFound));
    }

    #[tokio::test]
    async fn test_status_classification() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path_regex("^/v1/node_group/.+$"))
            .respond_with(ResponseTemplate::new(503).set_body_string("try later"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/node_group"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad instance type"))
            .mount(&server)
            .await;

        let adapter = adapter(&server, ResourceKind::NodeGroup);
        let err = adapter
            .update("ng-1", &AttributeDiff::default(), &Attributes::new())
            .await
            .expect_err("503");
        assert!(err.retryable);
        assert_eq!(err.status, Some(503));

        let err = adapter
            .create(&ResourceId::new(ResourceKind::NodeGroup, "ng"), &Attributes::new(), "tok-3")
            .await
            .expect_err("400");
        assert!(!err.retryable);
        assert!(err.cause.contains("bad instance type"));
    }

    #[tokio::test]
    async fn test_delete_tolerates_missing() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        adapter(&server, ResourceKind::IdentityRole)
            .delete("role-1")
            .await
            .expect("delete");
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_retryable() {
        let settings = ProviderSettings {
            endpoint: Some(String::from("http://127.0.0.1:1")),
            timeout: Duration::from_secs(2),
            ..ProviderSettings::sandbox("000000000000", "us-east-1")
        };
        let err = HttpAdapter::new(ResourceKind::Network, &settings)
            .expect("adapter")
            .describe("vpc-1")
            .await
            .expect_err("unreachable");
        assert!(err.retryable);
    }
}
