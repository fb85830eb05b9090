//! Out-of-process provider plugin client.
//!
//! A plugin is a separate process serving a small JSON protocol over HTTP:
//!
//! | Call               | Request                     | Response               |
//! |--------------------|-----------------------------|------------------------|
//! | initialize         | `POST /initialize`          | `ProviderMetadata`     |
//! | schemas            | `GET /schema`               | `[ResourceSchema]`     |
//! | create             | `POST /resources` (spec)    | `Resource`             |
//! | update             | `PUT /resources/{id}` (spec)| `Resource`             |
//! | delete             | `DELETE /resources/{id}`    | empty                  |
//! | get                | `GET /resources/{id}`       | `Resource`             |
//! | shutdown           | `POST /shutdown`            | empty                  |
//!
//! A misbehaving plugin can only fail its own calls; it never shares memory
//! with the orchestrator.

use async_trait::async_trait;
use reqwest::{header, Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::config::ResourceSpec;
use crate::error::{DeployError, ProviderError, Result};

use super::contract::{Provider, ProviderMetadata, Resource};
use super::schema::ResourceSchema;

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Maximum number of attempts for transient failures.
const MAX_RETRIES: u32 = 3;

/// Delay between retries in milliseconds, multiplied by the attempt number.
const RETRY_DELAY_MS: u64 = 500;

/// Upper bound honoured for a plugin's `retry-after` header.
const MAX_RETRY_AFTER_SECS: u64 = 30;

/// A failed request, and whether the plugin may have acted on it.
struct Attempt {
    error: DeployError,
    delivered: bool,
}

impl Attempt {
    fn sent(error: impl Into<DeployError>) -> Self {
        Self {
            error: error.into(),
            delivered: true,
        }
    }
}

/// HTTP plugin client.
#[derive(Debug)]
pub struct HttpProvider {
    name: String,
    endpoint: String,
    token: Option<String>,
    client: Client,
    retry_delay: Duration,
    schemas: RwLock<BTreeMap<String, ResourceSchema>>,
}

impl HttpProvider {
    /// Creates a plugin client for `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(name: &str, endpoint: &str, token: Option<String>) -> Result<Self> {
        Self::with_timeout(name, endpoint, token, DEFAULT_TIMEOUT_SECS)
    }

    /// Creates a plugin client with a custom request timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn with_timeout(
        name: &str,
        endpoint: &str,
        token: Option<String>,
        timeout_secs: u64,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| ProviderError::network(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            name: name.to_string(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token,
            client,
            retry_delay: Duration::from_millis(RETRY_DELAY_MS),
            schemas: RwLock::new(BTreeMap::new()),
        })
    }

    /// Overrides the base retry delay.
    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Returns the plugin endpoint.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Sends a request, retrying transient failures.
    ///
    /// `POST /resources` is not idempotent: it is only replayed when the
    /// plugin never received it (connection refused) or refused it with 429.
    async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<&ResourceSpec>,
    ) -> Result<Option<serde_json::Value>> {
        let idempotent = !(method == Method::POST && path == "/resources");
        let mut last_error = None;

        for attempt in 0..MAX_RETRIES {
            if let Some(err) = &last_error {
                let delay = match err {
                    DeployError::Provider(ProviderError::RateLimited { retry_after_secs }) => {
                        Duration::from_secs((*retry_after_secs).min(MAX_RETRY_AFTER_SECS))
                    }
                    _ => self.retry_delay * attempt,
                };
                debug!(provider = %self.name, "Retry attempt {attempt} of {MAX_RETRIES}");
                tokio::time::sleep(delay).await;
            }

            match self.call_once(method.clone(), path, body).await {
                Ok(result) => return Ok(result),
                Err(Attempt { error, delivered })
                    if error.is_retryable() && (idempotent || !delivered) =>
                {
                    warn!(provider = %self.name, path, error = %error, "Plugin call failed, retrying");
                    last_error = Some(error);
                }
                Err(Attempt { error, .. }) => return Err(error),
            }
        }

        Err(last_error.unwrap_or_else(|| ProviderError::network("Max retries exceeded").into()))
    }

    /// Sends a single request.
    async fn call_once(
        &self,
        method: Method,
        path: &str,
        body: Option<&ResourceSpec>,
    ) -> std::result::Result<Option<serde_json::Value>, Attempt> {
        let url = format!("{}{path}", self.endpoint);
        trace!(%method, %url, "Plugin request");

        let mut request = self
            .client
            .request(method, &url)
            .header(header::ACCEPT, "application/json");
        if let Some(token) = &self.token {
            request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        if let Some(spec) = body {
            request = request.json(spec);
        }

        let response = request.send().await.map_err(|e| Attempt {
            delivered: !e.is_connect(),
            error: ProviderError::network(format!("Request failed: {e}")).into(),
        })?;

        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok())
                .unwrap_or(1);
            return Err(Attempt {
                error: ProviderError::RateLimited {
                    retry_after_secs: retry_after,
                }
                .into(),
                delivered: false,
            });
        }

        if status == StatusCode::NOT_FOUND && path.starts_with("/resources/") {
            let id = path.trim_start_matches("/resources/").to_string();
            return Err(Attempt::sent(ProviderError::ResourceNotFound { id }));
        }

        if status.is_server_error() && status != StatusCode::NOT_IMPLEMENTED {
            let body = response.text().await.unwrap_or_default();
            return Err(Attempt::sent(ProviderError::network(format!(
                "plugin returned {status}: {body}"
            ))));
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Attempt::sent(ProviderError::api_error(status.as_u16(), body)));
        }

        let bytes = response.bytes().await.map_err(|e| {
            Attempt::sent(ProviderError::network(format!("Failed to read response: {e}")))
        })?;
        if bytes.is_empty() {
            return Ok(None);
        }

        serde_json::from_slice(&bytes).map(Some).map_err(|e| {
            Attempt::sent(ProviderError::Rejected {
                message: format!("invalid plugin response: {e}"),
            })
        })
    }

    async fn call_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&ResourceSpec>,
    ) -> Result<T> {
        let value = self.call(method, path, body).await?.ok_or_else(|| {
            DeployError::from(ProviderError::Rejected {
                message: format!("empty plugin response for {path}"),
            })
        })?;

        serde_json::from_value(value).map_err(|e| {
            ProviderError::Rejected {
                message: format!("invalid plugin response for {path}: {e}"),
            }
            .into()
        })
    }
}

#[async_trait]
impl Provider for HttpProvider {
    fn metadata(&self) -> ProviderMetadata {
        ProviderMetadata {
            name: self.name.clone(),
            version: String::new(),
            provider_type: String::from("http"),
            description: format!("Plugin at {}", self.endpoint),
        }
    }

    fn schema(&self, resource_type: &str) -> Option<ResourceSchema> {
        self.schemas
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(resource_type)
            .cloned()
    }

    async fn initialize(&self) -> Result<()> {
        let init = |e: DeployError| ProviderError::InitializationFailed {
            provider: self.name.clone(),
            message: e.to_string(),
        };

        let metadata: ProviderMetadata = self
            .call_json(Method::POST, "/initialize", None)
            .await
            .map_err(init)?;
        let schemas: Vec<ResourceSchema> = self
            .call_json(Method::GET, "/schema", None)
            .await
            .map_err(init)?;

        let count = schemas.len();
        *self
            .schemas
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = schemas
            .into_iter()
            .map(|schema| (schema.resource_type.clone(), schema))
            .collect();

        info!(
            provider = %self.name,
            plugin = %metadata.name,
            version = %metadata.version,
            schemas = count,
            "Plugin initialized"
        );
        Ok(())
    }

    async fn create_resource(&self, spec: &ResourceSpec) -> Result<Resource> {
        self.call_json(Method::POST, "/resources", Some(spec)).await
    }

    async fn update_resource(&self, id: &str, spec: &ResourceSpec) -> Result<Resource> {
        self.call_json(Method::PUT, &format!("/resources/{id}"), Some(spec))
            .await
    }

    async fn delete_resource(&self, id: &str) -> Result<()> {
        self.call(Method::DELETE, &format!("/resources/{id}"), None)
            .await
            .map(|_| ())
    }

    async fn get_resource(&self, id: &str) -> Result<Resource> {
        self.call_json(Method::GET, &format!("/resources/{id}"), None)
            .await
    }

    async fn shutdown(&self) -> Result<()> {
        self.call(Method::POST, "/shutdown", None).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> HttpProvider {
        HttpProvider::new("plugin", &server.uri(), Some(String::from("secret")))
            .expect("client")
            .with_retry_delay(Duration::from_millis(1))
    }

    fn resource_json(id: &str) -> serde_json::Value {
        json!({
            "id": id,
            "type": "bucket",
            "name": "assets",
            "properties": { "versioned": true },
            "status": "running"
        })
    }

    #[tokio::test]
    async fn test_initialize_loads_schemas() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/initialize"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"name": "s3-plugin"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/schema"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"type": "bucket", "fields": {"versioned": {"kind": "bool"}}}
            ])))
            .mount(&server)
            .await;

        let provider = client(&server);
        assert!(provider.schema("bucket").is_none());

        provider.initialize().await.expect("initialize");
        let schema = provider.schema("bucket").expect("schema");
        assert!(schema.fields.contains_key("versioned"));
    }

    #[tokio::test]
    async fn test_create_resource() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/resources"))
            .and(body_partial_json(json!({"name": "assets", "type": "bucket"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(resource_json("b-1")))
            .expect(1)
            .mount(&server)
            .await;

        let spec = ResourceSpec::new("assets", "bucket", "plugin").with_property("versioned", true);
        let resource = client(&server).create_resource(&spec).await.expect("create");

        assert_eq!(resource.id, "b-1");
        assert_eq!(resource.status, "running");
    }

    #[tokio::test]
    async fn test_rate_limit_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/resources/b-1"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/resources/b-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(resource_json("b-1")))
            .mount(&server)
            .await;

        let resource = client(&server).get_resource("b-1").await.expect("get");
        assert_eq!(resource.name, "assets");
    }

    #[tokio::test]
    async fn test_create_is_not_replayed_after_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/resources"))
            .respond_with(ResponseTemplate::new(502).set_body_string("upstream reset"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/resources/b-1"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let provider = client(&server);
        let spec = ResourceSpec::new("assets", "bucket", "plugin");

        let err = provider.create_resource(&spec).await.expect_err("502");
        assert!(err.to_string().contains("upstream reset"));

        provider.update_resource("b-1", &spec).await.expect_err("500");
        server.verify().await;
    }

    #[tokio::test]
    async fn test_rate_limited_create_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/resources"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/resources"))
            .respond_with(ResponseTemplate::new(201).set_body_json(resource_json("b-2")))
            .expect(1)
            .mount(&server)
            .await;

        let spec = ResourceSpec::new("assets", "bucket", "plugin");
        let resource = client(&server).create_resource(&spec).await.expect("create");
        assert_eq!(resource.id, "b-2");
    }

    #[tokio::test]
    async fn test_not_found_and_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/resources/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/resources"))
            .respond_with(ResponseTemplate::new(422).set_body_string("bucket name taken"))
            .expect(1)
            .mount(&server)
            .await;

        let provider = client(&server);

        let err = provider.delete_resource("gone").await.expect_err("404");
        assert!(matches!(
            err,
            DeployError::Provider(ProviderError::ResourceNotFound { .. })
        ));

        let spec = ResourceSpec::new("assets", "bucket", "plugin");
        let err = provider.create_resource(&spec).await.expect_err("422");
        assert!(matches!(
            err,
            DeployError::Provider(ProviderError::ApiRequestFailed { status: 422, .. })
        ));
        assert!(err.to_string().contains("bucket name taken"));
    }

    #[tokio::test]
    async fn test_unreachable_plugin() {
        let provider = HttpProvider::new("plugin", "http://127.0.0.1:1", None)
            .expect("client")
            .with_retry_delay(Duration::from_millis(1));

        let err = provider.initialize().await.expect_err("unreachable");
        assert!(matches!(
            err,
            DeployError::Provider(ProviderError::InitializationFailed { .. })
        ));
    }
}
