//! HTTP client for the Shaken Fist REST API

use std::time::Duration;

use reqwest::{Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{ClientError, Result};
use crate::types::{
    ApiErrorBody, AuthRequest, AuthResponse, CreateInstance, CreateKeyRequest,
    CreateNamespaceRequest, CreateNetwork, DeleteAllRequest, Instance, Network,
};

/// Per-request timeout
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Authenticated client bound to one namespace and key.
///
/// Access tokens are fetched lazily on the first request and refreshed once
/// when the API answers 401.
pub struct Client {
    http: reqwest::Client,
    base_url: String,
    namespace: String,
    key: String,
    token: Mutex<Option<String>>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("base_url", &self.base_url)
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Create a client for `base_url` (e.g. `https://sf.example.com/api`)
    pub fn new(base_url: &str, namespace: &str, key: &str) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self::with_http(http, base_url, namespace, key))
    }

    fn with_http(http: reqwest::Client, base_url: &str, namespace: &str, key: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            namespace: namespace.to_string(),
            key: key.to_string(),
            token: Mutex::new(None),
        }
    }

    /// A client for another namespace that shares this client's connection pool
    pub fn scoped(&self, namespace: &str, key: &str) -> Self {
        Self::with_http(self.http.clone(), &self.base_url, namespace, key)
    }

    /// Namespace this client authenticates as
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn authenticate(&self) -> Result<String> {
        debug!(namespace = %self.namespace, "Requesting access token");
        let resp = self
            .http
            .post(self.url("auth"))
            .json(&AuthRequest {
                namespace: &self.namespace,
                key: &self.key,
            })
            .send()
            .await?;
        let resp = check_status(Method::POST, "auth", resp).await?;
        let auth: AuthResponse = resp.json().await?;
        *self.token.lock().await = Some(auth.access_token.clone());
        Ok(auth.access_token)
    }

    async fn access_token(&self) -> Result<String> {
        if let Some(token) = self.token.lock().await.clone() {
            return Ok(token);
        }
        self.authenticate().await
    }

    async fn send(
        &self,
        method: &Method,
        path: &str,
        body: Option<&serde_json::Value>,
        token: &str,
    ) -> Result<Response> {
        let mut req = self
            .http
            .request(method.clone(), self.url(path))
            .bearer_auth(token);
        if let Some(body) = body {
            req = req.json(body);
        }
        Ok(req.send().await?)
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<Response> {
        let token = self.access_token().await?;
        let resp = self.send(&method, path, body.as_ref(), &token).await?;

        let resp = if resp.status() == StatusCode::UNAUTHORIZED {
            debug!(namespace = %self.namespace, "Access token rejected, re-authenticating");
            let token = self.authenticate().await?;
            self.send(&method, path, body.as_ref(), &token).await?
        } else {
            resp
        };

        check_status(method, path, resp).await
    }

    async fn request_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<T> {
        Ok(self.request(method, path, body).await?.json().await?)
    }

    // ── Namespaces ──────────────────────────────────────────────────────

    pub async fn create_namespace(&self, namespace: &str) -> Result<()> {
        let body = to_body(&CreateNamespaceRequest { namespace })?;
        self.request(Method::POST, "auth/namespaces", Some(body)).await?;
        Ok(())
    }

    pub async fn delete_namespace(&self, namespace: &str) -> Result<()> {
        self.request(Method::DELETE, &format!("auth/namespaces/{namespace}"), None)
            .await?;
        Ok(())
    }

    pub async fn create_namespace_key(&self, namespace: &str, key_name: &str, key: &str) -> Result<()> {
        let body = to_body(&CreateKeyRequest { key_name, key })?;
        self.request(
            Method::POST,
            &format!("auth/namespaces/{namespace}/keys"),
            Some(body),
        )
        .await?;
        Ok(())
    }

    pub async fn delete_namespace_key(&self, namespace: &str, key_name: &str) -> Result<()> {
        self.request(
            Method::DELETE,
            &format!("auth/namespaces/{namespace}/keys/{key_name}"),
            None,
        )
        .await?;
        Ok(())
    }

    // ── Networks ────────────────────────────────────────────────────────

    pub async fn create_network(&self, req: &CreateNetwork) -> Result<Network> {
        self.request_json(Method::POST, "networks", Some(to_body(req)?))
            .await
    }

    pub async fn delete_network(&self, network_uuid: &str) -> Result<()> {
        self.request(Method::DELETE, &format!("networks/{network_uuid}"), None)
            .await?;
        Ok(())
    }

    /// Delete every network in `namespace`, returning the UUIDs queued for deletion
    pub async fn delete_all_networks(&self, namespace: &str) -> Result<Vec<String>> {
        let body = to_body(&DeleteAllRequest {
            confirm: true,
            namespace,
        })?;
        self.request_json(Method::DELETE, "networks", Some(body)).await
    }

    // ── Instances ───────────────────────────────────────────────────────

    pub async fn create_instance(&self, req: &CreateInstance) -> Result<Instance> {
        self.request_json(Method::POST, "instances", Some(to_body(req)?))
            .await
    }

    pub async fn delete_instance(&self, instance_uuid: &str) -> Result<()> {
        self.request(Method::DELETE, &format!("instances/{instance_uuid}"), None)
            .await?;
        Ok(())
    }

    /// Delete every instance in `namespace`, returning the UUIDs queued for deletion
    pub async fn delete_all_instances(&self, namespace: &str) -> Result<Vec<String>> {
        let body = to_body(&DeleteAllRequest {
            confirm: true,
            namespace,
        })?;
        self.request_json(Method::DELETE, "instances", Some(body)).await
    }
}

fn to_body<T: Serialize>(value: &T) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(value)?)
}

/// Turn a non-success response into `ClientError::Api`
async fn check_status(method: Method, path: &str, resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let text = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ApiErrorBody>(&text)
        .map(|b| b.error)
        .unwrap_or_else(|_| {
            if text.trim().is_empty() {
                status.canonical_reason().unwrap_or("unknown error").to_string()
            } else {
                text.trim().to_string()
            }
        });

    Err(ClientError::Api {
        method: method.to_string(),
        path: path.to_string(),
        status: status.as_u16(),
        message,
    })
}
