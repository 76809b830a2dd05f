//! REST channel: direct methods and registry reads/writes.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;
use serde::Serialize;
use tracing::debug;
use url::Url;

use crate::config::ClientConfig;
use crate::credentials::{Credentials, TokenSource};
use crate::error::{Error, Result};
use crate::types::{CallOptions, Device, MethodResponse, Twin, whole_seconds};

const CONTENT_TYPE: &str = "application/json; charset=utf-8";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MethodCall<'a> {
    method_name: &'a str,
    #[serde(rename = "connectTimeoutInSeconds", skip_serializing_if = "Option::is_none")]
    connect_timeout: Option<u32>,
    #[serde(rename = "responseTimeoutInSeconds", skip_serializing_if = "Option::is_none")]
    response_timeout: Option<u32>,
    payload: &'a serde_json::Map<String, serde_json::Value>,
}

/// HTTPS client for the hub's REST API. Every request carries a freshly
/// minted token and a random request id. Clone is a cheap Arc refcount bump.
#[derive(Clone)]
pub struct RestClient {
    inner: Arc<Inner>,
}

struct Inner {
    client: reqwest::Client,
    base_url: Url,
    credentials: Credentials,
    tokens: Arc<dyn TokenSource>,
    token_ttl: Duration,
}

impl RestClient {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .timeout(config.timing.http_timeout)
            .build()?;
        let base_url = Url::parse(&config.rest_base_url())?;
        if base_url.cannot_be_a_base() {
            return Err(Error::Config(format!("invalid REST base url {base_url}")));
        }
        Ok(Self {
            inner: Arc::new(Inner {
                client,
                base_url,
                credentials: config.credentials.clone(),
                tokens: Arc::clone(&config.token_source),
                token_ttl: config.timing.token_ttl,
            }),
        })
    }

    /// Invoke `method_name` on `device_id` and return the device's response.
    pub async fn call(
        &self,
        device_id: &str,
        method_name: &str,
        payload: &serde_json::Map<String, serde_json::Value>,
        options: &CallOptions,
    ) -> Result<MethodResponse> {
        if device_id.is_empty() {
            return Err(Error::InvalidArgument("device id is empty".into()));
        }
        if method_name.is_empty() {
            return Err(Error::InvalidArgument("method name is empty".into()));
        }
        if payload.is_empty() {
            return Err(Error::InvalidArgument("payload is empty".into()));
        }
        options.validate()?;

        let body = MethodCall {
            method_name,
            connect_timeout: whole_seconds("connect_timeout", options.connect_timeout)?,
            response_timeout: whole_seconds("response_timeout", options.response_timeout)?,
            payload,
        };
        let bytes = self
            .request(Method::POST, &["twins", device_id, "methods"], Some(&body))
            .await?;
        let resp: MethodResponse = serde_json::from_slice(&bytes)?;
        debug!(device_id, method_name, status = resp.status, "direct method returned");
        Ok(resp)
    }

    pub async fn get_device(&self, device_id: &str) -> Result<Device> {
        if device_id.is_empty() {
            return Err(Error::InvalidArgument("device id is empty".into()));
        }
        let bytes = self
            .request::<()>(Method::GET, &["devices", device_id], None)
            .await?;
        let mut device: Device = serde_json::from_slice(&bytes)?;
        device.raw_json = bytes;
        Ok(device)
    }

    /// Patch the desired properties of a device twin.
    pub async fn update_twin(
        &self,
        device_id: &str,
        desired: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Twin> {
        if device_id.is_empty() {
            return Err(Error::InvalidArgument("device id is empty".into()));
        }
        let patch = serde_json::json!({ "properties": { "desired": desired } });
        let bytes = self
            .request(Method::PATCH, &["twins", device_id], Some(&patch))
            .await?;
        let mut twin: Twin = serde_json::from_slice(&bytes)?;
        twin.raw_json = bytes;
        Ok(twin)
    }

    /// Issue one request. `segments` are percent-encoded individually.
    async fn request<T: Serialize + ?Sized>(
        &self,
        method: Method,
        segments: &[&str],
        body: Option<&T>,
    ) -> Result<Vec<u8>> {
        let url = self.url(segments)?;
        let creds = &self.inner.credentials;
        let token = self
            .inner
            .tokens
            .sign(&creds.host_name, self.inner.token_ttl)
            .map_err(Error::Token)?;
        let request_id = uuid::Uuid::new_v4().to_string();

        debug!(%method, %url, %request_id, "REST request");
        let mut req = self
            .inner
            .client
            .request(method, url)
            .header(reqwest::header::AUTHORIZATION, token)
            .header("Request-Id", request_id)
            .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE);
        if let Some(body) = body {
            req = req.body(serde_json::to_vec(body)?);
        }

        let resp = req.send().await?;
        let status = resp.status();
        let bytes = resp.bytes().await?.to_vec();
        if status != reqwest::StatusCode::OK {
            return Err(Error::Rest {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }
        Ok(bytes)
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.inner.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| Error::Config(format!("invalid REST base url {}", self.inner.base_url)))?
            .pop_if_empty()
            .extend(segments);
        url.query_pairs_mut()
            .append_pair("api-version", &self.inner.credentials.api_version);
        Ok(url)
    }
}
