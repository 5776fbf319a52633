use std::sync::Arc;
use std::time::Duration;

use reqwest::{header, Client, Method, Url};
use tracing::debug;

use super::{ClientFactory, DeviceError, ProtocolClient};
use crate::config::Scheme;

const TD_ACCEPT: &str = "application/td+json, application/json";

/// HTTP binding backed by a shared reqwest client.
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    pub fn new(timeout: Duration) -> Result<Self, DeviceError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    async fn send(&self, url: &Url, request: reqwest::RequestBuilder) -> Result<Vec<u8>, DeviceError> {
        let response = request.send().await?;
        let status = response.status();
        debug!(%url, %status, "HTTP reply");
        if !status.is_success() {
            return Err(DeviceError::Status {
                url: url.to_string(),
                code: status.to_string(),
            });
        }
        Ok(response.bytes().await?.to_vec())
    }
}

#[async_trait::async_trait]
impl ProtocolClient for HttpClient {
    async fn read_resource(&self, url: &Url) -> Result<Vec<u8>, DeviceError> {
        let request = self.client.get(url.clone()).header(header::ACCEPT, TD_ACCEPT);
        self.send(url, request).await
    }

    async fn invoke_resource(
        &self,
        url: &Url,
        method: Option<&str>,
        content_type: &str,
        body: Vec<u8>,
    ) -> Result<Vec<u8>, DeviceError> {
        let method = match method {
            Some(m) => Method::from_bytes(m.to_ascii_uppercase().as_bytes()).map_err(|_| {
                DeviceError::InvalidUrl {
                    url: url.to_string(),
                    reason: format!("unknown HTTP method '{m}'"),
                }
            })?,
            None => Method::POST,
        };
        let request = self
            .client
            .request(method, url.clone())
            .header(header::CONTENT_TYPE, content_type)
            .body(body);
        self.send(url, request).await
    }
}

pub struct HttpClientFactory {
    timeout: Duration,
}

impl HttpClientFactory {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait::async_trait]
impl ClientFactory for HttpClientFactory {
    fn scheme(&self) -> Scheme {
        Scheme::Http
    }

    async fn create(&self) -> Result<Arc<dyn ProtocolClient>, DeviceError> {
        Ok(Arc::new(HttpClient::new(self.timeout)?))
    }
}
