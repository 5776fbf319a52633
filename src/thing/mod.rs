//! Web of Things consumer: fetch a Thing Description, bind it to a protocol
//! client and invoke its actions.

pub mod coap;
pub mod http;
pub mod runtime;

use std::collections::BTreeMap;
use std::sync::Arc;

use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::Scheme;

pub use coap::CoapClientFactory;
pub use http::HttpClientFactory;
pub use runtime::{ClientRuntime, ConsumedThing};

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("no client registered for scheme '{0}'")]
    UnsupportedScheme(String),

    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("CoAP transport error: {0}")]
    Coap(String),

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{url} answered with {code}")]
    Status { url: String, code: String },

    #[error("no reply from {url} within {secs}s")]
    Timeout { url: String, secs: u64 },

    #[error("thing '{thing}' has no action '{action}'")]
    UnknownAction { thing: String, action: String },

    #[error("action '{action}' has no form reachable over {schemes}")]
    NoForm { action: String, schemes: String },

    #[error("could not decode payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("client runtime has not been started")]
    NotStarted,
}

// ---------------------------------------------------------------------------
// Thing Description
// ---------------------------------------------------------------------------

/// The parts of a W3C Thing Description this client understands.
/// Anything else in the document is ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThingDescription {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub base: Option<String>,
    #[serde(default)]
    pub actions: BTreeMap<String, ActionAffordance>,
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionAffordance {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub forms: Vec<Form>,
}

/// A hypermedia control: where and how to perform an operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Form {
    pub href: String,
    #[serde(rename = "contentType", default)]
    pub content_type: Option<String>,
    /// A single operation type or a list of them.
    #[serde(default)]
    pub op: Option<serde_json::Value>,
    #[serde(rename = "htv:methodName", default)]
    pub method_name: Option<String>,
}

impl Form {
    /// Whether this form may be used for `op`. A form without `op` takes the
    /// default for its affordance and so accepts anything.
    pub fn supports(&self, op: &str) -> bool {
        match &self.op {
            None => true,
            Some(serde_json::Value::String(s)) => s == op,
            Some(serde_json::Value::Array(ops)) => ops.iter().any(|o| o.as_str() == Some(op)),
            Some(_) => false,
        }
    }

    pub fn content_type(&self) -> &str {
        self.content_type.as_deref().unwrap_or(JSON_CONTENT_TYPE)
    }
}

pub const JSON_CONTENT_TYPE: &str = "application/json";

impl ThingDescription {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, DeviceError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

// ---------------------------------------------------------------------------
// Protocol bindings
// ---------------------------------------------------------------------------

/// One protocol binding, able to read resources and invoke actions.
#[async_trait::async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Retrieve the resource at `url`.
    async fn read_resource(&self, url: &Url) -> Result<Vec<u8>, DeviceError>;

    /// Submit `body` to `url`. `method` is a binding-specific verb from the
    /// form; `None` means the binding's default for action invocation.
    async fn invoke_resource(
        &self,
        url: &Url,
        method: Option<&str>,
        content_type: &str,
        body: Vec<u8>,
    ) -> Result<Vec<u8>, DeviceError>;
}

/// Produces the client for one URL scheme when the runtime starts.
#[async_trait::async_trait]
pub trait ClientFactory: Send + Sync {
    fn scheme(&self) -> Scheme;

    async fn create(&self) -> Result<Arc<dyn ProtocolClient>, DeviceError>;
}

// ---------------------------------------------------------------------------
// Consumer seams
// ---------------------------------------------------------------------------

/// A live handle able to invoke named actions on a remote Thing.
#[async_trait::async_trait]
pub trait ActionInvoker: Send + Sync + 'static {
    async fn invoke_action(
        &self,
        name: &str,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, DeviceError>;
}

/// Discovers a Thing and turns its description into an [`ActionInvoker`].
#[async_trait::async_trait]
pub trait DeviceConnector: Send + Sync {
    type Thing: ActionInvoker;

    async fn fetch_description(&self, url: &str) -> Result<ThingDescription, DeviceError>;

    /// Bring up the protocol clients.
    async fn start(&self) -> Result<(), DeviceError>;

    async fn consume(&self, td: ThingDescription, url: &str) -> Result<Self::Thing, DeviceError>;
}

pub(crate) fn parse_url(url: &str) -> Result<Url, DeviceError> {
    Url::parse(url).map_err(|e| DeviceError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })
}
