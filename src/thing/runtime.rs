use std::collections::HashMap;
use std::sync::Arc;

use reqwest::Url;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::{
    parse_url, ActionInvoker, ClientFactory, CoapClientFactory, DeviceConnector, DeviceError,
    Form, HttpClientFactory, ProtocolClient, ThingDescription,
};
use crate::config::{Scheme, ThingConfig};

type Clients = HashMap<Scheme, Arc<dyn ProtocolClient>>;

/// Owns the registered protocol bindings and hands out consumed Things.
pub struct ClientRuntime {
    factories: Vec<Box<dyn ClientFactory>>,
    clients: OnceCell<Clients>,
}

impl Default for ClientRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRuntime {
    pub fn new() -> Self {
        Self {
            factories: Vec::new(),
            clients: OnceCell::new(),
        }
    }

    /// A runtime with only the binding for the configured scheme.
    pub fn for_thing(cfg: &ThingConfig) -> Self {
        let timeout = cfg.request_timeout();
        let mut runtime = Self::new();
        match cfg.protocol {
            Scheme::Http => runtime.add_client_factory(HttpClientFactory::new(timeout)),
            Scheme::Coap => runtime.add_client_factory(CoapClientFactory::new(timeout)),
        }
        runtime
    }

    pub fn add_client_factory(&mut self, factory: impl ClientFactory + 'static) {
        self.factories.push(Box::new(factory));
    }

    pub fn schemes(&self) -> Vec<Scheme> {
        self.factories.iter().map(|f| f.scheme()).collect()
    }

    /// Instantiate every registered client. Later calls are no-ops, and
    /// concurrent callers wait for the first one.
    pub async fn start(&self) -> Result<(), DeviceError> {
        self.started_clients().await.map(|_| ())
    }

    async fn started_clients(&self) -> Result<&Clients, DeviceError> {
        self.clients
            .get_or_try_init(|| async {
                let mut clients = Clients::new();
                for factory in &self.factories {
                    clients.insert(factory.scheme(), factory.create().await?);
                }
                info!(schemes = ?clients.keys().collect::<Vec<_>>(), "client runtime started");
                Ok(clients)
            })
            .await
    }

    async fn client_for(&self, url: &Url) -> Result<Arc<dyn ProtocolClient>, DeviceError> {
        let clients = self.started_clients().await?;
        Scheme::from_url(url)
            .and_then(|scheme| clients.get(&scheme))
            .cloned()
            .ok_or_else(|| DeviceError::UnsupportedScheme(url.scheme().to_string()))
    }

    /// Retrieve and parse the Thing Description at `url`.
    pub async fn fetch(&self, url: &str) -> Result<ThingDescription, DeviceError> {
        let url = parse_url(url)?;
        let client = self.client_for(&url).await?;
        debug!(%url, "fetching thing description");
        let bytes = client.read_resource(&url).await?;
        let td = ThingDescription::from_slice(&bytes)?;
        info!(title = %td.title, actions = td.actions.len(), "fetched thing description");
        Ok(td)
    }

    /// Bind a description to the started clients. `source` is the URL the
    /// description came from and anchors relative form targets.
    pub fn consume(&self, td: ThingDescription, source: &str) -> Result<ConsumedThing, DeviceError> {
        let clients = self.clients.get().ok_or(DeviceError::NotStarted)?;
        let source = parse_url(source)?;
        let base = match td.base.as_deref() {
            Some(base) => source.join(base).map_err(|e| DeviceError::InvalidUrl {
                url: base.to_string(),
                reason: e.to_string(),
            })?,
            None => source,
        };
        info!(title = %td.title, %base, "consumed thing");
        Ok(ConsumedThing {
            td,
            base,
            clients: clients.clone(),
        })
    }
}

#[async_trait::async_trait]
impl DeviceConnector for ClientRuntime {
    type Thing = ConsumedThing;

    async fn fetch_description(&self, url: &str) -> Result<ThingDescription, DeviceError> {
        self.fetch(url).await
    }

    async fn start(&self) -> Result<(), DeviceError> {
        ClientRuntime::start(self).await
    }

    async fn consume(&self, td: ThingDescription, url: &str) -> Result<ConsumedThing, DeviceError> {
        ClientRuntime::consume(self, td, url)
    }
}

// ---------------------------------------------------------------------------
// ConsumedThing
// ---------------------------------------------------------------------------

/// A Thing Description bound to live protocol clients.
pub struct ConsumedThing {
    td: ThingDescription,
    base: Url,
    clients: Clients,
}

impl ConsumedThing {
    pub fn description(&self) -> &ThingDescription {
        &self.td
    }

    pub fn title(&self) -> &str {
        &self.td.title
    }

    /// First form of `action` usable for invocation over a started client.
    fn select_form(&self, action: &str) -> Result<(&Form, Url, Arc<dyn ProtocolClient>), DeviceError> {
        let affordance = self.td.actions.get(action).ok_or_else(|| DeviceError::UnknownAction {
            thing: self.td.title.clone(),
            action: action.to_string(),
        })?;

        for form in affordance.forms.iter().filter(|f| f.supports("invokeaction")) {
            let Ok(target) = self.base.join(&form.href) else {
                debug!(href = %form.href, "skipping form with unusable href");
                continue;
            };
            if let Some(client) = Scheme::from_url(&target).and_then(|s| self.clients.get(&s)) {
                return Ok((form, target, client.clone()));
            }
        }

        let mut schemes: Vec<&str> = self.clients.keys().map(|s| s.name()).collect();
        schemes.sort_unstable();
        Err(DeviceError::NoForm {
            action: action.to_string(),
            schemes: schemes.join(", "),
        })
    }
}

#[async_trait::async_trait]
impl ActionInvoker for ConsumedThing {
    async fn invoke_action(
        &self,
        name: &str,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, DeviceError> {
        let (form, target, client) = self.select_form(name)?;
        let body = serde_json::to_vec(&input)?;
        debug!(action = %name, %target, "invoking action");
        let reply = client
            .invoke_resource(&target, form.method_name.as_deref(), form.content_type(), body)
            .await?;
        if reply.iter().all(u8::is_ascii_whitespace) {
            return Ok(serde_json::Value::Null);
        }
        Ok(serde_json::from_slice(&reply)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records every call and replies with a canned body.
    struct RecordingClient {
        reply: Vec<u8>,
        calls: Mutex<Vec<(String, Option<String>, Vec<u8>)>>,
    }

    #[async_trait::async_trait]
    impl ProtocolClient for RecordingClient {
        async fn read_resource(&self, _url: &Url) -> Result<Vec<u8>, DeviceError> {
            Ok(self.reply.clone())
        }

        async fn invoke_resource(
            &self,
            url: &Url,
            method: Option<&str>,
            _content_type: &str,
            body: Vec<u8>,
        ) -> Result<Vec<u8>, DeviceError> {
            self.calls
                .lock()
                .unwrap()
                .push((url.to_string(), method.map(str::to_string), body));
            Ok(self.reply.clone())
        }
    }

    struct FixedFactory(Scheme, Arc<RecordingClient>);

    #[async_trait::async_trait]
    impl ClientFactory for FixedFactory {
        fn scheme(&self) -> Scheme {
            self.0
        }

        async fn create(&self) -> Result<Arc<dyn ProtocolClient>, DeviceError> {
            Ok(self.1.clone())
        }
    }

    fn recording(reply: &str) -> Arc<RecordingClient> {
        Arc::new(RecordingClient {
            reply: reply.as_bytes().to_vec(),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn display_td(forms: serde_json::Value) -> ThingDescription {
        serde_json::from_value(serde_json::json!({
            "title": "Display",
            "actions": { "display": { "forms": forms } }
        }))
        .unwrap()
    }

    const SOURCE: &str = "http://192.168.178.27/.well-known/wot-thing-description";

    #[test]
    fn test_consume_before_start_fails() {
        let runtime = ClientRuntime::for_thing(&ThingConfig::default());
        let err = runtime.consume(ThingDescription::default(), SOURCE).err().unwrap();
        assert!(matches!(err, DeviceError::NotStarted));
    }

    #[test]
    fn test_for_thing_registers_configured_scheme_only() {
        let coap = ThingConfig {
            protocol: Scheme::Coap,
            ..ThingConfig::default()
        };
        assert_eq!(ClientRuntime::for_thing(&coap).schemes(), vec![Scheme::Coap]);
        assert_eq!(
            ClientRuntime::for_thing(&ThingConfig::default()).schemes(),
            vec![Scheme::Http]
        );
    }

    #[tokio::test]
    async fn test_fetch_over_unregistered_scheme_fails() {
        let runtime = ClientRuntime::for_thing(&ThingConfig::default());
        let err = runtime
            .fetch("coap://192.168.178.27/.well-known/wot-thing-description")
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::UnsupportedScheme(s) if s == "coap"));
    }

    #[tokio::test]
    async fn test_invoke_resolves_relative_href_and_decodes_reply() {
        let client = recording(r#"{"display":{"status":"created"}}"#);
        let mut runtime = ClientRuntime::new();
        runtime.add_client_factory(FixedFactory(Scheme::Http, client.clone()));
        runtime.start().await.unwrap();

        let td = display_td(serde_json::json!([{ "href": "actions/display" }]));
        let thing = runtime.consume(td, SOURCE).unwrap();
        let reply = thing
            .invoke_action("display", serde_json::json!({"headline": "Ping"}))
            .await
            .unwrap();
        assert_eq!(reply["display"]["status"], "created");

        let calls = client.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "http://192.168.178.27/.well-known/actions/display");
        assert_eq!(calls[0].1, None);
        assert_eq!(calls[0].2, br#"{"headline":"Ping"}"#.to_vec());
    }

    #[tokio::test]
    async fn test_invoke_skips_forms_for_other_schemes() {
        let client = recording("");
        let mut runtime = ClientRuntime::new();
        runtime.add_client_factory(FixedFactory(Scheme::Http, client.clone()));
        runtime.start().await.unwrap();

        let td = display_td(serde_json::json!([
            { "href": "coap://192.168.178.27/actions/display" },
            { "href": "http://192.168.178.27/actions/display", "op": "invokeaction", "htv:methodName": "PUT" }
        ]));
        let thing = runtime.consume(td, SOURCE).unwrap();
        let reply = thing.invoke_action("display", serde_json::json!({})).await.unwrap();
        assert!(reply.is_null());

        let calls = client.calls.lock().unwrap();
        assert_eq!(calls[0].0, "http://192.168.178.27/actions/display");
        assert_eq!(calls[0].1.as_deref(), Some("PUT"));
    }

    #[tokio::test]
    async fn test_invoke_errors() {
        let mut runtime = ClientRuntime::new();
        runtime.add_client_factory(FixedFactory(Scheme::Http, recording("not json")));
        runtime.start().await.unwrap();

        let td = display_td(serde_json::json!([{ "href": "coap://192.168.178.27/actions/display" }]));
        let thing = runtime.consume(td.clone(), SOURCE).unwrap();
        assert!(matches!(
            thing.invoke_action("display", serde_json::json!({})).await,
            Err(DeviceError::NoForm { .. })
        ));
        assert!(matches!(
            thing.invoke_action("blink", serde_json::json!({})).await,
            Err(DeviceError::UnknownAction { .. })
        ));

        let td = display_td(serde_json::json!([{ "href": "/actions/display" }]));
        let thing = runtime.consume(td, SOURCE).unwrap();
        assert!(matches!(
            thing.invoke_action("display", serde_json::json!({})).await,
            Err(DeviceError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn test_base_overrides_source() {
        let client = recording("");
        let mut runtime = ClientRuntime::new();
        runtime.add_client_factory(FixedFactory(Scheme::Http, client.clone()));
        runtime.start().await.unwrap();

        let mut td = display_td(serde_json::json!([{ "href": "display" }]));
        td.base = Some("http://10.0.0.5:8080/things/screen/".to_string());
        let thing = runtime.consume(td, SOURCE).unwrap();
        thing.invoke_action("display", serde_json::json!({})).await.unwrap();
        assert_eq!(
            client.calls.lock().unwrap()[0].0,
            "http://10.0.0.5:8080/things/screen/display"
        );
    }
}
