//! CoAP binding: one confirmable request per call over a fresh UDP socket.
//!
//! Piggy-backed and separate responses are both accepted. There is no
//! retransmission and no block-wise transfer; a request either gets its
//! answer within the timeout or fails.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use coap_lite::{
    CoapOption, ContentFormat, MessageClass, MessageType, Packet, RequestType, ResponseType,
};
use reqwest::Url;
use tokio::net::UdpSocket;
use tracing::debug;

use super::{ClientFactory, DeviceError, ProtocolClient, JSON_CONTENT_TYPE};
use crate::config::Scheme;

pub const COAP_DEFAULT_PORT: u16 = 5683;

const MAX_DATAGRAM: usize = 64 * 1024;

pub struct CoapClient {
    timeout: Duration,
}

impl CoapClient {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn exchange(
        &self,
        url: &Url,
        method: RequestType,
        content_format: Option<ContentFormat>,
        body: Vec<u8>,
    ) -> Result<Vec<u8>, DeviceError> {
        let peer = resolve(url).await?;
        let local: SocketAddr = if peer.is_ipv6() {
            "[::]:0".parse().map_err(|_| DeviceError::Coap("bad bind address".into()))?
        } else {
            "0.0.0.0:0".parse().map_err(|_| DeviceError::Coap("bad bind address".into()))?
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(peer).await?;

        let token: Vec<u8> = rand::random::<[u8; 4]>().to_vec();
        let request = build_request(url, method, content_format, body, rand::random(), token.clone());
        socket.send(&encode(&request)?).await?;
        debug!(%url, %peer, message_id = request.header.message_id, "CoAP request sent");

        let deadline = tokio::time::Instant::now() + self.timeout;
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let n = match tokio::time::timeout_at(deadline, socket.recv(&mut buf)).await {
                Ok(read) => read?,
                Err(_) => {
                    return Err(DeviceError::Timeout {
                        url: url.to_string(),
                        secs: self.timeout.as_secs(),
                    })
                }
            };
            let reply = match Packet::from_bytes(&buf[..n]) {
                Ok(p) => p,
                Err(e) => {
                    debug!(error = ?e, "discarding undecodable datagram");
                    continue;
                }
            };

            let same_exchange = reply.header.message_id == request.header.message_id;
            match reply.header.get_type() {
                MessageType::Reset if same_exchange => {
                    return Err(DeviceError::Coap(format!("{url} reset the exchange")));
                }
                MessageType::Acknowledgement
                    if same_exchange && matches!(reply.header.code, MessageClass::Empty) =>
                {
                    debug!(%url, "request acknowledged, awaiting separate response");
                    continue;
                }
                _ => {}
            }
            if reply.get_token() != token.as_slice() {
                continue;
            }
            if matches!(reply.header.get_type(), MessageType::Confirmable) {
                socket.send(&encode(&empty_ack(reply.header.message_id))?).await?;
            }

            return match reply.header.code {
                MessageClass::Response(code) if is_success(&code) => Ok(reply.payload),
                MessageClass::Response(code) => Err(DeviceError::Status {
                    url: url.to_string(),
                    code: format!("{code:?}"),
                }),
                other => Err(DeviceError::Coap(format!("unexpected message class {other:?}"))),
            };
        }
    }
}

#[async_trait::async_trait]
impl ProtocolClient for CoapClient {
    async fn read_resource(&self, url: &Url) -> Result<Vec<u8>, DeviceError> {
        self.exchange(url, RequestType::Get, None, Vec::new()).await
    }

    async fn invoke_resource(
        &self,
        url: &Url,
        method: Option<&str>,
        content_type: &str,
        body: Vec<u8>,
    ) -> Result<Vec<u8>, DeviceError> {
        let method = match method.map(|m| m.to_ascii_uppercase()) {
            None => RequestType::Post,
            Some(m) if m == "POST" => RequestType::Post,
            Some(m) if m == "PUT" => RequestType::Put,
            Some(m) if m == "GET" => RequestType::Get,
            Some(m) if m == "DELETE" => RequestType::Delete,
            Some(m) => {
                return Err(DeviceError::InvalidUrl {
                    url: url.to_string(),
                    reason: format!("unknown CoAP method '{m}'"),
                })
            }
        };
        let content_format = (content_type == JSON_CONTENT_TYPE).then_some(ContentFormat::ApplicationJSON);
        self.exchange(url, method, content_format, body).await
    }
}

pub struct CoapClientFactory {
    timeout: Duration,
}

impl CoapClientFactory {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait::async_trait]
impl ClientFactory for CoapClientFactory {
    fn scheme(&self) -> Scheme {
        Scheme::Coap
    }

    async fn create(&self) -> Result<Arc<dyn ProtocolClient>, DeviceError> {
        Ok(Arc::new(CoapClient::new(self.timeout)))
    }
}

// ---------------------------------------------------------------------------
// Packet helpers
// ---------------------------------------------------------------------------

async fn resolve(url: &Url) -> Result<SocketAddr, DeviceError> {
    let invalid = |reason: &str| DeviceError::InvalidUrl {
        url: url.to_string(),
        reason: reason.to_string(),
    };
    let host = url.host_str().ok_or_else(|| invalid("missing host"))?;
    let port = url.port().unwrap_or(COAP_DEFAULT_PORT);
    let literal = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = literal.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| invalid("host did not resolve"))
}

fn build_request(
    url: &Url,
    method: RequestType,
    content_format: Option<ContentFormat>,
    body: Vec<u8>,
    message_id: u16,
    token: Vec<u8>,
) -> Packet {
    let mut packet = Packet::new();
    packet.header.set_version(1);
    packet.header.set_type(MessageType::Confirmable);
    packet.header.code = MessageClass::Request(method);
    packet.header.message_id = message_id;
    packet.set_token(token);
    for segment in url.path_segments().into_iter().flatten().filter(|s| !s.is_empty()) {
        packet.add_option(CoapOption::UriPath, segment.as_bytes().to_vec());
    }
    if let Some(query) = url.query() {
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            packet.add_option(CoapOption::UriQuery, pair.as_bytes().to_vec());
        }
    }
    if let Some(cf) = content_format {
        packet.set_content_format(cf);
    }
    packet.payload = body;
    packet
}

fn empty_ack(message_id: u16) -> Packet {
    let mut ack = Packet::new();
    ack.header.set_type(MessageType::Acknowledgement);
    ack.header.code = MessageClass::Empty;
    ack.header.message_id = message_id;
    ack
}

fn encode(packet: &Packet) -> Result<Vec<u8>, DeviceError> {
    packet
        .to_bytes()
        .map_err(|e| DeviceError::Coap(format!("failed to encode packet: {e:?}")))
}

fn is_success(code: &ResponseType) -> bool {
    matches!(
        code,
        ResponseType::Created
            | ResponseType::Deleted
            | ResponseType::Valid
            | ResponseType::Changed
            | ResponseType::Content
    )
}
