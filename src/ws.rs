//! WebSocket transport for the device bridge.
//!
//! [`WsConnector`] opens a `tokio-tungstenite` session and splits it into a
//! [`DeviceSink`] / [`DeviceSource`] pair for [`crate::bridge::RemoteBridge`].
//! tungstenite reassembles fragmented frames itself, so every binary message
//! surfaces as one final [`Chunk`]. Text frames are not part of the device
//! protocol and are skipped.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue, Uri};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use crate::bridge::{BridgeConnector, BridgeSink, BridgeSource, Chunk};

type DeviceStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Write half of a device session.
#[derive(Debug)]
pub struct DeviceSink {
    sink: SplitSink<DeviceStream, Message>,
}

/// Read half of a device session.
#[derive(Debug)]
pub struct DeviceSource {
    stream: SplitStream<DeviceStream>,
}

#[async_trait]
impl BridgeSink for DeviceSink {
    async fn send_binary(&mut self, data: Vec<u8>) -> Result<()> {
        self.sink
            .send(Message::Binary(data))
            .await
            .context("device send failed")
    }

    async fn close(&mut self) -> Result<()> {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "bridge closed".into(),
        };
        self.sink
            .send(Message::Close(Some(frame)))
            .await
            .context("device close frame failed")?;
        self.sink.close().await.context("device sink close failed")
    }
}

#[async_trait]
impl BridgeSource for DeviceSource {
    async fn next_chunk(&mut self) -> Option<Result<Chunk>> {
        while let Some(next) = self.stream.next().await {
            match next {
                Ok(Message::Binary(data)) => return Some(Ok(Chunk::whole(data))),
                Ok(Message::Close(frame)) => {
                    match frame {
                        Some(f) => log::info!("[Ws] Device closed ({}): {}", u16::from(f.code), f.reason),
                        None => log::info!("[Ws] Device closed"),
                    }
                    return None;
                }
                Ok(Message::Text(text)) => {
                    log::debug!("[Ws] Skipping text frame ({} bytes)", text.len());
                }
                // Pings are answered by tungstenite on the next write or flush
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
                Err(e) => return Some(Err(anyhow::anyhow!("device read failed: {e}"))),
            }
        }
        None
    }
}

/// Rewrite `http(s)://` to `ws(s)://`; WebSocket schemes pass through.
#[must_use]
pub fn http_to_ws_scheme(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    }
}

/// `https://<host>` for a device URL, as devices expect on the handshake.
#[must_use]
pub fn device_origin(url: &str) -> Option<String> {
    let uri: Uri = url.parse().ok()?;
    uri.host().map(|host| format!("https://{host}"))
}

/// Connector for a fixed device URL.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
    headers: Vec<(String, String)>,
}

impl WsConnector {
    /// Connector for `url`; `http(s)` schemes are rewritten to `ws(s)`.
    pub fn new(url: &str) -> Self {
        Self {
            url: http_to_ws_scheme(url),
            headers: Vec::new(),
        }
    }

    /// Add a request header sent on every handshake.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Send the device `Origin` header derived from the URL host.
    pub fn with_device_origin(self) -> Self {
        match device_origin(&self.url) {
            Some(origin) => self.with_header("Origin", &origin),
            None => {
                log::warn!("[Ws] No host in {}, sending no Origin", self.url);
                self
            }
        }
    }

    /// Handshake and split into sink and source.
    pub async fn open(&self) -> Result<(DeviceSink, DeviceSource)> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .with_context(|| format!("invalid device URL: {}", self.url))?;
        for (name, value) in &self.headers {
            let header = HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("invalid header name: {name}"))?;
            let value = HeaderValue::from_str(value)
                .with_context(|| format!("invalid header value for {name}"))?;
            request.headers_mut().insert(header, value);
        }

        let (stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .with_context(|| format!("device handshake with {} failed", self.url))?;
        let (sink, stream) = stream.split();
        Ok((DeviceSink { sink }, DeviceSource { stream }))
    }
}

#[async_trait]
impl BridgeConnector for WsConnector {
    async fn connect(&self) -> Result<(Box<dyn BridgeSink>, Box<dyn BridgeSource>)> {
        let (sink, source) = self.open().await?;
        Ok((Box::new(sink), Box::new(source)))
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheme_rewrite() {
        assert_eq!(http_to_ws_scheme("https://device.local/ws"), "wss://device.local/ws");
        assert_eq!(http_to_ws_scheme("http://device.local:81/ws"), "ws://device.local:81/ws");
        assert_eq!(http_to_ws_scheme("ws://localhost:8080/state"), "ws://localhost:8080/state");
    }

    #[test]
    fn test_connector_rewrites_scheme() {
        let connector = WsConnector::new("http://device.local/ws/cmd").with_header("X-Client", "station");
        assert_eq!(connector.describe(), "ws://device.local/ws/cmd");
    }

    #[test]
    fn test_device_origin_uses_host_only() {
        assert_eq!(
            device_origin("wss://sych.local:8443/ws/ws_state").as_deref(),
            Some("https://sych.local")
        );
        assert_eq!(device_origin("ws://10.0.0.7/ws").as_deref(), Some("https://10.0.0.7"));
        assert_eq!(device_origin("not a url"), None);

        let connector = WsConnector::new("http://device.local:81/cmd").with_device_origin();
        assert_eq!(
            connector.headers,
            vec![("Origin".to_string(), "https://device.local".to_string())]
        );
    }

    #[tokio::test]
    async fn test_invalid_url_is_an_error() {
        assert!(WsConnector::new("not-a-url").open().await.is_err());
    }

    #[tokio::test]
    async fn test_bad_header_is_an_error() {
        let connector = WsConnector::new("ws://127.0.0.1:1/state").with_header("bad header", "x");
        assert!(connector.open().await.is_err());
    }

    #[tokio::test]
    async fn test_unreachable_device_is_an_error() {
        let connector = WsConnector::new("ws://127.0.0.1:1/state");
        assert!(connector.connect().await.is_err());
    }
}
