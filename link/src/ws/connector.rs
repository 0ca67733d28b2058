//! WebSocket channel to the relay

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use ::http::header::{HeaderValue, USER_AGENT};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info};
use url::Url;

use crate::authn::Credentials;
use crate::errors::LinkError;

pub type WsSink = Pin<Box<dyn Sink<Message, Error = LinkError> + Send>>;
pub type WsStream = Pin<Box<dyn Stream<Item = Result<Message, LinkError>> + Send>>;

/// Both halves of an open WebSocket
pub struct WsChannel {
    pub sink: WsSink,
    pub stream: WsStream,
}

/// Opens WebSocket channels to the relay
#[async_trait]
pub trait WsConnector: Send + Sync {
    async fn open(&self) -> Result<WsChannel, LinkError>;
}

/// Turn a configured endpoint into a WebSocket URL. `http`/`https`
/// endpoints map to `ws`/`wss`.
pub fn relay_url(endpoint: &str) -> Result<Url, LinkError> {
    let mut url = Url::parse(endpoint).map_err(|e| LinkError::ConfigError(format!("Invalid relay URL: {}", e)))?;

    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => return Err(LinkError::ConfigError(format!("Invalid relay URL scheme: {}", other))),
    };
    url.set_scheme(scheme)
        .map_err(|_| LinkError::ConfigError("Failed to set relay URL scheme".to_string()))?;

    Ok(url)
}

/// tokio-tungstenite connector
pub struct TungsteniteConnector {
    endpoint: Url,
    credentials: Option<Credentials>,
    connect_timeout: Duration,
}

impl TungsteniteConnector {
    pub fn new(endpoint: &str, credentials: Option<Credentials>) -> Result<Self, LinkError> {
        Ok(Self {
            endpoint: relay_url(endpoint)?,
            credentials,
            connect_timeout: Duration::from_secs(10),
        })
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// URL with the credential attached as `token` query parameter
    fn authorized_url(&self) -> Result<Url, LinkError> {
        let mut url = self.endpoint.clone();
        if let Some(credentials) = &self.credentials {
            credentials.ensure_valid()?;
            url.query_pairs_mut().append_pair("token", credentials.bearer());
        }
        Ok(url)
    }
}

#[async_trait]
impl WsConnector for TungsteniteConnector {
    async fn open(&self) -> Result<WsChannel, LinkError> {
        let url = self.authorized_url()?;
        let mut request = url.as_str().into_client_request()?;
        request.headers_mut().insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("bootlink/", env!("CARGO_PKG_VERSION"))),
        );

        info!("Connecting to relay: {}", self.endpoint);
        let (ws_stream, response) = tokio::time::timeout(self.connect_timeout, connect_async(request))
            .await
            .map_err(|_| LinkError::ConnectionError(format!("Relay handshake timed out after {:?}", self.connect_timeout)))?
            .map_err(|e| LinkError::ConnectionError(format!("Relay handshake failed: {}", e)))?;
        debug!("Relay handshake status {}", response.status());

        let (sink, stream) = ws_stream.split();
        Ok(WsChannel {
            sink: Box::pin(sink.sink_map_err(LinkError::from)),
            stream: Box::pin(stream.map(|message| message.map_err(LinkError::from))),
        })
    }
}
