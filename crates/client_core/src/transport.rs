//! Duplex text-frame transport used by the connection manager.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::domain::UserId;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use url::Url;

#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a fresh link. Resolves once the transport handshake finished.
    async fn connect(&self) -> Result<Box<dyn Connection>>;
}

#[async_trait]
pub trait Connection: Send {
    async fn send_text(&mut self, frame: String) -> Result<()>;
    /// Next text frame, or `None` once the peer closed the link.
    /// Must be cancel-safe.
    async fn next_text(&mut self) -> Option<Result<String>>;
    async fn close(&mut self) -> Result<()>;
}

/// Websocket connector for the message router.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: Url,
}

impl WsConnector {
    pub fn new(url: Url) -> Self {
        Self { url }
    }

    /// Derives `ws(s)://host/ws?user_id=..` from the service's http(s) URL.
    pub fn for_server(server_url: &str, user_id: UserId) -> Result<Self> {
        let mut url =
            Url::parse(server_url).with_context(|| format!("invalid server url: {server_url}"))?;
        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            "http" | "ws" => "ws",
            other => return Err(anyhow!("unsupported server url scheme `{other}`")),
        };
        url.set_scheme(scheme)
            .map_err(|()| anyhow!("cannot switch {server_url} to {scheme}"))?;
        let path = format!("{}/ws", url.path().trim_end_matches('/'));
        url.set_path(&path);
        url.query_pairs_mut()
            .clear()
            .append_pair("user_id", &user_id.0.to_string());
        Ok(Self { url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        let (stream, _) = connect_async(self.url.as_str())
            .await
            .with_context(|| format!("failed to connect websocket: {}", self.url))?;
        Ok(Box::new(WsConnection { stream }))
    }
}

struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Connection for WsConnection {
    async fn send_text(&mut self, frame: String) -> Result<()> {
        self.stream
            .send(Message::Text(frame))
            .await
            .context("websocket send failed")
    }

    async fn next_text(&mut self) -> Option<Result<String>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(err) => return Some(Err(err.into())),
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.stream.close(None).await.context("websocket close failed")
    }
}

pub mod memory {
    //! Channel-backed transport. The client side plugs into a session; the
    //! server side is driven by whoever plays the message router.

    use std::sync::{Arc, Mutex};

    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use shared::protocol::{InboundEvent, OutboundAction};
    use tokio::{sync::mpsc, time::Instant};

    use super::{Connection, Connector};

    #[derive(Default)]
    struct Gate {
        refusing: bool,
        attempts: Vec<Instant>,
    }

    /// Client half: hand this to the session.
    #[derive(Clone)]
    pub struct MemoryConnector {
        gate: Arc<Mutex<Gate>>,
        accepted: mpsc::UnboundedSender<MemoryPeer>,
    }

    /// Router half: accepts links and controls whether connects succeed.
    pub struct MemoryRouter {
        gate: Arc<Mutex<Gate>>,
        accepted: mpsc::UnboundedReceiver<MemoryPeer>,
    }

    /// One accepted link as seen from the router.
    pub struct MemoryPeer {
        to_client: mpsc::UnboundedSender<String>,
        from_client: mpsc::UnboundedReceiver<String>,
    }

    pub fn pair() -> (MemoryConnector, MemoryRouter) {
        let gate = Arc::new(Mutex::new(Gate::default()));
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        (
            MemoryConnector {
                gate: Arc::clone(&gate),
                accepted: accepted_tx,
            },
            MemoryRouter {
                gate,
                accepted: accepted_rx,
            },
        )
    }

    impl MemoryRouter {
        pub fn set_refusing(&self, refusing: bool) {
            if let Ok(mut gate) = self.gate.lock() {
                gate.refusing = refusing;
            }
        }

        /// Instants at which the client attempted to connect, accepted or not.
        pub fn connect_attempts(&self) -> Vec<Instant> {
            self.gate
                .lock()
                .map(|gate| gate.attempts.clone())
                .unwrap_or_default()
        }

        pub async fn accept(&mut self) -> Option<MemoryPeer> {
            self.accepted.recv().await
        }
    }

    impl MemoryPeer {
        pub fn push(&self, event: &InboundEvent) -> Result<()> {
            let frame = serde_json::to_string(event)?;
            self.push_raw(frame)
        }

        pub fn push_raw(&self, frame: impl Into<String>) -> Result<()> {
            self.to_client
                .send(frame.into())
                .map_err(|_| anyhow!("client side of the link is gone"))
        }

        /// Next action the client wrote, `None` once the client dropped the link.
        pub async fn recv(&mut self) -> Option<OutboundAction> {
            let frame = self.from_client.recv().await?;
            serde_json::from_str(&frame).ok()
        }

        /// Everything the client has written so far, without waiting.
        pub fn drain(&mut self) -> Vec<OutboundAction> {
            let mut actions = Vec::new();
            while let Ok(frame) = self.from_client.try_recv() {
                if let Ok(action) = serde_json::from_str(&frame) {
                    actions.push(action);
                }
            }
            actions
        }
    }

    #[async_trait]
    impl Connector for MemoryConnector {
        async fn connect(&self) -> Result<Box<dyn Connection>> {
            {
                let mut gate = self
                    .gate
                    .lock()
                    .map_err(|_| anyhow!("memory transport gate poisoned"))?;
                gate.attempts.push(Instant::now());
                if gate.refusing {
                    return Err(anyhow!("connection refused"));
                }
            }

            let (to_client, incoming) = mpsc::unbounded_channel();
            let (outgoing, from_client) = mpsc::unbounded_channel();
            self.accepted
                .send(MemoryPeer {
                    to_client,
                    from_client,
                })
                .map_err(|_| anyhow!("memory router is gone"))?;
            Ok(Box::new(MemoryConnection { incoming, outgoing }))
        }
    }

    struct MemoryConnection {
        incoming: mpsc::UnboundedReceiver<String>,
        outgoing: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl Connection for MemoryConnection {
        async fn send_text(&mut self, frame: String) -> Result<()> {
            self.outgoing
                .send(frame)
                .map_err(|_| anyhow!("peer closed the link"))
        }

        async fn next_text(&mut self) -> Option<Result<String>> {
            self.incoming.recv().await.map(Ok)
        }

        async fn close(&mut self) -> Result<()> {
            self.incoming.close();
            Ok(())
        }
    }
}
