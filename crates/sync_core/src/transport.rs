use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::warn;

use shared::protocol::{ClientFrame, ServerFrame};

#[derive(Debug)]
pub enum TransportEvent {
    Frame(ServerFrame),
    Closed { reason: String },
}

/// One physical connection. Dropping the sink closes the connection; the
/// event receiver yields inbound frames until a `Closed` event.
pub struct TransportLink {
    pub sink: mpsc::Sender<ClientFrame>,
    pub events: mpsc::Receiver<TransportEvent>,
}

/// Dial-only factory for transport sessions. The connection state machine is
/// the only caller and owns at most one live link at a time; no other
/// component touches the socket.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, server_url: &str) -> Result<TransportLink>;
}

/// The production transport: JSON text frames over a websocket.
pub struct WsTransport;

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, server_url: &str) -> Result<TransportLink> {
        let ws_url = websocket_url(server_url)?;
        let (ws_stream, _) = connect_async(&ws_url)
            .await
            .with_context(|| format!("failed to connect websocket: {ws_url}"))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (sink_tx, mut sink_rx) = mpsc::channel::<ClientFrame>(64);
        let (event_tx, event_rx) = mpsc::channel::<TransportEvent>(256);

        tokio::spawn(async move {
            while let Some(frame) = sink_rx.recv().await {
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(error = %err, "transport: failed to encode frame");
                        continue;
                    }
                };
                if ws_writer.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        tokio::spawn(async move {
            let reason = loop {
                match ws_reader.next().await {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ServerFrame>(&text) {
                            Ok(frame) => {
                                if event_tx.send(TransportEvent::Frame(frame)).await.is_err() {
                                    return;
                                }
                            }
                            // Malformed frames are a server bug, never a
                            // reason to drop the connection.
                            Err(err) => warn!(error = %err, "transport: malformed server frame skipped"),
                        }
                    }
                    Some(Ok(Message::Close(_))) => break "server closed the connection".to_string(),
                    Some(Ok(_)) => {}
                    Some(Err(err)) => break format!("websocket receive failed: {err}"),
                    None => break "websocket stream ended".to_string(),
                }
            };
            let _ = event_tx.send(TransportEvent::Closed { reason }).await;
        });

        Ok(TransportLink {
            sink: sink_tx,
            events: event_rx,
        })
    }
}

fn websocket_url(server_url: &str) -> Result<String> {
    if server_url.starts_with("ws://") || server_url.starts_with("wss://") {
        return Ok(server_url.to_string());
    }
    if let Some(rest) = server_url.strip_prefix("https://") {
        return Ok(format!("wss://{rest}"));
    }
    if let Some(rest) = server_url.strip_prefix("http://") {
        return Ok(format!("ws://{rest}"));
    }
    Err(anyhow!(
        "server url must start with ws://, wss://, http:// or https://"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_http_schemes_to_websocket() {
        assert_eq!(websocket_url("http://relay:8443").expect("url"), "ws://relay:8443");
        assert_eq!(
            websocket_url("https://relay.example").expect("url"),
            "wss://relay.example"
        );
        assert_eq!(websocket_url("ws://relay:8443").expect("url"), "ws://relay:8443");
        assert!(websocket_url("ftp://relay").is_err());
    }
}
