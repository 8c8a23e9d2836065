//! Realtime WebSocket relay handler.
//!
//! For each accepted client WebSocket connection, this handler establishes
//! exactly one upstream connection to the provider's realtime API and bridges
//! the two for the connection's lifetime. Frames pass through unparsed in
//! both directions; the relay only injects the lifecycle frames defined in
//! [`super::messages`].
//!
//! The per-connection state machine is sequential and one-directional:
//! missing-key check, then the connecting phase (client frames buffered in
//! order), then the bridged phase, then closed. There is no reconnect — an
//! upstream failure terminates the session and the client starts over with a
//! fresh connection.

use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::Duration;
use tokio_tungstenite::tungstenite::{self, Message as UpstreamMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::errors::{MISSING_API_KEY_MESSAGE, RelayError, RelayResult};
use crate::state::AppState;

use super::messages::{
    RelayFrame, UPSTREAM_CLOSED_STATUS, UPSTREAM_CONNECTED_STATUS, UPSTREAM_FAILED_MESSAGE,
};

/// Bound on the upstream WebSocket handshake. Without it, a hanging upstream
/// holds the client in the connecting state indefinitely.
const UPSTREAM_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum WebSocket frame size (10 MB)
const MAX_WS_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Maximum WebSocket message size (10 MB)
const MAX_WS_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Relay WebSocket handler.
///
/// Upgrades the HTTP connection and hands the socket to the bridging state
/// machine.
pub async fn relay_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    info!("Relay WebSocket connection upgrade requested");
    ws.max_frame_size(MAX_WS_FRAME_SIZE)
        .max_message_size(MAX_WS_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_relay_socket(socket, state))
}

/// Drive one client connection from accept to close.
async fn handle_relay_socket(socket: WebSocket, state: Arc<AppState>) {
    info!("Relay WebSocket client connected");
    let (mut client_sink, mut client_stream) = socket.split();

    // Configuration failure is terminal before any upstream dial.
    let Some(api_key) = state.config.openai_api_key.clone() else {
        send_frame(&mut client_sink, RelayFrame::error(MISSING_API_KEY_MESSAGE)).await;
        let _ = client_sink.close().await;
        return;
    };

    let url = match state.config.upstream_ws_url() {
        Ok(url) => url,
        Err(e) => {
            error!("Invalid upstream URL: {e}");
            send_frame(&mut client_sink, RelayFrame::error(UPSTREAM_FAILED_MESSAGE)).await;
            let _ = client_sink.close().await;
            return;
        }
    };

    // CONNECTING_UPSTREAM: dial the provider while buffering client traffic.
    // Ordering is preserved by the Vec; nothing is forwarded until the
    // upstream is open.
    let connect = connect_upstream(url, api_key);
    tokio::pin!(connect);
    let mut outbound_queue: Vec<UpstreamMessage> = Vec::new();

    let upstream = loop {
        tokio::select! {
            result = &mut connect => break result,
            incoming = client_stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    outbound_queue.push(UpstreamMessage::Text(text.as_str().into()));
                }
                Some(Ok(Message::Binary(data))) => {
                    outbound_queue.push(UpstreamMessage::Binary(data));
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                    // Client went away mid-handshake: dropping the dial
                    // cancels it, and the buffer is discarded with us.
                    info!("Relay client disconnected during upstream handshake");
                    return;
                }
                Some(Ok(_)) => {}
            }
        }
    };

    let upstream = match upstream {
        Ok(upstream) => upstream,
        Err(e) => {
            error!("Upstream connection failed: {e}");
            send_frame(&mut client_sink, RelayFrame::error(UPSTREAM_FAILED_MESSAGE)).await;
            let _ = client_sink.close().await;
            return;
        }
    };

    info!("Connected to upstream realtime WebSocket");
    let (mut upstream_sink, mut upstream_stream) = upstream.split();

    // BRIDGED: announce, flush the buffer in arrival order, then forward
    // both directions until either side goes away.
    if !send_frame(
        &mut client_sink,
        RelayFrame::status(UPSTREAM_CONNECTED_STATUS, None),
    )
    .await
    {
        let _ = upstream_sink.close().await;
        return;
    }
    for message in outbound_queue.drain(..) {
        if let Err(e) = upstream_sink.send(message).await {
            error!("Failed to flush buffered message upstream: {e}");
            send_frame(&mut client_sink, RelayFrame::error(UPSTREAM_FAILED_MESSAGE)).await;
            let _ = client_sink.close().await;
            return;
        }
    }

    bridge(
        &mut client_sink,
        &mut client_stream,
        &mut upstream_sink,
        &mut upstream_stream,
    )
    .await;

    // Teardown is idempotent: whichever side already closed, closing again
    // is a no-op error we ignore.
    let _ = upstream_sink.close().await;
    let _ = client_sink.close().await;
    info!("Relay WebSocket connection terminated");
}

/// Forward frames in both directions until one side terminates.
async fn bridge(
    client_sink: &mut SplitSink<WebSocket, Message>,
    client_stream: &mut SplitStream<WebSocket>,
    upstream_sink: &mut SplitSink<UpstreamSocket, UpstreamMessage>,
    upstream_stream: &mut SplitStream<UpstreamSocket>,
) {
    loop {
        tokio::select! {
            upstream_msg = upstream_stream.next() => match upstream_msg {
                Some(Ok(UpstreamMessage::Text(text))) => {
                    if client_sink
                        .send(Message::Text(text.as_str().into()))
                        .await
                        .is_err()
                    {
                        debug!("Client gone while forwarding upstream text");
                        return;
                    }
                }
                Some(Ok(UpstreamMessage::Binary(data))) => {
                    if client_sink.send(Message::Binary(data)).await.is_err() {
                        debug!("Client gone while forwarding upstream binary");
                        return;
                    }
                }
                Some(Ok(UpstreamMessage::Ping(payload))) => {
                    if let Err(e) = upstream_sink.send(UpstreamMessage::Pong(payload)).await {
                        warn!("Failed to answer upstream ping: {e}");
                    }
                }
                Some(Ok(UpstreamMessage::Close(frame))) => {
                    let (status, code) = match frame {
                        Some(frame) if !frame.reason.is_empty() => {
                            (frame.reason.to_string(), Some(u16::from(frame.code)))
                        }
                        Some(frame) => {
                            (UPSTREAM_CLOSED_STATUS.to_string(), Some(u16::from(frame.code)))
                        }
                        None => (UPSTREAM_CLOSED_STATUS.to_string(), None),
                    };
                    info!(code = ?code, "Upstream WebSocket closed: {status}");
                    send_frame(client_sink, RelayFrame::status(status, code)).await;
                    let _ = client_sink.close().await;
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!("Upstream WebSocket error: {e}");
                    send_frame(client_sink, RelayFrame::error(UPSTREAM_FAILED_MESSAGE)).await;
                    let _ = client_sink.close().await;
                    return;
                }
                None => {
                    info!("Upstream WebSocket stream ended");
                    send_frame(
                        client_sink,
                        RelayFrame::status(UPSTREAM_CLOSED_STATUS, None),
                    )
                    .await;
                    let _ = client_sink.close().await;
                    return;
                }
            },
            client_msg = client_stream.next() => match client_msg {
                Some(Ok(Message::Text(text))) => {
                    if let Err(e) = upstream_sink
                        .send(UpstreamMessage::Text(text.as_str().into()))
                        .await
                    {
                        error!("Failed to forward client text upstream: {e}");
                        send_frame(client_sink, RelayFrame::error(UPSTREAM_FAILED_MESSAGE)).await;
                        let _ = client_sink.close().await;
                        return;
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    if let Err(e) = upstream_sink.send(UpstreamMessage::Binary(data)).await {
                        error!("Failed to forward client binary upstream: {e}");
                        send_frame(client_sink, RelayFrame::error(UPSTREAM_FAILED_MESSAGE)).await;
                        let _ = client_sink.close().await;
                        return;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!("Relay client disconnected");
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Relay client WebSocket error: {e}");
                    return;
                }
            }
        }
    }
}

/// Dial the provider's realtime WebSocket, bounded by the handshake timeout.
async fn connect_upstream(url: Url, api_key: String) -> RelayResult<UpstreamSocket> {
    let host = match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_string(),
        (None, _) => {
            return Err(RelayError::UpstreamWebSocket(
                "upstream URL has no host".to_string(),
            ));
        }
    };

    let request = http::Request::builder()
        .uri(url.as_str())
        .header("Authorization", format!("Bearer {api_key}"))
        .header("OpenAI-Beta", "realtime=v1")
        .header(
            "Sec-WebSocket-Key",
            tungstenite::handshake::client::generate_key(),
        )
        .header("Sec-WebSocket-Version", "13")
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Host", host)
        .body(())
        .map_err(|e| RelayError::UpstreamWebSocket(e.to_string()))?;

    let handshake = tokio_tungstenite::connect_async(request);
    match tokio::time::timeout(UPSTREAM_HANDSHAKE_TIMEOUT, handshake).await {
        Ok(Ok((stream, _response))) => Ok(stream),
        Ok(Err(e)) => Err(RelayError::UpstreamWebSocket(e.to_string())),
        Err(_) => Err(RelayError::UpstreamWebSocket(format!(
            "handshake timed out after {}s",
            UPSTREAM_HANDSHAKE_TIMEOUT.as_secs()
        ))),
    }
}

/// Send one relay frame to the client; false when the client is gone.
async fn send_frame(sink: &mut SplitSink<WebSocket, Message>, frame: RelayFrame) -> bool {
    match sink.send(Message::Text(frame.to_json().into())).await {
        Ok(()) => true,
        Err(e) => {
            warn!("Failed to send relay frame to client: {e}");
            false
        }
    }
}
