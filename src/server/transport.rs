//! WebSocket transport - bridges sockets to the session loop.
//!
//! Each accepted socket runs on its own task: the handshake query and
//! cookie header become [`ConnectParams`], the loop's reply maps to a
//! close code (3001 unknown window, 3010 rate limited) or a live bridge
//! that forwards binary frames both ways. HTTP routing beyond the
//! upgrade itself stays outside the runtime.

use std::net::{IpAddr, SocketAddr};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::unbounded_channel;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::{ConnectOutcome, ConnectParams, ServerHandle};
use crate::error::SessionError;
use crate::window::{ClientInfo, WindowId};
use crate::wire::{CLOSE_RATE_LIMITED, CLOSE_UNKNOWN_WINDOW};

/// Accept connections forever, one bridge task per socket.
pub async fn serve(listener: TcpListener, handle: ServerHandle) -> Result<(), SessionError> {
    info!(target: "weft::transport", addr = ?listener.local_addr().ok(), "listening");
    loop {
        let (stream, peer) = listener.accept().await?;
        let handle = handle.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_socket(stream, peer, handle).await {
                debug!(target: "weft::transport", %peer, %err, "socket closed with error");
            }
        });
    }
}

async fn handle_socket(
    stream: TcpStream,
    peer: SocketAddr,
    handle: ServerHandle,
) -> Result<(), SessionError> {
    let mut query: Option<String> = None;
    let mut cookie: Option<String> = None;
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        query = req.uri().query().map(str::to_string);
        cookie = req
            .headers()
            .get("cookie")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Ok(resp)
    };
    let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback).await?;

    let params = connect_params(query.as_deref(), cookie, peer.ip());
    let (sink_tx, mut sink_rx) = unbounded_channel::<Vec<u8>>();
    let window_id = match handle.connect(params, sink_tx).await? {
        ConnectOutcome::Accepted { window_id } => window_id,
        ConnectOutcome::UnknownWindow => {
            ws.close(Some(CloseFrame {
                code: CloseCode::from(CLOSE_UNKNOWN_WINDOW),
                reason: "unknown window".into(),
            }))
            .await?;
            return Ok(());
        }
        ConnectOutcome::RateLimited => {
            warn!(target: "weft::transport", %peer, "connection rejected by rate limit");
            ws.close(Some(CloseFrame {
                code: CloseCode::from(CLOSE_RATE_LIMITED),
                reason: "rate limited".into(),
            }))
            .await?;
            return Ok(());
        }
    };

    let (mut ws_tx, mut ws_rx) = ws.split();
    let mut client_closed = false;
    loop {
        tokio::select! {
            chunk = sink_rx.recv() => match chunk {
                Some(bytes) => ws_tx.send(Message::Binary(bytes)).await?,
                // Window destroyed server-side; drop the socket.
                None => break,
            },
            frame = ws_rx.next() => match frame {
                Some(Ok(Message::Binary(data))) => handle.message(window_id.clone(), data)?,
                Some(Ok(Message::Close(_))) => {
                    client_closed = true;
                    break;
                }
                None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(target: "weft::transport", id = %window_id, %err, "read error");
                    break;
                }
            }
        }
    }

    // An explicit close tears the window down; anything else parks it
    // for a reconnect.
    if client_closed {
        handle.close(window_id);
    } else {
        handle.disconnect(window_id);
    }
    Ok(())
}

/// Parse the reconnection handshake query: window id (empty = new
/// window), acknowledged read offset, viewport size and current path.
fn connect_params(query: Option<&str>, cookie: Option<String>, ip: IpAddr) -> ConnectParams {
    let mut window_id = None;
    let mut read_offset = 0u64;
    let mut info = ClientInfo {
        cookie,
        ..ClientInfo::default()
    };

    for pair in query.unwrap_or("").split('&') {
        let (key, raw) = pair.split_once('=').unwrap_or((pair, ""));
        let value = decode_component(raw);
        match key {
            "window" if !value.is_empty() => window_id = WindowId::parse(&value),
            "offset" => read_offset = value.parse().unwrap_or(0),
            "viewport" => {
                if let Some((w, h)) = value.split_once('x') {
                    if let (Ok(w), Ok(h)) = (w.parse(), h.parse()) {
                        info.viewport = (w, h);
                    }
                }
            }
            "path" if !value.is_empty() => info.path = value,
            _ => {}
        }
    }

    ConnectParams {
        window_id,
        read_offset,
        info,
        ip,
    }
}

/// Minimal percent-decoding for query components.
fn decode_component(raw: &str) -> String {
    fn hex_val(b: u8) -> Option<u8> {
        match b {
            b'0'..=b'9' => Some(b - b'0'),
            b'a'..=b'f' => Some(b - b'a' + 10),
            b'A'..=b'F' => Some(b - b'A' + 10),
            _ => None,
        }
    }

    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                match (hex_val(bytes[i + 1]), hex_val(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi * 16 + lo);
                        i += 3;
                    }
                    _ => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}
