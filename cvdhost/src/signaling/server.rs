//! WebSocket front end of the signaling hub.
//!
//! Each accepted TCP connection gets its own thread. A plain
//! `GET /list-devices` request is answered with a JSON array; anything else
//! goes through the WebSocket handshake and is driven by a
//! [`SignalingHandler`]. Frames destined for a connection are queued on its
//! outbox and written by the connection's own thread between reads.

use std::io::{self, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::Value;
use tungstenite::handshake::server::write_response;
use tungstenite::http::{Response, StatusCode, header};
use tungstenite::{Message, WebSocket};

use cvdhost_shared::errors::{CvdResult, StackTraceError};
use cvdhost_shared::propagate;
use cvdhost_shared::protocol::signaling::LIST_DEVICES_PATH;

use super::handler::{Disposition, SignalingHandler};
use super::registry::{DeviceRegistry, SignalingEndpoint};

/// How often a connection thread checks its outbox while idle.
const OUTBOX_POLL: Duration = Duration::from_millis(20);
/// How long to wait for the peer to answer our close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(1);
const REQUEST_PEEK_LIMIT: usize = 1024;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

enum Outgoing {
    Text(String),
    Close,
}

/// Endpoint whose frames are delivered by the owning connection thread.
struct ChannelEndpoint {
    id: u64,
    outbox: Sender<Outgoing>,
}

impl SignalingEndpoint for ChannelEndpoint {
    fn id(&self) -> u64 {
        self.id
    }

    fn send_json(&self, frame: &Value) {
        // The connection may already be gone.
        let _ = self.outbox.send(Outgoing::Text(frame.to_string()));
    }

    fn close(&self) {
        let _ = self.outbox.send(Outgoing::Close);
    }
}

pub struct SignalingServer {
    listener: TcpListener,
    registry: Arc<DeviceRegistry>,
    ice_servers: Value,
}

impl SignalingServer {
    pub fn bind(addr: SocketAddr, ice_servers: Value) -> CvdResult<Self> {
        let listener = propagate!(TcpListener::bind(addr), "binding signaling server on {}", addr);
        Ok(Self {
            listener,
            registry: Arc::new(DeviceRegistry::new()),
            ice_servers,
        })
    }

    pub fn local_addr(&self) -> CvdResult<SocketAddr> {
        Ok(propagate!(self.listener.local_addr()))
    }

    pub fn registry(&self) -> Arc<DeviceRegistry> {
        Arc::clone(&self.registry)
    }

    /// Accept connections forever.
    pub fn run(&self) -> CvdResult<()> {
        tracing::info!(addr = ?self.listener.local_addr().ok(), "Signaling server listening");
        for stream in self.listener.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(err) => {
                    tracing::warn!("Accept failed: {}", err);
                    continue;
                }
            };
            let registry = Arc::clone(&self.registry);
            let ice_servers = self.ice_servers.clone();
            let spawned = thread::Builder::new()
                .name("signaling-conn".into())
                .spawn(move || {
                    let peer = stream.peer_addr().ok();
                    if let Err(err) = serve_connection(stream, registry, ice_servers) {
                        tracing::debug!(?peer, "Signaling connection ended: {}", err);
                    }
                });
            if let Err(err) = spawned {
                tracing::error!("Could not start signaling connection thread: {}", err);
            }
        }
        Ok(())
    }

    /// Run the accept loop on a background thread.
    pub fn spawn(self) -> CvdResult<thread::JoinHandle<CvdResult<()>>> {
        Ok(propagate!(
            thread::Builder::new()
                .name("signaling-accept".into())
                .spawn(move || self.run()),
            "spawning signaling accept loop"
        ))
    }
}

/// Serve one accepted TCP connection until it closes.
pub fn serve_connection(
    stream: TcpStream,
    registry: Arc<DeviceRegistry>,
    ice_servers: Value,
) -> CvdResult<()> {
    if requested_path(&stream).as_deref() == Some(LIST_DEVICES_PATH) {
        return list_devices(stream, &registry);
    }
    let ws = propagate!(tungstenite::accept(stream).map_err(StackTraceError::protocol), "websocket handshake");
    propagate!(ws.get_ref().set_read_timeout(Some(OUTBOX_POLL)));

    let (outbox, inbox) = mpsc::channel();
    let endpoint: Arc<dyn SignalingEndpoint> = Arc::new(ChannelEndpoint {
        id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
        outbox,
    });
    let mut handler = SignalingHandler::new(registry, Arc::clone(&endpoint), ice_servers);
    handler.on_open();
    let result = Connection {
        ws,
        inbox,
        endpoint: Arc::clone(&endpoint),
        closing_since: None,
    }
    .drive(&mut handler);
    handler.on_close();
    result
}

struct Connection {
    ws: WebSocket<TcpStream>,
    inbox: Receiver<Outgoing>,
    endpoint: Arc<dyn SignalingEndpoint>,
    closing_since: Option<Instant>,
}

impl Connection {
    fn drive(mut self, handler: &mut SignalingHandler) -> CvdResult<()> {
        loop {
            propagate!(self.flush_outbox());
            if self
                .closing_since
                .is_some_and(|since| since.elapsed() > CLOSE_GRACE)
            {
                return Ok(());
            }
            let message = match self.ws.read() {
                Ok(message) => message,
                Err(tungstenite::Error::Io(err))
                    if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
                {
                    continue;
                }
                Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                    return Ok(());
                }
                Err(err) => return Err(StackTraceError::protocol(err).push_entry(
                    cvdhost_shared::stack_entry!().with_message("reading signaling frame"),
                )),
            };
            if self.closing_since.is_some() {
                // Only the peer's close reply matters now.
                continue;
            }
            let disposition = match message {
                Message::Text(text) => handler.on_text(text.as_str()),
                Message::Binary(_) => handler.on_binary(),
                Message::Close(_) => return self.finish(),
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => Disposition::KeepOpen,
            };
            if disposition == Disposition::Close {
                self.endpoint.close();
            }
        }
    }

    fn flush_outbox(&mut self) -> CvdResult<()> {
        while let Ok(outgoing) = self.inbox.try_recv() {
            if self.closing_since.is_some() {
                continue;
            }
            let sent = match outgoing {
                Outgoing::Text(text) => self.ws.send(Message::text(text)),
                Outgoing::Close => {
                    self.closing_since = Some(Instant::now());
                    self.ws.close(None).and_then(|()| self.ws.flush())
                }
            };
            match sent {
                Ok(()) => {}
                Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                    self.closing_since.get_or_insert_with(Instant::now);
                }
                Err(err) => {
                    return Err(StackTraceError::protocol(err).push_entry(
                        cvdhost_shared::stack_entry!().with_message("writing signaling frame"),
                    ));
                }
            }
        }
        Ok(())
    }

    /// The peer closed: deliver what is queued, then let tungstenite answer.
    fn finish(mut self) -> CvdResult<()> {
        propagate!(self.flush_outbox());
        match self.ws.flush() {
            Ok(()) | Err(tungstenite::Error::ConnectionClosed) => Ok(()),
            Err(err) => Err(StackTraceError::protocol(err)),
        }
    }
}

/// Path of an HTTP request line, peeked without consuming the stream.
fn requested_path(stream: &TcpStream) -> Option<String> {
    let mut buf = [0u8; REQUEST_PEEK_LIMIT];
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let n = stream.peek(&mut buf).ok()?;
        if n == 0 {
            return None;
        }
        if let Some(end) = buf[..n].iter().position(|byte| *byte == b'\n') {
            let line = String::from_utf8_lossy(&buf[..end]);
            let mut parts = line.split_whitespace();
            let _method = parts.next()?;
            return parts.next().map(str::to_string);
        }
        if n == buf.len() || Instant::now() > deadline {
            return None;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

fn list_devices(mut stream: TcpStream, registry: &DeviceRegistry) -> CvdResult<()> {
    let response = propagate!(list_devices_response(registry));
    propagate!(stream.write_all(&response), "answering {}", LIST_DEVICES_PATH);
    Ok(())
}

/// Serialized `200 OK` carrying the registered device ids as JSON.
fn list_devices_response(registry: &DeviceRegistry) -> CvdResult<Vec<u8>> {
    let body = propagate!(serde_json::to_string(&registry.device_ids()));
    let response = propagate!(
        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::CONTENT_LENGTH, body.len())
            .header(header::CONNECTION, "close")
            .body(body)
            .map_err(StackTraceError::protocol)
    );
    let mut out = Vec::new();
    propagate!(write_response(&mut out, &response).map_err(StackTraceError::protocol));
    out.extend_from_slice(response.body().as_bytes());
    Ok(out)
}
