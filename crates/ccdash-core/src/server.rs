//! WebSocket server: subscriber hub, command dispatcher, and PTY output pump.
//!
//! One duplex endpoint at `/ws` (authorized), a liveness probe at `/health`.
//! Every subscriber gets the full session snapshot on connect and on every
//! poll; a subscriber may additionally attach to one session, which bridges a
//! `tmux attach-session` PTY over base64 `input`/`output` messages.

use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::auth;
use crate::config::{self, Config};
use crate::poller::{Poller, SessionInfo};
use crate::protocol::{parse_client_message, ClientMessage, ServerMessage};
use crate::scrollback::ScrollbackStore;
use crate::terminal::TerminalSession;
use crate::tmux::state::SessionState;
use crate::tmux::TmuxDriver;

/// PTY read buffer.
const READ_BUFFER_SIZE: usize = 32 * 1024;
/// Bounded chunk channel between the reader thread and the flusher.
const CHUNK_CHANNEL_CAPACITY: usize = 64;
/// Accumulated output above this flushes immediately.
const FLUSH_HIGH_WATER: usize = 16 * 1024;
/// Otherwise output flushes on this cadence, capping the message rate while
/// coalescing redraw bursts.
const FLUSH_INTERVAL: Duration = Duration::from_millis(16);

type Outbound = mpsc::UnboundedSender<Message>;

pub struct Server {
    config: Arc<Config>,
    tmux: Arc<TmuxDriver>,
    poller: Arc<Poller>,
    scrollback: Arc<ScrollbackStore>,
    subscribers: StdMutex<HashMap<u64, Outbound>>,
    next_subscriber: AtomicU64,
}

impl Server {
    pub fn new(
        config: Arc<Config>,
        tmux: Arc<TmuxDriver>,
        poller: Arc<Poller>,
        scrollback: Arc<ScrollbackStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            tmux,
            poller,
            scrollback,
            subscribers: StdMutex::new(HashMap::new()),
            next_subscriber: AtomicU64::new(0),
        })
    }

    /// Accept connections until shutdown fires.
    pub async fn run(self: Arc<Self>, listener: TcpListener, mut shutdown_rx: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let server = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, addr).await {
                                    debug!(?addr, error = %e, "connection ended with error");
                                }
                            });
                        }
                        Err(e) => error!(error = %e, "accept failed"),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("server shutting down");
                    break;
                }
            }
        }
    }

    /// Serialize the snapshot once and fan it out. Send failures are ignored
    /// here; the failing subscriber's read loop will notice and unregister.
    pub fn broadcast_sessions(&self, sessions: Vec<SessionInfo>) {
        let Ok(text) = serde_json::to_string(&ServerMessage::Sessions { sessions }) else {
            return;
        };

        let targets: Vec<Outbound> = {
            let subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
            subscribers.values().cloned().collect()
        };

        for tx in targets {
            let _ = tx.send(Message::text(text.clone()));
        }
    }

    fn add_subscriber(&self, tx: Outbound) -> u64 {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);
        id
    }

    fn remove_subscriber(&self, id: u64) {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        let token = self.config.token.clone();
        let handshake = accept_hdr_async(stream, move |req: &Request, resp: Response| {
            route_request(req, resp, &token)
        })
        .await;

        // A rejected handshake already answered over plain HTTP
        // (/health, 401, 404); there is nothing more to do.
        let ws_stream = match handshake {
            Ok(ws) => ws,
            Err(_) => return Ok(()),
        };

        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let subscriber_id = self.add_subscriber(out_tx.clone());
        info!(?addr, subscriber = subscriber_id, "dashboard connected");

        // Single writer per connection keeps per-subscriber ordering.
        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if ws_tx.send(msg).await.is_err() {
                    break;
                }
            }
        });

        // Full view before any delta.
        send_message(&out_tx, &ServerMessage::Sessions {
            sessions: self.poller.sessions().await,
        });

        let mut attachment: Option<Arc<TerminalSession>> = None;

        while let Some(msg) = ws_rx.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    self.dispatch(&text, &out_tx, &mut attachment).await;
                }
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }

        self.remove_subscriber(subscriber_id);
        if let Some(terminal) = attachment.take() {
            terminal.close();
        }
        drop(out_tx);
        let _ = writer.await;

        info!(?addr, subscriber = subscriber_id, "dashboard disconnected");
        Ok(())
    }

    /// One inbound frame. Protocol errors answer `error` and never disconnect.
    async fn dispatch(
        &self,
        text: &str,
        out_tx: &Outbound,
        attachment: &mut Option<Arc<TerminalSession>>,
    ) {
        let msg = match parse_client_message(text) {
            Ok(msg) => msg,
            Err(message) => {
                send_error(out_tx, message);
                return;
            }
        };

        match msg {
            ClientMessage::ListSessions => {
                send_message(out_tx, &ServerMessage::Sessions {
                    sessions: self.poller.sessions().await,
                });
            }

            ClientMessage::CreateSession { workdir, name } => {
                let workdir = resolve_workdir(&workdir);
                let name = if name.is_empty() { "session".to_string() } else { name };

                match self
                    .tmux
                    .create_session(
                        &name,
                        &workdir,
                        self.config.history_limit,
                        &self.config.session_command,
                    )
                    .await
                {
                    Ok(session_id) => {
                        self.poller
                            .track_session(&session_id, &workdir.to_string_lossy())
                            .await;
                        info!(session = %session_id, workdir = %workdir.display(), "session created");
                        send_message(out_tx, &ServerMessage::SessionCreated {
                            session_id: session_id.clone(),
                            name: session_id,
                        });
                    }
                    Err(e) => send_error(out_tx, e.to_string()),
                }
            }

            ClientMessage::KillSession { session_id } => {
                if session_id.is_empty() {
                    send_error(out_tx, "session_id required");
                    return;
                }
                if let Err(e) = self.tmux.kill_session(&session_id).await {
                    send_error(out_tx, e.to_string());
                }
            }

            ClientMessage::ClearDeadSessions => {
                let sessions = self.poller.sessions().await;
                for session in sessions.iter().filter(|s| s.state == SessionState::Dead) {
                    self.scrollback.remove(&session.id).await;
                }
                self.poller.clear_dead().await;

                let remaining = self.poller.sessions().await;
                let live: HashSet<String> = remaining.iter().map(|s| s.id.clone()).collect();
                self.scrollback.retain(&live).await;

                self.broadcast_sessions(remaining);
            }

            ClientMessage::Attach { session_id, cols, rows } => {
                if session_id.is_empty() {
                    send_error(out_tx, "session_id required");
                    return;
                }
                if let Some(previous) = attachment.take() {
                    previous.close();
                }

                let terminal = Arc::new(TerminalSession::new());
                if let Err(e) = terminal.attach(&session_id, cols, rows) {
                    send_error(out_tx, e.to_string());
                    return;
                }
                if let Err(e) = spawn_output_pump(Arc::clone(&terminal), out_tx.clone()) {
                    terminal.close();
                    send_error(out_tx, e.to_string());
                    return;
                }
                info!(session = %session_id, cols, rows, "subscriber attached");
                *attachment = Some(terminal);
            }

            ClientMessage::Detach => {
                if let Some(terminal) = attachment.take() {
                    terminal.detach();
                }
            }

            ClientMessage::Input { data } => {
                let Some(terminal) = attachment.as_ref() else {
                    return;
                };
                // Undecodable input is dropped, not answered.
                if let Ok(bytes) = BASE64.decode(data.as_bytes()) {
                    let _ = terminal.write(&bytes);
                }
            }

            ClientMessage::Resize { cols, rows } => {
                let Some(terminal) = attachment.as_ref() else {
                    return;
                };
                if cols > 0 && rows > 0 {
                    let _ = terminal.resize(cols, rows);
                }
            }

            ClientMessage::GetScrollback { session_id } => {
                if session_id.is_empty() {
                    send_error(out_tx, "session_id required");
                    return;
                }
                match self.scrollback.get(&session_id).await {
                    Ok(text) => send_message(out_tx, &ServerMessage::Scrollback {
                        data: BASE64.encode(text.as_bytes()),
                    }),
                    Err(e) => send_error(out_tx, e.to_string()),
                }
            }

            ClientMessage::MachineInfo => {
                send_message(out_tx, &ServerMessage::MachineInfo {
                    hostname: gethostname::gethostname().to_string_lossy().into_owned(),
                    os: format!("{}/{}", std::env::consts::OS, std::env::consts::ARCH),
                    dirs: self.config.expanded_workdirs(),
                });
            }
        }
    }
}

/// Handshake-time routing. Everything that is not a successful `/ws` upgrade
/// is answered as plain HTTP via the rejection response.
fn route_request(req: &Request, resp: Response, token: &str) -> Result<Response, ErrorResponse> {
    match req.uri().path() {
        "/ws" => {
            if auth::authorized(req, token) {
                Ok(resp)
            } else {
                Err(http_response(StatusCode::UNAUTHORIZED, "Unauthorized"))
            }
        }
        "/health" => Err(http_response(StatusCode::OK, r#"{"status":"ok"}"#)),
        _ => Err(http_response(StatusCode::NOT_FOUND, "Not Found")),
    }
}

fn http_response(status: StatusCode, body: &str) -> ErrorResponse {
    tokio_tungstenite::tungstenite::http::Response::builder()
        .status(status)
        .body(Some(body.to_string()))
        .expect("static response")
}

fn send_message(out_tx: &Outbound, msg: &ServerMessage) {
    if let Ok(text) = serde_json::to_string(msg) {
        let _ = out_tx.send(Message::text(text));
    }
}

fn send_error(out_tx: &Outbound, message: impl Into<String>) {
    send_message(out_tx, &ServerMessage::Error {
        message: message.into(),
    });
}

/// Default the workdir to the home directory and expand a leading `~`;
/// subprocesses get no shell expansion.
fn resolve_workdir(workdir: &str) -> PathBuf {
    if workdir.is_empty() {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"));
    }
    config::expand_tilde(workdir)
}

/// Start the PTY→subscriber pumps: a blocking reader filling a bounded chunk
/// channel, and a flusher coalescing chunks into `output` messages.
fn spawn_output_pump(terminal: Arc<TerminalSession>, out_tx: Outbound) -> Result<()> {
    let reader = terminal.reader()?;
    let (chunk_tx, chunk_rx) = mpsc::channel::<Vec<u8>>(CHUNK_CHANNEL_CAPACITY);

    tokio::task::spawn_blocking(move || read_loop(reader, chunk_tx, terminal));
    tokio::spawn(flush_loop(chunk_rx, out_tx));
    Ok(())
}

fn read_loop(mut reader: Box<dyn Read + Send>, chunk_tx: mpsc::Sender<Vec<u8>>, terminal: Arc<TerminalSession>) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf) {
            // EOF: the attachment is winding down. Not worth a log line.
            Ok(0) => return,
            Ok(n) => {
                if chunk_tx.blocking_send(buf[..n].to_vec()).is_err() {
                    return;
                }
            }
            Err(e) => {
                if terminal.is_attached() {
                    warn!(error = %e, "pty read failed");
                }
                return;
            }
        }
    }
}

async fn flush_loop(mut chunk_rx: mpsc::Receiver<Vec<u8>>, out_tx: Outbound) {
    let mut accumulated: Vec<u8> = Vec::new();
    let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            chunk = chunk_rx.recv() => match chunk {
                Some(chunk) => {
                    accumulated.extend_from_slice(&chunk);
                    if accumulated.len() > FLUSH_HIGH_WATER {
                        flush_output(&mut accumulated, &out_tx);
                    }
                }
                // Reader gone; whatever is buffered goes out now.
                None => {
                    flush_output(&mut accumulated, &out_tx);
                    return;
                }
            },
            _ = ticker.tick() => flush_output(&mut accumulated, &out_tx),
        }
    }
}

fn flush_output(accumulated: &mut Vec<u8>, out_tx: &Outbound) {
    if accumulated.is_empty() {
        return;
    }
    send_message(out_tx, &ServerMessage::Output {
        data: BASE64.encode(accumulated.as_slice()),
    });
    accumulated.clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_server() -> Arc<Server> {
        let config = Arc::new(Config::default());
        let tmux = Arc::new(TmuxDriver::new());
        let poller = Arc::new(Poller::new(Arc::clone(&tmux)));
        let scrollback = Arc::new(ScrollbackStore::new(
            std::env::temp_dir().join("ccdash-test-scrollback"),
            Duration::from_secs(30),
            Arc::clone(&tmux),
        ));
        Server::new(config, tmux, poller, scrollback)
    }

    fn decode_output(msg: &Message) -> Vec<u8> {
        let text = match msg {
            Message::Text(text) => text.as_str(),
            other => panic!("unexpected frame: {other:?}"),
        };
        let value: serde_json::Value = serde_json::from_str(text).unwrap();
        assert_eq!(value["type"], "output");
        BASE64.decode(value["data"].as_str().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_flush_loop_round_trips_bytes() {
        let (chunk_tx, chunk_rx) = mpsc::channel::<Vec<u8>>(CHUNK_CHANNEL_CAPACITY);
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();

        let flusher = tokio::spawn(flush_loop(chunk_rx, out_tx));

        chunk_tx.send(b"hello ".to_vec()).await.unwrap();
        chunk_tx.send(b"world".to_vec()).await.unwrap();
        drop(chunk_tx);
        flusher.await.unwrap();

        let mut bytes = Vec::new();
        while let Some(msg) = out_rx.recv().await {
            bytes.extend(decode_output(&msg));
        }
        // Chunk boundaries may vary with tick timing; the byte stream must not.
        assert_eq!(bytes, b"hello world");
    }

    #[tokio::test]
    async fn test_flush_loop_high_water_flush() {
        let (chunk_tx, chunk_rx) = mpsc::channel::<Vec<u8>>(CHUNK_CHANNEL_CAPACITY);
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();

        tokio::spawn(flush_loop(chunk_rx, out_tx));

        // A burst over the high-water mark flushes without waiting for EOF.
        chunk_tx.send(vec![b'x'; FLUSH_HIGH_WATER + 1]).await.unwrap();
        let msg = out_rx.recv().await.unwrap();
        assert_eq!(decode_output(&msg).len(), FLUSH_HIGH_WATER + 1);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_subscribers() {
        let server = test_server();
        let (tx1, mut rx1) = mpsc::unbounded_channel::<Message>();
        let (tx2, mut rx2) = mpsc::unbounded_channel::<Message>();
        server.add_subscriber(tx1);
        let id2 = server.add_subscriber(tx2);

        server.broadcast_sessions(Vec::new());
        for rx in [&mut rx1, &mut rx2] {
            match rx.recv().await.unwrap() {
                Message::Text(text) => {
                    assert_eq!(text, r#"{"type":"sessions","sessions":[]}"#);
                }
                other => panic!("unexpected frame: {other:?}"),
            }
        }

        // Unregistered subscribers stop receiving.
        server.remove_subscriber(id2);
        server.broadcast_sessions(Vec::new());
        assert!(rx1.recv().await.is_some());
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn test_resolve_workdir() {
        let home = dirs::home_dir().unwrap();
        assert_eq!(resolve_workdir(""), home);
        assert_eq!(resolve_workdir("~/projects"), home.join("projects"));
        assert_eq!(resolve_workdir("/srv/code"), PathBuf::from("/srv/code"));
    }

    #[test]
    fn test_route_request_paths() {
        let req = Request::builder().uri("/health").body(()).unwrap();
        let resp = Response::builder().body(()).unwrap();
        let rejection = route_request(&req, resp, "").unwrap_err();
        assert_eq!(rejection.status(), StatusCode::OK);
        assert_eq!(rejection.body().as_deref(), Some(r#"{"status":"ok"}"#));

        let req = Request::builder().uri("/ws").body(()).unwrap();
        let resp = Response::builder().body(()).unwrap();
        assert!(route_request(&req, resp, "").is_ok());

        let req = Request::builder().uri("/ws").body(()).unwrap();
        let resp = Response::builder().body(()).unwrap();
        let rejection = route_request(&req, resp, "secret").unwrap_err();
        assert_eq!(rejection.status(), StatusCode::UNAUTHORIZED);

        let req = Request::builder().uri("/ws?token=secret").body(()).unwrap();
        let resp = Response::builder().body(()).unwrap();
        assert!(route_request(&req, resp, "secret").is_ok());

        let req = Request::builder().uri("/elsewhere").body(()).unwrap();
        let resp = Response::builder().body(()).unwrap();
        let rejection = route_request(&req, resp, "").unwrap_err();
        assert_eq!(rejection.status(), StatusCode::NOT_FOUND);
    }
}
