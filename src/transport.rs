//! Result transport for streamed test results.
//!
//! The unittest launcher connects back to a loopback TCP server and writes
//! one frame per event while tests run:
//!
//! ```text
//! content-length:<N>{"event": "result", "test": "...", "outcome": "passed", ...}
//! content-length:<N>{"event": "start", "test": "..."}
//! ```
//!
//! `N` counts the bytes of the JSON body, starting at its first `{`. Frames
//! are concatenated with no delimiter, so a single read may carry several
//! frames or a fragment of one. [`FrameDecoder`] handles that framing
//! independently of any socket; [`ResultServer`] owns the listener and
//! feeds each connection's bytes through its own decoder.
//!
//! # Events
//!
//! Everything the server observes is delivered to one [`FrameHandler`] as a
//! [`ServerEvent`], strictly in arrival order per connection:
//!
//! | Event | Meaning |
//! |-------|---------|
//! | `Connected` | A runner connected |
//! | `Frame` | A decoded [`ResultFrame`] |
//! | `Disconnected` | A runner closed its connection |
//! | `Error` | Socket error or undecodable frame; the run continues |

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors starting the result server.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Neither the IPv6 nor the IPv4 loopback address could be bound.
    #[error("Failed to bind result server: {0}")]
    Bind(#[source] std::io::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A frame the decoder could not turn into a [`ResultFrame`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("Invalid frame header: {0:?}")]
    Header(String),

    #[error("Invalid frame body: {0}")]
    Body(String),
}

/// A decoded message from the runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultFrame {
    /// A test is about to run.
    Start { test: String },

    /// A test finished. `outcome` is the raw runner string.
    Result {
        test: String,
        outcome: String,
        message: Option<String>,
        traceback: Option<String>,
    },

    /// Any other event (`log`, `connect`, ...).
    Other { event: String },
}

#[derive(Debug, Default, Deserialize)]
struct RawFields {
    test: Option<String>,
    outcome: Option<String>,
    message: Option<String>,
    traceback: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    event: String,
    body: Option<RawFields>,
    #[serde(flatten)]
    fields: RawFields,
}

impl ResultFrame {
    /// Decodes one JSON body. Both flat frames and frames wrapping their
    /// payload in a `body` object are accepted.
    pub fn from_json(body: &[u8]) -> Result<Self, FrameError> {
        let raw: RawFrame =
            serde_json::from_slice(body).map_err(|e| FrameError::Body(e.to_string()))?;
        let fields = raw.body.unwrap_or(raw.fields);
        let frame = match raw.event.as_str() {
            "start" => ResultFrame::Start {
                test: fields.test.unwrap_or_default(),
            },
            "result" => ResultFrame::Result {
                test: fields.test.unwrap_or_default(),
                outcome: fields.outcome.unwrap_or_default(),
                message: fields.message,
                traceback: fields.traceback,
            },
            _ => ResultFrame::Other { event: raw.event },
        };
        Ok(frame)
    }
}

const HEADER: &[u8] = b"content-length:";

/// Largest body a frame may announce.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Stateful decoder for `content-length:` framed JSON.
///
/// ```
/// use pyrunner::transport::{FrameDecoder, ResultFrame};
///
/// let mut decoder = FrameDecoder::new();
/// let body = r#"{"event":"start","test":"a.b.c"}"#;
/// let wire = format!("content-length:{}{}", body.len(), body);
///
/// assert!(decoder.push(&wire.as_bytes()[..10]).is_empty());
/// let frames = decoder.push(&wire.as_bytes()[10..]);
/// assert_eq!(frames, vec![Ok(ResultFrame::Start { test: "a.b.c".into() })]);
/// ```
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `data` and returns every frame completed by it, in order.
    ///
    /// A frame whose body is not valid JSON yields an error in its place;
    /// decoding carries on with the next frame. So does a header announcing
    /// more than [`MAX_FRAME_LEN`] bytes, whose body is skipped up to the
    /// next header.
    pub fn push(&mut self, data: &[u8]) -> Vec<Result<ResultFrame, FrameError>> {
        self.buffer.extend_from_slice(data);
        let mut frames = Vec::new();

        while let Some(start) = self.buffer.iter().position(|b| *b == b'{') {
            let header = &self.buffer[..start];
            let Some(length) = parse_header(header) else {
                frames.push(Err(FrameError::Header(
                    String::from_utf8_lossy(header).into_owned(),
                )));
                self.resync(start);
                continue;
            };

            let end = match start.checked_add(length) {
                Some(end) if length <= MAX_FRAME_LEN => end,
                _ => {
                    frames.push(Err(FrameError::Header(
                        String::from_utf8_lossy(header).into_owned(),
                    )));
                    self.resync(start);
                    continue;
                }
            };
            if self.buffer.len() < end {
                break;
            }
            frames.push(ResultFrame::from_json(&self.buffer[start..end]));
            self.buffer.drain(..end);
        }

        frames
    }

    /// Returns `true` if no partial frame is buffered.
    pub fn is_empty(&self) -> bool {
        self.buffer.iter().all(u8::is_ascii_whitespace)
    }

    /// Drops bytes up to the next header after `from`.
    fn resync(&mut self, from: usize) {
        let next = self.buffer[from..]
            .windows(HEADER.len())
            .position(|window| window.eq_ignore_ascii_case(HEADER));
        match next {
            Some(offset) => {
                self.buffer.drain(..from + offset);
            }
            None => self.buffer.clear(),
        }
    }
}

fn parse_header(header: &[u8]) -> Option<usize> {
    let header = std::str::from_utf8(header).ok()?.trim();
    let (name, value) = header.split_once(':')?;
    if !name.trim().eq_ignore_ascii_case("content-length") {
        return None;
    }
    value.trim().parse().ok()
}

/// Something the server observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Connected,
    Frame(ResultFrame),
    Disconnected,
    Error(String),
}

/// Callback receiving every [`ServerEvent`].
pub type FrameHandler = Arc<dyn Fn(ServerEvent) + Send + Sync>;

/// Loopback TCP server receiving framed results from a runner.
///
/// The server is started before the runner is spawned so the port can be
/// passed on its command line. Each accepted connection gets its own
/// [`FrameDecoder`].
pub struct ResultServer {
    handler: FrameHandler,
    stop_accepting: CancellationToken,
    stop_reading: CancellationToken,
    state: Mutex<ServerState>,
}

#[derive(Default)]
struct ServerState {
    addr: Option<SocketAddr>,
    task: Option<JoinHandle<()>>,
}

impl ResultServer {
    pub fn new(handler: FrameHandler) -> Self {
        Self {
            handler,
            stop_accepting: CancellationToken::new(),
            stop_reading: CancellationToken::new(),
            state: Mutex::new(ServerState::default()),
        }
    }

    /// Binds an OS-assigned port on `[::1]`, falling back to `127.0.0.1`,
    /// and starts accepting. Returns the bound port.
    ///
    /// Calling `start` on a running server returns the existing port.
    pub async fn start(&self) -> TransportResult<u16> {
        if let Some(addr) = self.local_addr() {
            return Ok(addr.port());
        }

        let listener = match TcpListener::bind((Ipv6Addr::LOCALHOST, 0)).await {
            Ok(listener) => listener,
            Err(e) => {
                debug!("IPv6 loopback unavailable ({}), using IPv4", e);
                TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
                    .await
                    .map_err(TransportError::Bind)?
            }
        };
        let addr = listener.local_addr()?;
        debug!("Result server listening on {}", addr);

        let task = tokio::spawn(accept_loop(
            listener,
            self.handler.clone(),
            self.stop_accepting.clone(),
            self.stop_reading.clone(),
        ));

        let mut state = self.lock_state();
        state.addr = Some(addr);
        state.task = Some(task);
        Ok(addr.port())
    }

    /// The bound address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lock_state().addr
    }

    /// Closes the listener and every open connection. Idempotent.
    pub fn stop(&self) {
        self.stop_accepting.cancel();
        self.stop_reading.cancel();
    }

    /// Stops accepting and waits up to `grace` for open connections to
    /// close on their own, so frames written before the runner exited are
    /// all dispatched. Connections still open afterwards are dropped.
    pub async fn shutdown(&self, grace: Duration) {
        self.stop_accepting.cancel();
        let task = self.lock_state().task.take();
        if let Some(mut task) = task
            && tokio::time::timeout(grace, &mut task).await.is_err()
        {
            warn!("Result connections still open after {:?}, closing", grace);
            self.stop_reading.cancel();
            let _ = task.await;
        }
        self.stop_reading.cancel();
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for ResultServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn accept_loop(
    listener: TcpListener,
    handler: FrameHandler,
    stop_accepting: CancellationToken,
    stop_reading: CancellationToken,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = stop_accepting.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("Runner connected from {}", peer);
                    handler(ServerEvent::Connected);
                    connections.spawn(read_connection(stream, handler.clone(), stop_reading.clone()));
                }
                Err(e) => handler(ServerEvent::Error(e.to_string())),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
    // Connections the kernel already queued are still served.
    while let Some(Ok((stream, _))) = listener.accept().now_or_never() {
        handler(ServerEvent::Connected);
        connections.spawn(read_connection(stream, handler.clone(), stop_reading.clone()));
    }
    drop(listener);
    while connections.join_next().await.is_some() {}
}

async fn read_connection(mut stream: TcpStream, handler: FrameHandler, stop_reading: CancellationToken) {
    let mut decoder = FrameDecoder::new();
    let mut chunk = vec![0u8; 8 * 1024];
    loop {
        let read = tokio::select! {
            _ = stop_reading.cancelled() => break,
            read = stream.read(&mut chunk) => read,
        };
        match read {
            Ok(0) => break,
            Ok(n) => {
                for decoded in decoder.push(&chunk[..n]) {
                    match decoded {
                        Ok(frame) => handler(ServerEvent::Frame(frame)),
                        Err(e) => handler(ServerEvent::Error(e.to_string())),
                    }
                }
            }
            Err(e) => {
                handler(ServerEvent::Error(e.to_string()));
                break;
            }
        }
    }
    if !decoder.is_empty() {
        debug!("Connection closed with a partial frame buffered");
    }
    handler(ServerEvent::Disconnected);
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;

    fn frame(body: &str) -> String {
        format!("content-length:{}{}", body.len(), body)
    }

    #[test]
    fn test_two_frames_in_one_chunk() {
        let result = r#"{"event":"result","test":"m.C.t","outcome":"passed","message":"","traceback":""}"#;
        let start = r#"{"event":"start","test":"m.C.u"}"#;
        let wire = format!("{}{}", frame(result), frame(start));

        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(wire.as_bytes());
        assert_eq!(
            frames,
            vec![
                Ok(ResultFrame::Result {
                    test: "m.C.t".into(),
                    outcome: "passed".into(),
                    message: Some(String::new()),
                    traceback: Some(String::new()),
                }),
                Ok(ResultFrame::Start { test: "m.C.u".into() }),
            ]
        );
        assert!(decoder.is_empty());
    }

    #[test]
    fn test_frame_split_byte_by_byte() {
        let body = r#"{"event":"result","test":"m.C.t","outcome":"failed","message":"ünïcode"}"#;
        let wire = frame(body);
        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        for byte in wire.as_bytes() {
            frames.extend(decoder.push(std::slice::from_ref(byte)));
        }
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            Ok(ResultFrame::Result { message, .. }) => assert_eq!(message.as_deref(), Some("ünïcode")),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_bad_json_does_not_stop_decoding() {
        let wire = format!("{}{}", frame("{not json}"), frame(r#"{"event":"start","test":"x"}"#));
        let frames = FrameDecoder::new().push(wire.as_bytes());
        assert_eq!(frames.len(), 2);
        assert!(matches!(frames[0], Err(FrameError::Body(_))));
        assert_eq!(frames[1], Ok(ResultFrame::Start { test: "x".into() }));
    }

    #[test]
    fn test_bad_header_resyncs() {
        let wire = format!("garbage{{}}{}", frame(r#"{"event":"start","test":"x"}"#));
        let frames = FrameDecoder::new().push(wire.as_bytes());
        assert!(matches!(frames[0], Err(FrameError::Header(_))));
        assert_eq!(frames.last(), Some(&Ok(ResultFrame::Start { test: "x".into() })));
    }

    #[test]
    fn test_oversized_length_resyncs() {
        let wire = format!(
            "content-length:{}{{\"event\":\"start\"}}content-length:{}{{}}{}",
            usize::MAX,
            MAX_FRAME_LEN + 1,
            frame(r#"{"event":"start","test":"x"}"#)
        );
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(wire.as_bytes());
        assert_eq!(frames.len(), 3);
        assert!(matches!(frames[0], Err(FrameError::Header(_))));
        assert!(matches!(frames[1], Err(FrameError::Header(_))));
        assert_eq!(frames[2], Ok(ResultFrame::Start { test: "x".into() }));
        assert!(decoder.is_empty());
    }

    #[test]
    fn test_body_envelope() {
        let body = br#"{"event":"result","body":{"test":"a","outcome":"error","traceback":"tb"}}"#;
        assert_eq!(
            ResultFrame::from_json(body),
            Ok(ResultFrame::Result {
                test: "a".into(),
                outcome: "error".into(),
                message: None,
                traceback: Some("tb".into()),
            })
        );
        assert_eq!(
            ResultFrame::from_json(br#"{"event":"log","message":"hi"}"#),
            Ok(ResultFrame::Other { event: "log".into() })
        );
    }

    #[tokio::test]
    async fn test_server_dispatches_frames_before_shutdown_returns() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let server = ResultServer::new(Arc::new(move |event| sink.lock().unwrap().push(event)));
        server.start().await.unwrap();
        let addr = server.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        let wire = format!(
            "{}{}",
            frame(r#"{"event":"start","test":"t1"}"#),
            frame(r#"{"event":"result","test":"t1","outcome":"passed"}"#)
        );
        client.write_all(wire.as_bytes()).await.unwrap();
        client.shutdown().await.unwrap();
        drop(client);

        tokio::time::timeout(Duration::from_secs(5), async {
            while !events.lock().unwrap().contains(&ServerEvent::Disconnected) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        server.shutdown(Duration::from_secs(5)).await;

        let events = events.lock().unwrap().clone();
        assert_eq!(events.first(), Some(&ServerEvent::Connected));
        assert_eq!(events.last(), Some(&ServerEvent::Disconnected));
        let frames: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, ServerEvent::Frame(_)))
            .collect();
        assert_eq!(frames.len(), 2);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let server = ResultServer::new(Arc::new(|_| {}));
        let port = server.start().await.unwrap();
        assert_ne!(port, 0);
        assert_eq!(server.start().await.unwrap(), port);
        server.stop();
        server.stop();
        server.shutdown(Duration::from_millis(100)).await;
    }
}
