//! WebSocket transport: one conversation per connection on `/voice`.

use crate::audio::OutputAudioSink;
use crate::config::SessionConfig;
use crate::output::{OutputQueue, SessionOutput};
use crate::protocol::{
    encode_event, AudioEncoding, ClientAudioFormat, ClientControl, Frame, ProtocolError,
};
use crate::session::{EngineProvider, VoiceSession};
use futures_util::{Sink, SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::protocol::{frame::coding::CloseCode, CloseFrame, Message};
use tokio_util::sync::CancellationToken;

const VOICE_PATH: &str = "/voice";
const HEALTH_BODY: &str = r#"{"status":"healthy","service":"websocket-voice-agent"}"#;
const HEALTH_REQUEST: &[u8] = b"GET /health";
/// How long a slow client may take to send enough of its request line
const REQUEST_LINE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub audio_encoding: AudioEncoding,
    /// Outbound events buffered per connection
    pub output_queue_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            audio_encoding: AudioEncoding::Binary,
            output_queue_capacity: 512,
        }
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

pub struct VoiceServer {
    config: ServerConfig,
    session_config: SessionConfig,
    engines: Arc<dyn EngineProvider>,
}

impl VoiceServer {
    pub fn new(
        config: ServerConfig,
        session_config: SessionConfig,
        engines: Arc<dyn EngineProvider>,
    ) -> Self {
        Self {
            config,
            session_config,
            engines,
        }
    }

    /// Accept connections until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), TransportError> {
        let listener = TcpListener::bind(self.config.bind_address()).await?;
        log::info!(
            "🔌 Voice server listening on ws://{}{}",
            listener.local_addr()?,
            VOICE_PATH
        );

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let (stream, addr) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::error!("🔌 Error accepting connection: {}", e);
                    continue;
                }
            };

            let connection = Connection {
                addr,
                config: self.config.clone(),
                session_config: self.session_config.clone(),
                engines: Arc::clone(&self.engines),
                shutdown: shutdown.child_token(),
            };
            tokio::spawn(async move {
                if let Err(e) = connection.handle(stream).await {
                    log::warn!("🔌 Connection {} ended with error: {}", addr, e);
                }
            });
        }

        log::info!("🛑 Voice server shutting down");
        Ok(())
    }
}

struct Connection {
    addr: SocketAddr,
    config: ServerConfig,
    session_config: SessionConfig,
    engines: Arc<dyn EngineProvider>,
    shutdown: CancellationToken,
}

impl Connection {
    async fn handle(self, mut stream: TcpStream) -> Result<(), TransportError> {
        if is_health_check(&stream).await? {
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                HEALTH_BODY.len(),
                HEALTH_BODY
            );
            stream.write_all(response.as_bytes()).await?;
            stream.shutdown().await?;
            return Ok(());
        }

        let mut query = None;
        let ws_stream = accept_hdr_async(stream, |request: &Request, response: Response| {
            if request.uri().path() != VOICE_PATH {
                let mut error = ErrorResponse::new(Some(format!("no route for {}", request.uri().path())));
                *error.status_mut() = StatusCode::NOT_FOUND;
                return Err(error);
            }
            query = request.uri().query().map(str::to_string);
            Ok(response)
        })
        .await?;
        let (mut write, mut read) = ws_stream.split();

        let format = match ClientAudioFormat::from_query(query.as_deref()) {
            Ok(format) => format,
            Err(e) => {
                close_with(&mut write, CloseCode::Policy, &e.to_string()).await;
                return Err(e.into());
            }
        };
        log::info!(
            "🔌 Client {} connected ({} Hz, {} channel(s))",
            self.addr,
            format.sample_rate,
            format.channels
        );

        let queue = Arc::new(OutputQueue::new(self.config.output_queue_capacity));
        let output: Arc<dyn SessionOutput> = queue.clone();
        let sink = Arc::new(OutputAudioSink::new(Arc::clone(&output)));
        let session = self
            .engines
            .engines(sink)
            .and_then(|engines| VoiceSession::start(self.session_config.clone(), engines, output));
        let session = match session {
            Ok(session) => session,
            Err(e) => {
                log::error!("🔌 Could not start session for {}: {}", self.addr, e);
                close_with(&mut write, CloseCode::Error, "session failed to start").await;
                return Ok(());
            }
        };

        let encoding = self.config.audio_encoding;
        let writer_queue = Arc::clone(&queue);
        let writer = tokio::spawn(async move {
            while let Some(event) = writer_queue.recv().await {
                let message = match encode_event(event, encoding) {
                    Ok(Frame::Text(text)) => Message::Text(text.into()),
                    Ok(Frame::Binary(data)) => Message::Binary(data.into()),
                    Err(e) => {
                        log::warn!("🔌 Could not encode event: {}", e);
                        continue;
                    }
                };
                if let Err(e) = write.send(message).await {
                    log::debug!("🔌 Client write failed: {}", e);
                    break;
                }
            }
            let _ = write.send(Message::Close(None)).await;
            let _ = write.close().await;
        });

        loop {
            let message = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = session.ended() => break,
                message = read.next() => message,
            };
            let message = match message {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    log::warn!("🔌 Read from {} failed: {}", self.addr, e);
                    break;
                }
                None => break,
            };
            match message {
                Message::Binary(data) => {
                    session.submit_audio(data.as_slice(), format.sample_rate, format.channels);
                }
                Message::Text(text) => match ClientControl::parse(text.as_str()) {
                    Ok(ClientControl::Interrupt) => session.interrupt(),
                    Ok(ClientControl::TtsStart) => {
                        log::debug!("🔌 Client {} started playback", self.addr);
                    }
                    Ok(ClientControl::TtsStop) => {
                        log::debug!("🔌 Client {} stopped playback", self.addr);
                    }
                    Err(e) => log::warn!("🔌 Ignoring control message from {}: {}", self.addr, e),
                },
                Message::Close(frame) => {
                    log::debug!("🔌 Client {} closed: {:?}", self.addr, frame);
                    break;
                }
                _ => {}
            }
        }

        let report = session.shutdown().await;
        queue.close();
        let _ = writer.await;
        match report {
            Ok(report) => log::info!(
                "🔌 Client {} disconnected after {} turns ({:?})",
                self.addr,
                report.turns.turns_completed,
                report.end
            ),
            Err(e) => log::warn!("🔌 Session for {} did not shut down cleanly: {}", self.addr, e),
        }
        Ok(())
    }
}

/// Peeks at the request line until it is clear whether this is a health check.
/// Nothing is consumed, so the websocket handshake still sees the full request.
async fn is_health_check(stream: &TcpStream) -> Result<bool, TransportError> {
    let mut head = [0u8; 64];
    let deadline = tokio::time::Instant::now() + REQUEST_LINE_TIMEOUT;
    loop {
        let n = stream.peek(&mut head).await?;
        if n == 0 {
            return Ok(false);
        }
        if let Some(health) = classify_request_line(&head[..n]) {
            return Ok(health);
        }
        if tokio::time::Instant::now() >= deadline {
            log::debug!("🔌 Request line incomplete after {:?}", REQUEST_LINE_TIMEOUT);
            return Ok(false);
        }
        // peek does not wait for new bytes, so back off before looking again
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// `None` while the bytes seen so far could still be either kind of request.
fn classify_request_line(head: &[u8]) -> Option<bool> {
    if head.len() <= HEALTH_REQUEST.len() {
        return if HEALTH_REQUEST.starts_with(head) { None } else { Some(false) };
    }
    if !head.starts_with(HEALTH_REQUEST) {
        return Some(false);
    }
    Some(matches!(head[HEALTH_REQUEST.len()], b' ' | b'?'))
}

async fn close_with<S>(write: &mut S, code: CloseCode, reason: &str)
where
    S: Sink<Message> + Unpin,
{
    let frame = CloseFrame {
        code,
        reason: reason.to_string().into(),
    };
    let _ = write.send(Message::Close(Some(frame))).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_bind_address() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_address(), "0.0.0.0:8000");
        assert_eq!(config.audio_encoding, AudioEncoding::Binary);
    }

    #[tokio::test]
    async fn test_health_check_detection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream
                .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\n\r\n")
                .await
                .unwrap();
            stream
        });
        let (server_side, _) = listener.accept().await.unwrap();
        let _client = client.await.unwrap();
        assert!(is_health_check(&server_side).await.unwrap());
    }

    #[tokio::test]
    async fn test_health_check_request_line_split_across_writes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(b"GET /he").await.unwrap();
            stream.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            stream
                .write_all(b"alth HTTP/1.1\r\nHost: localhost\r\n\r\n")
                .await
                .unwrap();
            stream
        });
        let (server_side, _) = listener.accept().await.unwrap();
        assert!(is_health_check(&server_side).await.unwrap());
        let _client = client.await.unwrap();
    }

    #[test]
    fn test_request_line_classification() {
        assert_eq!(classify_request_line(b"GET /he"), None);
        assert_eq!(classify_request_line(b"GET /health"), None);
        assert_eq!(classify_request_line(b"GET /health HTTP/1.1"), Some(true));
        assert_eq!(classify_request_line(b"GET /health?full=1"), Some(true));
        assert_eq!(classify_request_line(b"GET /healthz"), Some(false));
        assert_eq!(classify_request_line(b"GET /voice HTTP/1.1"), Some(false));
        assert_eq!(classify_request_line(b"POST"), Some(false));
    }
}
