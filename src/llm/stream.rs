//! Line-oriented response body parsers: server-sent events and
//! newline-delimited JSON.

use super::LlmError;
use futures_util::{stream, Stream, StreamExt};
use std::pin::Pin;

type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, reqwest::Error>> + Send>>;

/// A parsed SSE event
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

struct LineReader {
    bytes: ByteStream,
    buffer: String,
    finished: bool,
}

impl LineReader {
    fn new(bytes: ByteStream) -> Self {
        Self {
            bytes,
            buffer: String::new(),
            finished: false,
        }
    }

    /// Next complete line, or the unterminated remainder once the body ends.
    async fn next_line(&mut self) -> Option<Result<String, LlmError>> {
        loop {
            if let Some(pos) = self.buffer.find('\n') {
                let line = self.buffer[..pos].trim_end_matches('\r').to_string();
                self.buffer.drain(..=pos);
                return Some(Ok(line));
            }
            if self.finished {
                if self.buffer.is_empty() {
                    return None;
                }
                return Some(Ok(std::mem::take(&mut self.buffer)));
            }
            match self.bytes.next().await {
                Some(Ok(chunk)) => self.buffer.push_str(&String::from_utf8_lossy(&chunk)),
                Some(Err(e)) => return Some(Err(LlmError::Stream(e.to_string()))),
                None => self.finished = true,
            }
        }
    }
}

fn body_bytes(response: reqwest::Response) -> ByteStream {
    Box::pin(response.bytes_stream().map(|chunk| chunk.map(|b| b.to_vec())))
}

/// Parse a response body as an SSE stream.
pub fn parse_sse_stream(
    response: reqwest::Response,
) -> impl Stream<Item = Result<SseEvent, LlmError>> + Send {
    sse_events(body_bytes(response))
}

fn sse_events(bytes: ByteStream) -> impl Stream<Item = Result<SseEvent, LlmError>> + Send {
    struct State {
        lines: LineReader,
        event: Option<String>,
        data: Vec<String>,
    }

    stream::unfold(
        State {
            lines: LineReader::new(bytes),
            event: None,
            data: Vec::new(),
        },
        |mut state| async move {
            loop {
                let line = match state.lines.next_line().await {
                    Some(Ok(line)) => line,
                    Some(Err(e)) => return Some((Err(e), state)),
                    None => {
                        if state.data.is_empty() {
                            return None;
                        }
                        let event = SseEvent {
                            event: state.event.take(),
                            data: state.data.join("\n"),
                        };
                        state.data.clear();
                        return Some((Ok(event), state));
                    }
                };

                if line.is_empty() {
                    if state.data.is_empty() {
                        continue;
                    }
                    let event = SseEvent {
                        event: state.event.take(),
                        data: state.data.join("\n"),
                    };
                    state.data.clear();
                    return Some((Ok(event), state));
                }
                if line.starts_with(':') {
                    continue;
                }
                if let Some(value) = line.strip_prefix("event:") {
                    state.event = Some(value.trim_start().to_string());
                } else if let Some(value) = line.strip_prefix("data:") {
                    state.data.push(value.trim_start().to_string());
                }
            }
        },
    )
}

/// Parse a response body as newline-delimited JSON values.
pub fn parse_json_lines(
    response: reqwest::Response,
) -> impl Stream<Item = Result<serde_json::Value, LlmError>> + Send {
    json_lines(body_bytes(response))
}

fn json_lines(bytes: ByteStream) -> impl Stream<Item = Result<serde_json::Value, LlmError>> + Send {
    stream::unfold(LineReader::new(bytes), |mut lines| async move {
        loop {
            match lines.next_line().await? {
                Ok(line) if line.trim().is_empty() => continue,
                Ok(line) => {
                    let value = serde_json::from_str(&line)
                        .map_err(|e| LlmError::ParseError(format!("{}: {}", e, line)));
                    return Some((value, lines));
                }
                Err(e) => return Some((Err(e), lines)),
            }
        }
    })
}
