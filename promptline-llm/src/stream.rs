//! Turns vendor byte streams into the unified chunk sequence.
//!
//! Every adapter hands [`normalize`] its response body, a [`Framing`] and a
//! handler that decodes one payload. The handler returns text fragments and
//! records usage in a [`UsageAccumulator`]; the driver takes care of line
//! buffering, dropping empty fragments and emitting the terminal chunk.

use bytes::BytesMut;
use futures::{Stream, StreamExt};
use promptline_core::{ChunkStream, PromptlineError, Result, StreamChunk, TokenUsage};

/// Collects token counts while a stream is read.
///
/// Every supported vendor reports cumulative counts, so each `set_*`
/// overwrites what an earlier event reported.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UsageAccumulator {
    input_tokens: u64,
    output_tokens: u64,
    thinking_tokens: Option<u64>,
    search_calls: Option<u64>,
    fetch_calls: Option<u64>,
}

impl UsageAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_input(&mut self, tokens: u64) {
        self.input_tokens = tokens;
    }

    pub fn set_output(&mut self, tokens: u64) {
        self.output_tokens = tokens;
    }

    pub fn set_thinking(&mut self, tokens: u64) {
        self.thinking_tokens = Some(tokens);
    }

    pub fn set_search_calls(&mut self, calls: u64) {
        self.search_calls = Some(calls);
    }

    pub fn set_fetch_calls(&mut self, calls: u64) {
        self.fetch_calls = Some(calls);
    }

    pub fn output_tokens(&self) -> u64 {
        self.output_tokens
    }

    pub fn finish(&self) -> TokenUsage {
        TokenUsage {
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            thinking_tokens: self.thinking_tokens,
            search_calls: self.search_calls,
            fetch_calls: self.fetch_calls,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Server-sent events; only `data:` lines carry payloads.
    Sse,
    /// One JSON document per line.
    JsonLines,
}

impl Framing {
    fn payload<'a>(&self, line: &'a str) -> Option<&'a str> {
        let line = line.trim();
        match self {
            Framing::Sse => line
                .strip_prefix("data:")
                .map(str::trim_start)
                .filter(|data| !data.is_empty()),
            Framing::JsonLines => Some(line).filter(|line| !line.is_empty()),
        }
    }
}

const SSE_DONE: &str = "[DONE]";

fn take_lines(buffer: &mut BytesMut, flush: bool) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
        let line = buffer.split_to(pos + 1);
        lines.push(String::from_utf8_lossy(&line).into_owned());
    }
    if flush && !buffer.is_empty() {
        let rest = buffer.split();
        lines.push(String::from_utf8_lossy(&rest).into_owned());
    }
    lines
}

/// Drives `bytes` through `handler`.
///
/// On a clean end of input (or an SSE `[DONE]`) exactly one terminal chunk is
/// emitted, with zero counts if the vendor never reported usage. A transport
/// or handler error is yielded once and ends the stream without a terminal
/// chunk.
pub fn normalize<S, B, E, H>(
    provider: String,
    bytes: S,
    framing: Framing,
    mut handler: H,
) -> ChunkStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
    H: FnMut(&str, &mut UsageAccumulator) -> Result<Vec<String>> + Send + 'static,
{
    let stream = async_stream::stream! {
        let mut usage = UsageAccumulator::new();
        let mut buffer = BytesMut::new();
        let mut bytes = Box::pin(bytes);
        let mut finished = false;

        loop {
            let (lines, at_end) = match bytes.next().await {
                Some(Ok(chunk)) => {
                    buffer.extend_from_slice(chunk.as_ref());
                    (take_lines(&mut buffer, false), false)
                }
                Some(Err(err)) => {
                    yield Err(PromptlineError::provider(&provider, err));
                    return;
                }
                None => (take_lines(&mut buffer, true), true),
            };

            for line in lines {
                let Some(payload) = framing.payload(&line) else {
                    continue;
                };
                if framing == Framing::Sse && payload == SSE_DONE {
                    finished = true;
                    break;
                }
                match handler(payload, &mut usage) {
                    Ok(texts) => {
                        for text in texts.into_iter().filter(|text| !text.is_empty()) {
                            yield Ok(StreamChunk::text(text));
                        }
                    }
                    Err(err) => {
                        yield Err(err);
                        return;
                    }
                }
            }

            if finished || at_end {
                break;
            }
        }

        tracing::debug!(provider = %provider, "stream finished");
        yield Ok(StreamChunk::terminal(usage.finish()));
    };
    stream.boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn collect(
        framing: Framing,
        parts: Vec<&'static str>,
        handler: impl FnMut(&str, &mut UsageAccumulator) -> Result<Vec<String>> + Send + 'static,
    ) -> Vec<Result<StreamChunk>> {
        let bytes = stream::iter(
            parts
                .into_iter()
                .map(|part| Ok::<_, std::io::Error>(part.as_bytes().to_vec())),
        );
        futures::executor::block_on(
            normalize("test".to_string(), bytes, framing, handler).collect::<Vec<_>>(),
        )
    }

    #[test]
    fn reassembles_lines_split_across_reads() {
        let mut seen = 0u64;
        let chunks = collect(
            Framing::Sse,
            vec!["data: {\"t\":\"He", "llo\"}\n\ndata: {\"t\":\"!\"}\n", "data: [DONE]\n"],
            move |payload, usage| {
                seen += 1;
                usage.set_output(seen);
                let value: serde_json::Value = serde_json::from_str(payload)?;
                Ok(vec![value["t"].as_str().unwrap_or_default().to_string()])
            },
        );

        let chunks: Vec<_> = chunks.into_iter().map(|chunk| chunk.unwrap()).collect();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0], StreamChunk::text("Hello"));
        assert_eq!(chunks[1], StreamChunk::text("!"));
        assert_eq!(chunks[2], StreamChunk::terminal(TokenUsage::new(0, 2)));
    }

    #[test]
    fn terminal_chunk_is_emitted_without_usage_reports() {
        let chunks = collect(Framing::JsonLines, vec!["{\"a\":1}\n{\"a\":2}"], |_, _| {
            Ok(vec![String::new()])
        });
        assert_eq!(chunks.len(), 1);
        assert_eq!(
            chunks[0].as_ref().unwrap(),
            &StreamChunk::terminal(TokenUsage::default())
        );
    }

    #[test]
    fn handler_error_ends_stream_without_terminal_chunk() {
        let chunks = collect(Framing::Sse, vec!["data: x\n", "data: y\n"], |_, _| {
            Err(PromptlineError::provider("test", "bad event"))
        });
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_err());
    }

    #[test]
    fn sse_ignores_event_and_comment_lines() {
        let chunks = collect(
            Framing::Sse,
            vec!["event: message\n: keepalive\ndata: hi\n\n"],
            |payload, _| Ok(vec![payload.to_string()]),
        );
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].as_ref().unwrap(), &StreamChunk::text("hi"));
    }
}
