//! JSON-RPC framing codec.
//!
//! Every message travels as `Content-Length: N\r\n\r\n{json}`. The
//! [`FrameDecoder`] is a pure, buffer-driven state machine that can be fed
//! arbitrary fragments of the byte stream; [`FrameReader`] and
//! [`FrameWriter`] drive it over async I/O.
//!
//! Bodies are logged at `TRACE` under the `cls_rpc::wire` target.

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::FrameError;

/// Default maximum frame body size (4 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Maximum size of a header block, terminator excluded.
const MAX_HEADER_BYTES: usize = 8 * 1024;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

const READ_CHUNK_BYTES: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    /// Waiting for a complete header block.
    Headers,
    /// Headers consumed; waiting for `content_length` body bytes.
    Body { content_length: usize },
}

/// Accumulates raw input and extracts complete frames.
///
/// Bytes belonging to the next frame stay buffered between calls, so the
/// decoder persists for the whole life of a connection.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    state: DecodeState,
    max_frame_bytes: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_frame_bytes(DEFAULT_MAX_FRAME_BYTES)
    }

    pub fn with_max_frame_bytes(max_frame_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            state: DecodeState::Headers,
            max_frame_bytes,
        }
    }

    /// Appends freshly read bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet consumed by a frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Extracts the next complete frame.
    ///
    /// Returns `Ok(None)` when more input is needed. Any error leaves the
    /// stream misaligned; the caller must drop the connection.
    pub fn decode(&mut self) -> Result<Option<Value>, FrameError> {
        loop {
            match self.state {
                DecodeState::Headers => {
                    self.skip_blank_lines();
                    let Some(end) = find_terminator(&self.buffer) else {
                        if self.buffer.len() > MAX_HEADER_BYTES {
                            return Err(FrameError::HeaderTooLarge {
                                max: MAX_HEADER_BYTES,
                            });
                        }
                        return Ok(None);
                    };
                    if end > MAX_HEADER_BYTES {
                        return Err(FrameError::HeaderTooLarge {
                            max: MAX_HEADER_BYTES,
                        });
                    }

                    let content_length = parse_headers(&self.buffer[..end])?;
                    if content_length > self.max_frame_bytes {
                        return Err(FrameError::FrameTooLarge {
                            length: content_length,
                            max: self.max_frame_bytes,
                        });
                    }

                    self.buffer.drain(..end + HEADER_TERMINATOR.len());
                    self.state = DecodeState::Body { content_length };
                }
                DecodeState::Body { content_length } => {
                    if self.buffer.len() < content_length {
                        return Ok(None);
                    }
                    let body: Vec<u8> = self.buffer.drain(..content_length).collect();
                    self.state = DecodeState::Headers;

                    tracing::trace!(
                        target: "cls_rpc::wire",
                        body = %String::from_utf8_lossy(&body),
                        "<- frame"
                    );
                    let value = serde_json::from_slice(&body).map_err(FrameError::Parse)?;
                    return Ok(Some(value));
                }
            }
        }
    }

    /// Checks that end-of-stream fell on a frame boundary.
    pub fn finish(&self) -> Result<(), FrameError> {
        match self.state {
            DecodeState::Body { .. } => Err(FrameError::UnexpectedEof),
            DecodeState::Headers if self.buffer.iter().all(u8::is_ascii_whitespace) => Ok(()),
            DecodeState::Headers => Err(FrameError::UnexpectedEof),
        }
    }

    /// Drops `\r`/`\n` left between frames by peers that terminate bodies
    /// with an uncounted line break.
    fn skip_blank_lines(&mut self) {
        let blank = self
            .buffer
            .iter()
            .take_while(|b| matches!(b, b'\r' | b'\n'))
            .count();
        if blank > 0 {
            self.buffer.drain(..blank);
        }
    }
}

fn find_terminator(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(HEADER_TERMINATOR.len())
        .position(|window| window == HEADER_TERMINATOR)
}

/// Parses a header block (terminator excluded) and returns the body length.
fn parse_headers(block: &[u8]) -> Result<usize, FrameError> {
    let text = std::str::from_utf8(block).map_err(|_| FrameError::InvalidHeader)?;
    let mut content_length: Option<usize> = None;

    for line in text.split("\r\n") {
        let line = line.trim();
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        // LSP uses "Content-Length" but peers vary in casing.
        if key.trim().eq_ignore_ascii_case("Content-Length") {
            let value = value.trim();
            let len = value
                .parse::<usize>()
                .map_err(|_| FrameError::InvalidContentLength(value.to_string()))?;
            content_length = Some(len);
        }
        // Other headers (e.g. Content-Type) are ignored.
    }

    match content_length {
        Some(0) | None => Err(FrameError::MissingContentLength),
        Some(len) => Ok(len),
    }
}

/// Serializes `message` and prepends its `Content-Length` header.
pub fn encode_frame<T: Serialize + ?Sized>(message: &T) -> Result<Vec<u8>, FrameError> {
    let body = serde_json::to_vec(message).map_err(FrameError::Serialize)?;
    tracing::trace!(
        target: "cls_rpc::wire",
        body = %String::from_utf8_lossy(&body),
        "-> frame"
    );

    let mut frame = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Reads JSON-RPC frames from an async reader.
pub struct FrameReader<R> {
    reader: R,
    decoder: FrameDecoder,
    chunk: Box<[u8]>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self::with_max_frame_bytes(reader, DEFAULT_MAX_FRAME_BYTES)
    }

    pub fn with_max_frame_bytes(reader: R, max_frame_bytes: usize) -> Self {
        Self {
            reader,
            decoder: FrameDecoder::with_max_frame_bytes(max_frame_bytes),
            chunk: vec![0u8; READ_CHUNK_BYTES].into_boxed_slice(),
        }
    }

    /// Read the next JSON-RPC frame.
    ///
    /// Returns `Ok(None)` on EOF at a frame boundary (clean shutdown).
    /// Cancel-safe: bytes already read stay in the decoder.
    pub async fn read_frame(&mut self) -> Result<Option<Value>, FrameError> {
        loop {
            if let Some(value) = self.decoder.decode()? {
                return Ok(Some(value));
            }

            let n = self.reader.read(&mut self.chunk).await?;
            if n == 0 {
                self.decoder.finish()?;
                return Ok(None);
            }
            self.decoder.extend(&self.chunk[..n]);
        }
    }
}

/// Writes JSON-RPC frames to an async writer.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write a JSON-RPC frame with `Content-Length` header.
    pub async fn write_frame<T: Serialize + ?Sized>(&mut self, message: &T) -> Result<(), FrameError> {
        let frame = encode_frame(message)?;
        self.write_encoded(&frame).await
    }

    /// Write a frame produced by [`encode_frame`].
    pub async fn write_encoded(&mut self, frame: &[u8]) -> Result<(), FrameError> {
        self.writer.write_all(frame).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_for(body: &str) -> Vec<u8> {
        let mut frame = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
        frame.extend_from_slice(body.as_bytes());
        frame
    }

    #[test]
    fn test_decoder_roundtrip() {
        let values = [
            serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": "ping", "params": {}}),
            serde_json::json!([1, 2, 3]),
            serde_json::json!("just a string"),
            serde_json::json!({"nested": {"k": "é", "list": [null, true, 1.5]}}),
        ];

        for value in values {
            let mut decoder = FrameDecoder::new();
            decoder.extend(&encode_frame(&value).unwrap());
            assert_eq!(decoder.decode().unwrap(), Some(value));
            assert_eq!(decoder.buffered(), 0);
        }
    }

    #[test]
    fn test_fragmented_at_every_boundary() {
        let value = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 12,
            "method": "textDocument/didOpen",
            "params": {"uri": "file:///a.cpp", "text": "int main() {}"}
        });
        let frame = encode_frame(&value).unwrap();

        for split in 0..=frame.len() {
            let mut decoder = FrameDecoder::new();
            decoder.extend(&frame[..split]);
            let early = decoder.decode().unwrap();
            if split < frame.len() {
                assert!(early.is_none(), "decoded early at split {split}");
                decoder.extend(&frame[split..]);
                assert_eq!(decoder.decode().unwrap(), Some(value.clone()));
            } else {
                assert_eq!(early, Some(value.clone()));
            }
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let value = serde_json::json!({"jsonrpc": "2.0", "method": "exit"});
        let frame = encode_frame(&value).unwrap();

        let mut decoder = FrameDecoder::new();
        let mut decoded = Vec::new();
        for byte in &frame {
            decoder.extend(std::slice::from_ref(byte));
            if let Some(v) = decoder.decode().unwrap() {
                decoded.push(v);
            }
        }
        assert_eq!(decoded, vec![value]);
    }

    #[test]
    fn test_leftover_bytes_kept_for_next_frame() {
        let first = frame_for(r#"{"id":1}"#);
        let second = frame_for(r#"{"id":2}"#);
        let mut input = first.clone();
        input.extend_from_slice(&second[..10]);

        let mut decoder = FrameDecoder::new();
        decoder.extend(&input);
        assert_eq!(decoder.decode().unwrap().unwrap()["id"], 1);
        assert!(decoder.decode().unwrap().is_none());
        assert_eq!(decoder.buffered(), 10);

        decoder.extend(&second[10..]);
        assert_eq!(decoder.decode().unwrap().unwrap()["id"], 2);
    }

    #[test]
    fn test_uncounted_trailing_crlf_is_skipped() {
        let mut input = frame_for(r#"{"id":1}"#);
        input.extend_from_slice(b"\r\n");
        input.extend_from_slice(&frame_for(r#"{"id":2}"#));
        input.extend_from_slice(b"\r\n");

        let mut decoder = FrameDecoder::new();
        decoder.extend(&input);
        assert_eq!(decoder.decode().unwrap().unwrap()["id"], 1);
        assert_eq!(decoder.decode().unwrap().unwrap()["id"], 2);
        assert!(decoder.decode().unwrap().is_none());
        assert!(decoder.finish().is_ok());
    }

    #[test]
    fn test_non_numeric_content_length() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(b"Content-Length: notanumber\r\n\r\n{}");
        assert!(matches!(
            decoder.decode(),
            Err(FrameError::InvalidContentLength(value)) if value == "notanumber"
        ));
    }

    #[test]
    fn test_zero_content_length() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(b"Content-Length: 0\r\n\r\n");
        assert!(matches!(
            decoder.decode(),
            Err(FrameError::MissingContentLength)
        ));
    }

    #[test]
    fn test_missing_content_length() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(b"Content-Type: application/json\r\n\r\n{}");
        assert!(matches!(
            decoder.decode(),
            Err(FrameError::MissingContentLength)
        ));
    }

    #[test]
    fn test_header_block_too_large() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&vec![b'x'; MAX_HEADER_BYTES + 1]);
        assert!(matches!(
            decoder.decode(),
            Err(FrameError::HeaderTooLarge { .. })
        ));
    }

    #[test]
    fn test_custom_frame_limit() {
        let mut decoder = FrameDecoder::with_max_frame_bytes(4);
        decoder.extend(&frame_for(r#"{"id":1}"#));
        assert!(matches!(
            decoder.decode(),
            Err(FrameError::FrameTooLarge { length: 8, max: 4 })
        ));
    }

    #[test]
    fn test_finish_mid_frame() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(b"Content-Length: 10\r\n\r\n{\"a\"");
        assert!(decoder.decode().unwrap().is_none());
        assert!(matches!(decoder.finish(), Err(FrameError::UnexpectedEof)));

        let mut decoder = FrameDecoder::new();
        decoder.extend(b"Content-Len");
        assert!(decoder.decode().unwrap().is_none());
        assert!(matches!(decoder.finish(), Err(FrameError::UnexpectedEof)));
    }

    #[test]
    fn test_header_value_whitespace_trimmed() {
        let body = r#"{"id":1}"#;
        let input = format!("  content-LENGTH :   {}  \r\n\r\n{body}", body.len());
        let mut decoder = FrameDecoder::new();
        decoder.extend(input.as_bytes());
        assert_eq!(decoder.decode().unwrap().unwrap()["id"], 1);
    }

    #[tokio::test]
    async fn test_roundtrip() {
        let msg = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "window/logMessage",
            "params": { "type": 4, "message": "hello" }
        });

        let mut buf = Vec::new();
        let mut writer = FrameWriter::new(&mut buf);
        writer.write_frame(&msg).await.unwrap();

        let mut reader = FrameReader::new(buf.as_slice());
        let result = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(result, msg);
    }

    #[tokio::test]
    async fn test_multiple_frames() {
        let msg1 = serde_json::json!({"jsonrpc": "2.0", "id": 1});
        let msg2 = serde_json::json!({"jsonrpc": "2.0", "id": 2});

        let mut buf = Vec::new();
        let mut writer = FrameWriter::new(&mut buf);
        writer.write_frame(&msg1).await.unwrap();
        writer.write_frame(&msg2).await.unwrap();

        let mut reader = FrameReader::new(buf.as_slice());
        assert_eq!(reader.read_frame().await.unwrap().unwrap(), msg1);
        assert_eq!(reader.read_frame().await.unwrap().unwrap(), msg2);
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_eof_returns_none() {
        let buf: &[u8] = b"";
        let mut reader = FrameReader::new(buf);
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_eof_mid_headers_is_error() {
        let buf: &[u8] = b"Content-Type: application/json\r\n";
        let mut reader = FrameReader::new(buf);
        assert!(matches!(
            reader.read_frame().await,
            Err(FrameError::UnexpectedEof)
        ));
    }

    #[tokio::test]
    async fn test_eof_mid_body() {
        // Content-Length says 100, but only 5 bytes follow
        let buf: &[u8] = b"Content-Length: 100\r\n\r\nhello";
        let mut reader = FrameReader::new(buf);
        assert!(matches!(
            reader.read_frame().await,
            Err(FrameError::UnexpectedEof)
        ));
    }

    #[tokio::test]
    async fn test_invalid_json_body() {
        let body = b"not valid json!!!";
        let frame = format!("Content-Length: {}\r\n\r\n", body.len());
        let mut buf = frame.into_bytes();
        buf.extend_from_slice(body);

        let mut reader = FrameReader::new(buf.as_slice());
        assert!(matches!(
            reader.read_frame().await,
            Err(FrameError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn test_reader_across_small_pipe() {
        // A 3-byte pipe forces the reader to reassemble every frame from
        // many partial reads.
        let (mut tx, rx) = tokio::io::duplex(3);
        let messages: Vec<Value> = (0..5)
            .map(|i| serde_json::json!({"jsonrpc": "2.0", "id": i, "result": "é".repeat(i)}))
            .collect();
        let expected = messages.clone();

        let writer = tokio::spawn(async move {
            for msg in &messages {
                tx.write_all(&encode_frame(msg).unwrap()).await.unwrap();
            }
        });

        let mut reader = FrameReader::new(rx);
        let mut received = Vec::new();
        while let Some(value) = reader.read_frame().await.unwrap() {
            received.push(value);
        }
        writer.await.unwrap();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_write_content_length_is_byte_count() {
        let msg = serde_json::json!({"k": "é"});
        let mut buf = Vec::new();
        let mut writer = FrameWriter::new(&mut buf);
        writer.write_frame(&msg).await.unwrap();

        let output = String::from_utf8(buf).unwrap();
        let body = serde_json::to_string(&msg).unwrap();
        assert_eq!(body.len(), 10);
        assert_eq!(output, format!("Content-Length: 10\r\n\r\n{body}"));
    }
}
