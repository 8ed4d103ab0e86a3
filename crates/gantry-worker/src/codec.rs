//! Newline-delimited JSON framing over any `AsyncRead`/`AsyncWrite` pair.
//!
//! One envelope per line. Inbound frames are split into a raw shape —
//! correlation id, payload kind, payload body — before full payload
//! decoding, so the dispatcher can route unknown kinds to its "no handler"
//! path instead of failing the whole frame: the wire protocol keeps
//! introducing message kinds and unknown ones are expected.

use serde::Deserialize;
use tokio::io::AsyncBufRead;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;

use crate::wire::Envelope;
use crate::wire::Payload;

/// Stream framing failure. Read/write errors and unparseable frames end
/// the run loop; an unknown payload kind is not a codec error.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("stream read failed: {0}")]
    Read(#[source] std::io::Error),
    #[error("stream write failed: {0}")]
    Write(#[source] std::io::Error),
    #[error("inbound frame is not a valid envelope: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("inbound envelope must carry exactly one payload entry, found {count}")]
    PayloadShape { count: usize },
    #[error("failed to encode outbound envelope: {0}")]
    Encode(#[source] serde_json::Error),
}

/// An inbound envelope with its payload body still undecoded.
#[derive(Debug, Clone)]
pub struct RawEnvelope {
    pub correlation_id: Option<String>,
    pub kind: String,
    pub body: serde_json::Value,
}

impl RawEnvelope {
    /// Decode the payload. `Ok(None)` means the kind is unknown to this
    /// worker; `Err` means a known kind with a malformed body.
    pub fn decode(&self) -> Result<Option<Payload>, serde_json::Error> {
        if !KNOWN_KINDS.contains(&self.kind.as_str()) {
            return Ok(None);
        }
        let tagged = serde_json::json!({ self.kind.clone(): self.body });
        serde_json::from_value(tagged).map(Some)
    }
}

const KNOWN_KINDS: &[&str] = &[
    "invocationRequest",
    "invocationResponse",
    "invocationCancel",
    "log",
    "workerInitRequest",
    "workerInitResponse",
    "functionLoadRequest",
    "functionLoadResponse",
    "reloadRequest",
    "reloadResponse",
    "workerStatusRequest",
    "workerStatusResponse",
    "workerTerminate",
];

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFrame {
    #[serde(default)]
    correlation_id: Option<String>,
    payload: serde_json::Map<String, serde_json::Value>,
}

/// Read the next envelope. Blank lines are skipped; `Ok(None)` is end of
/// stream.
pub async fn read_envelope<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Option<RawEnvelope>, CodecError> {
    let mut line = String::new();
    loop {
        line.clear();
        let bytes = reader.read_line(&mut line).await.map_err(CodecError::Read)?;
        if bytes == 0 {
            return Ok(None);
        }
        if line.trim().is_empty() {
            continue;
        }
        let frame: RawFrame = serde_json::from_str(line.trim()).map_err(CodecError::Malformed)?;
        if frame.payload.len() != 1 {
            return Err(CodecError::PayloadShape {
                count: frame.payload.len(),
            });
        }
        let (kind, body) = frame
            .payload
            .into_iter()
            .next()
            .unwrap_or_else(|| unreachable!("payload length checked above"));
        return Ok(Some(RawEnvelope {
            correlation_id: frame.correlation_id,
            kind,
            body,
        }));
    }
}

/// Write one envelope as a single line and flush.
pub async fn write_envelope<W: AsyncWrite + Unpin>(writer: &mut W, envelope: &Envelope) -> Result<(), CodecError> {
    let mut bytes = serde_json::to_vec(envelope).map_err(CodecError::Encode)?;
    bytes.push(b'\n');
    writer.write_all(&bytes).await.map_err(CodecError::Write)?;
    writer.flush().await.map_err(CodecError::Write)
}
