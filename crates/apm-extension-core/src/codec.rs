//! Wire container and codec for agent intake payloads.
//!
//! Agent bodies are newline-delimited JSON, optionally compressed with gzip
//! or deflate. The first line of a decoded body is the metadata object, the
//! remaining lines are events. Decoding happens once, on the coordinator
//! worker; the decoded bytes are appended to the batch verbatim.

use std::io::Read;

use bytes::Bytes;
use flate2::read::{GzDecoder, ZlibDecoder};

/// Supported `Content-Encoding` values for agent payloads.
pub const SUPPORTED_ENCODINGS: &[&str] = &["", "identity", "gzip", "deflate"];

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("unsupported content encoding: {0:?}")]
    InvalidEncoding(String),

    #[error("failed to decompress payload: {0}")]
    Decompress(#[from] std::io::Error),
}

/// A raw APM intake payload as received from the agent, or a snapshot of the
/// batch buffer on its way out to the APM Server.
#[derive(Debug, Clone)]
pub struct ApmData {
    pub data: Bytes,
    /// Value of the `Content-Encoding` header; empty means identity.
    pub content_encoding: String,
}

impl ApmData {
    pub fn identity(data: impl Into<Bytes>) -> Self {
        ApmData {
            data: data.into(),
            content_encoding: String::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns the decoded payload bytes. Identity payloads are passed
    /// through without copying.
    pub fn into_uncompressed(self) -> Result<Bytes, CodecError> {
        match self.content_encoding.as_str() {
            "" | "identity" => Ok(self.data),
            "gzip" => {
                let mut out = Vec::with_capacity(self.data.len() * 2);
                GzDecoder::new(self.data.as_ref()).read_to_end(&mut out)?;
                Ok(out.into())
            }
            "deflate" => {
                let mut out = Vec::with_capacity(self.data.len() * 2);
                ZlibDecoder::new(self.data.as_ref()).read_to_end(&mut out)?;
                Ok(out.into())
            }
            other => Err(CodecError::InvalidEncoding(other.to_string())),
        }
    }
}

/// Returns true if `encoding` names a content encoding we can decode.
pub fn is_supported_encoding(encoding: &str) -> bool {
    SUPPORTED_ENCODINGS.contains(&encoding)
}

/// Extracts the first top-level key of a JSON object without parsing it:
/// scan to the first quote, remember the quote character, and return the
/// slice up to the matching quote.
///
/// Agent serializers emit the event-type key first with no leading
/// whitespace inside the key, which makes this a reliable and cheap
/// discriminator on the batch hot path.
pub fn find_event_type(line: &[u8]) -> Option<&[u8]> {
    let (start, quote) = line
        .iter()
        .enumerate()
        .find(|(_, b)| **b == b'"' || **b == b'\'')
        .map(|(i, b)| (i + 1, *b))?;
    let key = &line[start..];
    let end = key.iter().position(|b| *b == quote)?;
    Some(&key[..end])
}
