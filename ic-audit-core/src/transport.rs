//! Wire framing shared by the notifier and the server
//!
//! Each envelope travels as one JSON object terminated by `\n`. A receiver
//! reads until the delimiter, so frames survive arbitrary fragmentation or
//! coalescing by the network stack. Older clients write a single raw JSON
//! object with no delimiter and then either close or wait for a reply; the
//! reader accepts such an object as soon as it is complete.

use serde::de::IgnoredAny;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::{Error, Result};
use crate::types::Envelope;

/// Byte separating frames on the wire
pub const FRAME_DELIMITER: u8 = b'\n';

/// Serialize an envelope into a single delimited frame.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>> {
    if !envelope.timestamp.is_finite() {
        return Err(Error::Serialization(
            "timestamp is not a finite number".to_string(),
        ));
    }
    if let Some((key, _)) = envelope
        .extra_fields
        .iter()
        .find(|(_, value)| !value.is_encodable())
    {
        return Err(Error::Serialization(format!(
            "extra field `{}` is not a finite number",
            key
        )));
    }

    let mut frame =
        serde_json::to_vec(envelope).map_err(|e| Error::Serialization(e.to_string()))?;
    frame.push(FRAME_DELIMITER);
    Ok(frame)
}

/// Parse one frame. Surrounding whitespace (including the delimiter) is ignored.
pub fn decode(frame: &[u8]) -> Result<Envelope> {
    let body = trim_ascii_whitespace(frame);
    if body.is_empty() {
        return Err(Error::Decode("empty frame".to_string()));
    }
    serde_json::from_slice(body).map_err(|e| Error::Decode(e.to_string()))
}

/// Write one envelope as a frame.
pub async fn write_frame<W>(writer: &mut W, envelope: &Envelope) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode(envelope)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Whether `bytes` hold exactly one complete JSON object.
///
/// Only checked when the data ends in `}`; a strict prefix of an object never
/// parses on its own.
fn is_complete_object(bytes: &[u8]) -> bool {
    let body = trim_ascii_whitespace(bytes);
    body.first() == Some(&b'{')
        && body.last() == Some(&b'}')
        && serde_json::from_slice::<IgnoredAny>(body).is_ok()
}

fn trim_ascii_whitespace(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}

/// Reads delimited frames from a byte stream.
///
/// Partially received bytes stay buffered between calls, so `next_frame`
/// can be wrapped in a timeout and resumed without losing data.
pub struct FrameReader<R> {
    reader: BufReader<R>,
    max_frame_bytes: usize,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, max_frame_bytes: usize) -> Self {
        Self {
            reader: BufReader::new(inner),
            max_frame_bytes,
            buf: Vec::new(),
        }
    }

    /// Next raw frame, or `None` once the stream is exhausted.
    ///
    /// A frame ends at the delimiter, at end of stream, or as soon as the
    /// buffered bytes form one complete JSON object. The last case serves
    /// senders that write a bare object and then wait for the peer to close.
    ///
    /// Blank lines are skipped. A frame longer than `max_frame_bytes` is a
    /// decode error; the stream should be dropped afterwards since the reader
    /// is no longer aligned to a frame boundary.
    pub async fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                if trim_ascii_whitespace(&self.buf).is_empty() {
                    self.buf.clear();
                    return Ok(None);
                }
                return Ok(Some(std::mem::take(&mut self.buf)));
            }

            let (used, terminated) = match available.iter().position(|b| *b == FRAME_DELIMITER) {
                Some(i) => (i + 1, true),
                None => (available.len(), false),
            };
            self.buf.extend_from_slice(&available[..used]);
            self.reader.consume(used);

            let body_len = self.buf.len() - usize::from(terminated);
            if body_len > self.max_frame_bytes {
                self.buf.clear();
                return Err(Error::Decode(format!(
                    "frame exceeds {} bytes",
                    self.max_frame_bytes
                )));
            }

            if !terminated && !is_complete_object(&self.buf) {
                continue;
            }
            if trim_ascii_whitespace(&self.buf).is_empty() {
                self.buf.clear();
                continue;
            }
            return Ok(Some(std::mem::take(&mut self.buf)));
        }
    }

    /// Next decoded envelope, or `None` once the stream is exhausted.
    pub async fn next_envelope(&mut self) -> Result<Option<Envelope>> {
        match self.next_frame().await? {
            Some(frame) => decode(&frame).map(Some),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{events, ExtraFields, FieldValue, ProjectIdentity};

    fn envelope(description: &str) -> Envelope {
        let identity = ProjectIdentity::new("arb", "fx", "FX arbitrage", vec![]);
        let mut extra = ExtraFields::new();
        extra.insert("symbol".to_string(), "EURUSD".into());
        Envelope::new(&identity, events::TRADE_OPENED, description, 1_700_000_000.125, extra)
    }

    #[test]
    fn test_encode_appends_single_delimiter() {
        let frame = encode(&envelope("open")).unwrap();
        assert_eq!(frame.last(), Some(&FRAME_DELIMITER));
        assert_eq!(frame.iter().filter(|b| **b == FRAME_DELIMITER).count(), 1);
        assert_eq!(decode(&frame).unwrap(), envelope("open"));
    }

    #[test]
    fn test_encode_rejects_non_finite_fields() {
        let mut bad = envelope("open");
        bad.extra_fields
            .insert("price".to_string(), FieldValue::Float(f64::INFINITY));
        assert!(matches!(encode(&bad), Err(Error::Serialization(_))));
    }

    #[test]
    fn test_decode_malformed_frames() {
        assert!(matches!(decode(b"not json\n"), Err(Error::Decode(_))));
        assert!(matches!(decode(b"   \n"), Err(Error::Decode(_))));
        assert!(matches!(
            decode(br#"{"event_type":"boot"}"#),
            Err(Error::Decode(_))
        ));
    }

    #[tokio::test]
    async fn test_reader_splits_coalesced_frames() {
        let mut bytes = encode(&envelope("one")).unwrap();
        bytes.extend(encode(&envelope("two")).unwrap());
        bytes.extend(b"\n\n");
        bytes.extend(encode(&envelope("three")).unwrap());

        let mut reader = FrameReader::new(bytes.as_slice(), 4096);
        let mut seen = Vec::new();
        while let Some(env) = reader.next_envelope().await.unwrap() {
            seen.push(env.event_description);
        }
        assert_eq!(seen, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn test_reader_reassembles_fragmented_frames() {
        let (mut client, server) = tokio::io::duplex(16);
        let bytes = encode(&envelope("fragmented")).unwrap();

        let writer = tokio::spawn(async move {
            for chunk in bytes.chunks(5) {
                client.write_all(chunk).await.unwrap();
                tokio::task::yield_now().await;
            }
        });

        let mut reader = FrameReader::new(server, 4096);
        let env = reader.next_envelope().await.unwrap().unwrap();
        writer.await.unwrap();

        assert_eq!(env.event_description, "fragmented");
        assert!(reader.next_envelope().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reader_accepts_unterminated_final_frame() {
        let bytes = serde_json::to_vec(&envelope("legacy")).unwrap();
        let mut reader = FrameReader::new(bytes.as_slice(), 4096);

        let env = reader.next_envelope().await.unwrap().unwrap();
        assert_eq!(env.event_description, "legacy");
        assert!(reader.next_envelope().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reader_returns_bare_object_while_stream_open() {
        let (mut client, server) = tokio::io::duplex(64);
        let bytes = serde_json::to_vec(&envelope("waiting")).unwrap();

        let writer = tokio::spawn(async move {
            for chunk in bytes.chunks(7) {
                client.write_all(chunk).await.unwrap();
                tokio::task::yield_now().await;
            }
            // Hold the stream open like a client blocked on a reply
            client
        });

        let mut reader = FrameReader::new(server, 4096);
        let env = tokio::time::timeout(std::time::Duration::from_secs(2), reader.next_envelope())
            .await
            .expect("complete object should not wait for end of stream")
            .unwrap()
            .unwrap();
        assert_eq!(env.event_description, "waiting");
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_reader_keeps_partial_frame_across_timeouts() {
        let (mut client, server) = tokio::io::duplex(4096);
        let frame = encode(&envelope("slow")).unwrap();
        let (head, tail) = frame.split_at(10);

        let mut reader = FrameReader::new(server, 4096);
        client.write_all(head).await.unwrap();
        let stalled =
            tokio::time::timeout(std::time::Duration::from_millis(50), reader.next_frame()).await;
        assert!(stalled.is_err());

        client.write_all(tail).await.unwrap();
        let env = reader.next_envelope().await.unwrap().unwrap();
        assert_eq!(env.event_description, "slow");
    }

    #[test]
    fn test_is_complete_object() {
        assert!(is_complete_object(br#" {"a":"}"} "#));
        assert!(!is_complete_object(br#"{"a":"}"#));
        assert!(!is_complete_object(br#"{"a":{"b":1}"#));
        assert!(!is_complete_object(b"[1]"));
    }

    #[tokio::test]
    async fn test_reader_rejects_oversized_frame() {
        let bytes = vec![b'x'; 64];
        let mut reader = FrameReader::new(bytes.as_slice(), 16);
        assert!(matches!(reader.next_frame().await, Err(Error::Decode(_))));
    }

    #[tokio::test]
    async fn test_write_frame_round_trip() {
        let mut out = Vec::new();
        write_frame(&mut out, &envelope("written")).await.unwrap();
        let mut reader = FrameReader::new(out.as_slice(), 4096);
        assert_eq!(
            reader.next_envelope().await.unwrap().unwrap(),
            envelope("written")
        );
    }
}
