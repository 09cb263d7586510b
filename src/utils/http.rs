use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;

/// Reads at most `max_bytes` of an upstream body. The second value reports whether the body was
/// cut short; a transport error mid-body ends the read with whatever arrived so far.
pub(crate) async fn response_bytes_truncated(
    response: reqwest::Response,
    max_bytes: usize,
) -> (Bytes, bool) {
    let max_bytes = max_bytes.max(1);
    let mut out = BytesMut::new();
    let mut truncated = false;

    let mut stream = response.bytes_stream();
    while let Some(next) = stream.next().await {
        let Ok(chunk) = next else {
            break;
        };
        let remaining = max_bytes.saturating_sub(out.len());
        if remaining == 0 {
            truncated = true;
            break;
        }
        if chunk.len() <= remaining {
            out.extend_from_slice(chunk.as_ref());
        } else {
            out.extend_from_slice(&chunk.as_ref()[..remaining]);
            truncated = true;
            break;
        }
    }
    (out.freeze(), truncated)
}
