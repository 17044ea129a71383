//! Utility functions for the uart-bridge crate.

/// Decode an inbound payload as UTF-8.
///
/// Returns `None` when the payload is not valid UTF-8. Invalid payloads are
/// dropped whole; no partial sequence is carried over to the next payload.
///
/// # Example
///
/// ```
/// use uart_bridge::decode_utf8;
///
/// assert_eq!(decode_utf8(b"ok\n").as_deref(), Some("ok\n"));
/// assert_eq!(decode_utf8(&[0xff, 0xfe]), None);
/// ```
#[inline]
pub fn decode_utf8(payload: &[u8]) -> Option<String> {
    std::str::from_utf8(payload).ok().map(str::to_owned)
}

/// Split an outbound payload into chunks of at most `max_len` bytes.
///
/// A `max_len` of zero is treated as one so that a misbehaving link can never
/// stall a send.
///
/// # Example
///
/// ```
/// use uart_bridge::chunk_payload;
///
/// let chunks: Vec<&[u8]> = chunk_payload(b"hello\n", 3).collect();
/// assert_eq!(chunks, vec![&b"hel"[..], &b"lo\n"[..]]);
/// ```
#[inline]
pub fn chunk_payload(payload: &[u8], max_len: usize) -> std::slice::Chunks<'_, u8> {
    payload.chunks(max_len.max(1))
}
