//! `multipart/x-mixed-replace` framing for the live MJPEG view.
//!
//! Each part is written as
//!
//! ```text
//! --<boundary>\r\n
//! Content-Type: <type>\r\n
//! \r\n
//! <payload>\r\n
//! ```
//!
//! Browsers replace the previous image with each new part, so there is no
//! closing boundary: the stream ends when the connection does.

use bytes::{BufMut, Bytes, BytesMut};

/// Boundary used by the `/video` route.
pub const BOUNDARY: &str = "frame";

/// Value of the `Content-Type` header for a stream using `boundary`.
pub fn stream_content_type(boundary: &str) -> String {
    format!("multipart/x-mixed-replace; boundary={boundary}")
}

/// Frame one payload as a single multipart part.
///
/// The payload is copied verbatim; parts are delimited by position, not by
/// scanning, so `\r\n` or the boundary string inside it is harmless.
pub fn frame_part(boundary: &str, content_type: &str, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(payload.len() + boundary.len() + content_type.len() + 24);
    buf.put_slice(b"--");
    buf.put_slice(boundary.as_bytes());
    buf.put_slice(b"\r\nContent-Type: ");
    buf.put_slice(content_type.as_bytes());
    buf.put_slice(b"\r\n\r\n");
    buf.put_slice(payload);
    buf.put_slice(b"\r\n");
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_part_exact_bytes() {
        let part = frame_part(BOUNDARY, "image/jpeg", &[0xFF, 0xD8, 0xFF, 0xD9]);
        let mut expected = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
        expected.extend_from_slice(&[0xFF, 0xD8, 0xFF, 0xD9]);
        expected.extend_from_slice(b"\r\n");
        assert_eq!(&part[..], &expected[..]);
    }

    #[test]
    fn test_payload_with_crlf_and_boundary_untouched() {
        let payload = b"\r\n--frame\r\n\r\nabc\r\n";
        let part = frame_part(BOUNDARY, "image/jpeg", payload);
        let header = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";
        assert!(part.starts_with(header));
        assert!(part.ends_with(b"\r\n"));
        assert_eq!(&part[header.len()..part.len() - 2], payload);
    }

    #[test]
    fn test_empty_payload() {
        let part = frame_part(BOUNDARY, "image/jpeg", &[]);
        assert_eq!(&part[..], b"--frame\r\nContent-Type: image/jpeg\r\n\r\n\r\n");
    }

    #[test]
    fn test_stream_content_type() {
        assert_eq!(
            stream_content_type(BOUNDARY),
            "multipart/x-mixed-replace; boundary=frame"
        );
    }
}
