/// Bounded output capture.
///
/// Submission output is never buffered without limit: each stream is capped
/// at the policy ceiling and clipped output carries an explicit truncation
/// marker so the caller can tell the difference.
use std::io::Read;
use std::sync::{Arc, Mutex};

/// Marker appended to clipped output.
pub const TRUNCATION_MARKER: &str = "\n...[output truncated]";

#[derive(Debug, Default)]
struct BufferInner {
    data: Vec<u8>,
    truncated: bool,
}

/// Shared capped byte buffer. Cloning shares the underlying storage, so the
/// interpreter-side writer hooks and the host-side reader see one stream.
#[derive(Clone, Debug)]
pub struct OutputBuffer {
    inner: Arc<Mutex<BufferInner>>,
    limit: usize,
}

impl OutputBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BufferInner::default())),
            limit,
        }
    }

    /// Append bytes, clipping at the limit. Writes past the limit are
    /// dropped silently; the truncation is recorded instead of erroring so
    /// a chatty submission still runs to completion.
    pub fn write(&self, bytes: &[u8]) {
        let mut inner = self.inner.lock().expect("output buffer lock poisoned");
        if inner.data.len() >= self.limit {
            inner.truncated = true;
            return;
        }
        let remaining = self.limit - inner.data.len();
        if bytes.len() > remaining {
            inner.data.extend_from_slice(&bytes[..remaining]);
            inner.truncated = true;
        } else {
            inner.data.extend_from_slice(bytes);
        }
    }

    pub fn is_truncated(&self) -> bool {
        self.inner
            .lock()
            .expect("output buffer lock poisoned")
            .truncated
    }

    /// Drain into a lossy UTF-8 string, marker appended when clipped.
    pub fn into_string(&self) -> String {
        let inner = self.inner.lock().expect("output buffer lock poisoned");
        let mut text = String::from_utf8_lossy(&inner.data).into_owned();
        if inner.truncated {
            text.push_str(TRUNCATION_MARKER);
        }
        text
    }
}

/// Read a stream to EOF, keeping at most `limit` bytes. Returns the
/// collected bytes and whether the stream was clipped.
pub fn read_bounded<R: Read>(mut stream: R, limit: usize) -> (Vec<u8>, bool) {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];
    let mut truncated = false;

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                if buffer.len() + n > limit {
                    let remaining = limit - buffer.len();
                    buffer.extend_from_slice(&chunk[..remaining]);
                    truncated = true;
                    // Keep draining so the writer does not block on a full
                    // pipe, but discard the excess.
                    while let Ok(n) = stream.read(&mut chunk) {
                        if n == 0 {
                            break;
                        }
                    }
                    break;
                }
                buffer.extend_from_slice(&chunk[..n]);
            }
            Err(_) => break,
        }
    }

    (buffer, truncated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_under_limit_are_kept_verbatim() {
        let buffer = OutputBuffer::new(64);
        buffer.write(b"hello\n");
        buffer.write(b"world\n");
        assert_eq!(buffer.into_string(), "hello\nworld\n");
        assert!(!buffer.is_truncated());
    }

    #[test]
    fn overflow_is_clipped_with_marker() {
        let buffer = OutputBuffer::new(8);
        buffer.write(b"0123456789");
        assert!(buffer.is_truncated());
        let text = buffer.into_string();
        assert!(text.starts_with("01234567"));
        assert!(text.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn writes_after_overflow_are_dropped() {
        let buffer = OutputBuffer::new(4);
        buffer.write(b"abcdef");
        buffer.write(b"ghij");
        let text = buffer.into_string();
        assert!(text.starts_with("abcd"));
        assert!(!text.contains("ghij"));
    }

    #[test]
    fn clones_share_storage() {
        let buffer = OutputBuffer::new(64);
        let writer = buffer.clone();
        writer.write(b"shared");
        assert_eq!(buffer.into_string(), "shared");
    }

    #[test]
    fn read_bounded_clips_long_streams() {
        let data = vec![b'x'; 10_000];
        let (collected, truncated) = read_bounded(&data[..], 1024);
        assert_eq!(collected.len(), 1024);
        assert!(truncated);

        let (collected, truncated) = read_bounded(&b"short"[..], 1024);
        assert_eq!(collected, b"short");
        assert!(!truncated);
    }
}
