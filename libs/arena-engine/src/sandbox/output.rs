// Bounded capture of a sandbox's output streams.
// Nothing past the cap is ever buffered; overflow is signalled so the
// supervisor can kill the run.

use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Notify;

const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Clone)]
pub struct BoundedBuffer {
    bytes: Vec<u8>,
    cap: usize,
    truncated: bool,
}

impl BoundedBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            bytes: Vec::new(),
            cap,
            truncated: false,
        }
    }

    /// Append as much of `chunk` as fits. Returns false once the cap is hit.
    pub fn push(&mut self, chunk: &[u8]) -> bool {
        if self.truncated {
            return false;
        }
        let room = self.cap - self.bytes.len();
        if chunk.len() > room {
            self.bytes.extend_from_slice(&chunk[..room]);
            self.truncated = true;
            return false;
        }
        self.bytes.extend_from_slice(chunk);
        true
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn into_string(self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// Drain `reader` into a buffer capped at `cap` bytes.
///
/// Stops reading (and drops the reader) as soon as the cap is exceeded,
/// after waking `overflow`.
pub async fn read_bounded<R>(mut reader: R, cap: usize, overflow: Arc<Notify>) -> BoundedBuffer
where
    R: AsyncRead + Unpin,
{
    let mut buffer = BoundedBuffer::new(cap);
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                if !buffer.push(&chunk[..n]) {
                    overflow.notify_one();
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "Output stream read failed");
                break;
            }
        }
    }
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_push_truncates_at_cap() {
        let mut buffer = BoundedBuffer::new(5);
        assert!(buffer.push(b"abc"));
        assert!(!buffer.push(b"defg"));
        assert!(buffer.is_truncated());
        assert!(!buffer.push(b"h"));
        assert_eq!(buffer.into_string(), "abcde");
    }

    #[test]
    fn test_exact_fit_is_not_truncation() {
        let mut buffer = BoundedBuffer::new(4);
        assert!(buffer.push(b"abcd"));
        assert!(!buffer.is_truncated());
        assert_eq!(buffer.into_string(), "abcd");
    }

    #[tokio::test]
    async fn test_read_bounded_signals_overflow() {
        let data = vec![b'y'; 100_000];
        let overflow = Arc::new(Notify::new());
        let buffer = read_bounded(&data[..], 1024, overflow.clone()).await;

        assert!(buffer.is_truncated());
        assert_eq!(buffer.into_string().len(), 1024);
        // notify_one stores a permit, so the waiter sees it even after the fact.
        tokio::time::timeout(Duration::from_millis(100), overflow.notified())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_read_bounded_small_stream() {
        let overflow = Arc::new(Notify::new());
        let buffer = read_bounded(&b"hello\n"[..], 1024, overflow).await;
        assert!(!buffer.is_truncated());
        assert_eq!(buffer.into_string(), "hello\n");
    }
}
