//! Bounded rotating output capture buffer, shared between a child's stdout
//! and stderr reader tasks and the periodic ticker / finalizer (C4).
//!
//! Always retains the *last* `capacity` bytes written, per spec.md §4.4's
//! three write regimes. Interleaving between stdout and stderr is
//! best-effort, not ordered.

use std::sync::Arc;
use tokio::sync::Mutex;

/// Thread-safe handle to a rotating buffer of a fixed capacity.
#[derive(Clone)]
pub struct RotatingBuffer {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    capacity: usize,
    data: Vec<u8>,
}

impl RotatingBuffer {
    pub fn new(capacity: usize) -> Self {
        RotatingBuffer {
            inner: Arc::new(Mutex::new(Inner {
                capacity,
                data: Vec::with_capacity(capacity),
            })),
        }
    }

    /// Append `bytes`, applying the rotation rule so that at most
    /// `capacity` bytes are ever retained.
    pub async fn write(&self, bytes: &[u8]) {
        let mut inner = self.inner.lock().await;
        inner.write(bytes);
    }

    /// Return the current contents as a UTF-8 string (lossily, since child
    /// output is not guaranteed valid UTF-8) and reset `used` to zero.
    pub async fn drain(&self) -> String {
        let mut inner = self.inner.lock().await;
        inner.drain()
    }
}

impl Inner {
    fn write(&mut self, bytes: &[u8]) {
        let cap = self.capacity;
        if bytes.len() >= cap {
            self.data.clear();
            self.data.extend_from_slice(&bytes[bytes.len() - cap..]);
            return;
        }

        let slack = cap - self.data.len();
        if bytes.len() <= slack {
            self.data.extend_from_slice(bytes);
            return;
        }

        let overflow = self.data.len() + bytes.len() - cap;
        self.data.drain(0..overflow);
        self.data.extend_from_slice(bytes);
    }

    fn drain(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.data).into_owned();
        self.data.clear();
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_within_capacity_appends() {
        let buf = RotatingBuffer::new(10);
        buf.write(b"abc").await;
        buf.write(b"def").await;
        assert_eq!(buf.drain().await, "abcdef");
    }

    #[tokio::test]
    async fn write_exceeding_capacity_discards_and_keeps_tail() {
        let buf = RotatingBuffer::new(10);
        buf.write(b"01234567890123").await; // 14 bytes, cap 10
        assert_eq!(buf.drain().await, "4567890123");
    }

    #[tokio::test]
    async fn write_overflowing_slack_shifts_left() {
        let buf = RotatingBuffer::new(900);
        buf.write(&vec![b'A'; 500]).await;
        buf.write(&vec![b'B'; 700]).await;
        let drained = buf.drain().await;
        assert_eq!(drained.len(), 900);
        assert_eq!(&drained[..200], "A".repeat(200).as_str());
        assert_eq!(&drained[200..], "B".repeat(700).as_str());
    }

    #[tokio::test]
    async fn drain_is_idempotent_without_intervening_writes() {
        let buf = RotatingBuffer::new(10);
        buf.write(b"hi").await;
        assert_eq!(buf.drain().await, "hi");
        assert_eq!(buf.drain().await, "");
    }

    #[tokio::test]
    async fn rotation_property_holds_for_arbitrary_write_sequence() {
        let cap = 16usize;
        let buf = RotatingBuffer::new(cap);
        let mut expected = Vec::new();
        let writes: [&[u8]; 4] = [b"hello", b"world this is longer", b"x", b""];
        for w in writes {
            buf.write(w).await;
            expected.extend_from_slice(w);
        }
        let want_len = expected.len().min(cap);
        let want = &expected[expected.len() - want_len..];
        assert_eq!(buf.drain().await.as_bytes(), want);
    }
}
