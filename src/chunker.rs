use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use crate::error::{BridgeError, Result};

/// Default BLE write size
pub const DEFAULT_CHUNK_SIZE: usize = 20;

/// Default pause between chunks
pub const DEFAULT_CHUNK_DELAY: Duration = Duration::from_millis(10);

/// How an outgoing payload is split
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPolicy {
    /// Largest single write
    pub max_chunk_size: usize,
    /// Pause between consecutive chunks
    pub delay: Duration,
}

impl Default for ChunkPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE, DEFAULT_CHUNK_DELAY)
    }
}

impl ChunkPolicy {
    /// Create a policy
    #[must_use]
    pub const fn new(max_chunk_size: usize, delay: Duration) -> Self {
        Self {
            max_chunk_size,
            delay,
        }
    }

    /// Split `data` into ordered chunks
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::InvalidParameters`] if the chunk size is zero.
    pub fn split<'a>(&self, data: &'a [u8]) -> Result<Vec<&'a [u8]>> {
        if self.max_chunk_size == 0 {
            return Err(BridgeError::InvalidParameters(
                "Chunk size must be greater than zero".to_string(),
            ));
        }
        Ok(data.chunks(self.max_chunk_size).collect())
    }
}

/// Destination for chunked writes
#[async_trait]
pub trait ChunkSink: Send + Sync {
    /// Write one chunk without waiting for a response
    async fn write_chunk(&self, chunk: &[u8]) -> Result<()>;
}

/// Write `data` to `sink` in chunks, pausing between them
///
/// A payload at or under the chunk size is a single write with no pause.
/// Returns the number of writes issued.
///
/// # Errors
///
/// Returns [`BridgeError::InvalidParameters`] for a zero chunk size, or the
/// first error reported by the sink; later chunks are not written.
pub async fn write_chunked<S>(sink: &S, data: &[u8], policy: &ChunkPolicy) -> Result<usize>
where
    S: ChunkSink + ?Sized,
{
    let chunks = policy.split(data)?;
    let total = chunks.len();

    for (index, chunk) in chunks.into_iter().enumerate() {
        if index > 0 {
            tokio::time::sleep(policy.delay).await;
        }
        debug!("Writing chunk {}/{}: {:02X?}", index + 1, total, chunk);
        sink.write_chunk(chunk).await?;
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::hex_decode;
    use std::sync::Mutex;
    use tokio::time::Instant;

    #[derive(Default)]
    struct RecordingSink {
        writes: Mutex<Vec<(Instant, Vec<u8>)>>,
        fail_on: Option<usize>,
    }

    #[async_trait]
    impl ChunkSink for RecordingSink {
        async fn write_chunk(&self, chunk: &[u8]) -> Result<()> {
            let mut writes = self.writes.lock().unwrap();
            if self.fail_on == Some(writes.len()) {
                return Err(BridgeError::NotConnected);
            }
            writes.push((Instant::now(), chunk.to_vec()));
            Ok(())
        }
    }

    const STATUS_FRAME: &str = "7B863313061984905000280041DC7D";

    #[tokio::test(start_paused = true)]
    async fn test_short_payload_single_write() {
        let sink = RecordingSink::default();
        let data = hex_decode(STATUS_FRAME).unwrap();
        let started = Instant::now();

        let count = write_chunked(&sink, &data, &ChunkPolicy::default())
            .await
            .unwrap();

        let writes = sink.writes.lock().unwrap();
        assert_eq!(count, 1);
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].1, data);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_doubled_payload_two_writes_with_delay() {
        let sink = RecordingSink::default();
        let mut data = hex_decode(STATUS_FRAME).unwrap();
        data.extend(hex_decode(STATUS_FRAME).unwrap());
        assert_eq!(data.len(), 30);

        let count = write_chunked(&sink, &data, &ChunkPolicy::default())
            .await
            .unwrap();

        let writes = sink.writes.lock().unwrap();
        assert_eq!(count, 2);
        assert_eq!(writes[0].1.len(), 20);
        assert_eq!(writes[1].1.len(), 10);
        assert!(writes[1].0 - writes[0].0 >= DEFAULT_CHUNK_DELAY);

        let rejoined: Vec<u8> = writes.iter().flat_map(|(_, c)| c.clone()).collect();
        assert_eq!(rejoined, data);
    }

    #[tokio::test]
    async fn test_zero_chunk_size_rejected() {
        let sink = RecordingSink::default();
        let policy = ChunkPolicy::new(0, DEFAULT_CHUNK_DELAY);

        let err = write_chunked(&sink, &[1, 2, 3], &policy).await.unwrap_err();
        assert!(matches!(err, BridgeError::InvalidParameters(_)));
        assert!(sink.writes.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sink_error_stops_remaining_chunks() {
        let sink = RecordingSink {
            fail_on: Some(1),
            ..RecordingSink::default()
        };
        let policy = ChunkPolicy::new(4, DEFAULT_CHUNK_DELAY);

        let err = write_chunked(&sink, &[0u8; 12], &policy).await.unwrap_err();
        assert!(matches!(err, BridgeError::NotConnected));
        assert_eq!(sink.writes.lock().unwrap().len(), 1);
    }
}
