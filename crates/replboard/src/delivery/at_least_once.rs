use crate::error::{BoardError, Result};
use crate::peer::Peer;
use crate::types::{Ack, Message, ReplicaId, SequenceNumber};
use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Peer wrapper that keeps retrying until a call succeeds or the attempts
/// run out
///
/// Each attempt is bounded by `attempt_timeout`. `put` and `delete` are not
/// idempotent, so they get a sequence number from a local counter when the
/// caller did not supply one; every retry reuses it, which lets an
/// [`crate::delivery::AtMostOnceFilter`] on the far side drop the repeats.
pub struct AtLeastOnceProxy<P: Peer> {
    inner: P,
    next_seq: AtomicU64,
    attempt_timeout: Duration,
    max_attempts: u32,
}

impl<P: Peer> AtLeastOnceProxy<P> {
    pub fn new(inner: P, attempt_timeout: Duration, max_attempts: u32) -> Self {
        Self {
            inner,
            next_seq: AtomicU64::new(0),
            attempt_timeout,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    fn tag(&self, seq: Option<SequenceNumber>) -> SequenceNumber {
        seq.unwrap_or_else(|| self.next_seq.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn retry<T, F, Fut>(&self, what: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let mut last_error = BoardError::Timeout(self.attempt_timeout);
        for attempt in 1..=self.max_attempts {
            match tokio::time::timeout(self.attempt_timeout, call()).await {
                Ok(Ok(value)) => {
                    if attempt > 1 {
                        debug!(
                            "{} to {} succeeded on attempt {}",
                            what,
                            self.inner.name(),
                            attempt
                        );
                    }
                    return Ok(value);
                }
                Ok(Err(e)) => {
                    warn!(
                        "{} to {} failed (attempt {}/{}): {}",
                        what,
                        self.inner.name(),
                        attempt,
                        self.max_attempts,
                        e
                    );
                    last_error = e;
                }
                Err(_) => {
                    warn!(
                        "{} to {} timed out after {:?} (attempt {}/{})",
                        what,
                        self.inner.name(),
                        self.attempt_timeout,
                        attempt,
                        self.max_attempts
                    );
                    last_error = BoardError::Timeout(self.attempt_timeout);
                }
            }
        }
        Err(last_error)
    }
}

#[async_trait]
impl<P: Peer> Peer for AtLeastOnceProxy<P> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn put(&self, message: Message, seq: Option<SequenceNumber>) -> Result<Ack> {
        let seq = Some(self.tag(seq));
        self.retry("PUT", || self.inner.put(message.clone(), seq))
            .await
    }

    async fn get(&self, index: usize) -> Result<Message> {
        self.retry("GET", || self.inner.get(index)).await
    }

    async fn get_num(&self) -> Result<usize> {
        self.retry("GETNUM", || self.inner.get_num()).await
    }

    async fn get_board(&self) -> Result<Vec<Message>> {
        self.retry("GETBOARD", || self.inner.get_board()).await
    }

    async fn modify(
        &self,
        index: usize,
        message: Message,
        seq: Option<SequenceNumber>,
    ) -> Result<Ack> {
        self.retry("MODIFY", || self.inner.modify(index, message.clone(), seq))
            .await
    }

    async fn delete(&self, index: usize, seq: Option<SequenceNumber>) -> Result<Ack> {
        let seq = Some(self.tag(seq));
        self.retry("DELETE", || self.inner.delete(index, seq)).await
    }

    async fn delete_all(&self, seq: Option<SequenceNumber>) -> Result<Ack> {
        self.retry("DELETEALL", || self.inner.delete_all(seq)).await
    }

    async fn acquire(&self) -> Result<bool> {
        self.retry("ACQUIRE", || self.inner.acquire()).await
    }

    async fn release(&self) -> Result<bool> {
        self.retry("RELEASE", || self.inner.release()).await
    }

    async fn are_you_alive(&self) -> Result<bool> {
        self.retry("AREYOUALIVE", || self.inner.are_you_alive())
            .await
    }

    async fn election(&self) -> Result<bool> {
        self.retry("ELECTION", || self.inner.election()).await
    }

    async fn set_coordinator(&self, coordinator: ReplicaId) -> Result<()> {
        self.retry("SETCOORDINATOR", || self.inner.set_coordinator(coordinator))
            .await
    }

    async fn get_sequence_number(&self) -> Result<SequenceNumber> {
        self.retry("GETSEQUENCENUMBER", || self.inner.get_sequence_number())
            .await
    }

    async fn synchronize(&self, other: ReplicaId) -> Result<()> {
        self.retry("SYNCHRONIZE", || self.inner.synchronize(other))
            .await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicU32;

    /// Fails (or hangs) for the first `failures` calls, then succeeds
    struct Flaky {
        failures: u32,
        hang: bool,
        calls: AtomicU32,
        seen: Mutex<Vec<Option<SequenceNumber>>>,
    }

    impl Flaky {
        fn new(failures: u32, hang: bool) -> Self {
            Self {
                failures,
                hang,
                calls: AtomicU32::new(0),
                seen: Mutex::new(Vec::new()),
            }
        }

        async fn attempt(&self, seq: Option<SequenceNumber>) -> Result<Ack> {
            self.seen.lock().unwrap().push(seq);
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                if self.hang {
                    std::future::pending::<()>().await;
                }
                return Err(BoardError::Remote);
            }
            Ok(Ack::Done)
        }
    }

    #[async_trait]
    impl Peer for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }
        async fn put(&self, _message: Message, seq: Option<SequenceNumber>) -> Result<Ack> {
            self.attempt(seq).await
        }
        async fn get(&self, _index: usize) -> Result<Message> {
            Err(BoardError::Remote)
        }
        async fn get_num(&self) -> Result<usize> {
            self.attempt(None).await.map(|_| 7)
        }
        async fn get_board(&self) -> Result<Vec<Message>> {
            Err(BoardError::Remote)
        }
        async fn modify(
            &self,
            _index: usize,
            _message: Message,
            seq: Option<SequenceNumber>,
        ) -> Result<Ack> {
            self.attempt(seq).await
        }
        async fn delete(&self, _index: usize, seq: Option<SequenceNumber>) -> Result<Ack> {
            self.attempt(seq).await
        }
        async fn delete_all(&self, seq: Option<SequenceNumber>) -> Result<Ack> {
            self.attempt(seq).await
        }
        async fn acquire(&self) -> Result<bool> {
            Ok(true)
        }
        async fn release(&self) -> Result<bool> {
            Ok(true)
        }
        async fn are_you_alive(&self) -> Result<bool> {
            Ok(true)
        }
        async fn election(&self) -> Result<bool> {
            Ok(true)
        }
        async fn set_coordinator(&self, _coordinator: ReplicaId) -> Result<()> {
            Ok(())
        }
        async fn get_sequence_number(&self) -> Result<SequenceNumber> {
            Ok(1)
        }
        async fn synchronize(&self, _other: ReplicaId) -> Result<()> {
            Ok(())
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failures_below_limit_are_hidden() {
        let proxy = AtLeastOnceProxy::new(Flaky::new(3, false), Duration::from_millis(50), 5);
        assert_eq!(proxy.put("m".into(), None).await.unwrap(), Ack::Done);
        assert_eq!(proxy.inner().calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_retries_reuse_one_sequence_number() {
        let proxy = AtLeastOnceProxy::new(Flaky::new(2, false), Duration::from_millis(50), 5);
        proxy.put("m".into(), None).await.unwrap();
        proxy.delete(0, None).await.unwrap();

        let seen = proxy.inner().seen.lock().unwrap().clone();
        assert_eq!(seen, vec![Some(1), Some(1), Some(1), Some(2)]);
    }

    #[tokio::test]
    async fn test_idempotent_calls_are_not_tagged() {
        let proxy = AtLeastOnceProxy::new(Flaky::new(0, false), Duration::from_millis(50), 5);
        proxy.modify(0, "m".into(), None).await.unwrap();
        proxy.delete_all(None).await.unwrap();
        proxy.put("m".into(), Some(42)).await.unwrap();

        let seen = proxy.inner().seen.lock().unwrap().clone();
        assert_eq!(seen, vec![None, None, Some(42)]);
    }

    #[tokio::test]
    async fn test_hung_attempts_time_out_and_retry() {
        let proxy = AtLeastOnceProxy::new(Flaky::new(2, true), Duration::from_millis(20), 5);
        assert_eq!(proxy.get_num().await.unwrap(), 7);
        assert_eq!(proxy.inner().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_last_error_surfaces_after_exhaustion() {
        let proxy = AtLeastOnceProxy::new(Flaky::new(10, false), Duration::from_millis(20), 3);
        assert!(matches!(
            proxy.put("m".into(), None).await,
            Err(BoardError::Remote)
        ));
        assert_eq!(proxy.inner().calls.load(Ordering::SeqCst), 3);

        let hanging = AtLeastOnceProxy::new(Flaky::new(10, true), Duration::from_millis(10), 2);
        assert!(matches!(
            hanging.delete(0, None).await,
            Err(BoardError::Timeout(_))
        ));
    }
}
