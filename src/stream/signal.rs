//! Cooperative cancellation shared between a stream run and its item functions.

use std::sync::Arc;
use tokio::sync::watch;

/// Read half handed to every item function.
///
/// Observing it is optional; items that ignore it simply run to completion.
#[derive(Debug, Clone)]
pub struct CancellationSignal {
    receiver: watch::Receiver<Option<String>>,
}

impl CancellationSignal {
    pub fn is_cancelled(&self) -> bool {
        self.receiver.borrow().is_some()
    }

    pub fn reason(&self) -> Option<String> {
        self.receiver.borrow().clone()
    }

    /// Resolves once the run is cancelled. Never resolves for a run that ended normally.
    pub async fn cancelled(&self) -> String {
        let mut receiver = self.receiver.clone();
        let outcome = receiver
            .wait_for(|reason| reason.is_some())
            .await
            .map(|reason| reason.clone());

        match outcome {
            Ok(Some(reason)) => reason,
            _ => std::future::pending().await,
        }
    }
}

/// Write half, kept by the processor, the driver and the result stream
#[derive(Debug, Clone)]
pub(crate) struct CancellationSource {
    sender: Arc<watch::Sender<Option<String>>>,
}

impl CancellationSource {
    pub(crate) fn new() -> Self {
        let (sender, _) = watch::channel(None);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Cancel with `reason`. Only the first call has any effect.
    pub(crate) fn cancel(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        self.sender.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        })
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.sender.borrow().is_some()
    }

    pub(crate) fn signal(&self) -> CancellationSignal {
        CancellationSignal {
            receiver: self.sender.subscribe(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_first_reason_wins() {
        let source = CancellationSource::new();
        let signal = source.signal();
        assert!(!signal.is_cancelled());

        assert!(source.cancel("stream timeout"));
        assert!(!source.cancel("aborted by caller"));
        assert!(source.is_cancelled());
        assert_eq!(signal.reason().as_deref(), Some("stream timeout"));
        assert_eq!(signal.cancelled().await, "stream timeout");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_wakes_waiters() {
        let source = CancellationSource::new();
        let signal = source.signal();
        let waiter = tokio::spawn(async move { signal.cancelled().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        source.cancel("stop");
        assert_eq!(waiter.await.unwrap(), "stop");
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_source_never_cancels() {
        let source = CancellationSource::new();
        let signal = source.signal();
        drop(source);

        let waited =
            tokio::time::timeout(Duration::from_millis(50), signal.cancelled()).await;
        assert!(waited.is_err());
    }
}
