//! Debounced "content may have changed" signal
//!
//! A burst of raw page mutations becomes one signal once the page has been
//! quiet for the debounce period. Signals the engine has not consumed yet are
//! coalesced, so at most one is ever queued.

use futures::stream::BoxStream;
use futures::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

enum Quiet {
    Elapsed,
    Mutated,
    Ended,
    Cancelled,
}

/// Owns one observation of the page. Dropping it tears the observation down.
pub struct ChangeDetector {
    signals: mpsc::Receiver<()>,
    cancel: CancellationToken,
}

impl ChangeDetector {
    pub fn spawn(mut source: BoxStream<'static, ()>, debounce: Duration) -> Self {
        let (tx, signals) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        tokio::spawn(async move {
            loop {
                // Wait for the first mutation of a burst
                tokio::select! {
                    _ = token.cancelled() => return,
                    next = source.next() => {
                        if next.is_none() {
                            return;
                        }
                    }
                }

                let ended = loop {
                    let quiet = tokio::select! {
                        _ = token.cancelled() => Quiet::Cancelled,
                        next = source.next() => match next {
                            Some(()) => Quiet::Mutated,
                            None => Quiet::Ended,
                        },
                        _ = tokio::time::sleep(debounce) => Quiet::Elapsed,
                    };
                    match quiet {
                        Quiet::Mutated => continue,
                        Quiet::Elapsed => break false,
                        Quiet::Ended => break true,
                        Quiet::Cancelled => return,
                    }
                };

                if let Err(TrySendError::Closed(_)) = tx.try_send(()) {
                    return;
                }
                if ended {
                    return;
                }
            }
        });

        Self { signals, cancel }
    }

    /// Next debounced signal; `None` once the source has ended
    pub async fn changed(&mut self) -> Option<()> {
        self.signals.recv().await
    }
}

impl Drop for ChangeDetector {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
