//! At-least-once delivery of individual signaling messages.
//!
//! A failed send is retried with exponential backoff, resending the same
//! payload unchanged, and abandoned (logged, nothing else) once the
//! attempt budget is exhausted. Losing a signal this way never fails the
//! call itself; a lost invite or hangup is subsumed by the expiry timers
//! on either side.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, warn};

use crate::signaling::{ChannelId, Signal};
use crate::transport::SignalingTransport;

/// A send is abandoned once its attempt count exceeds this.
pub(crate) const MAX_SEND_ATTEMPTS: u32 = 5;

const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// Backoff before the next attempt, given the number of attempts made so
/// far: 1000, 2000, 4000, 8000, 16000 ms for attempts 1 through 5.
pub(crate) fn retry_delay(attempts: u32) -> Duration {
    RETRY_BASE_DELAY * 2u32.pow(attempts)
}

/// Per-send mutable state threaded through the attempts.
struct RetryContext {
    tries: u32,
}

/// Sends signals for one call with bounded-retry semantics.
///
/// Cancelling stops any in-flight retry loops before their next resend;
/// a final notice can still be dispatched past cancellation for the
/// terminal hangup.
pub(crate) struct ReliableSender {
    transport: Arc<dyn SignalingTransport>,
    channel: ChannelId,
    cancelled: Arc<AtomicBool>,
}

impl ReliableSender {
    pub(crate) fn new(transport: Arc<dyn SignalingTransport>, channel: ChannelId) -> Self {
        Self {
            transport,
            channel,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Dispatch a signal, retrying in the background until delivered,
    /// abandoned, or cancelled.
    pub(crate) fn send(&self, signal: Signal) {
        self.spawn_loop(signal, false);
    }

    /// Like [`send`](Self::send), but keeps retrying even after
    /// [`cancel`](Self::cancel). Used for the single terminal notice.
    pub(crate) fn send_final(&self, signal: Signal) {
        self.spawn_loop(signal, true);
    }

    /// Stop all pending retries at their next wakeup.
    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    fn spawn_loop(&self, signal: Signal, ignore_cancel: bool) {
        let transport = Arc::clone(&self.transport);
        let channel = self.channel.clone();
        let cancelled = Arc::clone(&self.cancelled);

        tokio::spawn(async move {
            let mut ctx = RetryContext { tries: 1 };
            loop {
                if !ignore_cancel && cancelled.load(Ordering::Relaxed) {
                    debug!(
                        target: "Call/Retry",
                        "dropping {} for {}: call ended",
                        signal.signal_type(),
                        signal.call_id()
                    );
                    return;
                }

                match transport.send_signal(&channel, &signal).await {
                    Ok(()) => return,
                    Err(e) => {
                        if ctx.tries > MAX_SEND_ATTEMPTS {
                            warn!(
                                target: "Call/Retry",
                                "failed to send {} for {} on attempt {}, giving up: {e}",
                                signal.signal_type(),
                                signal.call_id(),
                                ctx.tries
                            );
                            return;
                        }
                        let delay = retry_delay(ctx.tries);
                        warn!(
                            target: "Call/Retry",
                            "failed to send {} for {}, retrying in {delay:?}: {e}",
                            signal.signal_type(),
                            signal.call_id()
                        );
                        ctx.tries += 1;
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        });
    }
}
