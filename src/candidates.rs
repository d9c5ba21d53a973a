//! Outbound candidate batching.
//!
//! Connectivity candidates arrive from the media session in rapid bursts.
//! Rather than emitting one transport message per candidate, discoveries
//! are queued and amalgamated: a short debounce window lets a burst
//! coalesce, then the entire queue is flushed as a single candidates
//! message. Candidates discovered while a batch is in flight join the
//! next batch; a failed batch is spliced back onto the front of the queue
//! so nothing is ever dropped or sent twice.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::Mutex;

use crate::retry::{MAX_SEND_ATTEMPTS, retry_delay};
use crate::signaling::{CallId, Candidate, CandidatesContent, ChannelId, Signal};
use crate::transport::SignalingTransport;

/// Coalescing window between the first enqueued candidate and the flush.
pub(crate) const CANDIDATE_DEBOUNCE: Duration = Duration::from_millis(100);

#[derive(Default)]
struct BatcherState {
    queue: VecDeque<Candidate>,
    /// Send attempts made for the batch currently in flight; zero means
    /// no batch is outstanding.
    tries: u32,
    flush_scheduled: bool,
    closed: bool,
}

pub(crate) struct CandidateBatcher {
    call_id: CallId,
    channel: ChannelId,
    transport: Arc<dyn SignalingTransport>,
    state: Mutex<BatcherState>,
}

impl CandidateBatcher {
    pub(crate) fn new(
        call_id: CallId,
        channel: ChannelId,
        transport: Arc<dyn SignalingTransport>,
    ) -> Arc<Self> {
        Arc::new(Self {
            call_id,
            channel,
            transport,
            state: Mutex::new(BatcherState::default()),
        })
    }

    /// Queue a candidate for delivery. Schedules a debounced flush unless
    /// one is already pending or a batch is mid-retry (in which case the
    /// candidate simply rides the next flush).
    pub(crate) async fn enqueue(self: &Arc<Self>, candidate: Candidate) {
        let mut state = self.state.lock().await;
        if state.closed {
            return;
        }
        state.queue.push_back(candidate);

        if state.tries == 0 && !state.flush_scheduled {
            state.flush_scheduled = true;
            let this = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(CANDIDATE_DEBOUNCE).await;
                this.flush().await;
            });
        }
    }

    /// Take the whole queue as one batch and send it. On success the
    /// queue is drained again immediately, picking up anything enqueued
    /// during the in-flight send.
    pub(crate) fn flush(
        self: &Arc<Self>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
        loop {
            let batch: Vec<Candidate> = {
                let mut state = self.state.lock().await;
                state.flush_scheduled = false;
                if state.closed || state.queue.is_empty() {
                    return;
                }
                state.tries += 1;
                state.queue.drain(..).collect()
            };

            debug!(
                target: "Call/Candidates",
                "sending {} candidates for {}",
                batch.len(),
                self.call_id
            );
            let signal = Signal::Candidates(CandidatesContent {
                call_id: self.call_id.clone(),
                candidates: batch.clone(),
            });

            match self.transport.send_signal(&self.channel, &signal).await {
                Ok(()) => {
                    let mut state = self.state.lock().await;
                    state.tries = 0;
                    // Loop to drain candidates that arrived mid-send.
                }
                Err(e) => {
                    let mut state = self.state.lock().await;
                    // Front-splice keeps discovery order relative to
                    // candidates enqueued while the batch was in flight.
                    for candidate in batch.into_iter().rev() {
                        state.queue.push_front(candidate);
                    }

                    if state.tries > MAX_SEND_ATTEMPTS {
                        warn!(
                            target: "Call/Candidates",
                            "failed to send candidates for {} on attempt {}, giving up for now: {e}",
                            self.call_id,
                            state.tries
                        );
                        // The re-queued candidates ride the next
                        // naturally triggered flush.
                        state.tries = 0;
                        return;
                    }

                    let delay = retry_delay(state.tries);
                    warn!(
                        target: "Call/Candidates",
                        "failed to send candidates for {}, retrying in {delay:?}: {e}",
                        self.call_id
                    );
                    drop(state);

                    let this = Arc::clone(self);
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        this.flush().await;
                    });
                    return;
                }
            }
        }
        })
    }

    /// Drop the queue and refuse further work. Called on call teardown.
    pub(crate) async fn close(&self) {
        let mut state = self.state.lock().await;
        state.closed = true;
        state.queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockSignalingTransport, candidate};

    fn batcher(transport: &Arc<MockSignalingTransport>) -> Arc<CandidateBatcher> {
        CandidateBatcher::new(
            CallId::new("BATCH-TEST"),
            ChannelId::new("!room"),
            transport.clone(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_coalesces_into_one_message() {
        let transport = MockSignalingTransport::new();
        let b = batcher(&transport);

        for i in 0..5 {
            b.enqueue(candidate(i)).await;
        }
        tokio::time::sleep(Duration::from_millis(150)).await;

        let sent = transport.delivered().await;
        assert_eq!(sent.len(), 1);
        match &sent[0].signal {
            Signal::Candidates(c) => assert_eq!(c.candidates.len(), 5),
            other => panic!("unexpected signal {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_waits_full_window() {
        let transport = MockSignalingTransport::new();
        let b = batcher(&transport);

        b.enqueue(candidate(0)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(transport.delivered().await.is_empty());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(transport.delivered().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_batch_requeues_in_order() {
        let transport = MockSignalingTransport::new();
        transport.fail_next(1).await;
        let b = batcher(&transport);

        b.enqueue(candidate(0)).await;
        b.enqueue(candidate(1)).await;
        tokio::time::sleep(Duration::from_millis(110)).await;
        // First attempt failed; enqueue two more before the retry fires.
        b.enqueue(candidate(2)).await;
        b.enqueue(candidate(3)).await;
        tokio::time::sleep(Duration::from_secs(2)).await;

        let delivered = transport.candidates_delivered().await;
        assert_eq!(
            delivered,
            vec![candidate(0), candidate(1), candidate(2), candidate(3)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_six_attempts_but_keeps_candidates() {
        let transport = MockSignalingTransport::new();
        transport.fail_next(usize::MAX).await;
        let b = batcher(&transport);

        b.enqueue(candidate(0)).await;
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(transport.attempt_count().await, 6);
        assert!(transport.delivered().await.is_empty());

        // A fresh enqueue triggers a new flush carrying everything.
        transport.heal().await;
        b.enqueue(candidate(1)).await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        let delivered = transport.candidates_delivered().await;
        assert_eq!(delivered, vec![candidate(0), candidate(1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_batcher_drops_everything() {
        let transport = MockSignalingTransport::new();
        let b = batcher(&transport);

        b.enqueue(candidate(0)).await;
        b.close().await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(transport.attempts().await.is_empty());
    }
}
