//! Call collision (glare) resolution.
//!
//! When both parties place a call for the same channel at the same time,
//! the colliding inbound invite absorbs the in-flight outbound attempt
//! instead of failing both: in-progress resources move to the
//! replacement call and the superseded call is torn down quietly.

use std::sync::Arc;

use log::info;

use crate::call::Call;
use crate::state::{CallState, HangupParty, HangupReason};

/// Supersede `existing` with `replacement`.
///
/// Depending on how far the existing call got, its local media (or the
/// expectation of it) is handed to the replacement so no second capture
/// round is needed. The hand-off is clear-then-assign within this single
/// invocation: exactly one call owns the handle at any time. The
/// existing call then ends with reason `Replaced`, its owner
/// notification suppressed, its media/session resources still released.
pub(crate) async fn supersede(existing: &Arc<Call>, replacement: &Arc<Call>) {
    {
        let mut old = existing.inner.lock().await;
        // A terminal call never gains a successor.
        if old.state.is_ended() {
            return;
        }

        match old.state {
            CallState::WaitLocalMedia => {
                // Capture still in flight; the handle will be forwarded
                // to the replacement when it lands.
                replacement.inner.lock().await.wait_for_local_media = true;
            }
            CallState::CreateOffer | CallState::InviteSent => {
                if let Some(stream) = old.local_media.take() {
                    replacement.inner.lock().await.local_media = Some(stream);
                }
            }
            _ => {}
        }
        old.successor = Some(Arc::clone(replacement));
    }

    info!(
        target: "Call",
        "call {} superseded by colliding call {}",
        existing.id(),
        replacement.id()
    );
    existing
        .terminate(HangupParty::Local, HangupReason::Replaced, true)
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::CallId;
    use crate::state::CallDirection;
    use crate::test_utils::TestHarness;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_wait_local_media_marks_replacement_waiting() {
        let harness = TestHarness::new();
        harness.media_source.gate_acquire();

        let existing = harness.new_call(CallId::new("OLD"), CallDirection::Outbound);
        existing.place(Default::default()).await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(existing.state().await, CallState::WaitLocalMedia);

        let replacement = harness.new_call(CallId::new("NEW"), CallDirection::Inbound);
        supersede(&existing, &replacement).await;

        assert!(replacement.inner.lock().await.wait_for_local_media);
        assert_eq!(existing.state().await, CallState::Ended);
        assert!(existing.successor().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ended_call_never_gains_successor() {
        let harness = TestHarness::new();
        let existing = harness.new_call(CallId::new("OLD"), CallDirection::Outbound);
        existing.hangup().await;

        let replacement = harness.new_call(CallId::new("NEW"), CallDirection::Inbound);
        supersede(&existing, &replacement).await;

        assert!(existing.successor().await.is_none());
    }
}
