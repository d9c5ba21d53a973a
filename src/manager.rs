//! Call manager: registry, placement and inbound dispatch.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::RwLock;

use crate::call::{Call, CallContext};
use crate::error::CallError;
use crate::events::CallObserver;
use crate::glare;
use crate::media::{MediaConstraints, MediaEvent, MediaFactory, MediaSource};
use crate::signaling::{CallId, ChannelId, InviteContent, Signal};
use crate::state::{CallDirection, CallState};
use crate::transport::SignalingTransport;

/// Configuration for the call manager.
#[derive(Clone)]
pub struct CallManagerConfig {
    /// Validity window carried on outbound invites.
    pub invite_lifetime: Duration,
    /// Capture constraints used when answering.
    pub answer_constraints: MediaConstraints,
    /// Optional observer for call lifecycle notifications.
    pub observer: Option<Arc<dyn CallObserver>>,
}

impl fmt::Debug for CallManagerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallManagerConfig")
            .field("invite_lifetime", &self.invite_lifetime)
            .field("answer_constraints", &self.answer_constraints)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

impl Default for CallManagerConfig {
    fn default() -> Self {
        Self {
            invite_lifetime: Duration::from_secs(60),
            answer_constraints: MediaConstraints::audio(),
            observer: None,
        }
    }
}

/// Owns every call keyed by id, routes inbound signaling and media
/// notifications to them, and resolves colliding invites.
pub struct CallManager {
    ctx: Arc<CallContext>,
    calls: RwLock<HashMap<CallId, Arc<Call>>>,
}

impl CallManager {
    pub fn new(
        transport: Arc<dyn SignalingTransport>,
        media_source: Arc<dyn MediaSource>,
        media_factory: Arc<dyn MediaFactory>,
        config: CallManagerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx: Arc::new(CallContext {
                transport,
                media_source,
                media_factory,
                observer: config.observer,
                invite_lifetime: config.invite_lifetime,
                answer_constraints: config.answer_constraints,
            }),
            calls: RwLock::new(HashMap::new()),
        })
    }

    /// Place an outbound call on a channel. At most one live call per
    /// channel may exist locally; collisions with a remote attempt are
    /// resolved on the inbound side.
    pub async fn place_call(
        &self,
        channel: ChannelId,
        constraints: MediaConstraints,
    ) -> Result<Arc<Call>, CallError> {
        self.cleanup_ended_calls().await;

        let call = {
            let mut calls = self.calls.write().await;
            for other in calls.values() {
                if other.channel() == &channel && !other.state().await.is_ended() {
                    return Err(CallError::ChannelBusy(channel));
                }
            }
            let call = Call::new(
                CallId::generate(),
                channel,
                CallDirection::Outbound,
                Arc::clone(&self.ctx),
            );
            calls.insert(call.id().clone(), Arc::clone(&call));
            call
        };

        call.place(constraints).await;
        Ok(call)
    }

    /// Dispatch one inbound signaling message. `age` is the elapsed time
    /// since the message was originated, used to correct expiry timers
    /// for delivery skew.
    pub async fn handle_signal(&self, channel: &ChannelId, age: Duration, signal: Signal) {
        match signal {
            Signal::Invite(content) => self.handle_invite(channel, age, content).await,
            Signal::Answer(content) => match self.get_call(&content.call_id).await {
                Some(call) => call.handle_remote_answer(content).await,
                None => warn!(
                    target: "CallManager",
                    "answer for unknown call {} in {channel}",
                    content.call_id
                ),
            },
            Signal::Candidates(content) => match self.get_call(&content.call_id).await {
                Some(call) => call.handle_remote_candidates(content).await,
                None => warn!(
                    target: "CallManager",
                    "candidates for unknown call {} in {channel}",
                    content.call_id
                ),
            },
            Signal::Hangup(content) => match self.get_call(&content.call_id).await {
                Some(call) => call.handle_remote_hangup().await,
                None => {
                    // Replayed history can surface a hangup before (or
                    // without) its invite; record the call as already
                    // over so a later invite replay cannot revive it.
                    debug!(
                        target: "CallManager",
                        "hangup for unknown call {} in {channel}, recording as ended",
                        content.call_id
                    );
                    let call = Call::new_ended_by_remote(
                        content.call_id,
                        channel.clone(),
                        Arc::clone(&self.ctx),
                    );
                    self.calls
                        .write()
                        .await
                        .insert(call.id().clone(), call);
                }
            },
        }
    }

    async fn handle_invite(&self, channel: &ChannelId, age: Duration, content: InviteContent) {
        if self.get_call(&content.call_id).await.is_some() {
            debug!(
                target: "CallManager",
                "duplicate invite for call {}, ignoring",
                content.call_id
            );
            return;
        }

        let (call, colliding) = {
            let mut calls = self.calls.write().await;
            let mut colliding = None;
            for other in calls.values() {
                if other.channel() == channel
                    && other.direction() == CallDirection::Outbound
                    && matches!(
                        other.state().await,
                        CallState::WaitLocalMedia | CallState::CreateOffer | CallState::InviteSent
                    )
                {
                    colliding = Some(Arc::clone(other));
                    break;
                }
            }
            let call = Call::new(
                content.call_id.clone(),
                channel.clone(),
                CallDirection::Inbound,
                Arc::clone(&self.ctx),
            );
            calls.insert(call.id().clone(), Arc::clone(&call));
            (call, colliding)
        };

        call.init_with_invite(content, age).await;
        if call.state().await.is_ended() {
            return;
        }

        match colliding {
            Some(existing) => {
                info!(
                    target: "CallManager",
                    "invite {} collides with outbound call {} in {channel}",
                    call.id(),
                    existing.id()
                );
                glare::supersede(&existing, &call).await;
                if let Some(observer) = &self.ctx.observer {
                    observer
                        .on_call_replaced(existing.snapshot().await, call.snapshot().await)
                        .await;
                }
                if let Err(e) = call.answer().await {
                    warn!(
                        target: "CallManager",
                        "failed to answer replacement call {}: {e}",
                        call.id()
                    );
                }
            }
            None => {
                if let Some(observer) = &self.ctx.observer {
                    observer.on_incoming_call(call.snapshot().await).await;
                }
            }
        }
    }

    /// Route a media session notification to its call.
    pub async fn handle_media_event(&self, call_id: &CallId, event: MediaEvent) {
        match self.get_call(call_id).await {
            Some(call) => call.handle_media_event(event).await,
            None => debug!(
                target: "CallManager",
                "media event {event:?} for unknown call {call_id}"
            ),
        }
    }

    pub async fn get_call(&self, call_id: &CallId) -> Option<Arc<Call>> {
        self.calls.read().await.get(call_id).cloned()
    }

    /// All calls that have not reached their terminal state.
    pub async fn active_calls(&self) -> Vec<Arc<Call>> {
        let calls = self.calls.read().await;
        let mut active = Vec::new();
        for call in calls.values() {
            if !call.state().await.is_ended() {
                active.push(Arc::clone(call));
            }
        }
        active
    }

    /// Drop ended calls from the registry.
    pub async fn cleanup_ended_calls(&self) {
        let mut calls = self.calls.write().await;
        let mut ended = Vec::new();
        for (id, call) in calls.iter() {
            if call.state().await.is_ended() {
                ended.push(id.clone());
            }
        }
        for id in ended {
            calls.remove(&id);
        }
    }
}
