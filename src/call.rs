//! The call entity and its state machine.
//!
//! A [`Call`] owns its identity, direction, state, timers and media
//! handles, and reacts to local actions (place, answer, hang up) and
//! remote signaling events. Every asynchronous completion re-validates
//! state under the call's lock before acting, so a callback that lands
//! after the call has ended is a silent no-op rather than a reanimation.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use tokio::sync::Mutex;

use crate::candidates::CandidateBatcher;
use crate::error::CallError;
use crate::events::{CallObserver, CallSnapshot};
use crate::media::{
    MediaConstraints, MediaError, MediaEvent, MediaFactory, MediaSession, MediaSource, MediaStream,
};
use crate::retry::ReliableSender;
use crate::signaling::{
    AnswerContent, CallId, CandidatesContent, ChannelId, HangupContent, InviteContent,
    SessionDescription, Signal,
};
use crate::state::{CallDirection, CallState, HangupParty, HangupReason};
use crate::transport::SignalingTransport;

/// Collaborators and settings shared by every call of one manager.
pub(crate) struct CallContext {
    pub(crate) transport: Arc<dyn SignalingTransport>,
    pub(crate) media_source: Arc<dyn MediaSource>,
    pub(crate) media_factory: Arc<dyn MediaFactory>,
    pub(crate) observer: Option<Arc<dyn CallObserver>>,
    pub(crate) invite_lifetime: Duration,
    pub(crate) answer_constraints: MediaConstraints,
}

pub(crate) struct CallInner {
    pub(crate) state: CallState,
    pub(crate) hangup_party: Option<HangupParty>,
    pub(crate) hangup_reason: Option<HangupReason>,
    pub(crate) ended_at: Option<DateTime<Utc>>,
    pub(crate) session: Option<Arc<dyn MediaSession>>,
    pub(crate) local_media: Option<Arc<dyn MediaStream>>,
    pub(crate) remote_media: Option<Arc<dyn MediaStream>>,
    pub(crate) successor: Option<Arc<Call>>,
    /// Set on a replacement call whose predecessor's media capture is
    /// still in flight; the handle arrives via the predecessor's
    /// deferred completion.
    pub(crate) wait_for_local_media: bool,
    invite_sent: bool,
    answer_sent: bool,
}

pub struct Call {
    id: CallId,
    channel: ChannelId,
    direction: CallDirection,
    created_at: DateTime<Utc>,
    ctx: Arc<CallContext>,
    sender: ReliableSender,
    batcher: Arc<CandidateBatcher>,
    pub(crate) inner: Mutex<CallInner>,
}

impl std::fmt::Debug for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Call")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .field("direction", &self.direction)
            .finish_non_exhaustive()
    }
}

impl Call {
    pub(crate) fn new(
        id: CallId,
        channel: ChannelId,
        direction: CallDirection,
        ctx: Arc<CallContext>,
    ) -> Arc<Self> {
        let sender = ReliableSender::new(Arc::clone(&ctx.transport), channel.clone());
        let batcher =
            CandidateBatcher::new(id.clone(), channel.clone(), Arc::clone(&ctx.transport));
        Arc::new(Self {
            id,
            channel,
            direction,
            created_at: Utc::now(),
            ctx,
            sender,
            batcher,
            inner: Mutex::new(CallInner {
                state: CallState::Fledgling,
                hangup_party: None,
                hangup_reason: None,
                ended_at: None,
                session: None,
                local_media: None,
                remote_media: None,
                successor: None,
                wait_for_local_media: false,
                invite_sent: false,
                answer_sent: false,
            }),
        })
    }

    /// Construct a call already in its terminal state from a hangup
    /// observed out of chronological order (state replay on resync).
    pub(crate) fn new_ended_by_remote(
        id: CallId,
        channel: ChannelId,
        ctx: Arc<CallContext>,
    ) -> Arc<Self> {
        let call = Self::new(id, channel, CallDirection::Inbound, ctx);
        {
            let mut inner = call
                .inner
                .try_lock()
                .expect("freshly constructed call is uncontended");
            inner.state = CallState::Ended;
            inner.hangup_party = Some(HangupParty::Remote);
            inner.hangup_reason = Some(HangupReason::RemoteHangup);
            inner.ended_at = Some(Utc::now());
        }
        call.sender.cancel();
        call
    }

    pub fn id(&self) -> &CallId {
        &self.id
    }

    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    pub fn direction(&self) -> CallDirection {
        self.direction
    }

    pub async fn state(&self) -> CallState {
        self.inner.lock().await.state
    }

    pub async fn successor(&self) -> Option<Arc<Call>> {
        self.inner.lock().await.successor.clone()
    }

    pub async fn local_media(&self) -> Option<Arc<dyn MediaStream>> {
        self.inner.lock().await.local_media.clone()
    }

    pub async fn remote_media(&self) -> Option<Arc<dyn MediaStream>> {
        self.inner.lock().await.remote_media.clone()
    }

    pub async fn snapshot(&self) -> CallSnapshot {
        let inner = self.inner.lock().await;
        CallSnapshot {
            id: self.id.clone(),
            channel: self.channel.clone(),
            direction: self.direction,
            state: inner.state,
            hangup_party: inner.hangup_party,
            hangup_reason: inner.hangup_reason,
            created_at: self.created_at,
            ended_at: inner.ended_at,
        }
    }

    /// Start an outbound call: request local media capture, then produce
    /// and dispatch the invite once it is acquired.
    pub(crate) async fn place(self: &Arc<Self>, constraints: MediaConstraints) {
        {
            let mut inner = self.inner.lock().await;
            if inner.state != CallState::Fledgling {
                warn!(
                    target: "Call",
                    "ignoring place on call {} in state {:?}",
                    self.id, inner.state
                );
                return;
            }
            inner.state = CallState::WaitLocalMedia;
        }
        info!(target: "Call", "placing call {} in {}", self.id, self.channel);

        let this = Arc::clone(self);
        tokio::spawn(async move {
            match this.ctx.media_source.acquire(constraints).await {
                Ok(stream) => this.media_acquired_for_invite(stream).await,
                Err(e) => this.capture_failed(e).await,
            }
        });
    }

    /// Initialize an inbound call from a received invite: the call is
    /// born ringing, with the expiry window shortened by the observed
    /// age of the invite.
    pub(crate) async fn init_with_invite(self: &Arc<Self>, invite: InviteContent, age: Duration) {
        let session = match self.ctx.media_factory.create_session() {
            Ok(s) => s,
            Err(e) => {
                warn!(target: "Call", "failed to create media session for {}: {e}", self.id);
                self.terminate(HangupParty::Local, HangupReason::NegotiationFailed, true)
                    .await;
                return;
            }
        };
        {
            let mut inner = self.inner.lock().await;
            if inner.state.is_ended() {
                drop(inner);
                session.close().await;
                return;
            }
            inner.session = Some(Arc::clone(&session));
            inner.state = CallState::Ringing;
        }
        info!(target: "Call", "incoming call {} ringing in {}", self.id, self.channel);

        self.arm_ringing_expiry(invite.lifetime().saturating_sub(age));

        if let Err(e) = session.set_remote_description(invite.offer).await {
            // Left ringing; without a remote description the call can
            // never connect and the expiry timer reaps it.
            warn!(target: "Call", "failed to set remote description for {}: {e}", self.id);
        }
    }

    /// Answer a ringing inbound call.
    pub async fn answer(self: &Arc<Self>) -> Result<(), CallError> {
        enum Next {
            Acquire,
            UseInherited(Arc<dyn MediaStream>),
            WaitForHandoff,
        }

        let next = {
            let mut inner = self.inner.lock().await;
            if !inner.state.can_answer() {
                return Err(CallError::NotAnswerable(inner.state));
            }
            inner.state = CallState::WaitLocalMedia;
            if let Some(stream) = inner.local_media.take() {
                Next::UseInherited(stream)
            } else if inner.wait_for_local_media {
                Next::WaitForHandoff
            } else {
                Next::Acquire
            }
        };

        match next {
            Next::Acquire => {
                info!(target: "Call", "answering call {}", self.id);
                let constraints = self.ctx.answer_constraints;
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    match this.ctx.media_source.acquire(constraints).await {
                        Ok(stream) => this.media_acquired_for_answer(stream).await,
                        Err(e) => this.capture_failed(e).await,
                    }
                });
            }
            Next::UseInherited(stream) => {
                info!(target: "Call", "answering call {} with inherited media", self.id);
                self.media_acquired_for_answer(stream).await;
            }
            Next::WaitForHandoff => {
                info!(
                    target: "Call",
                    "answering call {}: waiting for in-flight media capture",
                    self.id
                );
            }
        }
        Ok(())
    }

    /// Hang up locally. Idempotent: a second invocation is a no-op.
    pub async fn hangup(self: &Arc<Self>) {
        self.terminate(HangupParty::Local, HangupReason::UserHangup, false)
            .await;
    }

    pub(crate) async fn media_acquired_for_invite(self: &Arc<Self>, stream: Arc<dyn MediaStream>) {
        // A superseded call hands its capture result to the replacement,
        // which answers with it.
        let successor = self.inner.lock().await.successor.clone();
        if let Some(successor) = successor {
            successor.media_acquired_for_answer(stream).await;
            return;
        }

        let session = match self.ctx.media_factory.create_session() {
            Ok(s) => s,
            Err(e) => {
                stream.stop();
                warn!(target: "Call", "failed to create media session for {}: {e}", self.id);
                self.terminate(HangupParty::Local, HangupReason::NegotiationFailed, false)
                    .await;
                return;
            }
        };
        {
            let mut inner = self.inner.lock().await;
            if inner.state.is_ended() {
                drop(inner);
                stream.stop();
                session.close().await;
                return;
            }
            inner.local_media = Some(Arc::clone(&stream));
            inner.session = Some(Arc::clone(&session));
            inner.state = CallState::CreateOffer;
        }

        session.add_stream(stream).await;
        match session.create_offer().await {
            Ok(offer) => self.offer_created(offer).await,
            Err(e) => {
                warn!(target: "Call", "failed to create offer for {}: {e}", self.id);
                self.terminate(HangupParty::Local, HangupReason::NegotiationFailed, false)
                    .await;
            }
        }
    }

    pub(crate) async fn media_acquired_for_answer(self: &Arc<Self>, stream: Arc<dyn MediaStream>) {
        let session = {
            let mut inner = self.inner.lock().await;
            if inner.state.is_ended() {
                drop(inner);
                stream.stop();
                return;
            }
            let Some(session) = inner.session.clone() else {
                warn!(target: "Call", "no media session on call {} while answering", self.id);
                drop(inner);
                stream.stop();
                return;
            };
            inner.local_media = Some(Arc::clone(&stream));
            inner.state = CallState::CreateAnswer;
            session
        };

        session.add_stream(stream).await;
        match session.create_answer(self.ctx.answer_constraints).await {
            Ok(answer) => self.answer_created(answer).await,
            Err(e) => {
                warn!(target: "Call", "failed to create answer for {}: {e}", self.id);
                self.terminate(HangupParty::Local, HangupReason::NegotiationFailed, false)
                    .await;
            }
        }
    }

    pub(crate) async fn capture_failed(self: &Arc<Self>, error: MediaError) {
        // A pending capture may complete after this call was superseded;
        // the outcome, success or failure, belongs to the replacement.
        let successor = self.inner.lock().await.successor.clone();
        if let Some(successor) = successor {
            Box::pin(successor.capture_failed(error)).await;
            return;
        }
        error!(target: "Call", "could not capture local media for call {}: {error}", self.id);
        self.terminate(HangupParty::Local, HangupReason::CaptureFailure, false)
            .await;
    }

    async fn offer_created(self: &Arc<Self>, offer: SessionDescription) {
        let session = {
            let inner = self.inner.lock().await;
            if inner.state.is_ended() {
                debug!(
                    target: "Call",
                    "ignoring freshly created offer for {}: call has ended",
                    self.id
                );
                return;
            }
            inner.session.clone()
        };
        let Some(session) = session else { return };

        if let Err(e) = session.set_local_description(offer.clone()).await {
            warn!(target: "Call", "failed to set local description for {}: {e}", self.id);
            self.terminate(HangupParty::Local, HangupReason::NegotiationFailed, false)
                .await;
            return;
        }

        let lifetime = self.ctx.invite_lifetime;
        {
            let mut inner = self.inner.lock().await;
            if inner.state.is_ended() {
                return;
            }
            debug_assert!(!inner.invite_sent, "invite generated twice for one call");
            inner.invite_sent = true;
            inner.state = CallState::InviteSent;
        }

        self.sender.send(Signal::Invite(InviteContent {
            call_id: self.id.clone(),
            offer,
            lifetime: lifetime.as_millis() as u64,
        }));
        info!(target: "Call", "invite sent for call {}", self.id);
        self.arm_invite_expiry(lifetime);
    }

    async fn answer_created(self: &Arc<Self>, answer: SessionDescription) {
        let session = {
            let inner = self.inner.lock().await;
            if inner.state.is_ended() {
                debug!(
                    target: "Call",
                    "ignoring freshly created answer for {}: call has ended",
                    self.id
                );
                return;
            }
            inner.session.clone()
        };
        let Some(session) = session else { return };

        if let Err(e) = session.set_local_description(answer.clone()).await {
            warn!(target: "Call", "failed to set local description for {}: {e}", self.id);
            self.terminate(HangupParty::Local, HangupReason::NegotiationFailed, false)
                .await;
            return;
        }

        {
            let mut inner = self.inner.lock().await;
            if inner.state.is_ended() {
                return;
            }
            debug_assert!(!inner.answer_sent, "answer generated twice for one call");
            inner.answer_sent = true;
            inner.state = CallState::Connecting;
        }

        self.sender.send(Signal::Answer(AnswerContent {
            call_id: self.id.clone(),
            answer,
        }));
        info!(target: "Call", "answer sent for call {}", self.id);
    }

    pub(crate) async fn handle_remote_answer(self: &Arc<Self>, content: AnswerContent) {
        let session = {
            let mut inner = self.inner.lock().await;
            if inner.state.is_ended() {
                debug!(target: "Call", "ignoring answer for {}: call has ended", self.id);
                return;
            }
            if inner.state != CallState::InviteSent {
                // Duplicate delivery of an already-applied answer.
                debug!(
                    target: "Call",
                    "ignoring answer for {} in state {:?}",
                    self.id, inner.state
                );
                return;
            }
            inner.state = CallState::Connecting;
            inner.session.clone()
        };
        info!(target: "Call", "call {} answered by remote", self.id);

        let Some(session) = session else { return };
        if let Err(e) = session.set_remote_description(content.answer).await {
            warn!(target: "Call", "failed to apply remote answer for {}: {e}", self.id);
        }
    }

    pub(crate) async fn handle_remote_candidates(self: &Arc<Self>, content: CandidatesContent) {
        let session = {
            let inner = self.inner.lock().await;
            if inner.state.is_ended() {
                debug!(
                    target: "Call",
                    "ignoring remote candidates for {}: call has ended",
                    self.id
                );
                return;
            }
            inner.session.clone()
        };
        let Some(session) = session else { return };

        for candidate in content.candidates {
            if let Err(e) = session.add_remote_candidate(candidate).await {
                debug!(target: "Call", "failed to apply remote candidate for {}: {e}", self.id);
            }
        }
    }

    pub(crate) async fn handle_remote_hangup(self: &Arc<Self>) {
        info!(target: "Call", "remote hangup for call {}", self.id);
        self.terminate(HangupParty::Remote, HangupReason::RemoteHangup, false)
            .await;
    }

    pub(crate) async fn handle_media_event(self: &Arc<Self>, event: MediaEvent) {
        match event {
            MediaEvent::LocalCandidate(candidate) => {
                if self.inner.lock().await.state.is_ended() {
                    return;
                }
                self.batcher.enqueue(candidate).await;
            }
            MediaEvent::ConnectivityChanged(connectivity) => {
                let mut inner = self.inner.lock().await;
                // Connectivity can still complete while the call is being
                // torn down.
                if inner.state.is_ended() {
                    return;
                }
                debug!(
                    target: "Call",
                    "connectivity for call {} changed to {connectivity:?}",
                    self.id
                );
                if connectivity.is_established() && inner.state == CallState::Connecting {
                    inner.state = CallState::Connected;
                    drop(inner);
                    info!(target: "Call", "call {} connected", self.id);
                }
            }
            MediaEvent::RemoteStreamAdded(stream) => {
                let mut inner = self.inner.lock().await;
                if inner.state.is_ended() {
                    drop(inner);
                    stream.stop();
                    return;
                }
                inner.remote_media = Some(stream);
            }
            MediaEvent::RemoteStreamEnded => {
                if self.inner.lock().await.state.is_ended() {
                    return;
                }
                info!(target: "Call", "remote stream for call {} ended", self.id);
                self.terminate(HangupParty::Remote, HangupReason::RemoteMediaLost, false)
                    .await;
            }
        }
    }

    /// The single entry into the terminal state. Idempotent. Releases
    /// all owned media handles, closes the media session, emits one
    /// best-effort hangup notice when the termination is locally caused,
    /// and notifies the owner exactly once unless suppressed.
    pub(crate) async fn terminate(
        self: &Arc<Self>,
        party: HangupParty,
        reason: HangupReason,
        suppress_notify: bool,
    ) {
        let (session, local_media, remote_media) = {
            let mut inner = self.inner.lock().await;
            if inner.state.is_ended() {
                return;
            }
            inner.state = CallState::Ended;
            inner.hangup_party = Some(party);
            inner.hangup_reason = Some(reason);
            inner.ended_at = Some(Utc::now());
            (
                inner.session.take(),
                inner.local_media.take(),
                inner.remote_media.take(),
            )
        };
        info!(target: "Call", "call {} ended: {reason} by {party:?}", self.id);

        if let Some(stream) = local_media {
            stream.stop();
        }
        if let Some(stream) = remote_media {
            stream.stop();
        }
        self.batcher.close().await;
        self.sender.cancel();
        if let Some(session) = session {
            session.close().await;
        }

        if party == HangupParty::Local {
            self.sender.send_final(Signal::Hangup(HangupContent {
                call_id: self.id.clone(),
            }));
        }

        if !suppress_notify
            && let Some(observer) = &self.ctx.observer
        {
            observer.on_call_ended(self.snapshot().await).await;
        }
    }

    fn arm_invite_expiry(self: &Arc<Self>, lifetime: Duration) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(lifetime).await;
            let expired = this.inner.lock().await.state == CallState::InviteSent;
            if expired {
                info!(target: "Call", "invite for call {} expired with no answer", this.id);
                this.terminate(HangupParty::Local, HangupReason::InviteTimeout, false)
                    .await;
            }
        });
    }

    fn arm_ringing_expiry(self: &Arc<Self>, remaining: Duration) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(remaining).await;
            let still_ringing = this.inner.lock().await.state == CallState::Ringing;
            if still_ringing {
                info!(target: "Call", "incoming call {} expired unanswered", this.id);
                this.terminate(HangupParty::Remote, HangupReason::InviteTimeout, false)
                    .await;
            }
        });
    }
}
