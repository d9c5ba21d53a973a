//! Signaling transport boundary.
//!
//! The transport delivers typed signaling messages to the remote party of
//! a channel. Delivery is asynchronous and unreliable: a send may fail
//! outright, succeed late, or be duplicated by an upstream retry.
//! Within one channel, accepted messages are delivered in send order.
//! Retrying failed sends is this crate's responsibility, not the
//! transport's.

use async_trait::async_trait;

use crate::error::TransportError;
use crate::signaling::{ChannelId, Signal};

#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Attempt to deliver one signal to the given channel, resolving once
    /// the transport has accepted or rejected it.
    async fn send_signal(&self, channel: &ChannelId, signal: &Signal)
    -> Result<(), TransportError>;
}
