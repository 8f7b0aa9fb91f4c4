//! Event fan-out over the store's pub/sub: typed publishes onto `map:{id}` and
//! `user:{id}` channels, cancellable subscriptions yielding [`EventEnvelope`]s.
//!
//! Delivery is at-most-once and nothing is persisted: a subscriber only sees
//! what is published while its subscription is live.

use futures::stream::BoxStream;
use futures::StreamExt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{
    AvatarMoved, Channel, DomainEvent, EventEnvelope, PoiCreated, PoiDeleted, PoiJoined, PoiLeft,
    PoiUpdated, UserJoinedMap, UserLeftMap,
};
use crate::repositories::EphemeralStore;
use crate::services::retry::RetryPolicy;

#[derive(Clone)]
pub struct EventFanout {
    store: Arc<dyn EphemeralStore>,
    retry: RetryPolicy,
}

impl EventFanout {
    pub fn new(store: Arc<dyn EphemeralStore>) -> Self {
        Self {
            store,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Publish to the event's map channel, and to the affected user's channel
    /// when it has one. Returns how many subscribers received it in total.
    pub async fn publish(&self, event: &DomainEvent) -> AppResult<u64> {
        let payload = serde_json::to_string(&event.to_envelope()?)?;
        let mut delivered = self
            .publish_raw(&Channel::Map(event.map_id()).name(), &payload)
            .await?;
        if let Some(user_id) = event.affected_user() {
            delivered += self
                .publish_raw(&Channel::User(user_id).name(), &payload)
                .await?;
        }
        debug!(event = event.event_type(), map_id = %event.map_id(), delivered, "event published");
        Ok(delivered)
    }

    /// A timed-out publish may already have been delivered, so only failures
    /// that happened before sending are retried.
    async fn publish_raw(&self, channel: &str, payload: &str) -> AppResult<u64> {
        self.retry
            .run_when(
                "publish",
                |e| e.is_transient() && !e.is_timeout(),
                move || self.store.publish(channel, payload),
            )
            .await
    }

    pub async fn publish_avatar_moved(&self, event: AvatarMoved) -> AppResult<u64> {
        self.publish(&DomainEvent::AvatarMoved(event)).await
    }

    pub async fn publish_poi_created(&self, event: PoiCreated) -> AppResult<u64> {
        self.publish(&DomainEvent::PoiCreated(event)).await
    }

    pub async fn publish_poi_joined(&self, event: PoiJoined) -> AppResult<u64> {
        self.publish(&DomainEvent::PoiJoined(event)).await
    }

    pub async fn publish_poi_left(&self, event: PoiLeft) -> AppResult<u64> {
        self.publish(&DomainEvent::PoiLeft(event)).await
    }

    pub async fn publish_poi_updated(&self, event: PoiUpdated) -> AppResult<u64> {
        self.publish(&DomainEvent::PoiUpdated(event)).await
    }

    pub async fn publish_poi_deleted(&self, event: PoiDeleted) -> AppResult<u64> {
        self.publish(&DomainEvent::PoiDeleted(event)).await
    }

    pub async fn publish_user_joined_map(&self, event: UserJoinedMap) -> AppResult<u64> {
        self.publish(&DomainEvent::UserJoinedMap(event)).await
    }

    pub async fn publish_user_left_map(&self, event: UserLeftMap) -> AppResult<u64> {
        self.publish(&DomainEvent::UserLeftMap(event)).await
    }

    /// Open a live subscription. Messages published after this returns are
    /// delivered to it.
    pub async fn open(&self, channel: Channel) -> AppResult<EventSubscription> {
        let stream = self.store.subscribe(&channel.name()).await?;
        info!(channel = %channel, "event subscription opened");
        Ok(EventSubscription { channel, stream })
    }

    /// Forward every event on `map:{map_id}` into `out` until `cancel` resolves
    /// or `out` is closed.
    pub async fn subscribe_to_map_events<C>(
        &self,
        map_id: Uuid,
        out: mpsc::Sender<EventEnvelope>,
        cancel: C,
    ) -> AppResult<()>
    where
        C: Future<Output = ()> + Send,
    {
        self.open(Channel::Map(map_id)).await?.forward(out, cancel).await
    }

    /// Forward every event on `user:{user_id}` into `out` until `cancel`
    /// resolves or `out` is closed.
    pub async fn subscribe_to_user_events<C>(
        &self,
        user_id: Uuid,
        out: mpsc::Sender<EventEnvelope>,
        cancel: C,
    ) -> AppResult<()>
    where
        C: Future<Output = ()> + Send,
    {
        self.open(Channel::User(user_id)).await?.forward(out, cancel).await
    }
}

/// A live subscription to one channel. Dropping it releases the subscription.
pub struct EventSubscription {
    channel: Channel,
    stream: BoxStream<'static, String>,
}

impl EventSubscription {
    /// The channel this subscription listens on.
    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Next well-formed envelope. Malformed payloads are logged and skipped.
    /// `None` when the store closed the subscription.
    pub async fn next_envelope(&mut self) -> Option<EventEnvelope> {
        while let Some(raw) = self.stream.next().await {
            match EventEnvelope::parse(&raw) {
                Ok(envelope) => return Some(envelope),
                Err(e) => {
                    warn!(channel = %self.channel, error = %e, "dropping malformed event payload");
                }
            }
        }
        None
    }

    /// Pump envelopes into `out` until cancelled, `out` closes, or the store
    /// ends the subscription (an error).
    pub async fn forward<C>(mut self, out: mpsc::Sender<EventEnvelope>, cancel: C) -> AppResult<()>
    where
        C: Future<Output = ()> + Send,
    {
        tokio::pin!(cancel);
        loop {
            let envelope = tokio::select! {
                biased;
                _ = &mut cancel => break,
                next = self.next_envelope() => match next {
                    Some(envelope) => envelope,
                    None => {
                        warn!(channel = %self.channel, "store closed event subscription");
                        return Err(AppError::Internal(anyhow::anyhow!(
                            "subscription to {} closed by the store",
                            self.channel
                        )));
                    }
                },
            };
            tokio::select! {
                biased;
                _ = &mut cancel => break,
                sent = out.send(envelope) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }
        debug!(channel = %self.channel, "event subscription released");
        Ok(())
    }
}
