//! Real-time achievement notifications
//!
//! Evaluators publish to a Redis pub/sub channel; every server process runs a
//! listen loop that fans messages out to the per-user channels registered by
//! SSE connections in that process. Delivery is best-effort.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::Achievement;
use crate::redis_manager::keys;

/// Per-user buffer; events beyond it are dropped.
pub const CHANNEL_CAPACITY: usize = 10;

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum NotificationEvent {
    /// First frame of every stream
    Connected,
    AchievementUnlocked {
        user_id: i64,
        achievement_id: i64,
        slug: String,
        name: String,
        description: String,
        xp_reward: i32,
        icon_url: Option<String>,
    },
}

impl NotificationEvent {
    pub fn achievement_unlocked(user_id: i64, achievement: &Achievement) -> Self {
        Self::AchievementUnlocked {
            user_id,
            achievement_id: achievement.id,
            slug: achievement.slug.clone(),
            name: achievement.name.clone(),
            description: achievement.description.clone(),
            xp_reward: achievement.xp_reward,
            icon_url: achievement.icon_url.clone(),
        }
    }

    /// Recipient of the event, if it targets a user.
    pub fn user_id(&self) -> Option<i64> {
        match self {
            Self::Connected => None,
            Self::AchievementUnlocked { user_id, .. } => Some(*user_id),
        }
    }
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &NotificationEvent) -> Result<()>;
}

pub struct RedisPublisher {
    conn: ConnectionManager,
}

impl RedisPublisher {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl EventPublisher for RedisPublisher {
    async fn publish(&self, event: &NotificationEvent) -> Result<()> {
        let payload = serde_json::to_string(event)?;
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .publish(keys::ACHIEVEMENT_CHANNEL, payload)
            .await
            .context("Failed to publish notification")?;
        Ok(())
    }
}

struct Registration {
    generation: u64,
    sender: mpsc::Sender<NotificationEvent>,
}

/// Process-wide map of connected users to their event channel.
///
/// Cloning is cheap and shares the map.
#[derive(Clone, Default)]
pub struct NotificationBus {
    channels: Arc<RwLock<HashMap<i64, Registration>>>,
    generations: Arc<AtomicU64>,
}

impl NotificationBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a channel for `user_id`, closing any previous one for the same user.
    pub fn register(&self, user_id: i64) -> Subscription {
        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let previous = self
            .channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user_id, Registration { generation, sender });
        if previous.is_some() {
            debug!("Replaced notification channel for user_id={}", user_id);
        }
        Subscription {
            user_id,
            generation,
            receiver,
            bus: self.clone(),
        }
    }

    /// Close and remove the channel for `user_id`.
    pub fn unregister(&self, user_id: i64) {
        self.channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&user_id);
    }

    /// Remove the channel only if it still belongs to this registration.
    fn release(&self, user_id: i64, generation: u64) {
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        if channels.get(&user_id).map(|r| r.generation) == Some(generation) {
            channels.remove(&user_id);
        }
    }

    pub fn is_registered(&self, user_id: i64) -> bool {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&user_id)
    }

    /// Non-blocking hand-off to the recipient's channel. Returns whether it was queued.
    pub fn deliver(&self, event: NotificationEvent) -> bool {
        let Some(user_id) = event.user_id() else {
            return false;
        };
        let channels = self.channels.read().unwrap_or_else(PoisonError::into_inner);
        let Some(registration) = channels.get(&user_id) else {
            return false;
        };
        match registration.sender.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    "Notification channel full for user_id={}, dropping event",
                    user_id
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Notification channel closed for user_id={}", user_id);
                false
            }
        }
    }

    /// Parse a pub/sub payload and deliver it.
    pub fn deliver_payload(&self, payload: &str) -> bool {
        match serde_json::from_str::<NotificationEvent>(payload) {
            Ok(event) => self.deliver(event),
            Err(e) => {
                warn!("Ignoring malformed notification payload: {}", e);
                false
            }
        }
    }

    /// Subscribe to the notification channel and deliver until `cancel` fires.
    /// Reconnects after subscription failures.
    pub async fn listen_loop(&self, client: redis::Client, cancel: CancellationToken) {
        info!(
            "Notification listener subscribing to {}",
            keys::ACHIEVEMENT_CHANNEL
        );
        while !cancel.is_cancelled() {
            if let Err(e) = self.listen_once(&client, &cancel).await {
                error!("Notification listener error: {:#}. Resubscribing...", e);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
                }
            }
        }
        info!("Notification listener stopped");
    }

    async fn listen_once(&self, client: &redis::Client, cancel: &CancellationToken) -> Result<()> {
        let mut pubsub = client
            .get_async_pubsub()
            .await
            .context("Failed to open pub/sub connection")?;
        pubsub
            .subscribe(keys::ACHIEVEMENT_CHANNEL)
            .await
            .context("Failed to subscribe")?;
        let mut messages = Box::pin(pubsub.on_message());

        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                message = messages.next() => message,
            };
            let Some(message) = message else {
                anyhow::bail!("pub/sub stream closed");
            };
            match message.get_payload::<String>() {
                Ok(payload) => {
                    self.deliver_payload(&payload);
                }
                Err(e) => warn!("Failed to read notification payload: {}", e),
            }
        }
    }
}

/// Receiving end of a registration; unregisters itself when dropped.
pub struct Subscription {
    user_id: i64,
    generation: u64,
    receiver: mpsc::Receiver<NotificationEvent>,
    bus: NotificationBus,
}

impl Subscription {
    pub fn user_id(&self) -> i64 {
        self.user_id
    }

    pub async fn recv(&mut self) -> Option<NotificationEvent> {
        self.receiver.recv().await
    }

    /// JSON frames for an event stream: `connected` first, then every event.
    pub fn into_frames(self) -> impl Stream<Item = String> + Send {
        let connected = stream::iter(serde_json::to_string(&NotificationEvent::Connected).ok());
        let events = stream::unfold(self, |mut subscription| async move {
            loop {
                let event = subscription.recv().await?;
                match serde_json::to_string(&event) {
                    Ok(frame) => return Some((frame, subscription)),
                    Err(e) => warn!("Failed to encode notification: {}", e),
                }
            }
        });
        connected.chain(events)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.release(self.user_id, self.generation);
    }
}
