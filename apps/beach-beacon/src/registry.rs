use std::{sync::Arc, time::Duration};

use axum::extract::ws::Message;
use dashmap::{mapref::entry::Entry, DashMap};
use futures_util::future::join_all;
use metrics::{counter, gauge};
use serde::Serialize;
use serde_json::Value;
use tokio::{sync::mpsc, time::timeout};
use tracing::{debug, warn};
use uuid::Uuid;

pub const DEFAULT_CHANNEL_DEPTH: usize = 64;
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

pub type UserId = i64;
pub type ChannelId = Uuid;

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Frames buffered per channel before `send` waits for the connection
    /// task to drain.
    pub channel_depth: usize,
    /// How long `send` waits on a full queue before the write counts as
    /// failed.
    pub send_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            channel_depth: DEFAULT_CHANNEL_DEPTH,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }
}

/// Why a write to a channel failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteFailure {
    Closed,
    Stalled,
}

/// Outbound half of one live WebSocket. The connection task owns the
/// receiving end; the registry only ever holds senders.
#[derive(Clone)]
pub struct Channel {
    id: ChannelId,
    sender: mpsc::Sender<Message>,
}

impl Channel {
    pub fn open(depth: usize) -> (Self, mpsc::Receiver<Message>) {
        let (sender, receiver) = mpsc::channel(depth.max(1));
        (
            Self {
                id: Uuid::new_v4(),
                sender,
            },
            receiver,
        )
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserSnapshot {
    pub user_id: UserId,
    pub channels: usize,
}

/// Maps each connected user to the channels they currently hold open.
///
/// A user key is present only while at least one channel is registered
/// for it; the last `unregister` removes the key under the same shard lock.
#[derive(Clone)]
pub struct ChannelRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    users: DashMap<UserId, Vec<Channel>>,
    config: RegistryConfig,
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl ChannelRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                users: DashMap::new(),
                config,
            }),
        }
    }

    /// Opens a channel sized by this registry's configuration. The channel is
    /// not registered until [`ChannelRegistry::register`] is called.
    pub fn open_channel(&self) -> (Channel, mpsc::Receiver<Message>) {
        Channel::open(self.inner.config.channel_depth)
    }

    pub fn register(&self, user_id: UserId, channel: Channel) {
        let channel_id = channel.id;
        let channels = {
            let mut entry = self.inner.users.entry(user_id).or_default();
            if !entry.iter().any(|existing| existing.id == channel_id) {
                entry.push(channel);
            }
            entry.len()
        };

        debug!(user_id, channel_id = %channel_id, channels, "channel registered");
        self.record_connected_users();
    }

    /// Removes `channel_id` from the user's collection. Returns whether a
    /// channel was actually removed; unknown users and channels are a no-op.
    pub fn unregister(&self, user_id: UserId, channel_id: ChannelId) -> bool {
        let removed = match self.inner.users.entry(user_id) {
            Entry::Occupied(mut entry) => {
                let before = entry.get().len();
                entry.get_mut().retain(|channel| channel.id != channel_id);
                let removed = entry.get().len() != before;
                if entry.get().is_empty() {
                    entry.remove();
                }
                removed
            }
            Entry::Vacant(_) => false,
        };

        if removed {
            debug!(user_id, channel_id = %channel_id, "channel unregistered");
            self.record_connected_users();
        }
        removed
    }

    /// Fans `message` out to every channel `user_id` holds at call time.
    ///
    /// Returns `true` when the user had at least one channel, even if every
    /// write failed. A channel whose connection is gone, or whose queue stays
    /// full for `send_timeout`, is evicted.
    pub async fn send(&self, user_id: UserId, message: &Value) -> bool {
        let snapshot = self.channels_of(user_id);
        if snapshot.is_empty() {
            return false;
        }

        let frame = Message::Text(message.to_string());
        let send_timeout = self.inner.config.send_timeout;
        let writes = snapshot.iter().map(|channel| {
            let frame = frame.clone();
            async move {
                match timeout(send_timeout, channel.sender.send(frame)).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(_)) => Err(WriteFailure::Closed),
                    Err(_) => Err(WriteFailure::Stalled),
                }
            }
        });
        let outcomes = join_all(writes).await;

        for (channel, outcome) in snapshot.iter().zip(outcomes) {
            match outcome {
                Ok(()) => {
                    counter!("beach_beacon_frames_enqueued_total", 1);
                    continue;
                }
                Err(WriteFailure::Closed) => {
                    debug!(user_id, channel_id = %channel.id, "channel closed; evicting");
                }
                Err(WriteFailure::Stalled) => {
                    warn!(
                        user_id,
                        channel_id = %channel.id,
                        timeout_ms = send_timeout.as_millis() as u64,
                        "outbound queue stalled; evicting channel"
                    );
                }
            }
            if self.unregister(user_id, channel.id) {
                counter!("beach_beacon_channels_evicted_total", 1);
            }
        }

        true
    }

    // Cloned so no shard lock is held while writes are awaited.
    fn channels_of(&self, user_id: UserId) -> Vec<Channel> {
        self.inner
            .users
            .get(&user_id)
            .map(|channels| channels.value().clone())
            .unwrap_or_default()
    }

    pub fn channel_count(&self, user_id: UserId) -> usize {
        self.inner
            .users
            .get(&user_id)
            .map(|channels| channels.len())
            .unwrap_or(0)
    }

    pub fn contains_user(&self, user_id: UserId) -> bool {
        self.inner.users.contains_key(&user_id)
    }

    /// Number of users with at least one open channel.
    pub fn len(&self) -> usize {
        self.inner.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.users.is_empty()
    }

    pub fn snapshot(&self) -> Vec<UserSnapshot> {
        let mut users: Vec<UserSnapshot> = self
            .inner
            .users
            .iter()
            .map(|entry| UserSnapshot {
                user_id: *entry.key(),
                channels: entry.value().len(),
            })
            .collect();
        users.sort_by_key(|user| user.user_id);
        users
    }

    // Must not be called while holding an entry guard: `len` read-locks every shard.
    fn record_connected_users(&self) {
        gauge!("beach_beacon_users_connected", self.inner.users.len() as f64);
    }
}
