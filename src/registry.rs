//! Named-channel registry facade
//!
//! `Bus` maintains the name → channel mapping and fans every call
//! through to the owning channel. All channels record into one shared
//! `StatsMap`; the facade adds the `<name>_published` counter before
//! delegating a publish. Unknown names fail with `UnknownChannel` on
//! every method except `remove_channel` (no-op) and the pure queries
//! `contains_channel` / `channel_names`.

use crate::channel::{Channel, ChannelOptions, Subscriber};
use crate::config::{BusConfig, ChannelOverrides};
use crate::delivery::Delivery;
use crate::dlq::DeadLetterQueue;
use crate::error::{BusError, Result};
use crate::message::{Message, SubscriberId};
use crate::stats::{Metric, StatsMap};
use crate::tracker::DeliveryTracker;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Registry of named channels sharing one counter map
pub struct Bus {
    channels: RwLock<HashMap<String, Channel>>,
    config: BusConfig,
    stats: StatsMap,
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus {
    /// Create an empty bus with default configuration
    pub fn new() -> Self {
        Self::with_config(BusConfig::default())
    }

    /// Create an empty bus whose channels resolve against `config`
    pub fn with_config(config: BusConfig) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            config,
            stats: StatsMap::new(),
        }
    }

    /// Register a channel under `name` with fully resolved options
    pub async fn add_channel(
        &self,
        name: impl Into<String>,
        options: ChannelOptions,
    ) -> Result<Channel> {
        let name = name.into();
        let mut channels = self.channels.write().await;
        if channels.contains_key(&name) {
            return Err(BusError::ChannelExists(name));
        }

        let channel = Channel::new(name.clone(), options, self.stats.clone())?;
        channels.insert(name.clone(), channel.clone());
        drop(channels);

        tracing::info!(channel = %name, "Channel added");
        Ok(channel)
    }

    /// Register a channel whose overrides resolve against the bus tier
    pub async fn add_channel_from(
        &self,
        name: impl Into<String>,
        overrides: &ChannelOverrides,
    ) -> Result<Channel> {
        self.add_channel(name, overrides.resolve(&self.config)).await
    }

    /// Remove a channel. No-op when the name is unknown.
    ///
    /// The channel itself is left untouched; callers that want its
    /// pending work force-nacked should close it first.
    pub async fn remove_channel(&self, name: &str) {
        if self.channels.write().await.remove(name).is_some() {
            tracing::info!(channel = %name, "Channel removed");
        }
    }

    /// Look up a channel handle by name
    pub async fn channel(&self, name: &str) -> Result<Channel> {
        self.channels
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| BusError::UnknownChannel(name.to_string()))
    }

    /// Publish a message to the named channel
    ///
    /// Increments `<name>_published` before delegating.
    pub async fn publish(
        &self,
        name: &str,
        message: Message,
    ) -> Result<Option<Arc<DeliveryTracker>>> {
        let channel = self.channel(name).await?;
        self.stats.record(name, Metric::Published);
        channel.publish(message).await
    }

    /// Subscribe a handler to the named channel
    pub async fn subscribe(&self, name: &str, handler: Arc<dyn Subscriber>) -> Result<SubscriberId> {
        self.channel(name).await?.subscribe(handler)
    }

    /// Subscribe an async closure to the named channel
    pub async fn subscribe_fn<F, Fut>(&self, name: &str, handler: F) -> Result<SubscriberId>
    where
        F: Fn(Arc<Delivery>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.channel(name).await?.subscribe_fn(handler)
    }

    /// Remove a subscriber from the named channel
    pub async fn unsubscribe(&self, name: &str, id: SubscriberId) -> Result<()> {
        self.channel(name).await?.unsubscribe(id);
        Ok(())
    }

    /// Whether the named channel has unresolved publishes
    pub async fn has_pending(&self, name: &str) -> Result<bool> {
        Ok(self.channel(name).await?.has_pending())
    }

    /// Number of unresolved publishes on the named channel
    pub async fn pending_count(&self, name: &str) -> Result<usize> {
        Ok(self.channel(name).await?.pending_count())
    }

    /// The named channel's dead letter queue
    pub async fn dead_letters(&self, name: &str) -> Result<Arc<DeadLetterQueue>> {
        Ok(self.channel(name).await?.dead_letters())
    }

    /// Close the named channel
    pub async fn close(&self, name: &str) -> Result<()> {
        self.channel(name).await?.close();
        Ok(())
    }

    /// Close every registered channel
    pub async fn close_all(&self) {
        let channels = self.channels.read().await;
        for channel in channels.values() {
            channel.close();
        }
    }

    /// Hard-reset every registered channel
    pub async fn clear(&self) {
        let channels = self.channels.read().await;
        for channel in channels.values() {
            channel.clear();
        }
    }

    /// Whether a channel is registered under `name`
    pub async fn contains_channel(&self, name: &str) -> bool {
        self.channels.read().await.contains_key(name)
    }

    /// Names of every registered channel, sorted
    pub async fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// The counter map shared by every channel on this bus
    pub fn stats(&self) -> &StatsMap {
        &self.stats
    }
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus").field("stats", &self.stats).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_bus() -> Bus {
        Bus::new()
    }

    #[tokio::test]
    async fn test_add_and_query_channels() {
        let bus = test_bus();
        bus.add_channel("orders", ChannelOptions::default())
            .await
            .unwrap();
        bus.add_channel("alerts", ChannelOptions::default())
            .await
            .unwrap();

        assert!(bus.contains_channel("orders").await);
        assert!(!bus.contains_channel("billing").await);
        assert_eq!(bus.channel_names().await, vec!["alerts", "orders"]);
    }

    #[tokio::test]
    async fn test_add_duplicate_channel_fails() {
        let bus = test_bus();
        bus.add_channel("orders", ChannelOptions::default())
            .await
            .unwrap();

        let err = bus
            .add_channel("orders", ChannelOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::ChannelExists(_)));
    }

    #[tokio::test]
    async fn test_unknown_channel_errors() {
        let bus = test_bus();

        let err = bus
            .publish("ghost", Message::new("x".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::UnknownChannel(_)));

        let err = bus
            .subscribe_fn("ghost", |d| async move { d.ack() })
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::UnknownChannel(_)));

        assert!(bus.unsubscribe("ghost", 1).await.is_err());
        assert!(bus.has_pending("ghost").await.is_err());
        assert!(bus.pending_count("ghost").await.is_err());
        assert!(bus.dead_letters("ghost").await.is_err());
        assert!(bus.close("ghost").await.is_err());
    }

    #[tokio::test]
    async fn test_remove_channel_is_noop_when_absent() {
        let bus = test_bus();
        bus.remove_channel("ghost").await;

        bus.add_channel("orders", ChannelOptions::default())
            .await
            .unwrap();
        bus.remove_channel("orders").await;
        assert!(!bus.contains_channel("orders").await);
    }

    #[tokio::test]
    async fn test_publish_increments_published_counter() {
        let bus = test_bus();
        bus.add_channel("orders", ChannelOptions::default())
            .await
            .unwrap();
        bus.subscribe_fn("orders", |d| async move { d.ack() })
            .await
            .unwrap();

        bus.publish("orders", Message::new("o-1".to_string()))
            .await
            .unwrap();
        assert_eq!(bus.stats().get("orders_published"), 1);
    }

    #[tokio::test]
    async fn test_published_counts_even_when_channel_rejects() {
        let bus = test_bus();
        bus.add_channel("orders", ChannelOptions::default())
            .await
            .unwrap();
        bus.close("orders").await.unwrap();

        let err = bus
            .publish("orders", Message::new("late".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Closed(_)));
        assert_eq!(bus.stats().get("orders_published"), 1);
    }

    #[tokio::test]
    async fn test_close_all() {
        let bus = test_bus();
        let orders = bus
            .add_channel("orders", ChannelOptions::default())
            .await
            .unwrap();
        let alerts = bus
            .add_channel("alerts", ChannelOptions::default())
            .await
            .unwrap();

        bus.close_all().await;
        assert!(orders.is_closed());
        assert!(alerts.is_closed());
    }

    #[tokio::test]
    async fn test_channels_resolve_against_bus_config() {
        let bus = Bus::with_config(BusConfig {
            timeout_secs: Some(2.0),
            max_pending: Some(4),
            throttle: 0.0,
        });

        let channel = bus
            .add_channel_from("orders", &ChannelOverrides::default())
            .await
            .unwrap();

        // Bounded by the bus tier: five unacked publishes would block,
        // four must not.
        channel.subscribe_fn(|_| async move { Ok(()) }).unwrap();
        for i in 0..4 {
            bus.publish("orders", Message::new(format!("o-{}", i)))
                .await
                .unwrap();
        }
        assert_eq!(channel.pending_count(), 4);
    }
}
