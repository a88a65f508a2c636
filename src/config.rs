use std::sync::Arc;

use crate::{
    events::{EventSink, TrackerConfig},
    sharder::{RollingHashSharder, Sharder},
    storage::{KeyValueStorage, MemoryStorage},
    Client, Registry,
};

/// Configuration for [`Client`].
pub struct ClientConfig {
    pub(crate) storage: Arc<dyn KeyValueStorage>,
    pub(crate) sharder: Box<dyn Sharder + Send + Sync>,
    pub(crate) sinks: Vec<Box<dyn EventSink + Send + Sync>>,
    pub(crate) registry: Option<Arc<Registry>>,
    pub(crate) tracker: TrackerConfig,
}

impl ClientConfig {
    /// Create a default configuration persisting to `storage`.
    ///
    /// ```
    /// # use splitkit::{ClientConfig, MemoryStorage};
    /// ClientConfig::new(MemoryStorage::new());
    /// ```
    pub fn new(storage: impl KeyValueStorage + 'static) -> Self {
        ClientConfig {
            storage: Arc::new(storage),
            sharder: Box::new(RollingHashSharder),
            sinks: Vec::new(),
            registry: None,
            tracker: TrackerConfig::default(),
        }
    }

    /// Create a configuration that keeps everything in memory.
    pub fn in_memory() -> Self {
        ClientConfig::new(MemoryStorage::new())
    }

    /// Override the hash used for bucketing. Defaults to [`RollingHashSharder`].
    ///
    /// Changing the sharder re-buckets every user without a persisted assignment.
    pub fn sharder(&mut self, sharder: impl Sharder + Send + Sync + 'static) -> &mut Self {
        self.sharder = Box::new(sharder);
        self
    }

    /// Add a destination for analytics events. May be called multiple times.
    ///
    /// ```
    /// # use splitkit::{ClientConfig, events::AnalyticsEvent};
    /// let mut config = ClientConfig::in_memory();
    /// config.event_sink(|event: &AnalyticsEvent| {
    ///   println!("{:?}", event);
    /// });
    /// ```
    pub fn event_sink(&mut self, sink: impl EventSink + Send + Sync + 'static) -> &mut Self {
        self.sinks.push(Box::new(sink));
        self
    }

    /// Share an existing registry instead of loading one from storage.
    ///
    /// The registry keeps persisting to the storage it was loaded from.
    pub fn registry(&mut self, registry: Arc<Registry>) -> &mut Self {
        self.registry = Some(registry);
        self
    }

    /// How many recent analytics events to retain. Defaults to
    /// [`TrackerConfig::DEFAULT_MAX_EVENTS`].
    pub fn max_stored_events(&mut self, max_events: usize) -> &mut Self {
        self.tracker.max_events = max_events;
        self
    }

    /// Inactivity after which a new analytics session starts. Defaults to 30 minutes.
    pub fn session_timeout(&mut self, timeout: chrono::Duration) -> &mut Self {
        self.tracker.session_timeout = timeout;
        self
    }

    /// Create a new [`Client`] using the specified configuration.
    ///
    /// ```
    /// # use splitkit::{Client, ClientConfig};
    /// let client: Client = ClientConfig::in_memory().to_client();
    /// ```
    pub fn to_client(self) -> Client {
        Client::new(self)
    }
}
