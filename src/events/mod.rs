//! Analytics events: a bounded, persisted event log with session tracking, forwarding every
//! event to the configured [`EventSink`]s.
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    context::{generate_event_id, generate_session_id},
    models::Timestamp,
    storage::{load_json, remove_key, save_json, KeyValueStorage, TryParse},
};

mod http;
mod sink;

pub use http::HttpSink;
pub use sink::{DataLayerSink, EventSink, GtagSink};

/// Storage key of the persisted event log.
pub const EVENTS_KEY: &str = "analytics_events";
/// Storage key of the current session.
pub const SESSION_KEY: &str = "analytics_session";

/// Category of the experiment-related events emitted by [`Client`](crate::Client).
pub const AB_TEST_CATEGORY: &str = "ab_test";
/// Emitted once when a user is first assigned a variant.
pub const ASSIGNMENT_EVENT: &str = "ab_test_assignment";
/// Emitted when an assigned user sees the experiment.
pub const EXPOSURE_EVENT: &str = "ab_test_view";
/// Emitted when an assigned user converts on an experiment metric.
pub const CONVERSION_EVENT: &str = "ab_test_conversion";

/// Free-form event properties.
pub type EventProperties = serde_json::Map<String, serde_json::Value>;

/// A single analytics event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsEvent {
    #[allow(missing_docs)]
    pub id: String,
    /// Event name, e.g. `"add_to_cart"`.
    pub name: String,
    #[allow(missing_docs)]
    pub category: String,
    #[allow(missing_docs)]
    #[serde(default)]
    pub properties: EventProperties,
    /// Optional numeric value (revenue, quantity, etc.).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[allow(missing_docs)]
    pub timestamp: Timestamp,
    /// Filled in by the tracker if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Filled in by the tracker if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl AnalyticsEvent {
    /// Create an event stamped with a fresh id and the current time.
    pub fn new(name: impl Into<String>, category: impl Into<String>) -> AnalyticsEvent {
        AnalyticsEvent {
            id: generate_event_id(),
            name: name.into(),
            category: category.into(),
            properties: EventProperties::new(),
            value: None,
            timestamp: Utc::now(),
            user_id: None,
            session_id: None,
        }
    }

    #[allow(missing_docs)]
    pub fn with_property(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    #[allow(missing_docs)]
    pub fn with_value(mut self, value: f64) -> Self {
        self.value = Some(value);
        self
    }

    #[allow(missing_docs)]
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    #[allow(missing_docs)]
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// A browsing session, i.e., a run of events without a gap longer than the session timeout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct AnalyticsSession {
    pub id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    pub started_at: Timestamp,
    pub last_activity_at: Timestamp,
    pub event_count: u64,
}

/// Settings of an [`EventTracker`].
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// How many recent events are retained (in memory and in storage).
    pub max_events: usize,
    /// Inactivity after which the next event starts a new session.
    pub session_timeout: Duration,
}

impl TrackerConfig {
    /// Default value for [`TrackerConfig::max_events`].
    pub const DEFAULT_MAX_EVENTS: usize = 1000;
    /// Default value for [`TrackerConfig::session_timeout`], in minutes.
    pub const DEFAULT_SESSION_TIMEOUT_MINUTES: i64 = 30;
}

impl Default for TrackerConfig {
    fn default() -> TrackerConfig {
        TrackerConfig {
            max_events: TrackerConfig::DEFAULT_MAX_EVENTS,
            session_timeout: Duration::minutes(TrackerConfig::DEFAULT_SESSION_TIMEOUT_MINUTES),
        }
    }
}

#[derive(Debug)]
struct TrackerState {
    events: VecDeque<AnalyticsEvent>,
    session: Option<AnalyticsSession>,
    user_id: Option<String>,
}

/// Records analytics events and forwards them to sinks.
///
/// `track()` is fire-and-forget: it never fails and never retries. Sinks are called synchronously
/// on the calling thread, so they must not block (see [`HttpSink`] for offloading I/O).
pub struct EventTracker {
    config: TrackerConfig,
    storage: Arc<dyn KeyValueStorage>,
    sinks: Vec<Box<dyn EventSink + Send + Sync>>,
    state: Mutex<TrackerState>,
}

impl EventTracker {
    /// Create a tracker, restoring the persisted event log and session from `storage`.
    pub fn new(
        config: TrackerConfig,
        storage: Arc<dyn KeyValueStorage>,
        sinks: Vec<Box<dyn EventSink + Send + Sync>>,
    ) -> EventTracker {
        let stored: Vec<TryParse<AnalyticsEvent>> =
            load_json(&*storage, EVENTS_KEY).unwrap_or_default();
        let mut events: VecDeque<AnalyticsEvent> = stored
            .into_iter()
            .enumerate()
            .filter_map(|(index, event)| event.ok_or_log(EVENTS_KEY, &index.to_string()))
            .collect();
        while events.len() > config.max_events {
            events.pop_front();
        }
        let session: Option<AnalyticsSession> = load_json(&*storage, SESSION_KEY);

        EventTracker {
            config,
            storage,
            sinks,
            state: Mutex::new(TrackerState {
                events,
                session,
                user_id: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Default user id attached to events that have none.
    pub fn set_user_id(&self, user_id: impl Into<String>) {
        self.lock().user_id = Some(user_id.into());
    }

    /// Id of the current session, starting a new one if the previous one expired.
    pub fn session_id(&self) -> String {
        let mut state = self.lock();
        let id = self.touch_session(&mut state, false).id.clone();
        save_json(&*self.storage, SESSION_KEY, &state.session);
        id
    }

    /// Current session, if any.
    pub fn session(&self) -> Option<AnalyticsSession> {
        self.lock().session.clone()
    }

    /// Record `event` and forward it to all sinks.
    ///
    /// Missing `user_id`/`session_id` are filled with the tracker defaults.
    pub fn track(&self, mut event: AnalyticsEvent) {
        {
            let mut state = self.lock();

            if event.id.is_empty() {
                event.id = generate_event_id();
            }
            if event.user_id.is_none() {
                event.user_id = state.user_id.clone();
            }
            if event.session_id.is_none() {
                event.session_id = Some(self.touch_session(&mut state, true).id.clone());
            } else if let Some(session) = &mut state.session {
                if event.session_id.as_ref() == Some(&session.id) {
                    session.event_count += 1;
                    session.last_activity_at = Utc::now();
                }
            }

            state.events.push_back(event.clone());
            while state.events.len() > self.config.max_events {
                state.events.pop_front();
            }

            save_json(&*self.storage, EVENTS_KEY, &state.events);
            save_json(&*self.storage, SESSION_KEY, &state.session);
        }

        log::trace!(target: "splitkit", event:serde = event; "tracked event");

        // Sinks are called without holding the lock so that a sink may track events itself.
        for sink in &self.sinks {
            sink.send(&event);
        }
    }

    /// Snapshot of the retained events, oldest first.
    pub fn events(&self) -> Vec<AnalyticsEvent> {
        self.lock().events.iter().cloned().collect()
    }

    /// Retained events with the given name, oldest first.
    pub fn events_named(&self, name: &str) -> Vec<AnalyticsEvent> {
        self.lock()
            .events
            .iter()
            .filter(|e| e.name == name)
            .cloned()
            .collect()
    }

    /// Drop all retained events and the current session.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.events.clear();
        state.session = None;
        remove_key(&*self.storage, EVENTS_KEY);
        remove_key(&*self.storage, SESSION_KEY);
    }

    fn touch_session<'s>(
        &self,
        state: &'s mut TrackerState,
        count_event: bool,
    ) -> &'s AnalyticsSession {
        let now = Utc::now();
        let timeout = self.config.session_timeout;
        if state
            .session
            .as_ref()
            .is_some_and(|s| now - s.last_activity_at > timeout)
        {
            state.session = None;
        }

        let user_id = state.user_id.clone();
        let session = state.session.get_or_insert_with(|| {
            log::debug!(target: "splitkit", "starting new analytics session");
            AnalyticsSession {
                id: generate_session_id(),
                user_id,
                started_at: now,
                last_activity_at: now,
                event_count: 0,
            }
        });

        session.last_activity_at = now;
        if count_event {
            session.event_count += 1;
        }
        session
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use chrono::{Duration, Utc};

    use super::{
        AnalyticsEvent, AnalyticsSession, EventTracker, TrackerConfig, EVENTS_KEY, SESSION_KEY,
    };
    use crate::storage::{tests::FailingStorage, KeyValueStorage, MemoryStorage};

    fn tracker(storage: Arc<MemoryStorage>, max_events: usize) -> EventTracker {
        EventTracker::new(
            TrackerConfig {
                max_events,
                ..TrackerConfig::default()
            },
            storage,
            Vec::new(),
        )
    }

    #[test]
    fn fills_in_defaults() {
        let tracker = tracker(Arc::new(MemoryStorage::new()), 10);
        tracker.set_user_id("u1");
        tracker.track(AnalyticsEvent::new("add_to_cart", "ecommerce").with_value(129.0));

        let events = tracker.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].user_id.as_deref(), Some("u1"));
        assert_eq!(events[0].session_id, Some(tracker.session().unwrap().id));
        assert_eq!(events[0].value, Some(129.0));
    }

    #[test]
    fn keeps_explicit_ids() {
        let tracker = tracker(Arc::new(MemoryStorage::new()), 10);
        tracker.set_user_id("u1");
        tracker.track(
            AnalyticsEvent::new("page_view", "navigation")
                .with_user_id("u2")
                .with_session_id("s2"),
        );

        let events = tracker.events();
        assert_eq!(events[0].user_id.as_deref(), Some("u2"));
        assert_eq!(events[0].session_id.as_deref(), Some("s2"));
    }

    #[test]
    fn log_is_bounded() {
        let storage = Arc::new(MemoryStorage::new());
        let tracker = tracker(storage.clone(), 3);
        for i in 0..5 {
            tracker.track(AnalyticsEvent::new(format!("event-{i}"), "test"));
        }

        let names: Vec<_> = tracker.events().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["event-2", "event-3", "event-4"]);

        let persisted: Vec<AnalyticsEvent> =
            serde_json::from_str(&storage.get(EVENTS_KEY).unwrap().unwrap()).unwrap();
        assert_eq!(persisted.len(), 3);
    }

    #[test]
    fn restores_persisted_log() {
        let storage = Arc::new(MemoryStorage::new());
        {
            let tracker = tracker(storage.clone(), 10);
            tracker.track(AnalyticsEvent::new("first", "test"));
            tracker.track(AnalyticsEvent::new("second", "test"));
        }

        let tracker = tracker(storage, 1);
        let names: Vec<_> = tracker.events().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["second"]);
    }

    #[test]
    fn bad_stored_events_are_skipped() {
        let storage = Arc::new(MemoryStorage::new());
        let good = serde_json::to_value(AnalyticsEvent::new("kept", "test")).unwrap();
        let mut broken = serde_json::to_value(AnalyticsEvent::new("broken", "test")).unwrap();
        broken["timestamp"] = "yesterday".into();
        storage
            .set(EVENTS_KEY, &serde_json::json!([good, broken, 42]).to_string())
            .unwrap();

        let tracker = tracker(storage, 10);
        let names: Vec<_> = tracker.events().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["kept"]);
    }

    #[test]
    fn forwards_to_sinks() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let tracker = {
            let received = received.clone();
            EventTracker::new(
                TrackerConfig::default(),
                Arc::new(MemoryStorage::new()),
                vec![Box::new(move |event: &AnalyticsEvent| {
                    received.lock().unwrap().push(event.name.clone());
                })],
            )
        };

        tracker.track(AnalyticsEvent::new("purchase", "ecommerce"));
        assert_eq!(*received.lock().unwrap(), vec!["purchase".to_owned()]);
    }

    #[test]
    fn session_is_reused_until_timeout() {
        let storage = Arc::new(MemoryStorage::new());
        let tracker = tracker(storage.clone(), 10);

        let first = tracker.session_id();
        tracker.track(AnalyticsEvent::new("a", "test"));
        tracker.track(AnalyticsEvent::new("b", "test"));
        assert_eq!(tracker.session_id(), first);
        assert_eq!(tracker.session().unwrap().event_count, 2);

        // simulate 31 minutes of inactivity
        let stale = AnalyticsSession {
            last_activity_at: Utc::now() - Duration::minutes(31),
            ..tracker.session().unwrap()
        };
        storage
            .set(SESSION_KEY, &serde_json::to_string(&Some(stale)).unwrap())
            .unwrap();
        let restored = EventTracker::new(TrackerConfig::default(), storage, Vec::new());
        assert_ne!(restored.session_id(), first);
    }

    #[test]
    fn clear_removes_everything() {
        let storage = Arc::new(MemoryStorage::new());
        let tracker = tracker(storage.clone(), 10);
        tracker.track(AnalyticsEvent::new("a", "test"));

        tracker.clear();
        assert!(tracker.events().is_empty());
        assert!(tracker.session().is_none());
        assert!(storage.get(EVENTS_KEY).unwrap().is_none());
    }

    #[test]
    fn storage_failures_are_not_fatal() {
        let tracker = EventTracker::new(
            TrackerConfig::default(),
            Arc::new(FailingStorage),
            Vec::new(),
        );
        tracker.track(AnalyticsEvent::new("a", "test"));
        assert_eq!(tracker.events().len(), 1);
    }

    #[test]
    fn events_named_filters() {
        let tracker = tracker(Arc::new(MemoryStorage::new()), 10);
        tracker.track(AnalyticsEvent::new("a", "test"));
        tracker.track(AnalyticsEvent::new("b", "test"));
        tracker.track(AnalyticsEvent::new("a", "test"));
        assert_eq!(tracker.events_named("a").len(), 2);
    }
}
