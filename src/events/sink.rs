use serde_json::{json, Value};

use super::{AnalyticsEvent, EventProperties};

/// A destination for analytics events (analytics SDK, tag manager, HTTP collector, ...).
pub trait EventSink {
    /// Forward `event` to the destination.
    ///
    /// # Errors
    ///
    /// This method should not return errors and should not panic. Delivery is best-effort: failed
    /// events are dropped and should only be logged.
    ///
    /// # Notes
    ///
    /// This method is called on the thread that tracked the event (possibly while a variant is
    /// being assigned), so it must not block.
    fn send(&self, event: &AnalyticsEvent);
}

impl<T: Fn(&AnalyticsEvent)> EventSink for T {
    fn send(&self, event: &AnalyticsEvent) {
        self(event);
    }
}

/// Reshapes events into `gtag("event", name, params)` calls.
///
/// `params` contain the event properties plus `event_category`, and `value` if present.
///
/// ```
/// # use splitkit::events::GtagSink;
/// # use serde_json::Value;
/// let sink = GtagSink::new(|command: &str, name: &str, params: &Value| {
///     println!("gtag({command:?}, {name:?}, {params})");
/// });
/// ```
pub struct GtagSink<F> {
    gtag: F,
}

impl<F: Fn(&str, &str, &Value)> GtagSink<F> {
    #[allow(missing_docs)]
    pub fn new(gtag: F) -> Self {
        GtagSink { gtag }
    }
}

impl<F: Fn(&str, &str, &Value)> EventSink for GtagSink<F> {
    fn send(&self, event: &AnalyticsEvent) {
        let mut params = event.properties.clone();
        params.insert("event_category".to_owned(), event.category.clone().into());
        if let Some(value) = event.value {
            params.insert("value".to_owned(), value.into());
        }
        (self.gtag)("event", &event.name, &Value::Object(params));
    }
}

/// Reshapes events into flat `dataLayer.push({...})` objects keyed by `event`.
pub struct DataLayerSink<F> {
    push: F,
}

impl<F: Fn(Value)> DataLayerSink<F> {
    #[allow(missing_docs)]
    pub fn new(push: F) -> Self {
        DataLayerSink { push }
    }
}

impl<F: Fn(Value)> EventSink for DataLayerSink<F> {
    fn send(&self, event: &AnalyticsEvent) {
        let mut entry = EventProperties::new();
        entry.insert("event".to_owned(), event.name.clone().into());
        entry.insert("event_category".to_owned(), event.category.clone().into());
        // properties must not shadow the reserved keys above
        for (key, value) in &event.properties {
            entry.entry(key.clone()).or_insert_with(|| value.clone());
        }
        if let Some(value) = event.value {
            entry.insert("value".to_owned(), value.into());
        }
        entry.insert("timestamp".to_owned(), json!(event.timestamp.to_rfc3339()));
        (self.push)(Value::Object(entry));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::{json, Value};

    use super::{DataLayerSink, EventSink, GtagSink};
    use crate::events::AnalyticsEvent;

    fn event() -> AnalyticsEvent {
        AnalyticsEvent::new("ab_test_assignment", "ab_test")
            .with_property("experiment_id", "e1")
            .with_property("variant_id", "b")
            .with_value(1.0)
    }

    #[test]
    fn gtag_shape() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let calls = calls.clone();
            GtagSink::new(move |command: &str, name: &str, params: &Value| {
                calls
                    .lock()
                    .unwrap()
                    .push((command.to_owned(), name.to_owned(), params.clone()));
            })
        };

        sink.send(&event());

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "event");
        assert_eq!(calls[0].1, "ab_test_assignment");
        assert_eq!(
            calls[0].2,
            json!({
                "experiment_id": "e1",
                "variant_id": "b",
                "event_category": "ab_test",
                "value": 1.0,
            })
        );
    }

    #[test]
    fn data_layer_shape() {
        let pushed = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let pushed = pushed.clone();
            DataLayerSink::new(move |entry: Value| pushed.lock().unwrap().push(entry))
        };

        sink.send(&event().with_property("event", "spoofed"));

        let pushed = pushed.lock().unwrap();
        assert_eq!(pushed[0]["event"], "ab_test_assignment");
        assert_eq!(pushed[0]["event_category"], "ab_test");
        assert_eq!(pushed[0]["experiment_id"], "e1");
        assert_eq!(pushed[0]["value"], 1.0);
        assert!(pushed[0]["timestamp"].is_string());
    }

    #[test]
    fn closures_are_sinks() {
        let count = Arc::new(Mutex::new(0));
        let sink = {
            let count = count.clone();
            move |_: &AnalyticsEvent| *count.lock().unwrap() += 1
        };
        sink.send(&event());
        sink.send(&event());
        assert_eq!(*count.lock().unwrap(), 2);
    }
}
