use std::{
    sync::mpsc::{channel, Sender},
    thread::JoinHandle,
    time::Duration,
};

use reqwest::Url;

use super::{AnalyticsEvent, EventSink};
use crate::{Error, Result};

const ANALYTICS_ENDPOINT: &str = "/api/analytics";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Posts every event as JSON to `<base_url>/api/analytics`.
///
/// Requests are made from a background thread, so [`EventSink::send`] never blocks. Delivery is
/// best-effort: failed requests are logged and dropped.
pub struct HttpSink {
    endpoint: Url,
    sender: Sender<AnalyticsEvent>,
    join_handle: JoinHandle<()>,
}

impl HttpSink {
    /// Start the delivery thread.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidBaseUrl`] if `base_url` cannot be parsed, and [`Error::Io`] if the
    /// thread cannot be spawned.
    pub fn new(base_url: &str) -> Result<HttpSink> {
        let endpoint = Url::parse(base_url)
            .and_then(|base| base.join(ANALYTICS_ENDPOINT))
            .map_err(Error::InvalidBaseUrl)?;

        let (sender, receiver) = channel::<AnalyticsEvent>();

        let join_handle = {
            let endpoint = endpoint.clone();
            std::thread::Builder::new()
                .name("splitkit-analytics".to_owned())
                .spawn(move || {
                    let client = match reqwest::blocking::Client::builder()
                        .timeout(REQUEST_TIMEOUT)
                        .build()
                    {
                        Ok(client) => client,
                        Err(err) => {
                            log::warn!(target: "splitkit", "failed to create HTTP client, analytics delivery is disabled: {err}");
                            return;
                        }
                    };

                    // Exits once every sender is dropped.
                    for event in receiver {
                        match client.post(endpoint.clone()).json(&event).send() {
                            Ok(response) if response.status().is_success() => {
                                log::trace!(target: "splitkit", event_id:display = event.id; "delivered event");
                            }
                            Ok(response) => {
                                log::debug!(target: "splitkit", event_id:display = event.id; "analytics endpoint responded with {}", response.status());
                            }
                            Err(err) => {
                                log::debug!(target: "splitkit", event_id:display = event.id; "failed to deliver event: {err}");
                            }
                        }
                    }
                })?
        };

        Ok(HttpSink {
            endpoint,
            sender,
            join_handle,
        })
    }

    /// Where events are posted.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Stop accepting events and wait until the queued ones have been delivered.
    pub fn shutdown(self) {
        drop(self.sender);
        if self.join_handle.join().is_err() {
            log::warn!(target: "splitkit", "analytics delivery thread panicked");
        }
    }
}

impl EventSink for HttpSink {
    fn send(&self, event: &AnalyticsEvent) {
        // Only fails if the delivery thread is gone, in which case there is nobody to deliver to.
        let _ = self.sender.send(event.clone());
    }
}
