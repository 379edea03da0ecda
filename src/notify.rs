//! Instrumentation events emitted when a rule matches.

use serde::Serialize;
use tracing::info;

use crate::request::{MatchRecord, Request};

/// Event name carried by every match notification.
pub const MATCH_EVENT: &str = "abuse.match";

/// A rule match, as handed to a [`Notifier`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchEvent {
    pub name: &'static str,
    pub record: MatchRecord,
    pub remote_addr: Option<String>,
    pub method: String,
    pub path: String,
}

impl MatchEvent {
    pub(crate) fn new(record: MatchRecord, request: &Request) -> Self {
        Self {
            name: MATCH_EVENT,
            record,
            remote_addr: request.remote_addr().map(str::to_string),
            method: request.method().to_string(),
            path: request.path().to_string(),
        }
    }
}

/// Receives match events. Implementations must not block.
pub trait Notifier: Send + Sync {
    fn instrument(&self, event: &MatchEvent);
}

/// Notifier that writes each event to the `tracing` subscriber.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn instrument(&self, event: &MatchEvent) {
        let data = event.record.data;
        info!(
            event = event.name,
            rule = %event.record.rule,
            match_type = %event.record.match_type,
            discriminator = %event.record.discriminator,
            count = data.map(|d| d.count),
            limit = data.map(|d| d.limit),
            period_secs = data.map(|d| d.period.as_secs()),
            remote_addr = ?event.remote_addr,
            path = %event.path,
            "Rule matched"
        );
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::request::MatchType;
    use parking_lot::Mutex;

    /// Notifier that keeps every event it sees.
    #[derive(Default)]
    pub(crate) struct RecordingNotifier {
        pub events: Mutex<Vec<MatchEvent>>,
    }

    impl Notifier for RecordingNotifier {
        fn instrument(&self, event: &MatchEvent) {
            self.events.lock().push(event.clone());
        }
    }

    #[test]
    fn test_event_carries_request_details() {
        let request = Request::new("GET", "/admin").with_remote_addr("10.0.0.1");
        let record = MatchRecord {
            rule: "block-admin".into(),
            discriminator: "true".into(),
            match_type: MatchType::Blocklist,
            data: None,
        };

        let event = MatchEvent::new(record, &request);
        assert_eq!(event.name, "abuse.match");
        assert_eq!(event.remote_addr.as_deref(), Some("10.0.0.1"));
        assert_eq!(event.path, "/admin");

        let notifier = RecordingNotifier::default();
        notifier.instrument(&event);
        TracingNotifier.instrument(&event);
        assert_eq!(notifier.events.lock().len(), 1);
    }
}
