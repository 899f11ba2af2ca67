//! Server-Sent Events support

use crate::broker::{StreamEvent, Subscription};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::StreamExt;

/// Keep-alive comment interval
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Serve a subscription as an SSE response. The stream ends when the
/// subscription does (superseded, expired or deleted session).
pub fn sse_stream(subscription: Subscription) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = subscription.into_stream().map(|event| Ok(to_sse(&event)));

    Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(KEEP_ALIVE_INTERVAL)
            .text("ping"),
    )
}

/// Data-only frame carrying the event as JSON
fn to_sse(event: &StreamEvent) -> Event {
    match serde_json::to_string(event) {
        Ok(data) => Event::default().data(data),
        Err(e) => {
            tracing::error!(session_id = %event.session_id, error = %e, "Failed to encode event");
            Event::default().comment("encoding error")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_event_payload_fields() {
        let event = StreamEvent::final_response("s1", "done");
        let data = serde_json::to_string(&event).unwrap();
        let value: Value = serde_json::from_str(&data).unwrap();
        for field in ["type", "content", "session_id", "timestamp", "metadata", "sequence"] {
            assert!(value.get(field).is_some(), "missing {field}");
        }
        assert_eq!(value["type"], "final_response");
    }
}
