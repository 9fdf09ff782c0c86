// Streaming endpoint: one SSE stream per connected client
//
// Each stream opens with a `connection-established` marker, then carries one
// `power-event` message per relayed event. Dropping the stream (client gone or
// server shutting down) drops the subscription, which unregisters it.

use std::convert::Infallible;

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use futures_core::Stream;
use tracing::{debug, info, warn};

use powerwatch_core::{PowerEvent, Subscription};

use crate::AppState;

pub const CONNECTION_ESTABLISHED: &str = "connection-established";
pub const POWER_EVENT: &str = "power-event";

pub async fn event_stream_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscription = state.relay.fanout.subscribe();
    info!(target: "http", subscription_id = subscription.id(), "Starting SSE stream for client");

    Sse::new(power_event_stream(subscription))
        .keep_alive(KeepAlive::new().interval(state.keep_alive))
}

/// Marker first, then every event delivered to `subscription`
pub fn power_event_stream(
    mut subscription: Subscription,
) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        // No power event payload: the marker only says "connected"
        yield Ok(Event::default().event(CONNECTION_ESTABLISHED).data("null"));

        while let Some(event) = subscription.recv().await {
            match to_sse(&event) {
                Ok(sse) => {
                    debug!(
                        target: "http",
                        subscription_id = subscription.id(),
                        state = %event.state(),
                        time_generated = %event.time_generated(),
                        "Pushed power event to SSE stream"
                    );
                    yield Ok(sse);
                }
                Err(e) => {
                    warn!(target: "http", error = %e, "Failed to serialize power event");
                }
            }
        }
        info!(target: "http", subscription_id = subscription.id(), "SSE stream closed by relay");
    }
}

fn to_sse(event: &PowerEvent) -> Result<Event, axum::Error> {
    Event::default().event(POWER_EVENT).json_data(event)
}
