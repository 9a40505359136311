//! Replays a canned event stream through the driver in uneven chunks and
//! prints each callback. No backend needed.

use agent_stream::prelude::*;
use agent_stream::{TransportError, cancel_pair, observer_fn};
use bytes::Bytes;

const RECORDED: &str = concat!(
    "data: {\"type\":\"assistant_chunk\",\"content\":\"Looking at the schema… \"}\n\n",
    "data: {\"type\":\"assistant_chunk\",\"content\":\"joining orders to users.\"}\n\n",
    "data: {\"type\":\"structured_result\",\"fields\":{\"sub_tool_type\":\"sql\",\"query\":\"SELECT 1\"}}\n\n",
    "data: {\"type\":\"complete\"}\n\n",
);

#[tokio::main(flavor = "current_thread")]
async fn main() {
    agent_stream::observability::init_observability("debug");

    let chunks: Vec<Result<Bytes, TransportError>> = RECORDED
        .as_bytes()
        .chunks(17)
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect();
    let response = TransportResponse::new(200, futures::stream::iter(chunks));

    let mut observer = observer_fn(
        |session: &StreamSession| {
            println!("[{:?}] {}", session.phase(), session.accumulated_text());
        },
        |session: &StreamSession| {
            println!("done: {:?} fields={:?}", session.phase(), session.structured_fields());
        },
    );
    let (_cancel, signal) = cancel_pair();
    StreamDriver::default()
        .run(response, SessionId(1), &mut observer, signal)
        .await;
}
