//! The `/ws/data` push channel.
//!
//! Each client first receives a snapshot of all registered anchors and
//! wearables, then multiplexes across the four shared update queues.  The
//! queues are shared, not fanned out: whichever client task locks a receiver
//! first consumes the message, so with N clients each sees roughly 1/N of
//! the updates.

use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tracing::{info, warn};

use crate::events::PushMessage;
use crate::rows;
use crate::state::{AppState, SharedRx};

/// Upper bound on one multiplex wait; on expiry the loop just goes around
/// again.  Connection liveness is the channel layer's concern.
const QUEUE_WAIT: Duration = Duration::from_secs(5);

pub async fn ws_data_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_data_socket(socket, state))
}

async fn handle_data_socket(socket: WebSocket, state: AppState) {
    let total = state.ws_clients.fetch_add(1, Ordering::Relaxed) + 1;
    info!(clients = total, "push client connected");

    let (mut sink, mut stream) = socket.split();

    match send_snapshot(&mut sink, &state).await {
        Ok(()) => multiplex(&mut sink, &mut stream, &state).await,
        Err(e) => warn!(error = %e, "initial snapshot failed"),
    }

    let total = state.ws_clients.fetch_sub(1, Ordering::Relaxed) - 1;
    info!(clients = total, "push client disconnected");
}

/// One message per existing anchor, then one per existing wearable, in
/// insertion order.
async fn send_snapshot(
    sink: &mut SplitSink<WebSocket, Message>,
    state: &AppState,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    for anchor in rows::list_anchors(&state.pool).await? {
        send(sink, &PushMessage::Anchor(anchor)).await?;
    }
    for wearable in rows::list_wearables(&state.pool).await? {
        send(sink, &PushMessage::Wearable(wearable)).await?;
    }
    Ok(())
}

async fn send(
    sink: &mut SplitSink<WebSocket, Message>,
    msg: &PushMessage,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let json = serde_json::to_string(msg)?;
    sink.send(Message::Text(json)).await?;
    Ok(())
}

async fn multiplex(
    sink: &mut SplitSink<WebSocket, Message>,
    stream: &mut SplitStream<WebSocket>,
    state: &AppState,
) {
    loop {
        tokio::select! {
            msg = recv_shared(&state.queues.positions_rx) => {
                if !forward(sink, msg).await { break; }
            }
            msg = recv_shared(&state.queues.stats_rx) => {
                if !forward(sink, msg).await { break; }
            }
            msg = recv_shared(&state.queues.scans_rx) => {
                if !forward(sink, msg).await { break; }
            }
            msg = recv_shared(&state.queues.anchor_status_rx) => {
                if !forward(sink, msg).await { break; }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    // No client->server protocol beyond connection liveness.
                    Some(Ok(_)) => {}
                }
            }
            () = tokio::time::sleep(QUEUE_WAIT) => {}
        }
    }
}

/// Lock-then-receive on a shared queue.  Cancellation (losing the select
/// race) releases the lock without consuming a message.
pub(crate) async fn recv_shared(rx: &SharedRx) -> Option<PushMessage> {
    rx.lock().await.recv().await
}

/// Returns false when the client is gone or the queue's producers stopped.
async fn forward(sink: &mut SplitSink<WebSocket, Message>, msg: Option<PushMessage>) -> bool {
    let Some(msg) = msg else {
        return false;
    };
    match serde_json::to_string(&msg) {
        Ok(json) => sink.send(Message::Text(json)).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "failed to serialize push message");
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rows::StatsRow;
    use crate::state::UpdateQueues;
    use std::collections::HashSet;

    fn stats_msg(n: i64) -> PushMessage {
        PushMessage::Stats(StatsRow {
            active_devices: n,
            total_anchors: 0,
            total_wearables: 0,
            total_positions: 0,
            emergency_count: 0,
            ts: String::new(),
        })
    }

    #[tokio::test]
    async fn shared_queue_messages_are_consumed_exactly_once() {
        let queues = UpdateQueues::new();
        const N: i64 = 40;
        for i in 0..N {
            queues.stats_tx.send(stats_msg(i)).await.unwrap();
        }

        let (done_tx, mut done_rx) = tokio::sync::mpsc::channel::<i64>(64);
        for _ in 0..2 {
            let rx = queues.stats_rx.clone();
            let done = done_tx.clone();
            tokio::spawn(async move {
                while let Some(msg) = recv_shared(&rx).await {
                    if let PushMessage::Stats(stats) = msg {
                        done.send(stats.active_devices).await.unwrap();
                    }
                }
            });
        }
        drop(done_tx);
        // Dropping the senders lets the competing consumers drain and exit.
        drop(queues);

        let mut seen = HashSet::new();
        while let Some(value) = done_rx.recv().await {
            assert!(seen.insert(value), "message {value} delivered to two clients");
        }
        assert_eq!(seen.len(), N as usize);
    }
}
