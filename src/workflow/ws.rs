use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade, rejection::WebSocketUpgradeRejection},
    },
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use pipewright_common::{EventCategory, PushMessage};
use serde::Deserialize;
use serde_json::json;
use tokio::time::Instant;

use super::api::{ApiError, SharedState};
use super::broadcaster::{EventFilter, EventSource, Subscription, SubscriptionEvent};
use super::models::validate_instance_id;
use crate::errors::WorkflowError;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Default, Deserialize)]
pub struct WsParams {
    pub instance_id: Option<String>,
    /// Replay buffered log entries with a sequence number above this one.
    pub since: Option<u64>,
}

/// Ordered stream of push frames for one connection: replayed history
/// first, then live events with anything already replayed skipped.
pub struct PushFeed {
    sub: Subscription,
    instance_id: Option<String>,
    last_seq: u64,
    pending: std::collections::VecDeque<Arc<PushMessage>>,
}

impl PushFeed {
    /// Subscribe before reading history so nothing published in between is
    /// lost; duplicates are dropped by sequence number.
    pub async fn open<S: EventSource>(source: &S, params: &WsParams) -> anyhow::Result<Self> {
        let filter = match &params.instance_id {
            Some(id) => EventFilter::instance(id.clone()),
            None => EventFilter::all(),
        };
        let sub = source.subscribe(filter).await?;
        let mut feed = Self {
            sub,
            instance_id: params.instance_id.clone(),
            last_seq: params.since.unwrap_or(0),
            pending: Default::default(),
        };
        if let (Some(id), Some(since)) = (&params.instance_id, params.since) {
            let history = source.history(id, since).await?;
            tracing::debug!(instance_id = %id, since, replayed = history.len(), "replaying history");
            feed.pending.extend(history.into_iter().map(Arc::new));
        }
        Ok(feed)
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    fn accept(&mut self, msg: &PushMessage) -> bool {
        let Some(seq) = msg.seq else {
            return true;
        };
        if self.instance_id.as_deref() != Some(msg.instance_id.as_str()) {
            return true;
        }
        if seq <= self.last_seq {
            return false;
        }
        self.last_seq = seq;
        true
    }

    /// Next message to send. `None` once the subscription has ended, e.g.
    /// because the instance was deleted.
    pub async fn next(&mut self) -> Option<Arc<PushMessage>> {
        while let Some(msg) = self.pending.pop_front() {
            if self.accept(&msg) {
                return Some(msg);
            }
        }
        loop {
            match self.sub.recv().await? {
                SubscriptionEvent::Message(msg) => {
                    if self.accept(&msg) {
                        return Some(msg);
                    }
                }
                SubscriptionEvent::Lagged(missed) => {
                    tracing::warn!(missed, "push subscriber lagged");
                    let notice = PushMessage::new(
                        self.instance_id.clone().unwrap_or_default(),
                        EventCategory::Error,
                        None,
                        json!({
                            "kind": "lagged",
                            "missed": missed,
                            "resume_since": self.last_seq,
                        }),
                    );
                    return Some(Arc::new(notice));
                }
            }
        }
    }
}

// ── WebSocket handler ────────────────────────────────────────────────

pub async fn ws_handler(
    State(state): State<SharedState>,
    Query(params): Query<WsParams>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if let Err(e) = check_params(&state, &params).await {
        return e.into_response();
    }
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };
    match PushFeed::open(state.orch.log_aggregator(), &params).await {
        Ok(feed) => ws.on_upgrade(move |socket| handle_socket(socket, feed)),
        Err(e) => ApiError(WorkflowError::Other(e)).into_response(),
    }
}

async fn check_params(state: &SharedState, params: &WsParams) -> Result<(), ApiError> {
    match &params.instance_id {
        Some(id) => {
            validate_instance_id(id)?;
            state.orch.get(id).await?;
        }
        None if params.since.is_some() => {
            return Err(WorkflowError::validation(None, "since requires instance_id").into());
        }
        None => {}
    }
    Ok(())
}

async fn handle_socket(socket: WebSocket, feed: PushFeed) {
    let (sender, receiver) = socket.split();
    run_socket_loop(sender, receiver, feed).await;
}

/// Core WebSocket loop with ping/pong keepalive.
///
/// Combines feed forwarding, client message receiving, and periodic
/// ping/pong health checking into a single select loop. If no Pong is
/// received within [`PONG_TIMEOUT`] after a Ping is sent, the connection
/// is considered dead and the loop exits.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut feed: PushFeed,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately; consume it so the first real
    // ping fires after PING_INTERVAL has elapsed.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    tracing::debug!("push client missed pong, closing");
                    break;
                }
                if sender.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            next = feed.next() => {
                let Some(msg) = next else {
                    break;
                };
                let text = match serde_json::to_string(&*msg) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to encode push message");
                        continue;
                    }
                };
                if sender.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    // Best-effort close frame
    let _ = sender.send(Message::Close(None)).await;
}
