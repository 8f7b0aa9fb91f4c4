//! WebSocket handler: one map session per connection. Forwards the map's and
//! the user's event streams to the client and applies client messages.

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::handlers::http::AppState;
use crate::middleware::ClientIdentity;
use crate::models::{Channel, ClientMessage, EventEnvelope, Position};
use crate::services::{ConnectedSession, EventSubscription};

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub map_id: Uuid,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
}

impl WsParams {
    fn position(&self) -> AppResult<Option<Position>> {
        match (self.lat, self.lng) {
            (Some(lat), Some(lng)) => Ok(Some(Position::new(lat, lng))),
            (None, None) => Ok(None),
            _ => Err(AppError::Validation(
                "lat and lng must be given together".to_string(),
            )),
        }
    }
}

/// GET /ws?map_id=..&user_id=..[&lat=..&lng=..]
///
/// The session is connected before the upgrade so rate-limit and conflict
/// failures come back as plain HTTP responses.
pub async fn ws_handler(
    State(state): State<AppState>,
    identity: ClientIdentity,
    Query(params): Query<WsParams>,
    ws: WebSocketUpgrade,
) -> Result<Response, AppError> {
    let connected = state
        .reconciler
        .connect(identity.0, params.map_id, params.position()?)
        .await?;
    Ok(ws.on_upgrade(move |socket| handle_socket(state, socket, connected)))
}

fn frame(event: &str, data: serde_json::Value) -> String {
    json!({ "event": event, "data": data }).to_string()
}

fn error_frame(e: &AppError) -> String {
    frame(
        "error",
        json!({ "message": e.client_message(), "code": e.code() }),
    )
}

/// Close code when an event subscription ends under a live connection.
const CLOSE_EVENTS_LOST: u16 = 1011;
/// Close code when the session behind the connection no longer exists.
const CLOSE_SESSION_GONE: u16 = 4001;

fn close_frame(code: u16, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }))
}

/// Pump one subscription into `out` until `stop` flips. If the store ends the
/// subscription first, its channel is reported on `lost`.
fn spawn_forwarder(
    subscription: EventSubscription,
    out: mpsc::Sender<EventEnvelope>,
    mut stop: watch::Receiver<bool>,
    lost: mpsc::Sender<Channel>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let channel = subscription.channel();
        let cancel = async move {
            let _ = stop.changed().await;
        };
        if let Err(e) = subscription.forward(out, cancel).await {
            warn!(channel = %channel, error = %e, "event forwarding ended");
            let _ = lost.send(channel).await;
        }
    })
}

/// True when `err` came from the session itself having gone away, as opposed
/// to something the message referred to.
async fn session_gone(state: &AppState, session_id: Uuid, err: &AppError) -> bool {
    if !err.is_not_found() {
        return false;
    }
    matches!(state.presence.get(session_id).await, Err(e) if e.is_not_found())
}

async fn handle_socket(state: AppState, socket: WebSocket, connected: ConnectedSession) {
    let session_id = connected.presence.session_id;
    let user_id = connected.presence.user_id;
    let map_id = connected.presence.map_id;
    info!(session_id = %session_id, map_id = %map_id, "ws connected");

    let (mut sender, mut receiver) = socket.split();

    // Subscribe before taking the snapshot so nothing published in between is lost.
    let (map_tx, mut map_rx) = mpsc::channel::<EventEnvelope>(state.event_buffer);
    let (user_tx, mut user_rx) = mpsc::channel::<EventEnvelope>(state.event_buffer);
    let (stop_tx, stop_rx) = watch::channel(false);
    let (lost_tx, mut lost_rx) = mpsc::channel::<Channel>(2);
    let mut forwarders = Vec::new();
    for (channel, out) in [
        (Channel::Map(map_id), map_tx),
        (Channel::User(user_id), user_tx),
    ] {
        let subscription = match state.events.open(channel).await {
            Ok(s) => s,
            Err(e) => {
                warn!(channel = %channel, error = %e, "subscribe failed");
                let _ = stop_tx.send(true);
                let _ = sender.send(Message::Text(error_frame(&e))).await;
                let _ = sender.send(close_frame(CLOSE_EVENTS_LOST, "event stream unavailable")).await;
                let _ = state.reconciler.disconnect(session_id).await;
                return;
            }
        };
        forwarders.push(spawn_forwarder(
            subscription,
            out,
            stop_rx.clone(),
            lost_tx.clone(),
        ));
    }
    drop(lost_tx);

    let roster = state.presence.list_active_for_map(map_id).await.unwrap_or_default();
    let pois = state.pois.list_pois(map_id).await.unwrap_or_default();
    let hello = frame(
        "connected",
        json!({
            "session": connected.presence,
            "resumed": connected.resumed,
            "roster": roster,
            "pois": pois,
        }),
    );
    if sender.send(Message::Text(hello)).await.is_err() {
        let _ = stop_tx.send(true);
        let _ = state.reconciler.disconnect(session_id).await;
        return;
    }

    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Message>();
    let mut send_task = tokio::spawn(async move {
        loop {
            let envelope = tokio::select! {
                Some(envelope) = map_rx.recv() => envelope,
                // Membership events for this map already arrive on the map channel.
                Some(envelope) = user_rx.recv() => {
                    if envelope.map_id() == Some(map_id) {
                        continue;
                    }
                    envelope
                }
                Some(reply) = reply_rx.recv() => {
                    let closing = matches!(reply, Message::Close(_));
                    if sender.send(reply).await.is_err() || closing {
                        break;
                    }
                    continue;
                }
                else => break,
            };
            let text = match serde_json::to_string(&envelope) {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "failed to encode event");
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let close = loop {
        let msg = tokio::select! {
            Some(channel) = lost_rx.recv() => {
                warn!(session_id = %session_id, channel = %channel, "event stream lost, closing connection");
                break Some(close_frame(CLOSE_EVENTS_LOST, "event stream lost"));
            }
            msg = receiver.next() => msg,
        };
        let text = match msg {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break None,
            Some(Ok(_)) => continue,
        };
        let reply = match serde_json::from_str::<ClientMessage>(&text) {
            Ok(client_msg) => apply(&state, session_id, client_msg).await,
            Err(e) => {
                debug!(error = %e, "unparseable client message");
                Err(AppError::Serialization(e))
            }
        };
        match reply {
            Ok(Some(reply)) => {
                let _ = reply_tx.send(Message::Text(reply));
            }
            Ok(None) => {}
            Err(e) => {
                debug!(session_id = %session_id, error = %e, "client message rejected");
                let _ = reply_tx.send(Message::Text(error_frame(&e)));
                if session_gone(&state, session_id, &e).await {
                    info!(session_id = %session_id, "session gone, closing connection");
                    break Some(close_frame(CLOSE_SESSION_GONE, "session expired"));
                }
            }
        }
    };

    let _ = stop_tx.send(true);
    for forwarder in forwarders {
        let _ = forwarder.await;
    }
    if let Err(e) = state.reconciler.disconnect(session_id).await {
        warn!(session_id = %session_id, error = %e, "disconnect cleanup failed, sweeper will retry");
    }
    match close {
        Some(frame) => {
            let _ = reply_tx.send(frame);
            drop(reply_tx);
            // Let the close frame out; a stalled client does not hold the task.
            if tokio::time::timeout(Duration::from_secs(1), &mut send_task).await.is_err() {
                send_task.abort();
            }
        }
        None => send_task.abort(),
    }
    info!(session_id = %session_id, "ws disconnected");
}

/// Apply one client message. Returns the direct reply, if any; state changes
/// reach the client through the event stream.
async fn apply(state: &AppState, session_id: Uuid, msg: ClientMessage) -> AppResult<Option<String>> {
    match msg {
        ClientMessage::Move { data } => state
            .reconciler
            .move_avatar(session_id, data)
            .await
            .map(|_| None),
        ClientMessage::JoinPoi { data } => state
            .pois
            .join_poi(session_id, data.poi_id)
            .await
            .map(|(outcome, _)| Some(frame("join_result", json!({ "poi_id": data.poi_id, "outcome": outcome })))),
        ClientMessage::LeavePoi { data } => state
            .pois
            .leave_poi(session_id, data.poi_id)
            .await
            .map(|(left, _)| Some(frame("leave_result", json!({ "poi_id": data.poi_id, "left": left })))),
        ClientMessage::Heartbeat => state
            .reconciler
            .heartbeat(session_id)
            .await
            .map(|p| Some(frame("heartbeat_ack", json!({ "last_active": p.last_active })))),
        ClientMessage::Ping => Ok(Some(frame("pong", json!({})))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::{MemoryPoiRepository, MemorySessionRepository};
    use crate::repositories::testing::FaultyStore;
    use crate::repositories::MemoryStore;
    use crate::services::{EventFanout, SystemClock};
    use std::collections::HashMap;
    use std::sync::Arc;

    fn state() -> AppState {
        let config = Config {
            rate_limits: HashMap::new(),
            ..Config::default()
        };
        AppState::new(
            Arc::new(MemoryStore::default()),
            Arc::new(MemorySessionRepository::new()),
            Arc::new(MemoryPoiRepository::new()),
            Arc::new(SystemClock),
            &config,
        )
    }

    #[tokio::test]
    async fn forwarder_reports_a_subscription_the_store_ended() {
        let store = Arc::new(FaultyStore::default());
        store.close_subscriptions();
        let events = EventFanout::new(store);
        let channel = Channel::Map(Uuid::new_v4());
        let (out, _rx) = mpsc::channel(4);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let (lost_tx, mut lost_rx) = mpsc::channel(2);

        let subscription = events.open(channel).await.unwrap();
        let task = spawn_forwarder(subscription, out, stop_rx, lost_tx);
        let reported = tokio::time::timeout(Duration::from_secs(1), lost_rx.recv())
            .await
            .unwrap();
        assert_eq!(reported, Some(channel));
        task.await.unwrap();
    }

    #[tokio::test]
    async fn stopped_forwarder_reports_nothing() {
        let events = EventFanout::new(Arc::new(MemoryStore::default()));
        let (out, _rx) = mpsc::channel(4);
        let (stop_tx, stop_rx) = watch::channel(false);
        let (lost_tx, mut lost_rx) = mpsc::channel(2);

        let subscription = events.open(Channel::User(Uuid::new_v4())).await.unwrap();
        let task = spawn_forwarder(subscription, out, stop_rx, lost_tx);
        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert_eq!(lost_rx.recv().await, None);
    }

    #[tokio::test]
    async fn only_a_vanished_session_closes_the_connection() {
        let state = state();
        let map = Uuid::new_v4();
        let s = state
            .reconciler
            .connect(Uuid::new_v4(), map, None)
            .await
            .unwrap()
            .presence
            .session_id;

        let missing_poi = apply(
            &state,
            s,
            serde_json::from_value(json!({ "event": "join_poi", "data": { "poi_id": Uuid::new_v4() } }))
                .unwrap(),
        )
        .await
        .unwrap_err();
        assert!(missing_poi.is_not_found());
        assert!(!session_gone(&state, s, &missing_poi).await);

        state.reconciler.disconnect(s).await.unwrap();
        let err = apply(&state, s, ClientMessage::Heartbeat).await.unwrap_err();
        assert!(session_gone(&state, s, &err).await);
        assert!(!session_gone(&state, s, &AppError::Conflict("x".into())).await);
    }

    #[test]
    fn close_frames_carry_code_and_reason() {
        let Message::Close(Some(frame)) = close_frame(CLOSE_SESSION_GONE, "session expired") else {
            panic!("expected a close frame");
        };
        assert_eq!(frame.code, 4001);
        assert_eq!(frame.reason, "session expired");
    }

    #[test]
    fn position_params_must_pair() {
        let params = |lat, lng| WsParams {
            map_id: Uuid::nil(),
            lat,
            lng,
        };
        assert_eq!(params(None, None).position().unwrap(), None);
        assert_eq!(
            params(Some(1.0), Some(2.0)).position().unwrap(),
            Some(Position::new(1.0, 2.0))
        );
        assert!(params(Some(1.0), None).position().is_err());
    }

    #[test]
    fn error_frames_carry_code_not_internals() {
        let text = error_frame(&AppError::StoreTimeout { operation: "sadd" });
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["event"], "error");
        assert_eq!(value["data"]["code"], "store_unavailable");
        assert!(!text.contains("sadd"));
    }
}
