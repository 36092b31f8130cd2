//! WebSocket upgrade handler and per-connection event loop.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time;

use crate::capabilities::ChatAction;
use crate::error::EnqueueError;
use crate::AppState;

use super::events::{
    ChatFrame, ClientMessage, Envelope, EventName, EventPayload, HeartbeatPayload,
    IdentifyPayload, MessagePayload, MessageSendPayload, OutboundEvent, ReactionPayload,
    ReactionSendPayload, SubscribePayload, OP_HEARTBEAT, OP_IDENTIFY, OP_MESSAGE_SEND,
    OP_REACTION_SEND, OP_SUBSCRIBE, OP_UNSUBSCRIBE,
};
use super::registry::drop_session_with_retry;
use super::session::{DeliverySession, SESSION_SEND_BUFFER};

/// Close codes (4000-range for application-level).
const CLOSE_UNKNOWN_ERROR: u16 = 4000;
const CLOSE_UNKNOWN_OPCODE: u16 = 4001;
const CLOSE_NOT_AUTHENTICATED: u16 = 4003;
const CLOSE_SESSION_TIMEOUT: u16 = 4009;

/// Timeout for receiving IDENTIFY after connection (seconds).
const IDENTIFY_TIMEOUT_SECS: u64 = 10;

/// Heartbeat interval sent to clients in the READY payload (ms).
pub const HEARTBEAT_INTERVAL_MS: u64 = 41250;

/// Maximum accepted message text length (characters).
const MAX_MESSAGE_LEN: usize = 4096;

/// Maximum accepted reaction glyph length (characters).
const MAX_EMOJI_LEN: usize = 64;

pub fn router() -> Router<AppState> {
    Router::new().route("/chat", get(ws_upgrade))
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Step 1: Wait for IDENTIFY within timeout. The transport in front of us
    // has already authenticated the caller; the payload names the principal.
    let identify_result = time::timeout(Duration::from_secs(IDENTIFY_TIMEOUT_SECS), async {
        while let Some(msg) = ws_rx.next().await {
            let msg = match msg {
                Ok(m) => m,
                Err(e) => {
                    tracing::debug!(?e, "ws read error during identify");
                    return Err("read error");
                }
            };

            let text = match msg {
                Message::Text(t) => t,
                Message::Close(_) => return Err("client closed"),
                Message::Ping(_) | Message::Pong(_) => continue,
                _ => continue,
            };

            let client_msg: ClientMessage = match serde_json::from_str(&text) {
                Ok(m) => m,
                Err(_) => {
                    let _ = send_close(&mut ws_tx, CLOSE_UNKNOWN_ERROR, "Invalid JSON").await;
                    return Err("invalid json");
                }
            };

            if client_msg.op != OP_IDENTIFY {
                let _ = send_close(&mut ws_tx, CLOSE_NOT_AUTHENTICATED, "Expected IDENTIFY").await;
                return Err("expected identify");
            }

            let payload: IdentifyPayload =
                serde_json::from_value(client_msg.d).map_err(|_| "invalid identify payload")?;
            if payload.principal_id.is_empty() {
                return Err("empty principal id");
            }
            return Ok(payload);
        }
        Err("connection closed before identify")
    })
    .await;

    let payload = match identify_result {
        Ok(Ok(payload)) => payload,
        Ok(Err(reason)) => {
            tracing::debug!(%reason, "identify handshake failed");
            let _ = send_close(&mut ws_tx, CLOSE_NOT_AUTHENTICATED, reason).await;
            return;
        }
        Err(_timeout) => {
            let _ = send_close(&mut ws_tx, CLOSE_SESSION_TIMEOUT, "Handshake timeout").await;
            return;
        }
    };

    let session = Arc::new(DeliverySession::new(
        plenary_common::id::prefixed_ulid(plenary_common::id::prefix::SESSION),
        payload.principal_id,
    ));

    // Register the delivery channel before READY so no fan-out window is
    // missed between the handshake and the event loop.
    let (outbound_tx, outbound_rx) = mpsc::channel::<Arc<OutboundEvent>>(SESSION_SEND_BUFFER);
    state.sessions.insert(&session.session_id, outbound_tx);

    tracing::info!(
        session_id = %session.session_id,
        principal_id = %session.principal_id,
        "delivery session established"
    );

    let ready = ChatFrame::dispatch(
        EventName::READY,
        session.next_seq(),
        serde_json::json!({
            "session_id": session.session_id,
            "heartbeat_interval": HEARTBEAT_INTERVAL_MS,
        }),
    );
    if send_frame(&mut ws_tx, &ready).await.is_ok() {
        run_session(session.clone(), &state, ws_tx, ws_rx, outbound_rx).await;
    }

    // Teardown runs on every exit path: release the delivery channel, then
    // the registry tuples, then the local room set.
    state.sessions.remove(&session.session_id);
    drop_session_with_retry(state.registry.as_ref(), &session.session_id).await;
    let rooms = session.take_rooms();

    tracing::info!(
        session_id = %session.session_id,
        principal_id = %session.principal_id,
        rooms = rooms.len(),
        "delivery session ended"
    );
}

/// Main session event loop: read client ops, forward fan-out events, enforce
/// the heartbeat deadline.
async fn run_session(
    session: Arc<DeliverySession>,
    state: &AppState,
    mut ws_tx: futures_util::stream::SplitSink<WebSocket, Message>,
    mut ws_rx: futures_util::stream::SplitStream<WebSocket>,
    mut outbound_rx: mpsc::Receiver<Arc<OutboundEvent>>,
) {
    // Heartbeat deadline: client must heartbeat within 1.5× the interval.
    let heartbeat_deadline = Duration::from_millis(HEARTBEAT_INTERVAL_MS * 3 / 2);
    let mut heartbeat_timer = time::interval(heartbeat_deadline);
    heartbeat_timer.tick().await; // First tick fires immediately; skip it.
    let mut got_heartbeat = true;

    loop {
        tokio::select! {
            // Client sends us an op.
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let client_msg: ClientMessage = match serde_json::from_str(&text) {
                            Ok(m) => m,
                            Err(_) => {
                                let _ = send_close(&mut ws_tx, CLOSE_UNKNOWN_ERROR, "Invalid JSON").await;
                                break;
                            }
                        };

                        match client_msg.op {
                            OP_HEARTBEAT => {
                                got_heartbeat = true;
                                let payload: HeartbeatPayload =
                                    serde_json::from_value(client_msg.d).unwrap_or(HeartbeatPayload { seq: 0 });
                                let ack = ChatFrame::heartbeat_ack(payload.seq);
                                if send_frame(&mut ws_tx, &ack).await.is_err() {
                                    break;
                                }
                            }
                            OP_SUBSCRIBE => {
                                if let Some(frame) = handle_subscribe(&session, state, client_msg.d).await {
                                    if send_frame(&mut ws_tx, &frame).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            OP_UNSUBSCRIBE => {
                                if let Some(frame) = handle_unsubscribe(&session, state, client_msg.d).await {
                                    if send_frame(&mut ws_tx, &frame).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            OP_MESSAGE_SEND => {
                                if let Some(frame) = handle_message_send(&session, state, client_msg.d).await {
                                    if send_frame(&mut ws_tx, &frame).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            OP_REACTION_SEND => {
                                handle_reaction_send(&session, state, client_msg.d).await;
                            }
                            OP_IDENTIFY => {
                                // Already identified.
                                let _ = send_close(&mut ws_tx, CLOSE_UNKNOWN_ERROR, "Already identified").await;
                                break;
                            }
                            _ => {
                                let _ = send_close(&mut ws_tx, CLOSE_UNKNOWN_OPCODE, "Unknown opcode").await;
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(?e, session_id = %session.session_id, "ws read error");
                        break;
                    }
                    _ => continue,
                }
            }

            // Event from a distributor.
            event = outbound_rx.recv() => {
                match event {
                    Some(event) => {
                        let frame = ChatFrame::dispatch(
                            event.event_name,
                            session.next_seq(),
                            event.data.clone(),
                        );
                        if send_frame(&mut ws_tx, &frame).await.is_err() {
                            break;
                        }
                    }
                    // Channel removed by the distributor: we were evicted.
                    None => break,
                }
            }

            // Heartbeat timeout check.
            _ = heartbeat_timer.tick() => {
                if !got_heartbeat {
                    tracing::debug!(
                        session_id = %session.session_id,
                        "heartbeat timeout, closing connection"
                    );
                    let _ = send_close(&mut ws_tx, CLOSE_SESSION_TIMEOUT, "Heartbeat timeout").await;
                    break;
                }
                got_heartbeat = false;
            }
        }
    }
}

/// Check the capability gate, treating a gate outage as a denial.
async fn gate_allows(state: &AppState, session: &DeliverySession, chat_id: &str, action: ChatAction) -> bool {
    match state
        .capabilities
        .allows(&session.principal_id, chat_id, action)
        .await
    {
        Ok(allowed) => allowed,
        Err(err) => {
            tracing::warn!(
                session_id = %session.session_id,
                %chat_id,
                %err,
                "capability lookup failed, treating as denied"
            );
            false
        }
    }
}

async fn handle_subscribe(
    session: &Arc<DeliverySession>,
    state: &AppState,
    data: serde_json::Value,
) -> Option<ChatFrame> {
    let payload: SubscribePayload = match serde_json::from_value(data) {
        Ok(p) => p,
        Err(_) => {
            tracing::debug!(session_id = %session.session_id, "malformed subscribe payload");
            return None;
        }
    };
    if payload.chat_id.is_empty() {
        tracing::debug!(session_id = %session.session_id, "subscribe with empty chat id");
        return None;
    }

    if !gate_allows(state, session, &payload.chat_id, ChatAction::Subscribe).await {
        // Denials are silent on the wire so a caller can't learn whether the
        // chat exists.
        tracing::debug!(
            session_id = %session.session_id,
            chat_id = %payload.chat_id,
            "subscribe denied"
        );
        return None;
    }

    if let Err(err) = state
        .registry
        .subscribe(&payload.chat_id, &session.session_id, &session.principal_id)
        .await
    {
        // Non-fatal: the client may retry.
        tracing::warn!(
            session_id = %session.session_id,
            chat_id = %payload.chat_id,
            %err,
            "subscribe failed"
        );
        return None;
    }
    session.join_room(&payload.chat_id);

    Some(ChatFrame::dispatch(
        EventName::CHAT_SUBSCRIBED,
        session.next_seq(),
        serde_json::json!({ "chat_id": payload.chat_id }),
    ))
}

async fn handle_unsubscribe(
    session: &Arc<DeliverySession>,
    state: &AppState,
    data: serde_json::Value,
) -> Option<ChatFrame> {
    let payload: SubscribePayload = match serde_json::from_value(data) {
        Ok(p) => p,
        Err(_) => {
            tracing::debug!(session_id = %session.session_id, "malformed unsubscribe payload");
            return None;
        }
    };
    if payload.chat_id.is_empty() {
        return None;
    }

    if !gate_allows(state, session, &payload.chat_id, ChatAction::Subscribe).await {
        tracing::debug!(
            session_id = %session.session_id,
            chat_id = %payload.chat_id,
            "unsubscribe denied"
        );
        return None;
    }

    if let Err(err) = state
        .registry
        .unsubscribe(&payload.chat_id, &session.session_id)
        .await
    {
        tracing::warn!(
            session_id = %session.session_id,
            chat_id = %payload.chat_id,
            %err,
            "unsubscribe failed"
        );
        return None;
    }
    session.leave_room(&payload.chat_id);

    Some(ChatFrame::dispatch(
        EventName::CHAT_UNSUBSCRIBED,
        session.next_seq(),
        serde_json::json!({ "chat_id": payload.chat_id }),
    ))
}

async fn handle_message_send(
    session: &Arc<DeliverySession>,
    state: &AppState,
    data: serde_json::Value,
) -> Option<ChatFrame> {
    let payload: MessageSendPayload = match serde_json::from_value(data) {
        Ok(p) => p,
        Err(_) => {
            tracing::debug!(session_id = %session.session_id, "malformed message payload");
            return None;
        }
    };
    if payload.chat_id.is_empty()
        || payload.text.is_empty()
        || payload.text.chars().count() > MAX_MESSAGE_LEN
    {
        tracing::debug!(
            session_id = %session.session_id,
            chat_id = %payload.chat_id,
            "message payload failed validation"
        );
        return None;
    }

    if !gate_allows(state, session, &payload.chat_id, ChatAction::Send).await {
        tracing::debug!(
            session_id = %session.session_id,
            chat_id = %payload.chat_id,
            "message send denied"
        );
        return None;
    }

    let event = envelope(
        state,
        session,
        &payload.chat_id,
        MessagePayload { text: payload.text },
    );

    match state.messages.publish(event) {
        Ok(()) => None,
        Err(EnqueueError::QueueFull) => {
            // Messages are never silently dropped: tell the producer (and
            // only the producer) to retry.
            tracing::warn!(
                session_id = %session.session_id,
                chat_id = %payload.chat_id,
                "message distribution queue full, rejecting send"
            );
            Some(ChatFrame::dispatch(
                EventName::SEND_REJECTED,
                session.next_seq(),
                serde_json::json!({ "chat_id": payload.chat_id, "reason": "retry" }),
            ))
        }
    }
}

async fn handle_reaction_send(
    session: &Arc<DeliverySession>,
    state: &AppState,
    data: serde_json::Value,
) {
    let payload: ReactionSendPayload = match serde_json::from_value(data) {
        Ok(p) => p,
        Err(_) => {
            tracing::debug!(session_id = %session.session_id, "malformed reaction payload");
            return;
        }
    };
    if payload.chat_id.is_empty()
        || payload.emoji.is_empty()
        || payload.emoji.chars().count() > MAX_EMOJI_LEN
    {
        tracing::debug!(
            session_id = %session.session_id,
            chat_id = %payload.chat_id,
            "reaction payload failed validation"
        );
        return;
    }

    if !gate_allows(state, session, &payload.chat_id, ChatAction::Send).await {
        tracing::debug!(
            session_id = %session.session_id,
            chat_id = %payload.chat_id,
            "reaction send denied"
        );
        return;
    }

    let event = envelope(
        state,
        session,
        &payload.chat_id,
        ReactionPayload {
            message_id: payload.message_id,
            emoji: payload.emoji,
        },
    );

    if let Err(EnqueueError::QueueFull) = state.reactions.publish(event) {
        // Reactions are best-effort: dropped under sustained overload.
        tracing::warn!(
            session_id = %session.session_id,
            chat_id = %payload.chat_id,
            "reaction distribution queue full, dropping reaction"
        );
    }
}

fn envelope<P: EventPayload>(
    state: &AppState,
    session: &DeliverySession,
    chat_id: &str,
    payload: P,
) -> Envelope<P> {
    // The snowflake already encodes the assignment instant; deriving sent_at
    // from it keeps the timestamp consistent with the ordering id.
    let event_id = state.snowflake.generate();
    Envelope {
        event_id,
        chat_id: chat_id.to_string(),
        sender_id: session.principal_id.clone(),
        sent_at: plenary_common::snowflake::snowflake_datetime(event_id),
        payload,
    }
}

async fn send_frame(
    ws_tx: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    frame: &ChatFrame,
) -> Result<(), axum::Error> {
    let json = serde_json::to_string(frame).unwrap();
    ws_tx.send(Message::Text(json.into())).await
}

/// Send a WebSocket close frame with a code and reason.
async fn send_close(
    ws_tx: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    code: u16,
    reason: &str,
) -> Result<(), axum::Error> {
    let close_msg = Message::Close(Some(axum::extract::ws::CloseFrame {
        code,
        reason: reason.to_string().into(),
    }));
    ws_tx.send(close_msg).await
}
