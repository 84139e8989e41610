//! Connection gateway: the only transport-aware component.
//!
//! Each WebSocket gets a [`ConnectionId`], an outbound channel drained by
//! a writer task, and a read loop that decodes [`ClientEvent`] frames and
//! dispatches them to the delivery engine or the status propagator.
//! Engine results are translated back into [`ServerEvent`]s and routed
//! through the [`ConnectionHub`].

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, warn};

use courier_shared::protocol::{ClientEvent, ServerEvent, StatusEntry, WireMessage};
use courier_shared::types::{ConnectionId, ConversationId, DeliveryStatus, MessageId, UserId};

use crate::api::AppState;
use crate::error::ServerError;
use crate::status::StatusKind;

// ---------------------------------------------------------------------------
// Connection hub
// ---------------------------------------------------------------------------

struct ConnectionEntry {
    /// The user this connection subscribed to via `joinRoom`, if any.
    user: Option<UserId>,
    tx: mpsc::UnboundedSender<ServerEvent>,
}

/// Registry of open connections and their notification addresses.
///
/// Connections whose channel has gone away are pruned on the next send
/// that touches them.
#[derive(Clone, Default)]
pub struct ConnectionHub {
    inner: Arc<Mutex<HashMap<ConnectionId, ConnectionEntry>>>,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, connection: ConnectionId, tx: mpsc::UnboundedSender<ServerEvent>) {
        self.inner
            .lock()
            .await
            .insert(connection, ConnectionEntry { user: None, tx });
    }

    pub async fn deregister(&self, connection: ConnectionId) {
        self.inner.lock().await.remove(&connection);
    }

    /// Subscribe `connection` to notifications addressed to `user`.
    pub async fn join(&self, connection: ConnectionId, user: UserId) {
        if let Some(entry) = self.inner.lock().await.get_mut(&connection) {
            debug!(connection = %connection, user = %user, "connection joined room");
            entry.user = Some(user);
        }
    }

    /// Push an event to every connection subscribed to `user`.  Returns
    /// the number of connections reached.
    pub async fn send_to_user(&self, user: &UserId, event: &ServerEvent) -> usize {
        let mut map = self.inner.lock().await;
        let mut delivered = 0;
        map.retain(|_, entry| {
            if entry.user.as_ref() != Some(user) {
                return true;
            }
            match entry.tx.send(event.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => false,
            }
        });
        delivered
    }

    /// Push an event to every open connection.
    pub async fn broadcast(&self, event: &ServerEvent) -> usize {
        let mut map = self.inner.lock().await;
        let mut delivered = 0;
        map.retain(|_, entry| match entry.tx.send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(_) => false,
        });
        delivered
    }
}

// ---------------------------------------------------------------------------
// WebSocket handling
// ---------------------------------------------------------------------------

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let connection_id = ConnectionId::new();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();

    state.hub.register(connection_id, tx.clone()).await;
    debug!(connection = %connection_id, "connection opened");

    let (mut sink, mut stream) = socket.split();

    // Writer task: drains the outbound channel onto the socket.
    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let json = match event.to_json() {
                Ok(json) => json,
                Err(e) => {
                    error!(error = %e, "failed to encode outbound event");
                    continue;
                }
            };
            if sink.send(WsMessage::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(frame)) = stream.next().await {
        match frame {
            WsMessage::Text(text) => match ClientEvent::from_json(text.as_str()) {
                Ok(event) => dispatch(event, connection_id, &state, &tx).await,
                Err(e) => {
                    warn!(connection = %connection_id, error = %e, "undecodable client event");
                    let _ = tx.send(ServerEvent::SendRejected {
                        reason: format!("invalid event: {e}"),
                    });
                }
            },
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    // Transport-level disconnect: withdraw presence; in-flight store
    // writes complete or fail on their own.
    state.hub.deregister(connection_id).await;
    if state.presence.withdraw(connection_id).await {
        let online = state.presence.snapshot_online().await;
        state
            .hub
            .broadcast(&ServerEvent::PresenceChanged { online })
            .await;
    }
    writer.abort();

    debug!(connection = %connection_id, "connection closed");
}

async fn dispatch(
    event: ClientEvent,
    connection_id: ConnectionId,
    state: &AppState,
    reply: &mpsc::UnboundedSender<ServerEvent>,
) {
    match event {
        ClientEvent::AnnouncePresence { user_id } => {
            state.presence.announce(connection_id, user_id).await;
            let online = state.presence.snapshot_online().await;
            state
                .hub
                .broadcast(&ServerEvent::PresenceChanged { online })
                .await;
        }

        ClientEvent::JoinRoom { user_id } => {
            state.hub.join(connection_id, user_id).await;
        }

        ClientEvent::SendMessage {
            sender_id,
            receiver_id,
            body,
            client_token,
        } => {
            let result = state
                .delivery
                .send_message(&sender_id, &receiver_id, &body, client_token.as_deref())
                .await;

            match result {
                Ok(outcome) => {
                    let message = WireMessage {
                        message_id: outcome.message.id,
                        sender_id: outcome.message.sender.clone(),
                        receiver_id: outcome.message.receiver.clone(),
                        body: outcome.message.body.clone(),
                        created_at: outcome.message.created_at,
                    };

                    // Echo to the originating connection, with the
                    // sender-side status.
                    let _ = reply.send(ServerEvent::MessageReceived {
                        conversation_id: outcome.conversation_id,
                        message: message.clone(),
                        status: outcome.sender_status,
                        timestamp: outcome.timestamp,
                    });

                    // The receiver's connections get their own status.
                    state
                        .hub
                        .send_to_user(
                            &receiver_id,
                            &ServerEvent::MessageReceived {
                                conversation_id: outcome.conversation_id,
                                message,
                                status: outcome.receiver_status,
                                timestamp: outcome.timestamp,
                            },
                        )
                        .await;
                }
                Err(ServerError::InvalidSend(reason)) => {
                    warn!(connection = %connection_id, reason, "send rejected");
                    let _ = reply.send(ServerEvent::SendRejected { reason });
                }
                Err(e) => {
                    error!(connection = %connection_id, error = %e, "send failed");
                    let _ = reply.send(ServerEvent::SendRejected {
                        reason: "message could not be stored".into(),
                    });
                }
            }
        }

        ClientEvent::MarkDelivered {
            conversation_id,
            message_id,
        } => {
            mark_one_and_notify(state, conversation_id, message_id, StatusKind::Delivered).await;
        }

        ClientEvent::MarkSeen {
            conversation_id,
            message_id,
        } => {
            mark_one_and_notify(state, conversation_id, message_id, StatusKind::Seen).await;
        }

        ClientEvent::MarkAllSeen {
            conversation_id,
            user_id,
            peer_id,
        } => {
            // Messages flowing peer -> user become seen; the peer (their
            // sender) gets one batched notification.
            match state
                .propagator
                .mark_all_seen(conversation_id, &peer_id, &user_id)
                .await
            {
                Ok(Some(batch)) => {
                    let updates = batch
                        .message_ids
                        .iter()
                        .map(|&message_id| StatusEntry {
                            message_id,
                            status: DeliveryStatus::Read,
                            timestamp: batch.timestamp,
                        })
                        .collect();
                    state
                        .hub
                        .send_to_user(
                            &batch.sender,
                            &ServerEvent::StatusChanged {
                                conversation_id: batch.conversation_id,
                                updates,
                            },
                        )
                        .await;
                }
                Ok(None) => {}
                Err(e) => {
                    error!(conversation = %conversation_id, error = %e, "markAllSeen failed");
                }
            }
        }

        ClientEvent::MarkAllDelivered {
            conversation_id,
            user_id,
        } => {
            match state
                .propagator
                .mark_all_delivered(conversation_id, &user_id)
                .await
            {
                Ok(updates) => {
                    // Fan out per message's own sender.
                    for update in updates {
                        state
                            .hub
                            .send_to_user(
                                &update.sender,
                                &ServerEvent::StatusChanged {
                                    conversation_id,
                                    updates: vec![StatusEntry {
                                        message_id: update.message_id,
                                        status: update.status,
                                        timestamp: update.timestamp,
                                    }],
                                },
                            )
                            .await;
                    }
                }
                Err(e) => {
                    error!(conversation = %conversation_id, error = %e, "markAllDelivered failed");
                }
            }
        }
    }
}

/// Raise one receipt flag and, if it actually changed, notify the
/// message's sender.  Marks against unknown messages are ignored.
async fn mark_one_and_notify(
    state: &AppState,
    conversation_id: ConversationId,
    message_id: MessageId,
    kind: StatusKind,
) {
    match state
        .propagator
        .mark_one(conversation_id, message_id, kind)
        .await
    {
        Ok(Some(update)) => {
            state
                .hub
                .send_to_user(
                    &update.sender,
                    &ServerEvent::StatusChanged {
                        conversation_id,
                        updates: vec![StatusEntry {
                            message_id: update.message_id,
                            status: update.status,
                            timestamp: update.timestamp,
                        }],
                    },
                )
                .await;
        }
        Ok(None) => {}
        Err(e) => {
            error!(conversation = %conversation_id, message = %message_id, error = %e, "status update failed");
        }
    }
}
