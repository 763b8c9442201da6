//! The client's dispatch task.
//!
//! All inbound frames and all entity-subscription completions are handled
//! here, one at a time, so registry mutation for a client never races with
//! event delivery.

use std::sync::Weak;

use tokio::sync::{mpsc, oneshot};

use crate::client::ClientInner;
use crate::correlator::Resolution;
use crate::error::ClientError;
use crate::identity::ServerIdentity;
use crate::listeners::{ChatEvent, EntityEvent, EntityMeta, ListenerHandle, ProtobufEvent, TeamEvent};
use crate::messages::{AppBroadcast, AppMessage, AppResponse, ChatMessage, ResponseBody, decode};
use crate::subscriptions::PendingSubscription;

/// Work posted to the dispatch task from other tasks.
pub(crate) enum Control {
    /// Entity metadata query finished; register the listener if it succeeded.
    EntityResolved {
        identity: ServerIdentity,
        subscription: PendingSubscription,
        reply: AppResponse,
        ack: oneshot::Sender<Result<ListenerHandle, ClientError>>,
    },
}

pub(crate) async fn run(
    client: Weak<ClientInner>,
    mut frames: mpsc::Receiver<Vec<u8>>,
    mut control: mpsc::Receiver<Control>,
) {
    loop {
        tokio::select! {
            Some(frame) = frames.recv() => {
                let Some(inner) = client.upgrade() else { break };
                handle_frame(&inner, frame);
            }
            Some(message) = control.recv() => {
                let Some(inner) = client.upgrade() else { break };
                handle_control(&inner, message);
            }
            else => break,
        }
    }
    tracing::debug!("dispatch loop stopped");
}

fn handle_frame(inner: &ClientInner, frame: Vec<u8>) {
    let identity = inner.identity();
    let bytes: std::sync::Arc<[u8]> = frame.into();
    inner.registries.protobuf.emit(
        &identity,
        ProtobufEvent {
            bytes: bytes.clone(),
        },
    );

    match decode::<AppMessage>(&bytes) {
        Ok(AppMessage::Response(reply)) => {
            let seq = reply.seq;
            if inner.correlator.resolve(reply) == Resolution::Unmatched {
                tracing::debug!(seq, "reply without a waiting request");
            }
        }
        Ok(AppMessage::Broadcast(broadcast)) => handle_broadcast(inner, &identity, broadcast),
        Err(err) => tracing::warn!(error = %err, len = bytes.len(), "undecodable frame"),
    }
}

fn handle_broadcast(inner: &ClientInner, identity: &ServerIdentity, broadcast: AppBroadcast) {
    match broadcast {
        AppBroadcast::TeamChanged { player_id, team } => {
            inner
                .registries
                .team
                .emit(identity, TeamEvent { player_id, team });
        }
        AppBroadcast::NewTeamMessage(message) => handle_team_message(inner, identity, message),
        AppBroadcast::EntityChanged { entity_id, payload } => {
            let delivered = inner.registries.entity.emit_where(
                identity,
                |meta| meta.entity_id == entity_id,
                |meta| EntityEvent {
                    entity_id,
                    entity_type: meta.entity_type,
                    payload: payload.clone(),
                },
            );
            tracing::trace!(entity_id, delivered, "entity changed");
        }
        AppBroadcast::CameraRays { frame } => {
            if let Some(camera) = inner.camera.lock().as_ref() {
                camera.push_frame(frame);
            }
        }
    }
}

fn handle_team_message(inner: &ClientInner, identity: &ServerIdentity, message: ChatMessage) {
    inner.conversations.read().route(&message);

    let options = inner.commands.lock().clone();
    if let (Some(options), Some(dispatcher)) = (options, inner.dispatcher.clone())
        && options.matches(&message.message)
    {
        let command = message.clone();
        tokio::spawn(async move {
            dispatcher.run_command(command, &options).await;
        });
    }

    inner.registries.chat.emit(identity, ChatEvent { message });
}

fn handle_control(inner: &ClientInner, control: Control) {
    match control {
        Control::EntityResolved {
            identity,
            subscription,
            reply,
            ack,
        } => {
            let result = register_entity(inner, &identity, subscription, reply);
            let _ = ack.send(result);
        }
    }
}

fn register_entity(
    inner: &ClientInner,
    identity: &ServerIdentity,
    subscription: PendingSubscription,
    reply: AppResponse,
) -> Result<ListenerHandle, ClientError> {
    let entity_id = subscription.entity_id;
    if let Some(err) = reply.error() {
        tracing::warn!(entity_id, error = %err, "entity not found");
        return Err(ClientError::SubscriptionFailed(entity_id));
    }
    let ResponseBody::EntityInfo(info) = reply.body else {
        return Err(ClientError::UnexpectedResponse(reply.seq));
    };

    inner.registries.entity.insert(
        identity,
        subscription.id,
        EntityMeta {
            entity_id,
            entity_type: info.entity_type,
        },
        subscription.handler,
    );
    tracing::debug!(entity_id, entity_type = ?info.entity_type, "entity listener registered");
    Ok(ListenerHandle::Entity {
        entity_id,
        id: subscription.id,
    })
}
