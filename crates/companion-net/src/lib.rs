//! Client-side protocol engine for the game-server companion endpoint.
//!
//! One persistent connection is shared by many logical operations. Each
//! request carries a sequence number and is matched to its reply by the
//! [`correlator`]; outgoing traffic passes a per-identity token bucket
//! ([`limiter`]) and a [`heartbeat`] keeps idle connections alive. The
//! [`client::CompanionClient`] facade composes these pieces.

pub mod camera;
pub mod client;
pub mod commands;
pub mod connection;
pub mod conversation;
pub mod correlator;
mod dispatch;
pub mod error;
pub mod framing;
pub mod heartbeat;
pub mod identity;
pub mod limiter;
pub mod listeners;
pub mod markers;
pub mod messages;
pub mod reconnection;
pub mod subscriptions;
pub mod transport;

#[cfg(test)]
mod testing;

pub use camera::CameraSession;
pub use client::{ClientBuilder, CompanionClient, ConnectOptions, SwitchTarget, WakeupHandle};
pub use commands::{CommandDispatch, CommandOptions};
pub use connection::{Connection, ConnectionState, ConnectionStateWatch};
pub use correlator::{ErrorCheck, RequestCorrelator, ResendPolicy};
pub use error::{ClientError, ServerError};
pub use heartbeat::{Heartbeat, Keepalive};
pub use identity::ServerIdentity;
pub use limiter::{AdmissionPolicy, BucketConfig, LimiterError, RateLimiter, TokenBucket};
pub use listeners::{
    ChatEvent, EntityEvent, ListenerHandle, ListenerId, MarkerEvent, ProtobufEvent, TeamEvent,
};
pub use messages::{AppBroadcast, AppMessage, AppRequest, AppResponse, RequestBody, ResponseBody};
pub use transport::{TcpTransport, Transport, TransportError};
