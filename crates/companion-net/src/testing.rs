//! In-memory transport and helpers for protocol tests.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use crate::client::{ClientBuilder, WakeupHandle};
use crate::heartbeat::Keepalive;
use crate::identity::ServerIdentity;
use crate::messages::{
    AppBroadcast, AppMessage, AppRequest, AppResponse, CameraInfo, EntityInfo, EntityPayload,
    EntityType, GameTime, RequestBody, ResponseBody, ServerInfo, decode, encode,
};
use crate::transport::{FrameReceiver, FrameSender, Transport, TransportError, TransportLink};

type Responder = Arc<dyn Fn(&AppRequest) -> Option<AppResponse> + Send + Sync>;
type Inbound = mpsc::UnboundedSender<Vec<u8>>;

pub(crate) fn identity() -> ServerIdentity {
    ServerIdentity::new("10.0.0.1", 28082, 1, 1).unwrap()
}

/// Builder preloaded with [`identity`], the mock transport and a counting keepalive.
pub(crate) fn client_builder(transport: Arc<MockTransport>) -> ClientBuilder {
    ClientBuilder::new()
        .host("10.0.0.1")
        .port(28082)
        .owner_id(1)
        .credential_token(1)
        .transport(transport)
        .keepalive(Arc::new(CountingKeepalive::default()))
}

/// Plausible success reply for every request kind.
pub(crate) fn auto_responder(request: &AppRequest) -> Option<AppResponse> {
    let body = match &request.body {
        RequestBody::GetTime => ResponseBody::Time(GameTime::default()),
        RequestBody::GetInfo => ResponseBody::Info(ServerInfo::default()),
        RequestBody::GetEntityInfo => ResponseBody::EntityInfo(EntityInfo {
            entity_type: EntityType::Switch,
            payload: EntityPayload::default(),
        }),
        RequestBody::GetMapMarkers => ResponseBody::MapMarkers(Vec::new()),
        RequestBody::CameraSubscribe { .. } => ResponseBody::CameraSubscribeInfo(CameraInfo {
            width: 160,
            height: 90,
            ..CameraInfo::default()
        }),
        _ => ResponseBody::Success,
    };
    Some(AppResponse::ok(request.seq, body))
}

#[derive(Default)]
struct MockState {
    refuse: u32,
    opens: u32,
    sent: Vec<Vec<u8>>,
    inbound: Option<Inbound>,
    responder: Option<Responder>,
}

/// Scripted server: records every frame sent, answers through a responder
/// closure and lets tests push frames at will.
pub(crate) struct MockTransport {
    state: Arc<Mutex<MockState>>,
    sent_count: watch::Sender<usize>,
}

impl MockTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(Mutex::new(MockState::default())),
            sent_count: watch::channel(0).0,
        })
    }

    /// Refuse the next `n` open attempts.
    pub(crate) fn refuse_next(&self, n: u32) {
        self.state.lock().refuse = n;
    }

    pub(crate) fn open_attempts(&self) -> u32 {
        self.state.lock().opens
    }

    pub(crate) fn respond_with<F>(&self, responder: F)
    where
        F: Fn(&AppRequest) -> Option<AppResponse> + Send + Sync + 'static,
    {
        self.state.lock().responder = Some(Arc::new(responder));
    }

    pub(crate) fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.state.lock().sent.clone()
    }

    pub(crate) fn requests(&self) -> Vec<AppRequest> {
        self.sent_frames()
            .iter()
            .map(|frame| decode(frame).unwrap())
            .collect()
    }

    pub(crate) async fn wait_for_sent(&self, count: usize) {
        let mut rx = self.sent_count.subscribe();
        let waited = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|n| *n >= count));
        waited.await.unwrap().unwrap();
    }

    pub(crate) fn push_frame(&self, frame: Vec<u8>) {
        if let Some(inbound) = &self.state.lock().inbound {
            let _ = inbound.send(frame);
        }
    }

    pub(crate) fn broadcast(&self, broadcast: AppBroadcast) {
        self.push_frame(encode(&AppMessage::Broadcast(broadcast)).unwrap());
    }

    /// Simulate the server dropping the link.
    pub(crate) fn drop_link(&self) {
        self.state.lock().inbound = None;
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, address: &str) -> Result<TransportLink, TransportError> {
        let mut state = self.state.lock();
        state.opens += 1;
        if state.refuse > 0 {
            state.refuse -= 1;
            return Err(TransportError::Refused {
                address: address.to_string(),
                source: io::Error::from(io::ErrorKind::ConnectionRefused),
            });
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.inbound = Some(tx);
        Ok(TransportLink {
            sender: Box::new(MockSender {
                state: Arc::clone(&self.state),
                sent_count: self.sent_count.clone(),
            }),
            receiver: Box::new(MockReceiver { rx }),
        })
    }
}

struct MockSender {
    state: Arc<Mutex<MockState>>,
    sent_count: watch::Sender<usize>,
}

#[async_trait]
impl FrameSender for MockSender {
    async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.sent.push(frame.to_vec());
        let count = state.sent.len();

        let reply = match (&state.responder, decode::<AppRequest>(frame)) {
            (Some(responder), Ok(request)) => responder(&request),
            _ => None,
        };
        if let (Some(reply), Some(inbound)) = (reply, &state.inbound) {
            let _ = inbound.send(encode(&AppMessage::Response(reply)).unwrap());
        }
        drop(state);
        self.sent_count.send_replace(count);
        Ok(())
    }

    async fn close(&mut self) {}
}

struct MockReceiver {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

#[async_trait]
impl FrameReceiver for MockReceiver {
    async fn receive(&mut self) -> Result<Vec<u8>, TransportError> {
        self.rx.recv().await.ok_or(TransportError::Closed)
    }
}

/// Keepalive that only counts calls.
#[derive(Default)]
pub(crate) struct CountingKeepalive {
    pub starts: AtomicUsize,
    pub resets: AtomicUsize,
    pub stops: AtomicUsize,
}

impl Keepalive for CountingKeepalive {
    fn start(&self, _interval: Duration, _wakeup: WakeupHandle) {
        self.starts.fetch_add(1, Ordering::SeqCst);
    }

    fn reset_rhythm(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}
