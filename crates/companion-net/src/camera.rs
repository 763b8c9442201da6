//! Live camera sessions.
//!
//! A client holds at most one [`CameraSession`]. Asking for the camera it
//! already targets returns the same session; asking for another camera
//! unsubscribes the current one first.

use std::sync::{Arc, Weak};

use tokio::sync::watch;

use crate::client::ClientInner;
use crate::correlator::ErrorCheck;
use crate::error::ClientError;
use crate::messages::{CameraInfo, RequestBody};

/// Latest raw ray frame, if any arrived yet.
pub type CameraFrame = Option<Arc<[u8]>>;

pub struct CameraSession {
    camera_id: String,
    info: CameraInfo,
    frames: watch::Sender<CameraFrame>,
    client: Weak<ClientInner>,
}

impl CameraSession {
    pub(crate) fn new(camera_id: String, info: CameraInfo, client: Weak<ClientInner>) -> Self {
        let (frames, _) = watch::channel(None);
        Self {
            camera_id,
            info,
            frames,
            client,
        }
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    /// Subscribe acknowledgement: resolution, clip planes and control flags.
    pub fn info(&self) -> &CameraInfo {
        &self.info
    }

    /// Observe ray frames as they arrive.
    pub fn frames(&self) -> watch::Receiver<CameraFrame> {
        self.frames.subscribe()
    }

    pub(crate) fn push_frame(&self, frame: Vec<u8>) {
        self.frames.send_replace(Some(frame.into()));
    }

    fn client(&self) -> Result<Arc<ClientInner>, ClientError> {
        self.client.upgrade().ok_or(ClientError::NotConnected)
    }

    /// Send movement/button input to the camera.
    pub async fn send_input(&self, buttons: u32, mouse_delta: (f32, f32)) -> Result<(), ClientError> {
        self.client()?
            .request(
                RequestBody::CameraInput {
                    buttons,
                    mouse_delta,
                },
                None,
                ErrorCheck::Enabled,
            )
            .await?;
        Ok(())
    }

    /// Cancel the server-side subscription. The reply is not awaited.
    pub async fn unsubscribe(&self) -> Result<(), ClientError> {
        tracing::debug!(camera_id = %self.camera_id, "unsubscribing camera");
        self.client()?
            .send_detached(RequestBody::CameraUnsubscribe, None)
            .await
    }
}

impl std::fmt::Debug for CameraSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraSession")
            .field("camera_id", &self.camera_id)
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::messages::{AppBroadcast, ResponseBody};
    use crate::testing::{MockTransport, auto_responder, client_builder};

    fn subscribes(transport: &MockTransport) -> Vec<String> {
        transport
            .requests()
            .into_iter()
            .filter_map(|req| match req.body {
                RequestBody::CameraSubscribe { camera_id } => Some(camera_id),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_same_camera_reuses_session() {
        let transport = MockTransport::new();
        transport.respond_with(auto_responder);
        let client = client_builder(transport.clone()).build().unwrap();
        client.connect().await.unwrap();

        let first = client.camera_session("cam1").await.unwrap();
        let second = client.camera_session("cam1").await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(subscribes(&transport), vec!["cam1".to_string()]);
    }

    #[tokio::test]
    async fn test_switching_camera_unsubscribes_previous() {
        let transport = MockTransport::new();
        transport.respond_with(auto_responder);
        let client = client_builder(transport.clone()).build().unwrap();
        client.connect().await.unwrap();

        let first = client.camera_session("cam1").await.unwrap();
        let second = client.camera_session("cam2").await.unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.camera_id(), "cam2");
        let kinds: Vec<_> = transport.requests().iter().map(|r| r.body.kind()).collect();
        assert_eq!(
            kinds,
            vec!["camera_subscribe", "camera_unsubscribe", "camera_subscribe"]
        );
    }

    #[tokio::test]
    async fn test_wrong_acknowledgement_is_rejected() {
        let transport = MockTransport::new();
        transport.respond_with(|req| {
            Some(crate::messages::AppResponse::ok(req.seq, ResponseBody::Success))
        });
        let client = client_builder(transport.clone()).build().unwrap();
        client.connect().await.unwrap();

        let err = client.camera_session("cam1").await.unwrap_err();
        assert!(matches!(err, ClientError::UnexpectedResponse(1)));
    }

    #[tokio::test]
    async fn test_ray_frames_reach_session() {
        let transport = MockTransport::new();
        transport.respond_with(auto_responder);
        let client = client_builder(transport.clone()).build().unwrap();
        client.connect().await.unwrap();

        let session = client.camera_session("cam1").await.unwrap();
        let mut frames = session.frames();
        transport.broadcast(AppBroadcast::CameraRays {
            frame: vec![1, 2, 3],
        });

        frames.changed().await.unwrap();
        let frame = frames.borrow().clone().unwrap();
        assert_eq!(&frame[..], &[1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_unsubscribe_does_not_block_next_session() {
        let transport = MockTransport::new();
        transport.respond_with(|req| match req.body {
            RequestBody::CameraUnsubscribe => None,
            _ => auto_responder(req),
        });
        let client = client_builder(transport.clone()).build().unwrap();
        client.connect().await.unwrap();

        client.camera_session("cam1").await.unwrap();
        let second = tokio::time::timeout(Duration::from_secs(60), client.camera_session("cam2"))
            .await
            .expect("second session stalled")
            .unwrap();
        assert_eq!(second.camera_id(), "cam2");

        tokio::time::sleep(Duration::from_secs(30)).await;
        let kinds: Vec<_> = transport.requests().iter().map(|r| r.body.kind()).collect();
        assert_eq!(
            kinds,
            vec!["camera_subscribe", "camera_unsubscribe", "camera_subscribe"]
        );
        let third = client.camera_session("cam3").await.unwrap();
        assert_eq!(third.camera_id(), "cam3");
    }
}
