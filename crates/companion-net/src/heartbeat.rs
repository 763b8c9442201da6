//! Keepalive for idle connections.
//!
//! The server stops pushing broadcasts to a client that has been quiet for a
//! while. [`Heartbeat`] sends a wakeup request whenever no request went out
//! for one full interval; every admitted send pushes the next beat back.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::client::WakeupHandle;
use crate::error::ClientError;

/// Activity-driven keepalive.
pub trait Keepalive: Send + Sync {
    /// Begin beating every `interval`, replacing any previous run.
    fn start(&self, interval: Duration, wakeup: WakeupHandle);
    /// Record activity so the next beat is pushed back.
    fn reset_rhythm(&self);
    /// Stop beating. Idempotent.
    fn stop(&self);
}

/// Default [`Keepalive`] driven by a background task.
pub struct Heartbeat {
    last_activity: Arc<Mutex<Instant>>,
    shutdown_tx: Mutex<Option<watch::Sender<bool>>>,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

impl Heartbeat {
    pub fn new() -> Self {
        Self {
            last_activity: Arc::new(Mutex::new(Instant::now())),
            shutdown_tx: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.shutdown_tx.lock().is_some()
    }
}

impl Keepalive for Heartbeat {
    fn start(&self, interval: Duration, wakeup: WakeupHandle) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        if let Some(previous) = self.shutdown_tx.lock().replace(shutdown_tx) {
            let _ = previous.send(true);
        }
        *self.last_activity.lock() = Instant::now();
        tracing::debug!(?interval, "heartbeat started");
        tokio::spawn(beat_loop(
            interval,
            Arc::clone(&self.last_activity),
            wakeup,
            shutdown_rx,
        ));
    }

    fn reset_rhythm(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn stop(&self) {
        if let Some(shutdown) = self.shutdown_tx.lock().take() {
            let _ = shutdown.send(true);
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn beat_loop(
    interval: Duration,
    last_activity: Arc<Mutex<Instant>>,
    wakeup: WakeupHandle,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let due = *last_activity.lock() + interval;
        tokio::select! {
            _ = tokio::time::sleep_until(due) => {
                if last_activity.lock().elapsed() < interval {
                    continue;
                }
                match wakeup.send().await {
                    Ok(()) => tracing::trace!("heartbeat sent"),
                    Err(ClientError::NotConnected) => {
                        tracing::debug!("connection gone, heartbeat stopping");
                        break;
                    }
                    Err(err) => tracing::warn!(error = %err, "heartbeat failed"),
                }
                *last_activity.lock() = Instant::now();
            }
            _ = shutdown_rx.changed() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::RequestBody;
    use crate::testing::{MockTransport, auto_responder, client_builder};

    const INTERVAL: Duration = Duration::from_secs(240);

    async fn client_with_heartbeat(
        transport: &Arc<MockTransport>,
    ) -> (crate::CompanionClient, Arc<Heartbeat>) {
        let heartbeat = Arc::new(Heartbeat::new());
        transport.respond_with(auto_responder);
        let client = client_builder(Arc::clone(transport))
            .keepalive(heartbeat.clone())
            .keepalive_interval(INTERVAL)
            .build()
            .unwrap();
        client.connect().await.unwrap();
        (client, heartbeat)
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_connection_gets_a_wakeup() {
        let transport = MockTransport::new();
        let (_client, heartbeat) = client_with_heartbeat(&transport).await;
        assert!(heartbeat.is_running());

        tokio::time::sleep(INTERVAL - Duration::from_secs(1)).await;
        assert!(transport.requests().is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        let sent = transport.requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].body, RequestBody::GetTime);
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_postpones_the_beat() {
        let transport = MockTransport::new();
        let (client, _heartbeat) = client_with_heartbeat(&transport).await;

        tokio::time::sleep(Duration::from_secs(200)).await;
        client.get_info().await.unwrap();

        tokio::time::sleep(Duration::from_secs(100)).await;
        assert_eq!(transport.requests().len(), 1);

        tokio::time::sleep(Duration::from_secs(150)).await;
        assert_eq!(transport.requests().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent() {
        let transport = MockTransport::new();
        let (_client, heartbeat) = client_with_heartbeat(&transport).await;

        heartbeat.stop();
        heartbeat.stop();
        assert!(!heartbeat.is_running());

        tokio::time::sleep(INTERVAL * 3).await;
        assert!(transport.requests().is_empty());
    }
}
