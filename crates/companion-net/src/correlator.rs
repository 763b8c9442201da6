//! Sequence-number correlation of requests and replies.
//!
//! A call registers its sequence number before transmitting, then waits for
//! the dispatch loop to [`resolve`](RequestCorrelator::resolve) a matching
//! reply. Missing replies are handled with a two-speed resend cadence; a
//! server-side rate-limit rejection triggers a drain-and-refill recovery
//! before the same envelope is sent again.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use companion_config::RequestConfig;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::connection::Connection;
use crate::error::{ClientError, ServerError};
use crate::identity::ServerIdentity;
use crate::limiter::{AdmissionPolicy, RateLimiter};
use crate::messages::{AppRequest, AppResponse, encode};

/// Poll interval while waiting for the bucket to refill after a server
/// rate-limit rejection.
const RECOVERY_POLL: Duration = Duration::from_secs(1);

/// Resend cadence for unanswered requests.
#[derive(Debug, Clone, PartialEq)]
pub struct ResendPolicy {
    pub short_interval: Duration,
    /// Short intervals without a reply before the first resend.
    pub short_polls: u32,
    pub long_interval: Duration,
    /// Long intervals without a reply before resending and reverting to short.
    pub long_polls: u32,
    /// Resends allowed before failing with `ResponseNotReceived`. `None` waits forever.
    pub max_resends: Option<u32>,
}

impl Default for ResendPolicy {
    fn default() -> Self {
        Self {
            short_interval: Duration::from_millis(100),
            short_polls: 10,
            long_interval: Duration::from_secs(1),
            long_polls: 5,
            max_resends: None,
        }
    }
}

impl From<&RequestConfig> for ResendPolicy {
    fn from(config: &RequestConfig) -> Self {
        Self {
            short_interval: Duration::from_millis(config.short_poll_ms),
            short_polls: config.short_polls.max(1),
            long_interval: Duration::from_millis(config.long_poll_ms),
            long_polls: config.long_polls.max(1),
            max_resends: config.max_resends,
        }
    }
}

/// Whether a server error code in the reply fails the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCheck {
    Enabled,
    /// Hand the reply back as-is, error field included.
    Disabled,
}

/// Outcome of routing one reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Delivered,
    /// Reply to a fire-and-forget request.
    Ignored,
    /// No call is waiting for this sequence number.
    Unmatched,
}

/// Tracks in-flight calls by sequence number.
pub struct RequestCorrelator {
    connection: Arc<Connection>,
    limiter: Arc<RateLimiter>,
    policy: ResendPolicy,
    pending: Mutex<HashMap<u32, oneshot::Sender<AppResponse>>>,
    ignored: Mutex<HashSet<u32>>,
}

/// Removes the pending entry when the call finishes or is cancelled.
struct PendingGuard<'a> {
    correlator: &'a RequestCorrelator,
    seq: u32,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.correlator.pending.lock().remove(&self.seq);
    }
}

impl RequestCorrelator {
    pub fn new(connection: Arc<Connection>, limiter: Arc<RateLimiter>, policy: ResendPolicy) -> Self {
        Self {
            connection,
            limiter,
            policy,
            pending: Mutex::new(HashMap::new()),
            ignored: Mutex::new(HashSet::new()),
        }
    }

    pub fn policy(&self) -> &ResendPolicy {
        &self.policy
    }

    /// Number of calls currently waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Send an already-admitted request and wait for its reply.
    pub async fn call(
        &self,
        identity: &ServerIdentity,
        request: &AppRequest,
        check: ErrorCheck,
    ) -> Result<AppResponse, ClientError> {
        let seq = request.seq;
        let frame = encode(request)?;

        loop {
            let (tx, rx) = oneshot::channel();
            self.pending.lock().insert(seq, tx);
            let guard = PendingGuard {
                correlator: self,
                seq,
            };

            tracing::trace!(seq, kind = request.body.kind(), "sending request");
            self.connection.send(&frame).await?;
            let reply = self.await_reply(seq, &frame, rx).await?;
            drop(guard);

            match reply.error() {
                Some(ServerError::RateLimit) => {
                    tracing::warn!(seq, "server rate limit hit, retrying once the bucket is full");
                    self.recover(identity, request.body.cost()).await?;
                }
                Some(err) if check == ErrorCheck::Enabled => {
                    return Err(ClientError::ServerRejected(err));
                }
                _ => return Ok(reply),
            }
        }
    }

    async fn await_reply(
        &self,
        seq: u32,
        frame: &[u8],
        mut rx: oneshot::Receiver<AppResponse>,
    ) -> Result<AppResponse, ClientError> {
        let policy = &self.policy;
        let mut long = false;
        let mut polls = 0;
        let mut resends = 0;

        loop {
            let interval = if long {
                policy.long_interval
            } else {
                policy.short_interval
            };
            match tokio::time::timeout(interval, &mut rx).await {
                Ok(Ok(reply)) => return Ok(reply),
                // Pending table cleared underneath us.
                Ok(Err(_)) => return Err(ClientError::NotConnected),
                Err(_) => {
                    polls += 1;
                    let threshold = if long {
                        policy.long_polls
                    } else {
                        policy.short_polls
                    };
                    if polls < threshold {
                        continue;
                    }
                    if let Some(max) = policy.max_resends
                        && resends >= max
                    {
                        tracing::warn!(seq, resends, "giving up on reply");
                        return Err(ClientError::ResponseNotReceived(seq));
                    }
                    resends += 1;
                    tracing::debug!(seq, resends, "no reply yet, resending");
                    self.connection.send(frame).await?;
                    long = !long;
                    polls = 0;
                }
            }
        }
    }

    /// Drain the bucket, wait until it is full again, then re-admit `cost`.
    async fn recover(&self, identity: &ServerIdentity, cost: u32) -> Result<(), ClientError> {
        self.limiter.drain(identity)?;
        while !self.limiter.is_full(identity)? {
            tokio::time::sleep(RECOVERY_POLL).await;
        }
        self.limiter
            .acquire(identity, cost, AdmissionPolicy::Wait)
            .await
    }

    /// Transmit without waiting; the eventual reply is dropped quietly.
    pub async fn send_detached(&self, request: &AppRequest) -> Result<(), ClientError> {
        let frame = encode(request)?;
        self.ignored.lock().insert(request.seq);
        if let Err(err) = self.connection.send(&frame).await {
            self.ignored.lock().remove(&request.seq);
            return Err(err);
        }
        Ok(())
    }

    /// Hand `reply` to the call waiting on its sequence number.
    pub fn resolve(&self, reply: AppResponse) -> Resolution {
        let seq = reply.seq;
        if self.ignored.lock().remove(&seq) {
            return Resolution::Ignored;
        }
        let Some(tx) = self.pending.lock().remove(&seq) else {
            return Resolution::Unmatched;
        };
        if tx.send(reply).is_err() {
            return Resolution::Unmatched;
        }
        Resolution::Delivered
    }

    /// Detached sends still expecting a reply to drop.
    pub fn detached_count(&self) -> usize {
        self.ignored.lock().len()
    }

    /// Stop expecting replies to earlier detached sends.
    pub fn forget_detached(&self) {
        self.ignored.lock().clear();
    }

    /// Fail every waiting call and forget ignored sequence numbers.
    pub fn clear(&self) {
        self.pending.lock().clear();
        self.ignored.lock().clear();
    }
}
