//! Realtime change-notification transport
//!
//! A sum type over the ways the delta loop can learn about remote changes:
//!
//! - `Socket` - a websocket subscription to the server's notification
//!   endpoint; each received frame is a ping that something changed
//! - `Poll` - no push channel; the delta loop stays on its polling interval
//! - `None` - notifications disabled entirely
//!
//! The transport publishes its health (`healthy`, `degraded`, `failed`,
//! `unknown`); the delta loop translates health into its polling interval
//! and tracks `recovery_since` while the transport is failed.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Health of the push-notification channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifierHealth {
    Healthy,
    Degraded,
    Failed,
    Unknown,
}

/// A ping that remote changes are waiting to be fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeSignal;

/// Consecutive connection failures before `Degraded` escalates to `Failed`.
const FAILURES_BEFORE_FAILED: u32 = 3;

/// Wait between reconnection attempts while unhealthy.
const RECONNECT_WAIT: Duration = Duration::from_secs(10);

/// Tracks health transitions and the failure timestamp.
pub(crate) struct HealthTracker {
    tx: watch::Sender<NotifierHealth>,
    consecutive_failures: u32,
    recovery_since: Arc<Mutex<Option<Instant>>>,
}

impl HealthTracker {
    fn new(
        tx: watch::Sender<NotifierHealth>,
        recovery_since: Arc<Mutex<Option<Instant>>>,
    ) -> Self {
        Self {
            tx,
            consecutive_failures: 0,
            recovery_since,
        }
    }

    pub(crate) fn record_connected(&mut self) {
        self.consecutive_failures = 0;
        *self.recovery_since.lock().unwrap() = None;
        let _ = self.tx.send(NotifierHealth::Healthy);
    }

    pub(crate) fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= FAILURES_BEFORE_FAILED {
            let mut since = self.recovery_since.lock().unwrap();
            if since.is_none() {
                *since = Some(Instant::now());
            }
            let _ = self.tx.send(NotifierHealth::Failed);
        } else {
            let _ = self.tx.send(NotifierHealth::Degraded);
        }
    }
}

/// Everything the delta loop needs from a running transport.
pub struct RealtimeHandle {
    /// Change pings; `None` for transports without a push channel
    pub signals: Option<mpsc::Receiver<ChangeSignal>>,
    /// Current health, updated on every transition
    pub health: watch::Receiver<NotifierHealth>,
    /// When the transport entered its current failed stretch
    pub recovery_since: Arc<Mutex<Option<Instant>>>,
    /// Keeps static-health senders alive for transports without an I/O task
    _health_tx: Option<watch::Sender<NotifierHealth>>,
}

/// The transport choice, from configuration.
pub enum RealtimeTransport {
    Socket { url: String, token: String },
    Poll,
    None,
}

impl RealtimeTransport {
    /// Builds the configured transport; an empty URL means polling only.
    pub fn from_config(notification_url: &str, token: &str) -> Self {
        if notification_url.is_empty() {
            RealtimeTransport::Poll
        } else {
            RealtimeTransport::Socket {
                url: notification_url.to_string(),
                token: token.to_string(),
            }
        }
    }

    /// Starts the transport's I/O task (if any) and returns the handle the
    /// delta loop programs against.
    pub fn start(self, cancel: CancellationToken) -> RealtimeHandle {
        match self {
            RealtimeTransport::Socket { url, token } => {
                let (signal_tx, signal_rx) = mpsc::channel(16);
                let (health_tx, health_rx) = watch::channel(NotifierHealth::Unknown);
                let recovery_since = Arc::new(Mutex::new(None));
                let tracker = HealthTracker::new(health_tx, Arc::clone(&recovery_since));
                tokio::spawn(socket_loop(url, token, signal_tx, tracker, cancel));
                RealtimeHandle {
                    signals: Some(signal_rx),
                    health: health_rx,
                    recovery_since,
                    _health_tx: None,
                }
            }
            RealtimeTransport::Poll => {
                let (health_tx, health_rx) = watch::channel(NotifierHealth::Degraded);
                RealtimeHandle {
                    signals: None,
                    health: health_rx,
                    recovery_since: Arc::new(Mutex::new(None)),
                    _health_tx: Some(health_tx),
                }
            }
            RealtimeTransport::None => {
                let (health_tx, health_rx) = watch::channel(NotifierHealth::Unknown);
                RealtimeHandle {
                    signals: None,
                    health: health_rx,
                    recovery_since: Arc::new(Mutex::new(None)),
                    _health_tx: Some(health_tx),
                }
            }
        }
    }
}

/// Connects, reads notification frames, reconnects on failure.
async fn socket_loop(
    url: String,
    token: String,
    signals: mpsc::Sender<ChangeSignal>,
    mut tracker: HealthTracker,
    cancel: CancellationToken,
) {
    info!(url = %url, "Realtime transport starting");
    loop {
        if cancel.is_cancelled() {
            break;
        }

        match connect(&url, &token).await {
            Ok(mut stream) => {
                tracker.record_connected();
                debug!("Notification socket connected");
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            info!("Realtime transport stopping");
                            return;
                        }
                        frame = stream.next() => match frame {
                            Some(Ok(Message::Text(_))) | Some(Ok(Message::Binary(_))) => {
                                // the payload is opaque; any frame means "poll now"
                                let _ = signals.try_send(ChangeSignal);
                            }
                            Some(Ok(_)) => {} // ping/pong/frame noise
                            Some(Err(e)) => {
                                warn!(error = %e, "Notification socket error");
                                tracker.record_failure();
                                break;
                            }
                            None => {
                                warn!("Notification socket closed by server");
                                tracker.record_failure();
                                break;
                            }
                        }
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Notification socket connect failed");
                tracker.record_failure();
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(RECONNECT_WAIT) => {}
        }
    }
}

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn connect(url: &str, token: &str) -> anyhow::Result<WsStream> {
    let mut request = url.into_client_request()?;
    request.headers_mut().insert(
        "Authorization",
        HeaderValue::from_str(&format!("Bearer {token}"))?,
    );
    let (stream, _response) = tokio_tungstenite::connect_async(request).await?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_selects_transport() {
        assert!(matches!(
            RealtimeTransport::from_config("", "tok"),
            RealtimeTransport::Poll
        ));
        assert!(matches!(
            RealtimeTransport::from_config("wss://push.example/sub", "tok"),
            RealtimeTransport::Socket { .. }
        ));
    }

    #[tokio::test]
    async fn test_poll_transport_health_is_degraded() {
        let handle = RealtimeTransport::Poll.start(CancellationToken::new());
        assert_eq!(*handle.health.borrow(), NotifierHealth::Degraded);
        assert!(handle.signals.is_none());
    }

    #[tokio::test]
    async fn test_none_transport_health_is_unknown() {
        let handle = RealtimeTransport::None.start(CancellationToken::new());
        assert_eq!(*handle.health.borrow(), NotifierHealth::Unknown);
        assert!(handle.signals.is_none());
    }

    #[test]
    fn test_health_tracker_escalates_to_failed() {
        let (tx, rx) = watch::channel(NotifierHealth::Unknown);
        let recovery = Arc::new(Mutex::new(None));
        let mut tracker = HealthTracker::new(tx, Arc::clone(&recovery));

        tracker.record_failure();
        assert_eq!(*rx.borrow(), NotifierHealth::Degraded);
        assert!(recovery.lock().unwrap().is_none());

        tracker.record_failure();
        tracker.record_failure();
        assert_eq!(*rx.borrow(), NotifierHealth::Failed);
        assert!(recovery.lock().unwrap().is_some());
    }

    #[test]
    fn test_health_tracker_recovers() {
        let (tx, rx) = watch::channel(NotifierHealth::Unknown);
        let recovery = Arc::new(Mutex::new(None));
        let mut tracker = HealthTracker::new(tx, Arc::clone(&recovery));

        for _ in 0..5 {
            tracker.record_failure();
        }
        assert_eq!(*rx.borrow(), NotifierHealth::Failed);

        tracker.record_connected();
        assert_eq!(*rx.borrow(), NotifierHealth::Healthy);
        assert!(recovery.lock().unwrap().is_none());
    }
}
