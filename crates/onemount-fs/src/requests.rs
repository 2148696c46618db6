//! Metadata request manager
//!
//! Serializes all "list children" and "get item" calls into a single
//! priority queue so foreground FUSE operations bypass background tree
//! sync. Each request carries a completion channel; requests time out after
//! the configured window (30 s default) and surface as recoverable errors.
//!
//! The manager also remembers when the last foreground (normal/high)
//! request happened; the delta loop reads that to pick its fast interval.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use onemount_core::domain::Priority;
use onemount_core::ports::{RemoteDrive, RemoteItem};
use onemount_core::{CoreError, ItemId};

/// A queued metadata fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataRequest {
    /// List a directory's children
    Children(ItemId),
    /// Fetch a single item
    Item(ItemId),
}

/// Result of a metadata fetch.
#[derive(Debug, Clone)]
pub enum MetadataResponse {
    Children(Vec<RemoteItem>),
    Item(RemoteItem),
}

struct QueuedRequest {
    request: MetadataRequest,
    reply: oneshot::Sender<Result<MetadataResponse, CoreError>>,
}

struct Inner {
    queues: Mutex<[VecDeque<QueuedRequest>; 3]>,
    queued: AtomicUsize,
    notify: Notify,
    last_foreground: Mutex<Option<Instant>>,
    remote: Arc<dyn RemoteDrive>,
    timeout: Duration,
    capacity: usize,
}

/// Prioritized, serialized metadata fetcher.
#[derive(Clone)]
pub struct MetadataRequestManager {
    inner: Arc<Inner>,
}

impl MetadataRequestManager {
    pub fn new(remote: Arc<dyn RemoteDrive>, timeout: Duration, capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                queues: Mutex::new([VecDeque::new(), VecDeque::new(), VecDeque::new()]),
                queued: AtomicUsize::new(0),
                notify: Notify::new(),
                last_foreground: Mutex::new(None),
                remote,
                timeout,
                capacity,
            }),
        }
    }

    /// Queues a request and waits for its completion or timeout.
    pub async fn request(
        &self,
        request: MetadataRequest,
        priority: Priority,
    ) -> Result<MetadataResponse, CoreError> {
        if priority > Priority::Background {
            *self.inner.last_foreground.lock().unwrap() = Some(Instant::now());
        }

        if self.inner.queued.load(Ordering::SeqCst) >= self.inner.capacity {
            warn!("Metadata request queue full, rejecting request");
            return Err(CoreError::Storage("metadata request queue full".to_string()));
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut queues = self.inner.queues.lock().unwrap();
            queues[priority as usize].push_back(QueuedRequest {
                request,
                reply: reply_tx,
            });
        }
        self.inner.queued.fetch_add(1, Ordering::SeqCst);
        self.inner.notify.notify_one();

        match tokio::time::timeout(self.inner.timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CoreError::Storage(
                "metadata request worker dropped the reply".to_string(),
            )),
            Err(_) => Err(CoreError::Timeout("metadata request".to_string())),
        }
    }

    /// How long ago the last foreground request happened.
    pub fn foreground_idle(&self) -> Option<Duration> {
        self.inner
            .last_foreground
            .lock()
            .unwrap()
            .map(|at| at.elapsed())
    }

    /// Records foreground activity from paths that bypass the queue
    /// (e.g. hydration opens).
    pub fn touch_foreground(&self) {
        *self.inner.last_foreground.lock().unwrap() = Some(Instant::now());
    }

    fn pop(&self) -> Option<QueuedRequest> {
        let mut queues = self.inner.queues.lock().unwrap();
        // high first
        for queue in queues.iter_mut().rev() {
            if let Some(request) = queue.pop_front() {
                self.inner.queued.fetch_sub(1, Ordering::SeqCst);
                return Some(request);
            }
        }
        None
    }

    /// Single worker loop: executes requests highest-priority-first until
    /// cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        debug!("Metadata request manager starting");
        loop {
            let Some(queued) = self.pop() else {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = self.inner.notify.notified() => continue,
                }
            };

            let fetch = async {
                match &queued.request {
                    MetadataRequest::Children(id) => self
                        .inner
                        .remote
                        .list_children(id)
                        .await
                        .map(MetadataResponse::Children),
                    MetadataRequest::Item(id) => self
                        .inner
                        .remote
                        .get_item(id)
                        .await
                        .map(MetadataResponse::Item),
                }
            };
            let result = match std::panic::AssertUnwindSafe(fetch).catch_unwind().await {
                Ok(result) => result,
                Err(_) => {
                    tracing::error!("Metadata request panicked; worker continues");
                    Err(CoreError::Storage("metadata request panicked".to_string()))
                }
            };
            // receiver may have timed out and gone away
            let _ = queued.reply.send(result);

            if cancel.is_cancelled() {
                break;
            }
        }
        debug!("Metadata request manager stopped");
    }
}
