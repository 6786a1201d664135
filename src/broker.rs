//! In-memory progress broker: one channel per job, coalescing intermediate
//! ticks to the latest value while never dropping a terminal event.
//! `tokio::sync::watch` is the natural primitive for "subscriber always reads
//! the latest value, older unread values are coalesced away": a `watch`
//! channel keeps exactly one pending value per receiver and always yields
//! the current one first on subscribe.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::watch;

use crate::job::{JobId, ProgressEvent};

/// A live subscription to a single job's progress events.
///
/// Yields the cached snapshot first (if any), then live updates, and ends
/// after a terminal event.
pub struct ProgressStream {
    receiver: watch::Receiver<Option<ProgressEvent>>,
    done: bool,
    /// `true` until the first poll, so the receiver's currently-held value
    /// (the snapshot) is always delivered even if nothing publishes again.
    first: bool,
}

impl Stream for ProgressStream {
    type Item = ProgressEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        if this.first {
            this.first = false;
            let current = this.receiver.borrow().clone();
            if let Some(event) = current {
                if event.is_terminal() {
                    this.done = true;
                }
                return Poll::Ready(Some(event));
            }
            // No snapshot yet; fall through to waiting for the first publish.
        }

        let poll_result = {
            let fut = this.receiver.changed();
            tokio::pin!(fut);
            fut.poll(cx)
        };
        match poll_result {
            Poll::Ready(Ok(())) => {
                let event = this.receiver.borrow_and_update().clone();
                match event {
                    Some(event) => {
                        if event.is_terminal() {
                            this.done = true;
                        }
                        Poll::Ready(Some(event))
                    }
                    None => Poll::Pending,
                }
            }
            Poll::Ready(Err(_)) => {
                // Sender dropped: broker shut down or job GC'd without a
                // terminal event. Treat as stream end.
                this.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

struct JobChannel {
    sender: watch::Sender<Option<ProgressEvent>>,
}

/// Publish/subscribe facility keyed by job id.
///
/// Holds only live subscriptions and a last-snapshot cache — the durable
/// job store remains the source of truth.
pub struct ProgressBroker {
    channels: Mutex<HashMap<JobId, JobChannel>>,
}

impl Default for ProgressBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressBroker {
    pub fn new() -> Self {
        ProgressBroker {
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Publish an event. Never blocks. Replaces any pending (unread) event
    /// for the job with the newer one; terminal events are never coalesced
    /// away because `watch` always retains the most recently sent value and
    /// every subscriber observes it via `changed()`/snapshot-on-subscribe.
    pub fn publish(&self, event: ProgressEvent) {
        let job_id = event.job_id().clone();
        let mut channels = self.channels.lock().expect("broker mutex poisoned");
        match channels.get(&job_id) {
            Some(channel) => {
                // send_replace never blocks, even with zero receivers.
                let _ = channel.sender.send_replace(Some(event));
            }
            None => {
                let (sender, _receiver) = watch::channel(Some(event));
                channels.insert(job_id, JobChannel { sender });
            }
        }
    }

    /// Subscribe to a job's progress stream. The first yielded item is the
    /// cached last snapshot, if any.
    pub fn subscribe(&self, job_id: &JobId) -> ProgressStream {
        let mut channels = self.channels.lock().expect("broker mutex poisoned");
        let channel = channels.entry(job_id.clone()).or_insert_with(|| {
            let (sender, _receiver) = watch::channel(None);
            JobChannel { sender }
        });
        ProgressStream {
            receiver: channel.sender.subscribe(),
            done: false,
            first: true,
        }
    }

    /// Drop the cached channel for a job, e.g. once the retention sweeper
    /// deletes the underlying record. Idempotent.
    pub fn forget(&self, job_id: &JobId) {
        self.channels
            .lock()
            .expect("broker mutex poisoned")
            .remove(job_id);
    }
}
