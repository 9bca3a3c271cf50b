use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use postgate_store::MetadataStore;
use tokio::sync::Notify;
use uuid::Uuid;

/// Best-effort `last_used_at` updates, decoupled from the request path.
/// The queue is bounded with a drop-oldest policy; the semantics of
/// `last_used_at` tolerate loss, and a failed write is logged and forgotten.
#[derive(Clone)]
pub struct TouchQueue {
    inner: Arc<TouchInner>,
}

struct TouchInner {
    pending: Mutex<VecDeque<(Uuid, DateTime<Utc>)>>,
    notify: Notify,
    capacity: usize,
}

impl TouchQueue {
    /// Spawns the single drain worker and hands back the enqueue handle.
    pub fn start(store: MetadataStore, capacity: usize) -> Self {
        let inner = Arc::new(TouchInner {
            pending: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity,
        });

        let worker_inner = inner.clone();
        tokio::spawn(async move {
            loop {
                let next = {
                    let mut pending = lock_pending(&worker_inner.pending);
                    pending.pop_front()
                };

                match next {
                    Some((token_id, when)) => {
                        if let Err(err) = store.touch_token(token_id, when).await {
                            tracing::debug!(
                                token_id = %token_id,
                                error = %err,
                                "last_used_at update failed"
                            );
                        }
                    }
                    None => worker_inner.notify.notified().await,
                }
            }
        });

        Self { inner }
    }

    /// Never blocks the response path.
    pub fn enqueue(&self, token_id: Uuid, when: DateTime<Utc>) {
        let dropped = {
            let mut pending = lock_pending(&self.inner.pending);
            push_bounded(&mut pending, (token_id, when), self.inner.capacity)
        };

        if dropped > 0 {
            crate::metrics::inc_touch_dropped(dropped);
            tracing::debug!(dropped, "touch queue overflow, dropped oldest updates");
        }

        self.inner.notify.notify_one();
    }
}

fn lock_pending<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Push with drop-oldest overflow. Returns how many entries were evicted.
fn push_bounded<T>(queue: &mut VecDeque<T>, item: T, capacity: usize) -> u64 {
    let mut dropped = 0;
    while capacity > 0 && queue.len() >= capacity {
        queue.pop_front();
        dropped += 1;
    }
    queue.push_back(item);
    dropped
}
