//! Session / event bus: per-session ordered event queues with subscribe,
//! tee, bounded back-pressure, and a completion sentinel.
//!
//! The bus is process-wide but partitioned by session id; there is no
//! cross-session interference. Publishing never blocks: when a subscriber
//! queue is full the oldest non-terminal event is dropped and surfaced to
//! that subscriber as a `status{dropped:n}` event. Terminal events are
//! never dropped.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::debug;

use crate::event::{Event, EventKind};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("unknown session '{0}'")]
    UnknownSession(String),

    #[error("session '{0}' already exists")]
    DuplicateSession(String),
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Completing,
    Closed,
}

/// Snapshot of a session's metadata.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub state: SessionState,
    pub subscriber_count: usize,
}

// ---------------------------------------------------------------------------
// Subscriber queue
// ---------------------------------------------------------------------------

struct QueueInner {
    events: VecDeque<Event>,
    dropped: u64,
    closed: bool,
}

struct SubscriberQueue {
    session_id: String,
    capacity: usize,
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl SubscriberQueue {
    fn new(session_id: &str, capacity: usize) -> Self {
        Self {
            session_id: session_id.to_string(),
            capacity,
            inner: Mutex::new(QueueInner {
                events: VecDeque::new(),
                dropped: 0,
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    fn push(&self, event: Event) {
        {
            let mut inner = self.inner.lock().expect("subscriber queue lock poisoned");
            if inner.closed {
                return;
            }
            if inner.events.len() >= self.capacity {
                // The front is never terminal: nothing is published after a
                // terminal event, so it can only sit at the back.
                inner.events.pop_front();
                inner.dropped += 1;
            }
            inner.events.push_back(event);
        }
        self.notify.notify_one();
    }
}

/// One subscriber's ordered view of a session stream.
///
/// `next` yields events in publish order and returns `None` after the
/// terminal event has been delivered.
pub struct Subscription {
    queue: Arc<SubscriberQueue>,
}

impl Subscription {
    pub async fn next(&mut self) -> Option<Event> {
        loop {
            let notified = self.queue.notify.notified();
            {
                let mut inner = self
                    .queue
                    .inner
                    .lock()
                    .expect("subscriber queue lock poisoned");

                if inner.dropped > 0 {
                    let n = inner.dropped;
                    inner.dropped = 0;
                    return Some(Event::new(
                        EventKind::Status,
                        &self.queue.session_id,
                        json!({ "dropped": n }),
                    ));
                }

                if let Some(event) = inner.events.pop_front() {
                    if event.kind.is_terminal() {
                        inner.closed = true;
                    }
                    return Some(event);
                }

                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Drain the stream to completion, collecting every event.
    pub async fn collect(mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event);
        }
        events
    }
}

// ---------------------------------------------------------------------------
// Session bus
// ---------------------------------------------------------------------------

struct SessionEntry {
    created_at: DateTime<Utc>,
    state: SessionState,
    backlog: VecDeque<Event>,
    backlog_dropped: u64,
    subscribers: Vec<Weak<SubscriberQueue>>,
}

/// Process-wide event bus, partitioned by session id.
pub struct SessionBus {
    sessions: Mutex<HashMap<String, SessionEntry>>,
    capacity: usize,
}

impl Default for SessionBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl SessionBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    /// Admit a new session.
    pub fn create_session(&self, session_id: &str) -> Result<(), SessionError> {
        let mut sessions = self.sessions.lock().expect("session bus lock poisoned");
        if sessions.contains_key(session_id) {
            return Err(SessionError::DuplicateSession(session_id.to_string()));
        }
        sessions.insert(
            session_id.to_string(),
            SessionEntry {
                created_at: Utc::now(),
                state: SessionState::Open,
                backlog: VecDeque::new(),
                backlog_dropped: 0,
                subscribers: Vec::new(),
            },
        );
        debug!(session_id, "session created");
        Ok(())
    }

    /// Publish an event to a session. Non-blocking.
    pub fn publish(&self, event: Event) -> Result<(), SessionError> {
        let mut sessions = self.sessions.lock().expect("session bus lock poisoned");
        let entry = sessions
            .get_mut(&event.session_id)
            .ok_or_else(|| SessionError::UnknownSession(event.session_id.clone()))?;

        // Backlog retains the stream for late subscribers, same bound.
        if entry.backlog.len() >= self.capacity {
            entry.backlog.pop_front();
            entry.backlog_dropped += 1;
        }
        entry.backlog.push_back(event.clone());

        entry.subscribers.retain(|weak| {
            if let Some(queue) = weak.upgrade() {
                queue.push(event.clone());
                true
            } else {
                false
            }
        });

        if event.kind.is_terminal() {
            entry.state = SessionState::Completing;
        }
        Ok(())
    }

    /// Subscribe to a session. Each subscriber gets an independent view:
    /// the backlog is replayed first, then live events.
    pub fn subscribe(&self, session_id: &str) -> Result<Subscription, SessionError> {
        let mut sessions = self.sessions.lock().expect("session bus lock poisoned");
        let entry = sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::UnknownSession(session_id.to_string()))?;

        let queue = Arc::new(SubscriberQueue::new(session_id, self.capacity));
        {
            let mut inner = queue.inner.lock().expect("subscriber queue lock poisoned");
            inner.dropped = entry.backlog_dropped;
        }
        for event in &entry.backlog {
            queue.push(event.clone());
        }
        entry.subscribers.push(Arc::downgrade(&queue));

        Ok(Subscription { queue })
    }

    pub fn session_info(&self, session_id: &str) -> Option<SessionInfo> {
        let mut sessions = self.sessions.lock().expect("session bus lock poisoned");
        sessions.get_mut(session_id).map(|entry| {
            entry.subscribers.retain(|weak| weak.strong_count() > 0);
            SessionInfo {
                id: session_id.to_string(),
                created_at: entry.created_at,
                state: entry.state,
                subscriber_count: entry.subscribers.len(),
            }
        })
    }

    /// Remove a finished session after a grace period.
    ///
    /// The session is removed only once its terminal event has been
    /// published and the last subscriber has disconnected. Returns whether
    /// the session was removed.
    pub async fn close_after_grace(&self, session_id: &str, grace: Duration) -> bool {
        tokio::time::sleep(grace).await;
        let mut sessions = self.sessions.lock().expect("session bus lock poisoned");
        let Some(entry) = sessions.get_mut(session_id) else {
            return false;
        };
        entry.subscribers.retain(|weak| weak.strong_count() > 0);
        if entry.state == SessionState::Completing && entry.subscribers.is_empty() {
            sessions.remove(session_id);
            debug!(session_id, "session closed");
            true
        } else {
            false
        }
    }
}
