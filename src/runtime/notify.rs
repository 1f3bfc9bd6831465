//! Asynchronous notification fan-out.
//!
//! Engine code only enqueues events onto an unbounded channel. A dedicated
//! task delivers them to subscribers, so a slow subscriber never stalls the
//! thread that completed an I/O operation.

use crate::error::Error;
use crate::runtime::ConnectionId;
use chrono::{DateTime, Utc};
use slab::Slab;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::trace;

/// Where an error notification originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSource {
    Listener,
    Accept,
    Admission,
    Connection(ConnectionId),
}

impl fmt::Display for ErrorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSource::Listener => f.write_str("listener"),
            ErrorSource::Accept => f.write_str("accept"),
            ErrorSource::Admission => f.write_str("admission"),
            ErrorSource::Connection(id) => write!(f, "connection {id}"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Event {
    ConnectionStatus {
        conn_id: ConnectionId,
        connected: bool,
        error: Option<Arc<Error>>,
    },
    Error {
        source: ErrorSource,
        error: Arc<Error>,
    },
    RunningState {
        running: bool,
    },
}

#[derive(Debug, Clone)]
pub struct Notification {
    pub at: DateTime<Utc>,
    pub event: Event,
}

pub type SubscriptionId = usize;

type Callback = Box<dyn Fn(&Notification) + Send + Sync>;

enum Subscriber {
    Callback(Callback),
    Channel(mpsc::UnboundedSender<Notification>),
}

type Subscribers = Arc<Mutex<Slab<Subscriber>>>;

/// Subscriber list plus the sending half of the delivery channel.
pub struct Notifier {
    tx: mpsc::UnboundedSender<Notification>,
    subscribers: Subscribers,
}

impl Notifier {
    /// Start the delivery task on `runtime`.
    pub fn new(runtime: &Handle) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Notification>();
        let subscribers: Subscribers = Arc::new(Mutex::new(Slab::new()));

        let delivery = Arc::clone(&subscribers);
        runtime.spawn(async move {
            while let Some(notification) = rx.recv().await {
                deliver(&delivery, &notification);
            }
            trace!("notification channel closed");
        });

        Self { tx, subscribers }
    }

    /// Register a callback. It runs on the delivery task and must not block.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        lock(&self.subscribers).insert(Subscriber::Callback(Box::new(callback)))
    }

    /// Register a channel subscriber. Dropping the receiver unsubscribes it.
    pub fn subscribe_channel(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = lock(&self.subscribers).insert(Subscriber::Channel(tx));
        (id, rx)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        lock(&self.subscribers).try_remove(id).is_some()
    }

    /// Queue an event for delivery. Never blocks.
    pub fn emit(&self, event: Event) {
        let notification = Notification {
            at: Utc::now(),
            event,
        };
        if self.tx.send(notification).is_err() {
            trace!("notification dropped, delivery task is gone");
        }
    }

    pub fn connection_status(&self, conn_id: ConnectionId, connected: bool, error: Option<Error>) {
        self.emit(Event::ConnectionStatus {
            conn_id,
            connected,
            error: error.map(Arc::new),
        });
    }

    pub fn error(&self, source: ErrorSource, error: Error) {
        self.emit(Event::Error {
            source,
            error: Arc::new(error),
        });
    }

    pub fn running(&self, running: bool) {
        self.emit(Event::RunningState { running });
    }
}

fn deliver(subscribers: &Mutex<Slab<Subscriber>>, notification: &Notification) {
    let mut subscribers = lock(subscribers);
    let mut closed = Vec::new();

    for (id, subscriber) in subscribers.iter() {
        match subscriber {
            Subscriber::Callback(callback) => callback(notification),
            Subscriber::Channel(tx) => {
                if tx.send(notification.clone()).is_err() {
                    closed.push(id);
                }
            }
        }
    }

    for id in closed {
        subscribers.remove(id);
    }
}

fn lock(subscribers: &Mutex<Slab<Subscriber>>) -> MutexGuard<'_, Slab<Subscriber>> {
    subscribers.lock().unwrap_or_else(PoisonError::into_inner)
}
