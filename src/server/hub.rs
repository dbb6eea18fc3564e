//! Fan-out of events to every connected observer.
//!
//! The [`Hub`] loop owns the listener set and the replay buffer; everything
//! else talks to it through a cloneable [`HubHandle`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::events::Event;

pub const OUTBOX_CAPACITY: usize = 32;
pub const LISTENER_CAPACITY: usize = 64;
const CONTROL_CAPACITY: usize = 8;

pub type ListenerId = u64;

struct Registration {
    id: ListenerId,
    outbox: mpsc::Sender<Event>,
    registered: oneshot::Sender<()>,
}

/// Receiving end of a registered listener. The channel closes when the hub
/// drops the listener.
#[derive(Debug)]
pub struct Subscription {
    pub id: ListenerId,
    pub events: mpsc::Receiver<Event>,
}

#[derive(Clone, Debug)]
pub struct HubHandle {
    outbox: mpsc::Sender<Event>,
    register: mpsc::Sender<Registration>,
    unregister: mpsc::Sender<ListenerId>,
    next_id: Arc<AtomicU64>,
}

impl HubHandle {
    /// Hands an event to the hub. Waits while the hub's outbox is full.
    pub async fn publish(&self, event: Event) {
        if self.outbox.send(event).await.is_err() {
            debug!("hub is gone, dropping event");
        }
    }

    pub async fn subscribe(&self) -> Option<Subscription> {
        self.subscribe_with_capacity(LISTENER_CAPACITY).await
    }

    /// Registers a new listener and returns once the hub has accepted it,
    /// so every event published afterwards reaches it. `None` when the hub
    /// is no longer running.
    pub async fn subscribe_with_capacity(&self, capacity: usize) -> Option<Subscription> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (outbox, events) = mpsc::channel(capacity.max(1));
        let (registered, accepted) = oneshot::channel();
        self.register
            .send(Registration {
                id,
                outbox,
                registered,
            })
            .await
            .ok()?;
        accepted.await.ok()?;
        Some(Subscription { id, events })
    }

    pub async fn unsubscribe(&self, id: ListenerId) {
        let _ = self.unregister.send(id).await;
    }
}

pub struct Hub {
    listeners: HashMap<ListenerId, mpsc::Sender<Event>>,
    last_queue_updated: Option<Event>,
    last_download_started: Option<Event>,
    outbox: mpsc::Receiver<Event>,
    register: mpsc::Receiver<Registration>,
    unregister: mpsc::Receiver<ListenerId>,
}

impl Hub {
    pub fn new() -> (Self, HubHandle) {
        let (outbox_tx, outbox) = mpsc::channel(OUTBOX_CAPACITY);
        let (register_tx, register) = mpsc::channel(CONTROL_CAPACITY);
        let (unregister_tx, unregister) = mpsc::channel(CONTROL_CAPACITY);

        let hub = Self {
            listeners: HashMap::new(),
            last_queue_updated: None,
            last_download_started: None,
            outbox,
            register,
            unregister,
        };
        let handle = HubHandle {
            outbox: outbox_tx,
            register: register_tx,
            unregister: unregister_tx,
            next_id: Arc::new(AtomicU64::new(1)),
        };
        (hub, handle)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Runs until `cancel` fires or every handle is dropped.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("event hub started");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(registration) = self.register.recv() => self.add_listener(registration),
                Some(id) = self.unregister.recv() => self.remove_listener(id),
                Some(event) = self.outbox.recv() => self.broadcast(event),
                else => break,
            }
        }
        info!(listeners = self.listeners.len(), "event hub stopped");
    }

    fn add_listener(&mut self, registration: Registration) {
        let Registration {
            id,
            outbox,
            registered,
        } = registration;

        // Catch the newcomer up on the current queue and download.
        for event in [&self.last_queue_updated, &self.last_download_started]
            .into_iter()
            .flatten()
        {
            if outbox.try_send(event.clone()).is_err() {
                warn!(listener = id, "could not replay state to new listener");
            }
        }

        self.listeners.insert(id, outbox);
        let _ = registered.send(());
        debug!(listener = id, total = self.listeners.len(), "listener registered");
    }

    /// Dropping the sender closes the listener's channel.
    fn remove_listener(&mut self, id: ListenerId) {
        if self.listeners.remove(&id).is_some() {
            debug!(listener = id, total = self.listeners.len(), "listener unregistered");
        }
    }

    fn broadcast(&mut self, event: Event) {
        match event {
            Event::QueueUpdated { .. } => self.last_queue_updated = Some(event.clone()),
            Event::DownloadStarted { .. } => self.last_download_started = Some(event.clone()),
            _ => {}
        }

        self.listeners.retain(|id, outbox| match outbox.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(listener = *id, "listener is not keeping up, dropping it");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(listener = *id, "listener went away");
                false
            }
        });
    }
}
