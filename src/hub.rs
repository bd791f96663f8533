//! The broadcast hub: bounded per-source history and fan-out to live clients.
//!
//! Every mutation (history append and eviction, client registration and
//! removal, delivery) runs under one mutex, so a client that registers sees
//! each source's history exactly once and strictly before any live line
//! ingested after it joined.
//!
//! Delivery never blocks on a client. Each client owns a bounded [`Outbox`]
//! that its connection task drains; what happens when it fills up is decided
//! by [`OverflowPolicy`].

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace, warn};

pub const DEFAULT_HISTORY_LEN: usize = 50;
pub const DEFAULT_CLIENT_QUEUE: usize = 1024;

/// One line from one source, as sent to clients.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct LineEvent {
    pub source_index: usize,
    pub text: String,
}

impl LineEvent {
    pub fn new(source_index: usize, text: impl Into<String>) -> Self {
        LineEvent {
            source_index,
            text: text.into(),
        }
    }
}

/// What to do with a client whose outbox is full.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum OverflowPolicy {
    /// Discard the oldest queued line to make room.
    #[default]
    DropOldest,
    /// Unregister the client.
    Disconnect,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HubConfig {
    /// Number of sources; valid indexes are `0..sources`.
    pub sources: usize,
    /// Lines kept per source for replay.
    pub history_len: usize,
    /// Live lines a client may have queued before `overflow` applies.
    pub client_queue: usize,
    pub overflow: OverflowPolicy,
}

impl Default for HubConfig {
    fn default() -> Self {
        HubConfig {
            sources: 0,
            history_len: DEFAULT_HISTORY_LEN,
            client_queue: DEFAULT_CLIENT_QUEUE,
            overflow: OverflowPolicy::default(),
        }
    }
}

pub type ClientId = u64;

enum Push {
    Queued,
    Dropped,
    Rejected,
}

#[derive(Default)]
struct OutboxState {
    queue: VecDeque<LineEvent>,
    /// Replayed history still at the front of `queue`. Never counted
    /// against the bound and never evicted.
    replayed: usize,
    closed: bool,
}

impl OutboxState {
    fn live(&self) -> usize {
        self.queue.len() - self.replayed
    }
}

/// Bounded queue of lines waiting to be written to one client.
///
/// Replayed history sits ahead of every live line; the bound applies to the
/// live lines behind it.
#[derive(Default)]
struct Outbox {
    state: Mutex<OutboxState>,
    notify: Notify,
}

impl Outbox {
    fn lock(&self) -> MutexGuard<'_, OutboxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueues history without applying the bound.
    fn replay<'a>(&self, source_index: usize, lines: impl IntoIterator<Item = &'a String>) {
        let mut state = self.lock();
        debug_assert_eq!(state.live(), 0, "history replayed behind live lines");
        let before = state.queue.len();
        state
            .queue
            .extend(lines.into_iter().map(|text| LineEvent::new(source_index, text.clone())));
        state.replayed += state.queue.len() - before;
        drop(state);
        self.notify.notify_one();
    }

    fn push(&self, event: &LineEvent, capacity: usize, policy: OverflowPolicy) -> Push {
        let mut state = self.lock();
        if state.closed {
            return Push::Rejected;
        }

        let mut outcome = Push::Queued;
        if state.live() >= capacity {
            match policy {
                OverflowPolicy::DropOldest => {
                    let oldest_live = state.replayed;
                    state.queue.remove(oldest_live);
                    outcome = Push::Dropped;
                }
                OverflowPolicy::Disconnect => return Push::Rejected,
            }
        }
        state.queue.push_back(event.clone());
        drop(state);
        self.notify.notify_one();

        outcome
    }

    fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    async fn recv(&self) -> Option<LineEvent> {
        loop {
            {
                let mut state = self.lock();
                if state.closed {
                    return None;
                }
                if let Some(event) = state.queue.pop_front() {
                    state.replayed = state.replayed.saturating_sub(1);
                    return Some(event);
                }
            }
            self.notify.notified().await;
        }
    }

    fn len(&self) -> usize {
        self.lock().queue.len()
    }
}

struct State {
    history: Vec<VecDeque<String>>,
    clients: HashMap<ClientId, Arc<Outbox>>,
    next_id: ClientId,
}

struct Shared {
    config: HubConfig,
    state: Mutex<State>,
}

/// Handle to the hub. Cloning is cheap and every clone refers to the same
/// history and client set.
#[derive(Clone)]
pub struct Hub {
    shared: Arc<Shared>,
}

impl fmt::Debug for Hub {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        let state = self.lock();
        f.debug_struct("Hub")
            .field("config", &self.shared.config)
            .field("clients", &state.clients.len())
            .field(
                "history",
                &state.history.iter().map(VecDeque::len).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Hub {
    pub fn new(config: HubConfig) -> Self {
        let history = (0..config.sources)
            .map(|_| VecDeque::with_capacity(config.history_len))
            .collect();

        Hub {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(State {
                    history,
                    clients: HashMap::new(),
                    next_id: 0,
                }),
            }),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.shared.config
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends pre-existing lines to a source's history without delivering
    /// them to anyone.
    pub fn seed(&self, source_index: usize, lines: impl IntoIterator<Item = String>) {
        let limit = self.shared.config.history_len;
        let mut state = self.lock();
        let Some(history) = state.history.get_mut(source_index) else {
            warn!(source_index, "seed for unknown source ignored");
            return;
        };
        for line in lines {
            push_bounded(history, line, limit);
        }
    }

    /// Records `event` in its source's history and delivers it to every
    /// registered client.
    ///
    /// Clients that cannot take the line are unregistered once delivery to
    /// the others is done. Returns the number of clients the line was queued
    /// for.
    pub fn ingest(&self, event: LineEvent) -> usize {
        let HubConfig {
            history_len,
            client_queue,
            overflow,
            ..
        } = self.shared.config;

        let mut state = self.lock();
        let Some(history) = state.history.get_mut(event.source_index) else {
            warn!(source_index = event.source_index, "line for unknown source dropped");
            return 0;
        };
        push_bounded(history, event.text.clone(), history_len);

        let mut delivered = 0;
        let mut failed = Vec::new();
        for (id, outbox) in &state.clients {
            match outbox.push(&event, client_queue, overflow) {
                Push::Queued => delivered += 1,
                Push::Dropped => {
                    trace!(client = id, "outbox full, dropped oldest line");
                    delivered += 1;
                }
                Push::Rejected => failed.push(*id),
            }
        }

        for id in failed {
            if let Some(outbox) = state.clients.remove(&id) {
                debug!(client = id, "client could not keep up, unregistered");
                outbox.close();
            }
        }

        delivered
    }

    /// Adds a client to the live set, queueing the full history for it first.
    ///
    /// History is queued in source-index order, oldest line first within a
    /// source, before any line ingested after this call.
    pub fn register(&self) -> Subscription {
        let outbox = Arc::new(Outbox::default());

        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        for (source_index, lines) in state.history.iter().enumerate() {
            outbox.replay(source_index, lines);
        }
        state.clients.insert(id, Arc::clone(&outbox));
        let clients = state.clients.len();
        drop(state);

        debug!(client = id, clients, "client registered");

        Subscription {
            id,
            outbox,
            hub: self.clone(),
        }
    }

    /// Removes a client from the live set. Returns `false` if it was already
    /// gone; calling this more than once is harmless.
    pub fn unregister(&self, id: ClientId) -> bool {
        let removed = self.lock().clients.remove(&id);
        match removed {
            Some(outbox) => {
                outbox.close();
                debug!(client = id, "client unregistered");
                true
            }
            None => false,
        }
    }

    /// Snapshot of one source's history, oldest first.
    pub fn history(&self, source_index: usize) -> Vec<String> {
        self.lock()
            .history
            .get(source_index)
            .map(|lines| lines.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn client_count(&self) -> usize {
        self.lock().clients.len()
    }

    /// Drains the ingest channel into the hub until every sender is gone.
    pub async fn run(&self, mut rx: mpsc::Receiver<LineEvent>) {
        while let Some(event) = rx.recv().await {
            trace!(source_index = event.source_index, "ingest");
            self.ingest(event);
        }
        debug!("ingest channel closed");
    }
}

fn push_bounded(history: &mut VecDeque<String>, line: String, limit: usize) {
    if limit == 0 {
        return;
    }
    while history.len() >= limit {
        history.pop_front();
    }
    history.push_back(line);
}

/// A registered client's end of the hub.
///
/// Dropping it unregisters the client.
pub struct Subscription {
    id: ClientId,
    outbox: Arc<Outbox>,
    hub: Hub,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("queued", &self.outbox.len())
            .finish()
    }
}

impl Subscription {
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Waits for the next line. Returns `None` once the client has been
    /// unregistered.
    pub async fn recv(&self) -> Option<LineEvent> {
        self.outbox.recv().await
    }

    /// Lines currently queued for this client.
    pub fn queued(&self) -> usize {
        self.outbox.len()
    }

    pub fn unregister(&self) -> bool {
        self.hub.unregister(self.id)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.unregister(self.id);
    }
}
