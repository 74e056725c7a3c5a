//! Concurrent, in-memory view of live positions fed by the exchange stream.
//!
//! Each symbol maps to an immutable `Arc<Position>`. Writers replace the value
//! under the map's per-key lock, so readers only ever see committed positions
//! and updates to different symbols never contend.

mod merge;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::models::{Position, RawPositionUpdate};

pub use merge::{merge, parse_decimal, MergeOutcome, Merged, Transition};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Exchange-driven change notifications, sent while the per-key lock is held
/// so subscribers see one symbol's events in commit order.
///
/// The broadcast channel is lossy under lag. Closes are also delivered on the
/// unbounded channel from [`PositionStore::with_closes`].
#[derive(Debug, Clone)]
pub enum PositionEvent {
    Opened(Arc<Position>),
    Updated(Arc<Position>),
    Closed {
        previous: Arc<Position>,
        closed: Arc<Position>,
    },
}

/// A position that went flat, with the last open state it had.
#[derive(Debug, Clone)]
pub struct ClosedPosition {
    pub previous: Arc<Position>,
    pub closed: Arc<Position>,
}

/// Result of [`PositionStore::apply_update`].
#[derive(Debug, Clone)]
pub enum ApplyResult {
    Applied {
        position: Arc<Position>,
        transition: Transition,
    },
    Stale,
}

/// Authoritative live position map.
pub struct PositionStore {
    positions: DashMap<String, Arc<Position>>,
    events: broadcast::Sender<PositionEvent>,
    closes: Option<mpsc::UnboundedSender<ClosedPosition>>,
}

impl Default for PositionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PositionStore {
    pub fn new() -> Self {
        let (events, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            positions: DashMap::new(),
            events,
            closes: None,
        }
    }

    /// Store that also queues every close on a lossless channel.
    pub fn with_closes() -> (Self, mpsc::UnboundedReceiver<ClosedPosition>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut store = Self::new();
        store.closes = Some(tx);
        (store, rx)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PositionEvent> {
        self.events.subscribe()
    }

    /// Create or merge the position for `symbol` as one atomic step.
    pub fn apply_update(
        &self,
        symbol: &str,
        raw: &RawPositionUpdate,
        source_ts: DateTime<Utc>,
    ) -> ApplyResult {
        let key = normalize_symbol(symbol);

        match self.positions.entry(key.clone()) {
            Entry::Occupied(mut slot) => {
                let merged = merge(Some(slot.get().as_ref()), &key, raw, source_ts);
                log_field_errors(&key, &merged);
                match merged.outcome {
                    MergeOutcome::Stale { stored_at } => {
                        debug!(symbol = %key, %source_ts, %stored_at, "Dropping stale position update");
                        ApplyResult::Stale
                    }
                    MergeOutcome::Applied { position, transition } => {
                        let position = Arc::new(position);
                        let previous = slot.insert(position.clone());
                        log_transition(&key, &position, transition);
                        self.publish(transition, previous, position.clone());
                        ApplyResult::Applied { position, transition }
                    }
                }
            }
            Entry::Vacant(slot) => {
                let merged = merge(None, &key, raw, source_ts);
                log_field_errors(&key, &merged);
                match merged.outcome {
                    MergeOutcome::Stale { .. } => ApplyResult::Stale,
                    MergeOutcome::Applied { position, transition } => {
                        let position = Arc::new(position);
                        let _held = slot.insert(position.clone());
                        log_transition(&key, &position, transition);
                        let event = match transition {
                            Transition::Opened => PositionEvent::Opened(position.clone()),
                            _ => PositionEvent::Updated(position.clone()),
                        };
                        self.broadcast(event);
                        ApplyResult::Applied { position, transition }
                    }
                }
            }
        }
    }

    /// Atomically replace strategy-owned fields of an existing position.
    ///
    /// `f` sees the committed value under the per-key lock and returns the
    /// replacement, or `None` to leave it unchanged. No event is sent; readers
    /// pick the change up through [`PositionStore::get`].
    pub fn amend<F>(&self, symbol: &str, f: F) -> Option<Arc<Position>>
    where
        F: FnOnce(&Position) -> Option<Position>,
    {
        let key = normalize_symbol(symbol);
        let mut slot = self.positions.get_mut(&key)?;
        let next = Arc::new(f(slot.value())?);
        *slot.value_mut() = next.clone();
        Some(next)
    }

    /// Committed snapshot for one symbol.
    pub fn get(&self, symbol: &str) -> Option<Arc<Position>> {
        self.positions
            .get(&normalize_symbol(symbol))
            .map(|p| p.value().clone())
    }

    /// Committed snapshots of every known symbol, sorted by symbol.
    pub fn get_all(&self) -> Vec<Arc<Position>> {
        let mut all: Vec<_> = self.positions.iter().map(|p| p.value().clone()).collect();
        all.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        all
    }

    /// Positions with size > 0.
    pub fn open_positions(&self) -> Vec<Arc<Position>> {
        self.get_all().into_iter().filter(|p| p.is_open()).collect()
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    fn publish(&self, transition: Transition, previous: Arc<Position>, current: Arc<Position>) {
        let event = match transition {
            Transition::Opened => PositionEvent::Opened(current),
            Transition::Updated => PositionEvent::Updated(current),
            Transition::Closed => {
                if let Some(closes) = &self.closes {
                    let close = ClosedPosition {
                        previous: previous.clone(),
                        closed: current.clone(),
                    };
                    if closes.send(close).is_err() {
                        warn!(symbol = %current.symbol, "Close receiver dropped");
                    }
                }
                PositionEvent::Closed {
                    previous,
                    closed: current,
                }
            }
        };
        self.broadcast(event);
    }

    fn broadcast(&self, event: PositionEvent) {
        if self.events.receiver_count() > 0 {
            let _ = self.events.send(event);
        }
    }
}

fn log_transition(symbol: &str, position: &Position, transition: Transition) {
    match transition {
        Transition::Opened => info!(
            symbol = %symbol,
            side = position.side.as_str(),
            size = %position.size,
            entry = %position.entry_price,
            "Position opened"
        ),
        Transition::Closed => info!(symbol = %symbol, "Position closed"),
        Transition::Updated => {}
    }
}

fn log_field_errors(symbol: &str, merged: &Merged) {
    for err in &merged.field_errors {
        warn!(symbol = %symbol, error = %err, "Ignoring unusable position field");
    }
}

pub fn normalize_symbol(symbol: &str) -> String {
    symbol.trim().to_uppercase()
}
