use crate::engine::types::SaleEvent;
use chrono::{DateTime, Utc};
use std::collections::{HashSet, VecDeque};
use tracing::{info, warn};

/// Set of already-handled action ids that remembers insertion order and
/// forgets the oldest ids past `capacity`.
#[derive(Debug, Clone)]
pub struct SeenActions {
    order: VecDeque<String>,
    index: HashSet<String>,
    capacity: usize,
}

impl SeenActions {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            index: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn from_ordered<I>(capacity: usize, ids: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let mut seen = Self::new(capacity);
        for id in ids {
            seen.insert(id);
        }
        seen
    }

    pub fn contains(&self, action_id: &str) -> bool {
        self.index.contains(action_id)
    }

    /// Returns false when the id was already present.
    pub fn insert(&mut self, action_id: String) -> bool {
        if self.index.contains(&action_id) {
            return false;
        }
        self.index.insert(action_id.clone());
        self.order.push_back(action_id);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.index.remove(&evicted);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.order.iter()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    Bootstrap,
    Steady,
}

#[derive(Debug, Clone)]
pub struct DispatchPlan {
    pub phase: CyclePhase,
    /// Events to classify and publish, newest first.
    pub emit: Vec<SaleEvent>,
    /// Events not previously seen in this cycle.
    pub new_count: usize,
    /// Unseen events that were marked seen without being emitted.
    pub suppressed: usize,
}

impl DispatchPlan {
    fn idle(phase: CyclePhase) -> Self {
        Self {
            phase,
            emit: Vec::new(),
            new_count: 0,
            suppressed: 0,
        }
    }
}

#[derive(Debug)]
pub struct DispatchScheduler {
    seen: SeenActions,
    bootstrap_batch: usize,
    initial_batch_sent: bool,
    last_emitted_ts: Option<DateTime<Utc>>,
    waiting: bool,
}

impl DispatchScheduler {
    pub fn new(seen: SeenActions, bootstrap_batch: usize) -> Self {
        Self {
            seen,
            bootstrap_batch,
            initial_batch_sent: false,
            last_emitted_ts: None,
            waiting: false,
        }
    }

    pub fn seen(&self) -> &SeenActions {
        &self.seen
    }

    pub fn is_waiting(&self) -> bool {
        self.waiting
    }

    pub fn initial_batch_sent(&self) -> bool {
        self.initial_batch_sent
    }

    pub fn last_emitted_ts(&self) -> Option<DateTime<Utc>> {
        self.last_emitted_ts
    }

    pub fn phase(&self) -> CyclePhase {
        if self.initial_batch_sent {
            CyclePhase::Steady
        } else {
            CyclePhase::Bootstrap
        }
    }

    /// Selects what to emit from one page of purchases (API order, newest first).
    /// Every unseen action id is marked seen whether or not it is emitted.
    pub fn plan(&mut self, events: Vec<SaleEvent>) -> DispatchPlan {
        let fresh: Vec<SaleEvent> = events
            .into_iter()
            .filter(|ev| self.seen.insert(ev.action_id.clone()))
            .collect();
        let phase = self.phase();

        if fresh.is_empty() {
            if !self.waiting {
                info!("no new sales, entering waiting mode");
                self.waiting = true;
            }
            return DispatchPlan::idle(phase);
        }
        if self.waiting {
            info!(count = fresh.len(), "new sales detected, leaving waiting mode");
            self.waiting = false;
        }

        let new_count = fresh.len();
        match phase {
            CyclePhase::Bootstrap => {
                self.last_emitted_ts = fresh.iter().filter_map(SaleEvent::created_at_utc).max();
                self.initial_batch_sent = true;
                let emit: Vec<SaleEvent> = fresh.into_iter().take(self.bootstrap_batch).collect();
                let suppressed = new_count - emit.len();
                info!(
                    emit = emit.len(),
                    suppressed,
                    "initial batch selected"
                );
                DispatchPlan {
                    phase,
                    emit,
                    new_count,
                    suppressed,
                }
            }
            CyclePhase::Steady => {
                let boundary = self.last_emitted_ts;
                let mut emit = Vec::new();
                for ev in fresh {
                    match ev.created_at_utc() {
                        Some(ts) if boundary.map_or(true, |b| ts > b) => emit.push(ev),
                        Some(_) => {}
                        None => warn!(
                            action_id = %ev.action_id,
                            created_at = %ev.created_at,
                            "unparseable sale timestamp, not emitting"
                        ),
                    }
                }
                if let Some(newest) = emit.iter().filter_map(SaleEvent::created_at_utc).max() {
                    self.last_emitted_ts = Some(boundary.map_or(newest, |b| b.max(newest)));
                }
                let suppressed = new_count - emit.len();
                DispatchPlan {
                    phase,
                    emit,
                    new_count,
                    suppressed,
                }
            }
        }
    }
}
