use crate::error::JobError;
use crate::model::{Run, RunState};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rand::Rng;
use std::cmp::Reverse;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub limit: Option<usize>,
    pub state: Option<RunState>,
    pub kind: Option<String>,
}

#[derive(Debug, Clone)]
struct Slot {
    seq: u64,
    run: Run,
}

/// In-memory store of every run the process has seen.
#[derive(Debug, Default)]
pub struct RunRegistry {
    runs: DashMap<String, Slot>,
    next_id: AtomicU64,
    next_seq: AtomicU64,
    max_retained: Option<usize>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Once more than `max` runs are held, the oldest terminal runs are
    /// evicted on insert. Live runs are never evicted.
    pub fn with_retention(max: Option<usize>) -> Self {
        Self {
            max_retained: max,
            ..Self::default()
        }
    }

    /// Counter prefix keeps ids unique for the registry's lifetime; the random
    /// suffix keeps them unguessable across restarts.
    pub fn next_id(&self) -> String {
        let counter = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let mut random = [0_u8; 4];
        rand::rng().fill(&mut random);
        format!("{counter:04x}{}", hex_encode(&random))
    }

    pub fn insert(&self, run: Run) -> Result<(), JobError> {
        match self.runs.entry(run.id.clone()) {
            Entry::Occupied(_) => {
                return Err(JobError::internal(format!(
                    "run id {} is already registered",
                    run.id
                )));
            }
            Entry::Vacant(slot) => {
                let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                slot.insert(Slot { seq, run });
            }
        }

        self.evict();
        Ok(())
    }

    /// Replaces a stored run. The new state must equal the stored one or be
    /// a legal forward transition from it.
    pub fn update(&self, run: Run) -> Result<(), JobError> {
        let mut slot = self
            .runs
            .get_mut(&run.id)
            .ok_or_else(|| JobError::NotFound(run.id.clone()))?;

        let current = slot.run.state;
        if current != run.state && !current.can_transition_to(run.state) {
            return Err(JobError::internal(format!(
                "run {}: refusing state regression {current} -> {}",
                run.id, run.state
            )));
        }

        slot.run = run;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Run> {
        self.runs.get(id).map(|slot| slot.run.clone())
    }

    /// Terminal runs, most recent first. Filters apply before the limit.
    pub fn list(&self, filter: &Filter) -> Vec<Run> {
        let mut slots: Vec<Slot> = self
            .runs
            .iter()
            .filter(|slot| slot.run.state.is_terminal() && matches_filter(&slot.run, filter))
            .map(|slot| slot.value().clone())
            .collect();

        slots.sort_by_key(|slot| Reverse((slot.run.started_at, slot.seq)));

        if let Some(limit) = filter.limit
            && slots.len() > limit
        {
            slots.truncate(limit);
        }

        slots.into_iter().map(|slot| slot.run).collect()
    }

    /// Pending and running runs, oldest first.
    pub fn list_active(&self) -> Vec<Run> {
        let mut slots: Vec<Slot> = self
            .runs
            .iter()
            .filter(|slot| slot.run.state.is_live())
            .map(|slot| slot.value().clone())
            .collect();
        slots.sort_by_key(|slot| slot.seq);
        slots.into_iter().map(|slot| slot.run).collect()
    }

    pub fn live_count(&self) -> usize {
        self.runs
            .iter()
            .filter(|slot| slot.run.state.is_live())
            .count()
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    fn evict(&self) {
        let Some(max) = self.max_retained else {
            return;
        };

        let excess = self.runs.len().saturating_sub(max);
        if excess == 0 {
            return;
        }

        let mut terminal: Vec<(u64, String)> = self
            .runs
            .iter()
            .filter(|slot| slot.run.state.is_terminal())
            .map(|slot| (slot.seq, slot.key().clone()))
            .collect();
        terminal.sort();

        for (_, id) in terminal.into_iter().take(excess) {
            self.runs.remove(&id);
            debug!(run_id = %id, "evicted");
        }
    }
}

fn matches_filter(run: &Run, filter: &Filter) -> bool {
    if let Some(state) = filter.state
        && run.state != state
    {
        return false;
    }

    if let Some(kind) = &filter.kind
        && &run.kind != kind
    {
        return false;
    }

    true
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}
