//! Per-worker batch accumulator.

use eventstore_core::{Batch, Event};
use std::time::Instant;

/// Groups envelopes into batches of at most `batch_size`. Owned by exactly
/// one worker, so it needs no synchronization.
#[derive(Debug)]
pub struct BatchAssembler {
    events: Vec<Event>,
    opened_at: Option<Instant>,
    batch_size: usize,
}

impl BatchAssembler {
    pub fn new(batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            events: Vec::with_capacity(batch_size),
            opened_at: None,
            batch_size,
        }
    }

    /// Appends an envelope. Returns true when the batch is full and must be
    /// flushed before the next append.
    pub fn push(&mut self, event: Event) -> bool {
        if self.events.is_empty() {
            self.opened_at = Some(Instant::now());
        }
        self.events.push(event);
        self.is_full()
    }

    pub fn is_full(&self) -> bool {
        self.events.len() >= self.batch_size
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Closes the current batch, leaving the assembler empty. `None` when
    /// there is nothing to flush.
    pub fn take(&mut self) -> Option<Batch> {
        if self.events.is_empty() {
            return None;
        }
        let events = std::mem::replace(&mut self.events, Vec::with_capacity(self.batch_size));
        let opened_at = self.opened_at.take().unwrap_or_else(Instant::now);
        Some(Batch::new(events, opened_at))
    }
}
