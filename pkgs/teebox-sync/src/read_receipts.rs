//! Read-receipt debounce
//!
//! Unread messages from other participants are queued as they show up. A
//! sweep becomes due once the oldest queued id has waited `delay` and the
//! previous sweep is at least `cooldown` old. Only one sweep runs at a time,
//! and ids marked recently are not queued again until `recent_ttl` passes.

use crate::cache::TtlCache;
use std::time::{Duration, Instant};
use tracing::debug;

const RECENT_CAPACITY: usize = 4096;

pub struct ReadReceiptScheduler {
    delay: Duration,
    cooldown: Duration,
    queued: Vec<String>,
    first_queued_at: Option<Instant>,
    last_sweep_at: Option<Instant>,
    processing: bool,
    recently_marked: TtlCache<String, ()>,
}

impl ReadReceiptScheduler {
    pub fn new(delay: Duration, cooldown: Duration, recent_ttl: Duration) -> Self {
        let mut recently_marked = TtlCache::new(RECENT_CAPACITY, recent_ttl);
        recently_marked.open();
        Self {
            delay,
            cooldown,
            queued: Vec::new(),
            first_queued_at: None,
            last_sweep_at: None,
            processing: false,
            recently_marked,
        }
    }

    /// Queue ids for the next sweep. Returns how many were new.
    pub fn queue<I>(&mut self, message_ids: I, now: Instant) -> usize
    where
        I: IntoIterator<Item = String>,
    {
        let mut added = 0;
        for id in message_ids {
            if self.recently_marked.contains(&id, now) || self.queued.contains(&id) {
                continue;
            }
            self.queued.push(id);
            added += 1;
        }
        if added > 0 && self.first_queued_at.is_none() {
            self.first_queued_at = Some(now);
        }
        added
    }

    pub fn pending(&self) -> usize {
        self.queued.len()
    }

    pub fn is_processing(&self) -> bool {
        self.processing
    }

    /// When the next sweep may start, if anything is queued
    pub fn due_at(&self) -> Option<Instant> {
        let queued_at = self.first_queued_at?;
        let after_delay = queued_at + self.delay;
        Some(match self.last_sweep_at {
            Some(last) => after_delay.max(last + self.cooldown),
            None => after_delay,
        })
    }

    pub fn is_due(&self, now: Instant) -> bool {
        !self.processing && self.due_at().is_some_and(|due| due <= now)
    }

    /// Take the queued ids and mark a sweep as running
    pub fn begin(&mut self, now: Instant) -> Option<Vec<String>> {
        if !self.is_due(now) {
            return None;
        }
        self.processing = true;
        self.first_queued_at = None;
        let batch = std::mem::take(&mut self.queued);
        debug!("Starting read-receipt sweep for {} messages", batch.len());
        Some(batch)
    }

    /// Finish the running sweep. Failed ids go back on the queue.
    pub fn finish(&mut self, batch: Vec<String>, succeeded: bool, now: Instant) {
        self.processing = false;
        self.last_sweep_at = Some(now);

        if succeeded {
            for id in batch {
                self.recently_marked.insert(id, (), now);
            }
        } else {
            self.queue(batch, now);
        }
        self.recently_marked.purge_expired(now);
    }

    /// Forget queued work, e.g. when switching conversations
    pub fn clear(&mut self) {
        self.queued.clear();
        self.first_queued_at = None;
    }
}
