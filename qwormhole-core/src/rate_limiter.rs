//! Token-bucket admission control for outbound bytes.
//!
//! Tokens refill continuously at `bytes_per_sec` up to `burst_bytes`. Sends
//! that do not fit wait in a queue ordered by `(priority, arrival)`, lower
//! priority first. While a payload larger than the burst is at the head of
//! the queue the bucket may fill past the burst up to that payload's size,
//! so it is admitted after `(size - burst) / rate` more and never starved.
//! The balance never goes negative: over any window `[t0, t]` at most
//! `burst + rate * (t - t0)` bytes are admitted.
//!
//! Time is passed in by the caller, which keeps the limiter deterministic.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Rate limit settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub bytes_per_sec: u64,
    pub burst_bytes: u64,
}

impl RateLimitConfig {
    /// Creates a config whose burst equals one second of throughput.
    pub fn per_second(bytes_per_sec: u64) -> Self {
        Self {
            bytes_per_sec,
            burst_bytes: bytes_per_sec,
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.bytes_per_sec == 0 {
            return Err(CoreError::invalid("rate_limit_bytes_per_sec", "must be > 0"));
        }
        if self.burst_bytes == 0 {
            return Err(CoreError::invalid("rate_limit_burst_bytes", "must be > 0"));
        }
        Ok(())
    }
}

/// Outcome of [`RateLimiter::submit`].
#[derive(Debug, PartialEq, Eq)]
pub enum Admission<T> {
    /// The item may be written now.
    Admitted(T),
    /// The item was queued; it will come out of [`RateLimiter::drain`].
    Queued,
}

#[derive(Debug)]
struct Pending<T> {
    item: T,
    bytes: u64,
}

/// Token bucket with a priority queue of pending items.
#[derive(Debug)]
pub struct RateLimiter<T> {
    rate: f64,
    burst: f64,
    tokens: f64,
    last_refill: Instant,
    queue: BTreeMap<(i32, u64), Pending<T>>,
    next_seq: u64,
    queued_bytes: u64,
}

impl<T> RateLimiter<T> {
    /// Creates a limiter with a full bucket.
    pub fn new(config: RateLimitConfig, now: Instant) -> Result<Self, CoreError> {
        config.validate()?;
        Ok(Self {
            rate: config.bytes_per_sec as f64,
            burst: config.burst_bytes as f64,
            tokens: config.burst_bytes as f64,
            last_refill: now,
            queue: BTreeMap::new(),
            next_seq: 0,
            queued_bytes: 0,
        })
    }

    /// Largest balance the bucket may hold: the burst, raised to the size
    /// of an oversized head.
    fn capacity(&self) -> f64 {
        match self.queue.values().next() {
            Some(head) => self.burst.max(head.bytes as f64),
            None => self.burst,
        }
    }

    fn refill(&mut self, now: Instant) {
        if now <= self.last_refill {
            return;
        }
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity());
        self.last_refill = now;
    }

    fn take(&mut self, bytes: u64) -> bool {
        let bytes = bytes as f64;
        if self.tokens >= bytes {
            self.tokens -= bytes;
            true
        } else {
            false
        }
    }

    /// Admits `bytes` if the bucket currently holds enough tokens.
    ///
    /// This bypasses the queue; callers that need ordering use
    /// [`RateLimiter::submit`]. Payloads larger than the burst only pass
    /// through the queue.
    pub fn try_admit(&mut self, bytes: u64, now: Instant) -> bool {
        self.refill(now);
        self.take(bytes)
    }

    /// Admits the item immediately if nothing is waiting and it fits,
    /// otherwise queues it.
    pub fn submit(&mut self, item: T, bytes: u64, priority: i32, now: Instant) -> Admission<T> {
        self.refill(now);
        if self.queue.is_empty() && self.take(bytes) {
            return Admission::Admitted(item);
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.queued_bytes += bytes;
        self.queue.insert((priority, seq), Pending { item, bytes });
        Admission::Queued
    }

    /// Releases queued items head-first while they fit.
    pub fn drain(&mut self, now: Instant) -> Vec<T> {
        self.refill(now);
        let mut admitted = Vec::new();
        while let Some((&key, head)) = self.queue.first_key_value() {
            if !self.take(head.bytes) {
                break;
            }
            if let Some(pending) = self.queue.remove(&key) {
                self.queued_bytes -= pending.bytes;
                admitted.push(pending.item);
            }
        }
        admitted
    }

    /// Returns when the head of the queue will fit, or `None` if the queue
    /// is empty.
    pub fn next_admission_at(&mut self, now: Instant) -> Option<Instant> {
        self.refill(now);
        let head = self.queue.values().next()?;
        let deficit = head.bytes as f64 - self.tokens;
        if deficit <= 0.0 {
            return Some(now);
        }
        let micros = (deficit / self.rate * 1_000_000.0).ceil() as u64;
        Some(now + Duration::from_micros(micros.max(1)))
    }

    /// Removes every queued item, in queue order.
    pub fn clear(&mut self) -> Vec<T> {
        self.queued_bytes = 0;
        std::mem::take(&mut self.queue)
            .into_values()
            .map(|p| p.item)
            .collect()
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn queued_bytes(&self) -> u64 {
        self.queued_bytes
    }

    /// Current token balance.
    pub fn available_tokens(&mut self, now: Instant) -> f64 {
        self.refill(now);
        self.tokens
    }
}
