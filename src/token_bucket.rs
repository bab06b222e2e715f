//! Thread-safe token bucket with a background refill thread.
//!
//! A bucket starts full. Every call to [`TokenBucket::allow`] takes one token
//! if one is available, and a dedicated thread adds `rate` tokens every
//! `interval`, never going above `capacity`. Both paths go through the same
//! lock, so no admission is ever lost or granted twice.

use std::mem;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::config::BucketConfig;
use crate::error::{Error, Result};

/// Lifecycle of a bucket's refill thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Running,
    Stopping,
    Stopped,
}

struct Tokens {
    current: u64,
    max: u64,
}

impl Tokens {
    fn new(size: u64) -> Self {
        Self {
            current: size,
            max: size,
        }
    }

    fn acquire(&mut self) -> bool {
        if self.current > 0 {
            self.current -= 1;
            return true;
        }
        false
    }

    fn release(&mut self, amount: u64) {
        self.current = self.current.saturating_add(amount).min(self.max);
    }
}

struct Refill {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

enum Lifecycle {
    Running(Refill),
    Stopping,
    Stopped,
}

pub struct TokenBucket {
    tokens: Arc<Mutex<Tokens>>,
    capacity: u64,
    rate: u64,
    interval: Duration,
    lifecycle: Mutex<Lifecycle>,
    stopped: Condvar,
}

impl TokenBucket {
    /// Creates a full bucket and starts its refill thread.
    ///
    /// Fails when any of `rate`, `capacity` or `interval` is zero.
    pub fn new(rate: u64, capacity: u64, interval: Duration) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::ZeroCapacity);
        }
        if rate == 0 {
            return Err(Error::ZeroRate);
        }
        if interval.is_zero() {
            return Err(Error::ZeroInterval);
        }

        let tokens = Arc::new(Mutex::new(Tokens::new(capacity)));
        let (stop, stop_rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("tollbooth-refill".into())
            .spawn({
                let tokens = Arc::clone(&tokens);
                move || refill(tokens, rate, interval, stop_rx)
            })
            .map_err(Error::Spawn)?;

        tracing::info!(
            capacity,
            rate,
            ?interval,
            "token bucket started"
        );

        Ok(Self {
            tokens,
            capacity,
            rate,
            interval,
            lifecycle: Mutex::new(Lifecycle::Running(Refill { stop, handle })),
            stopped: Condvar::new(),
        })
    }

    pub fn from_config(config: &BucketConfig) -> Result<Self> {
        config.validate()?;
        Self::new(config.rate, config.capacity, config.interval())
    }

    /// Takes one token if any is left. Returns `false` without changing
    /// anything when the bucket is empty.
    pub fn allow(&self) -> bool {
        self.tokens.lock().acquire()
    }

    /// Stops the refill thread and waits for it to exit.
    ///
    /// Only the first call does any work. Calls made while another caller is
    /// already stopping the bucket block until the refill thread has exited,
    /// so no call returns while a refill can still happen. `allow` keeps
    /// working afterwards but the bucket never refills again.
    pub fn stop(&self) {
        let Refill { stop, handle } = {
            let mut lifecycle = self.lifecycle.lock();
            match mem::replace(&mut *lifecycle, Lifecycle::Stopping) {
                Lifecycle::Running(refill) => refill,
                other => {
                    *lifecycle = other;
                    while matches!(*lifecycle, Lifecycle::Stopping) {
                        self.stopped.wait(&mut lifecycle);
                    }
                    return;
                }
            }
        };

        // Disconnecting the channel wakes the refill thread.
        drop(stop);
        if handle.join().is_err() {
            tracing::warn!("refill thread panicked before shutdown");
        }

        *self.lifecycle.lock() = Lifecycle::Stopped;
        self.stopped.notify_all();
        tracing::info!(tokens = self.available(), "token bucket stopped");
    }

    pub fn state(&self) -> State {
        match *self.lifecycle.lock() {
            Lifecycle::Running(_) => State::Running,
            Lifecycle::Stopping => State::Stopping,
            Lifecycle::Stopped => State::Stopped,
        }
    }

    /// Number of tokens left at the time of the call.
    pub fn available(&self) -> u64 {
        self.tokens.lock().current
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn rate(&self) -> u64 {
        self.rate
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl Drop for TokenBucket {
    fn drop(&mut self) {
        self.stop();
    }
}

fn refill(tokens: Arc<Mutex<Tokens>>, rate: u64, interval: Duration, stop: Receiver<()>) {
    let mut next_tick = Instant::now().checked_add(interval);
    // An interval too large to schedule never ticks; only shutdown ends the wait.
    while let Some(tick) = next_tick {
        let wait = tick.saturating_duration_since(Instant::now());
        match stop.recv_timeout(wait) {
            Err(RecvTimeoutError::Timeout) => {
                let current = {
                    let mut tokens = tokens.lock();
                    tokens.release(rate);
                    tokens.current
                };
                tracing::debug!(tokens = current, "refilled tokens");
                next_tick = following_tick(tick, interval, Instant::now());
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
        }
    }
    let _ = stop.recv();
}

/// First tick of the schedule after `now`. Missed ticks are dropped rather
/// than replayed as a burst.
fn following_tick(tick: Instant, interval: Duration, now: Instant) -> Option<Instant> {
    let next = tick.checked_add(interval)?;
    if next > now {
        return Some(next);
    }
    let skipped = now.duration_since(next).as_nanos() / interval.as_nanos() + 1;
    let offset = interval.as_nanos().checked_mul(skipped)?;
    next.checked_add(Duration::from_nanos(u64::try_from(offset).ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn tokens_acquire_until_empty() {
        let mut tokens = Tokens::new(2);
        assert!(tokens.acquire());
        assert!(tokens.acquire());
        assert!(!tokens.acquire());
        assert_eq!(tokens.current, 0);
    }

    #[test]
    fn tokens_release_is_capped() {
        let mut tokens = Tokens::new(5);
        tokens.acquire();
        tokens.release(3);
        assert_eq!(tokens.current, 5);

        tokens.release(u64::MAX);
        assert_eq!(tokens.current, 5);
    }

    #[test]
    fn tokens_release_partial() {
        let mut tokens = Tokens::new(5);
        for _ in 0..5 {
            tokens.acquire();
        }
        tokens.release(2);
        assert_eq!(tokens.current, 2);
    }

    #[test]
    fn following_tick_keeps_fixed_rate() {
        let start = Instant::now();
        let interval = Duration::from_millis(100);
        let next = following_tick(start, interval, start + Duration::from_millis(30));
        assert_eq!(next, Some(start + interval));
    }

    #[test]
    fn following_tick_skips_missed_ticks() {
        let start = Instant::now();
        let interval = Duration::from_millis(100);
        let next = following_tick(start, interval, start + Duration::from_millis(350));
        assert_eq!(next, Some(start + Duration::from_millis(400)));
    }

    #[test]
    fn following_tick_skips_long_stall_with_tiny_interval() {
        let start = Instant::now();
        let interval = Duration::from_nanos(1);
        let now = start + Duration::from_secs(10);
        let next = following_tick(start, interval, now);
        assert_eq!(next, Some(now + interval));
    }

    #[test]
    fn following_tick_lands_after_exact_tick() {
        let start = Instant::now();
        let interval = Duration::from_millis(100);
        let next = following_tick(start, interval, start + interval);
        assert_eq!(next, Some(start + Duration::from_millis(200)));
    }

    #[test]
    fn new_rejects_zero_parameters() {
        assert!(matches!(
            TokenBucket::new(1, 0, HOUR),
            Err(Error::ZeroCapacity)
        ));
        assert!(matches!(TokenBucket::new(0, 1, HOUR), Err(Error::ZeroRate)));
        assert!(matches!(
            TokenBucket::new(1, 1, Duration::ZERO),
            Err(Error::ZeroInterval)
        ));
    }

    #[test]
    fn from_config_uses_all_fields() {
        let config = BucketConfig {
            capacity: 4,
            rate: 2,
            interval_ms: 250,
        };
        let bucket = TokenBucket::from_config(&config).unwrap();
        assert_eq!(bucket.capacity(), 4);
        assert_eq!(bucket.rate(), 2);
        assert_eq!(bucket.interval(), Duration::from_millis(250));
        assert_eq!(bucket.available(), 4);
    }

    #[test]
    fn stop_transitions_to_stopped() {
        let bucket = TokenBucket::new(1, 1, HOUR).unwrap();
        assert_eq!(bucket.state(), State::Running);
        bucket.stop();
        assert_eq!(bucket.state(), State::Stopped);
    }

    #[test]
    fn stop_is_idempotent() {
        let bucket = TokenBucket::new(1, 3, HOUR).unwrap();
        assert!(bucket.allow());
        bucket.stop();
        bucket.stop();
        bucket.stop();
        assert_eq!(bucket.state(), State::Stopped);
        assert_eq!(bucket.available(), 2);
    }

    #[test]
    fn stop_does_not_wait_for_next_tick() {
        let bucket = TokenBucket::new(1, 1, HOUR).unwrap();
        let started = Instant::now();
        bucket.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn drop_joins_refill_thread() {
        let bucket = TokenBucket::new(1, 1, Duration::from_millis(1)).unwrap();
        let tokens = Arc::clone(&bucket.tokens);
        assert_eq!(Arc::strong_count(&tokens), 3);

        drop(bucket);
        assert_eq!(Arc::strong_count(&tokens), 1);
    }

    #[test]
    fn second_stop_waits_for_refill_thread() {
        let bucket = TokenBucket::new(1, 1, Duration::from_millis(1)).unwrap();
        assert!(bucket.allow());

        // Park the refill thread inside a tick.
        let guard = bucket.tokens.lock();
        thread::sleep(Duration::from_millis(20));

        thread::scope(|scope| {
            let first = scope.spawn(|| bucket.stop());
            while bucket.state() != State::Stopping {
                thread::sleep(Duration::from_millis(1));
            }

            let second = scope.spawn(|| {
                bucket.stop();
                (bucket.state(), bucket.available())
            });
            thread::sleep(Duration::from_millis(50));
            assert!(!second.is_finished());
            assert!(!first.is_finished());

            drop(guard);
            first.join().unwrap();
            let (state, tokens) = second.join().unwrap();
            assert_eq!(state, State::Stopped);

            thread::sleep(Duration::from_millis(20));
            assert_eq!(bucket.available(), tokens);
        });
    }

    #[test]
    fn unschedulable_interval_never_refills() {
        let bucket = TokenBucket::new(1, 2, Duration::MAX).unwrap();
        assert_eq!(bucket.interval(), Duration::MAX);
        assert!(bucket.allow());
        thread::sleep(Duration::from_millis(20));
        assert_eq!(bucket.available(), 1);
        bucket.stop();
        assert_eq!(bucket.state(), State::Stopped);
    }
}
