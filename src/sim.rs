//! Real-time load generator for a [`TokenBucket`].
//!
//! Events sit in a heap ordered by when they are due. The executor sleeps
//! until the earliest one, runs its handler and schedules whatever the
//! handler returns. Because the bucket refills on wall-clock time, events
//! are executed in real time rather than on a virtual clock.

use std::cmp::Ordering;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::ensure;
use rand::distributions::{Distribution, Uniform};

use crate::token_bucket::TokenBucket;

pub trait Handler<S>: HandlerClone<S> {
    fn call(&self, now: Instant, state: &mut S) -> Vec<Event<S>>;
}

pub trait HandlerClone<S> {
    fn clone_box(&self) -> Box<dyn Handler<S>>;
}

impl<S, T> HandlerClone<S> for T
where
    T: 'static + Handler<S> + Clone,
{
    fn clone_box(&self) -> Box<dyn Handler<S>> {
        Box::new(self.clone())
    }
}

impl<S> Clone for Box<dyn Handler<S>> {
    fn clone(&self) -> Box<dyn Handler<S>> {
        self.clone_box()
    }
}

#[derive(Clone)]
pub struct Event<S> {
    pub ready_at: Instant,
    pub handler: Box<dyn Handler<S>>,
}

impl<S> Eq for Event<S> {}

impl<S> PartialEq for Event<S> {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at
    }
}

impl<S> Ord for Event<S> {
    fn cmp(&self, other: &Self) -> Ordering {
        Reverse(self.ready_at).cmp(&Reverse(other.ready_at))
    }
}

impl<S> PartialOrd for Event<S> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Runs events in due order, sleeping until each one is ready. Stops at the
/// first event due after `finish_at`.
pub fn execute<S>(state: &mut S, init_events: Vec<Event<S>>, finish_at: Instant) {
    let mut heap = BinaryHeap::new();
    for event in init_events {
        heap.push(event);
    }
    while let Some(event) = heap.pop() {
        if event.ready_at > finish_at {
            return;
        }
        let now = Instant::now();
        if event.ready_at > now {
            thread::sleep(event.ready_at - now);
        }
        let new_events = event.handler.call(event.ready_at, state);
        for new_event in new_events {
            heap.push(new_event);
        }
    }
}

/// Shape of the synthetic traffic.
#[derive(Debug, Clone, Copy)]
pub struct LoadConfig {
    pub clients: usize,
    /// Time between two requests of the same client.
    pub request_interval: Duration,
    /// Mean delay before a produced request reaches the bucket.
    pub latency: Duration,
    pub jitter: Duration,
    pub duration: Duration,
}

/// Admitted requests per elapsed second, with and without the bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub with_bucket: Vec<u64>,
    pub without_bucket: Vec<u64>,
}

impl LoadReport {
    fn record(&mut self, second: usize, admitted: bool) {
        if self.without_bucket.len() <= second {
            self.with_bucket.resize(second + 1, 0);
            self.without_bucket.resize(second + 1, 0);
        }
        self.without_bucket[second] += 1;
        if admitted {
            self.with_bucket[second] += 1;
        }
    }

    pub fn total_with_bucket(&self) -> u64 {
        self.with_bucket.iter().sum()
    }

    pub fn total_without_bucket(&self) -> u64 {
        self.without_bucket.iter().sum()
    }
}

struct Load<'a> {
    limiter: &'a TokenBucket,
    started: Instant,
    report: LoadReport,
}

#[derive(Clone)]
struct ProduceRequest {
    interval: Duration,
    latency: Uniform<Duration>,
}

impl<'a> Handler<Load<'a>> for ProduceRequest {
    fn call(&self, now: Instant, _state: &mut Load<'a>) -> Vec<Event<Load<'a>>> {
        let latency = self.latency.sample(&mut rand::thread_rng());
        vec![
            Event {
                ready_at: now + self.interval,
                handler: Box::new(self.clone()),
            },
            Event {
                ready_at: now + latency,
                handler: Box::new(Request),
            },
        ]
    }
}

#[derive(Clone)]
struct Request;

impl<'a> Handler<Load<'a>> for Request {
    fn call(&self, now: Instant, state: &mut Load<'a>) -> Vec<Event<Load<'a>>> {
        let second = now.saturating_duration_since(state.started).as_secs() as usize;
        let admitted = state.limiter.allow();
        state.report.record(second, admitted);
        vec![]
    }
}

/// Drives `limiter` with the traffic described by `config` and reports how
/// many requests got through each second.
pub fn run(limiter: &TokenBucket, config: &LoadConfig) -> anyhow::Result<LoadReport> {
    ensure!(config.clients > 0, "at least one client is required");
    ensure!(
        !config.request_interval.is_zero(),
        "request interval must be greater than zero"
    );

    let latency = Uniform::new_inclusive(
        config.latency.saturating_sub(config.jitter),
        config.latency + config.jitter,
    );
    let started = Instant::now();
    let mut load = Load {
        limiter,
        started,
        report: LoadReport::default(),
    };

    // Spread the clients over one request interval.
    let stagger = config.request_interval / config.clients as u32;
    let init_events = (0..config.clients)
        .map(|client| Event {
            ready_at: started + stagger * client as u32,
            handler: Box::new(ProduceRequest {
                interval: config.request_interval,
                latency,
            }) as Box<dyn Handler<Load>>,
        })
        .collect();

    execute(&mut load, init_events, started + config.duration);
    tracing::info!(
        with_bucket = load.report.total_with_bucket(),
        without_bucket = load.report.total_without_bucket(),
        "simulation finished"
    );
    Ok(load.report)
}
