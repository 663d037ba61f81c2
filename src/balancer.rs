//! Alias selection across a group: round-robin, uniform random, and
//! weighted random (`4.3`).

use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Which selection policy a [`Balancer`] call uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    RoundRobin,
    Random,
    /// Reserved for future load-aware selection; currently behaves like
    /// [`Strategy::RoundRobin`] (`4.3`: "least-load (reserved; falls
    /// back to round-robin)").
    LeastLoad,
}

/// Per-group round-robin counters plus weighted/uniform random
/// selection, all behind one small surface.
#[derive(Default)]
pub struct Balancer {
    counters: RwLock<HashMap<String, Arc<AtomicU64>>>,
}

impl Balancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Select one element of `options` for `group` under `strategy`.
    /// A single-element input is returned without touching the RNG or
    /// counter; an empty input returns `None`.
    pub fn select<'a>(&self, group: &str, options: &'a [String], strategy: Strategy) -> Option<&'a str> {
        if options.is_empty() {
            return None;
        }
        if options.len() == 1 {
            return Some(options[0].as_str());
        }

        match strategy {
            Strategy::RoundRobin | Strategy::LeastLoad => {
                let idx = self.next_round_robin_index(group, options.len());
                Some(options[idx].as_str())
            }
            Strategy::Random => {
                let idx = rand::thread_rng().gen_range(0..options.len());
                Some(options[idx].as_str())
            }
        }
    }

    /// Weighted random selection: probability proportional to weight.
    /// If every weight is zero, falls back to uniform random. Empty
    /// input yields `None`.
    pub fn select_weighted<'a>(&self, options: &'a [(String, f64)]) -> Option<&'a str> {
        if options.is_empty() {
            return None;
        }
        if options.len() == 1 {
            return Some(options[0].0.as_str());
        }

        let total: f64 = options.iter().map(|(_, w)| w.max(0.0)).sum();
        if total <= 0.0 {
            let idx = rand::thread_rng().gen_range(0..options.len());
            return Some(options[idx].0.as_str());
        }

        let mut pick = rand::thread_rng().gen_range(0.0..total);
        for (name, weight) in options {
            let weight = weight.max(0.0);
            if pick < weight {
                return Some(name.as_str());
            }
            pick -= weight;
        }
        options.last().map(|(name, _)| name.as_str())
    }

    fn next_round_robin_index(&self, group: &str, len: usize) -> usize {
        let counter = self.counter_for(group);
        let idx = counter.fetch_add(1, Ordering::Relaxed);
        (idx % len as u64) as usize
    }

    fn counter_for(&self, group: &str) -> Arc<AtomicU64> {
        if let Some(c) = self.counters.read().unwrap().get(group) {
            return c.clone();
        }
        let mut counters = self.counters.write().unwrap();
        counters.entry(group.to_string()).or_insert_with(|| Arc::new(AtomicU64::new(0))).clone()
    }
}
