//! Reservation pools for local RTP ports and session identifiers
//!
//! A value is either reserved or free; reserving checks membership and
//! inserts under one lock, so two concurrent allocations can never hand out
//! the same value. Values go back to the pool only through
//! [`ReservationPool::release`].

use std::collections::HashSet;
use std::hash::Hash;
use std::ops::RangeInclusive;

use parking_lot::Mutex;
use rand::distributions::uniform::SampleUniform;
use rand::Rng;
use tracing::{debug, trace};

use crate::error::{ClientError, ClientResult};

#[derive(Debug)]
pub struct ReservationPool<T> {
    name: &'static str,
    reserved: Mutex<HashSet<T>>,
}

/// Local RTP ports in use by any call
pub type PortPool = ReservationPool<u16>;

/// Session identifiers in use by any call
pub type SessionIdPool = ReservationPool<u32>;

impl<T> ReservationPool<T>
where
    T: Copy + Eq + Hash + PartialOrd + SampleUniform + std::fmt::Debug,
{
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            reserved: Mutex::new(HashSet::new()),
        }
    }

    /// Draw random values from `range` until one is free, reserving it.
    ///
    /// Gives up with `ResourceUnavailable` after `max_attempts` draws or
    /// once every value in the range is taken.
    pub fn reserve_random(&self, range: &RangeInclusive<T>, max_attempts: usize) -> ClientResult<T>
    where
        T: Into<u64>,
    {
        if range.is_empty() {
            return Err(ClientError::resource_unavailable(format!("{} (empty range)", self.name)));
        }
        let capacity = (*range.end()).into() - (*range.start()).into() + 1;
        let mut rng = rand::thread_rng();
        let mut reserved = self.reserved.lock();

        for attempt in 0..max_attempts {
            let taken = reserved.iter().filter(|v| range.contains(v)).count() as u64;
            if taken >= capacity {
                break;
            }
            let candidate = rng.gen_range(range.clone());
            if reserved.insert(candidate) {
                trace!(pool = self.name, value = ?candidate, attempt, "Reserved");
                return Ok(candidate);
            }
        }

        debug!(pool = self.name, in_use = reserved.len(), "Pool exhausted");
        Err(ClientError::resource_unavailable(self.name))
    }

    /// Reserve a specific value, false if already taken
    pub fn reserve(&self, value: T) -> bool {
        self.reserved.lock().insert(value)
    }

    /// Return a value to the pool, false if it was not reserved
    pub fn release(&self, value: T) -> bool {
        let released = self.reserved.lock().remove(&value);
        if released {
            trace!(pool = self.name, value = ?value, "Released");
        }
        released
    }

    pub fn contains(&self, value: T) -> bool {
        self.reserved.lock().contains(&value)
    }

    pub fn len(&self) -> usize {
        self.reserved.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.reserved.lock().is_empty()
    }
}
