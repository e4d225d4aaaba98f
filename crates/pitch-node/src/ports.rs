//! Port pool — fixed-capacity admission control for one node.
//!
//! Each active match owns one triple of adjacent ports (primary, coach,
//! observer). The pool is the node's sole backpressure point: when it is
//! empty, admission is rejected and the dispatch message gets requeued.
//!
//! All mutation happens under one mutex held only for the pop/push
//! itself, never across job execution. An explicit `assigned` set makes
//! release idempotent-safe: returning a triple that is not currently
//! leased is dropped with a warning instead of growing the pool.

use std::collections::HashSet;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{NodeError, NodeResult};

/// First primary port handed out.
pub const BASE_PORT: u16 = 6000;

/// Spacing between consecutive triples' primary ports.
const PORT_STRIDE: u16 = 10;

/// Largest capacity whose last triple still fits in the u16 port range.
pub const MAX_CAPACITY: u32 =
    (u16::MAX as u32 - 2 - BASE_PORT as u32) / PORT_STRIDE as u32 + 1;

/// Three adjacent ports one match's server process binds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortTriple {
    pub primary: u16,
    pub coach: u16,
    pub observer: u16,
}

impl PortTriple {
    fn from_base(base: u16) -> Self {
        Self {
            primary: base,
            coach: base + 1,
            observer: base + 2,
        }
    }
}

struct PoolInner {
    free: Vec<PortTriple>,
    /// Primary ports currently leased out.
    assigned: HashSet<u16>,
    capacity: u32,
}

/// Fixed-capacity allocator of port triples.
pub struct PortPool {
    inner: Mutex<PoolInner>,
}

impl PortPool {
    /// Create a pool of `capacity` triples starting at [`BASE_PORT`],
    /// spaced [`PORT_STRIDE`] apart. Capacities past [`MAX_CAPACITY`]
    /// are clamped so the port arithmetic stays inside u16.
    pub fn new(capacity: u32) -> Self {
        let capacity = Self::clamp_capacity(capacity);
        Self {
            inner: Mutex::new(PoolInner {
                free: Self::build_triples(capacity),
                assigned: HashSet::new(),
                capacity,
            }),
        }
    }

    fn clamp_capacity(capacity: u32) -> u32 {
        if capacity > MAX_CAPACITY {
            warn!(capacity, max = MAX_CAPACITY, "pool capacity clamped");
            MAX_CAPACITY
        } else {
            capacity
        }
    }

    fn build_triples(capacity: u32) -> Vec<PortTriple> {
        (0..capacity)
            .map(|i| PortTriple::from_base(BASE_PORT + i as u16 * PORT_STRIDE))
            .rev()
            .collect()
    }

    /// Pop one free triple in O(1), or `None` when exhausted.
    ///
    /// Never blocks; a rejected admission is the caller's signal to
    /// requeue the dispatch.
    pub fn acquire(&self) -> Option<PortTriple> {
        let mut inner = self.inner.lock();
        let triple = inner.free.pop()?;
        inner.assigned.insert(triple.primary);
        debug!(port = triple.primary, "port triple acquired");
        Some(triple)
    }

    /// Return a leased triple to the pool.
    ///
    /// A triple that is not currently assigned is ignored — a
    /// double-release can never inflate capacity.
    pub fn release(&self, triple: PortTriple) {
        let mut inner = self.inner.lock();
        if inner.assigned.remove(&triple.primary) {
            inner.free.push(triple);
            debug!(port = triple.primary, "port triple released");
        } else {
            warn!(port = triple.primary, "release of unassigned port triple ignored");
        }
    }

    /// Reinitialize the pool to `capacity` fresh triples.
    ///
    /// Only valid with zero active leases; resizing under running jobs
    /// is rejected.
    pub fn resize(&self, capacity: u32) -> NodeResult<()> {
        let capacity = Self::clamp_capacity(capacity);
        let mut inner = self.inner.lock();
        if !inner.assigned.is_empty() {
            return Err(NodeError::PoolBusy(inner.assigned.len()));
        }
        inner.free = Self::build_triples(capacity);
        inner.capacity = capacity;
        debug!(capacity, "port pool resized");
        Ok(())
    }

    /// Number of free triples.
    pub fn available(&self) -> usize {
        self.inner.lock().free.len()
    }

    /// Number of leased triples.
    pub fn active(&self) -> usize {
        self.inner.lock().assigned.len()
    }

    /// Configured capacity.
    pub fn capacity(&self) -> u32 {
        self.inner.lock().capacity
    }
}
