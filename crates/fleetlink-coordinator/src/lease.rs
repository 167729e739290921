//! Execution node leasing.
//!
//! A fixed pool of execution nodes is leased to simulated entities for
//! their lifetime and returned on despawn. The registry keeps the
//! entity-to-node mapping bidirectional and hands out free nodes in FIFO
//! order, so a node that was just released is the last to be reused.
//!
//! # Invariants
//!
//! - An entity holds at most one node and a node serves at most one
//!   entity.
//! - `free + leased == inventory` at all times; nodes are never created or
//!   destroyed after construction.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Mutex, PoisonError},
};

#[derive(Debug, Default)]
struct LeaseTables {
    free: VecDeque<u32>,
    by_entity: HashMap<String, u32>,
    by_node: HashMap<u32, String>,
}

/// Bidirectional entity-to-node lease registry over a fixed inventory.
#[derive(Debug)]
pub struct NodeLeaseRegistry {
    inner: Mutex<LeaseTables>,
    inventory: usize,
}

impl NodeLeaseRegistry {
    /// Create a registry over nodes `0..node_count`, all free.
    pub fn new(node_count: usize) -> Self {
        let tables = LeaseTables {
            free: (0..node_count as u32).collect(),
            ..LeaseTables::default()
        };
        Self { inner: Mutex::new(tables), inventory: node_count }
    }

    /// Lease a node to `entity`, FIFO from the free pool.
    ///
    /// Idempotent: an entity that already holds a lease gets the same node
    /// back. Returns `None` when the pool is exhausted.
    pub fn assign(&self, entity: &str) -> Option<u32> {
        let mut tables = self.lock();
        if let Some(node) = tables.by_entity.get(entity) {
            return Some(*node);
        }
        let node = tables.free.pop_front()?;
        tables.by_entity.insert(entity.to_owned(), node);
        tables.by_node.insert(node, entity.to_owned());
        Some(node)
    }

    /// Return `entity`'s node to the back of the free pool.
    ///
    /// Returns the released node, or `None` if the entity held no lease.
    pub fn release(&self, entity: &str) -> Option<u32> {
        let mut tables = self.lock();
        let node = tables.by_entity.remove(entity)?;
        tables.by_node.remove(&node);
        tables.free.push_back(node);
        Some(node)
    }

    /// Node currently leased to `entity`.
    pub fn node_of(&self, entity: &str) -> Option<u32> {
        self.lock().by_entity.get(entity).copied()
    }

    /// Entity currently holding `node`.
    pub fn entity_of(&self, node: u32) -> Option<String> {
        self.lock().by_node.get(&node).cloned()
    }

    /// Number of nodes available for leasing.
    pub fn free_count(&self) -> usize {
        self.lock().free.len()
    }

    /// Number of nodes currently leased.
    pub fn lease_count(&self) -> usize {
        self.lock().by_entity.len()
    }

    /// Total node inventory, leased or not.
    pub fn inventory_size(&self) -> usize {
        self.inventory
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LeaseTables> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
