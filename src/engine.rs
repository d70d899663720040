//! Shared engine context
//!
//! An [`Engine`] is passed to every walker and dispatcher constructor. It
//! carries the backend connector that workers open their sessions with, and
//! counts the worker pools currently alive so a runaway caller cannot open
//! an unbounded number of them.

use crate::backend::Connector;
use crate::error::{PoolError, PoolResult};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Default limit on simultaneously open worker pools
pub const DEFAULT_MAX_POOLS: usize = 32;

/// Engine context: backend connector plus pool accounting
#[derive(Clone)]
pub struct Engine {
    connector: Arc<dyn Connector>,
    live_pools: Arc<AtomicUsize>,
    max_pools: usize,
}

impl Engine {
    /// Create an engine around a backend connector
    pub fn new(connector: impl Connector) -> Self {
        Self::with_connector(Arc::new(connector))
    }

    /// Create an engine around a shared connector
    pub fn with_connector(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            live_pools: Arc::new(AtomicUsize::new(0)),
            max_pools: DEFAULT_MAX_POOLS,
        }
    }

    /// Override the pool limit
    pub fn with_max_pools(mut self, max_pools: usize) -> Self {
        self.max_pools = max_pools;
        self
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::clone(&self.connector)
    }

    /// Number of worker pools currently open
    pub fn live_pools(&self) -> usize {
        self.live_pools.load(Ordering::SeqCst)
    }

    pub(crate) fn register_pool(&self) -> PoolResult<PoolSlot> {
        let max = self.max_pools;
        self.live_pools
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n < max {
                    Some(n + 1)
                } else {
                    None
                }
            })
            .map_err(|_| PoolError::TooManyPools { max })?;

        Ok(PoolSlot {
            live_pools: Arc::clone(&self.live_pools),
        })
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("live_pools", &self.live_pools())
            .field("max_pools", &self.max_pools)
            .finish()
    }
}

/// A registered pool; releases its slot when dropped
#[derive(Debug)]
pub(crate) struct PoolSlot {
    live_pools: Arc<AtomicUsize>,
}

impl Drop for PoolSlot {
    fn drop(&mut self) {
        self.live_pools.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;

    #[test]
    fn test_pool_slots_are_limited_and_released() {
        let engine = Engine::new(MemoryBackend::new().connector()).with_max_pools(2);
        let a = engine.register_pool().unwrap();
        let _b = engine.register_pool().unwrap();
        assert!(matches!(
            engine.register_pool(),
            Err(PoolError::TooManyPools { max: 2 })
        ));
        drop(a);
        assert_eq!(engine.live_pools(), 1);
        assert!(engine.register_pool().is_ok());
    }
}
