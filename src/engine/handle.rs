// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Lazily-initialized, shareable engine handle.
//!
//! The first [`EngineHandle::get`] runs the factory on the blocking pool.
//! Concurrent callers wait on the same initialization. A failed
//! initialization leaves the handle empty so the next call retries.

use std::fmt;
use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::{debug, warn};

use super::{EngineError, EngineResult, KeyEngine, LocalKeyEngine};

type EngineFactory = dyn Fn() -> EngineResult<Arc<dyn KeyEngine>> + Send + Sync;

/// Cloneable handle; clones share one engine instance.
#[derive(Clone)]
pub struct EngineHandle {
    cell: Arc<OnceCell<Arc<dyn KeyEngine>>>,
    factory: Arc<EngineFactory>,
}

impl EngineHandle {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> EngineResult<Arc<dyn KeyEngine>> + Send + Sync + 'static,
    {
        Self {
            cell: Arc::new(OnceCell::new()),
            factory: Arc::new(factory),
        }
    }

    /// Handle backed by [`LocalKeyEngine`].
    pub fn local() -> Self {
        Self::new(|| Ok(Arc::new(LocalKeyEngine::new()?) as Arc<dyn KeyEngine>))
    }

    /// Handle around an already-built engine.
    pub fn from_engine(engine: Arc<dyn KeyEngine>) -> Self {
        let ready = Arc::clone(&engine);
        Self {
            cell: Arc::new(OnceCell::new_with(Some(engine))),
            factory: Arc::new(move || Ok(Arc::clone(&ready))),
        }
    }

    /// Return the engine, initializing it on first use.
    pub async fn get(&self) -> EngineResult<Arc<dyn KeyEngine>> {
        let engine = self
            .cell
            .get_or_try_init(|| async {
                let factory = Arc::clone(&self.factory);
                let result = tokio::task::spawn_blocking(move || factory())
                    .await
                    .map_err(|e| EngineError::Initialization(format!("initialization task failed: {e}")))?;
                match &result {
                    Ok(_) => debug!("Key engine initialized"),
                    Err(e) => warn!(error = %e, "Key engine initialization failed; will retry on next use"),
                }
                result
            })
            .await?;
        Ok(Arc::clone(engine))
    }

    pub fn is_initialized(&self) -> bool {
        self.cell.initialized()
    }
}

impl Default for EngineHandle {
    fn default() -> Self {
        Self::local()
    }
}

impl fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineHandle")
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn initializes_once_across_clones() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handle = EngineHandle::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(LocalKeyEngine) as Arc<dyn KeyEngine>)
        });
        let clone = handle.clone();

        assert!(!handle.is_initialized());
        handle.get().await.unwrap();
        clone.get().await.unwrap();
        assert!(clone.is_initialized());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_initialization_is_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handle = EngineHandle::new(move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(EngineError::Initialization("first attempt".to_string()))
            } else {
                Ok(Arc::new(LocalKeyEngine) as Arc<dyn KeyEngine>)
            }
        });

        assert!(matches!(handle.get().await, Err(EngineError::Initialization(_))));
        assert!(!handle.is_initialized());
        handle.get().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn from_engine_is_ready() {
        let handle = EngineHandle::from_engine(Arc::new(LocalKeyEngine));
        assert!(handle.is_initialized());
        let engine = handle.get().await.unwrap();
        assert_eq!(engine.generate_mnemonic().unwrap().word_count(), 12);
    }
}
