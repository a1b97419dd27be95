//! Scripted in-memory connection source for driving the pipeline through
//! each failure edge.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use packline_core::{ConnectionSource, Operation, Release, StoreConnection, StoreError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Which stage should fail on the next invocation.
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub fail_acquire: bool,
    pub fail_begin: bool,
    pub fail_at: Option<usize>,
    pub hang_at: Option<usize>,
    pub fail_commit: bool,
    pub fail_rollback: bool,
    pub fail_release: bool,
}

impl Script {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn fail_at(index: usize) -> Self {
        Self {
            fail_at: Some(index),
            ..Self::default()
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Counters {
    pub acquisitions: usize,
    pub begins: usize,
    pub executed: usize,
    pub commits: usize,
    pub rollbacks: usize,
    pub releases: usize,
    pub discards: usize,
}

struct Shared {
    permits: Arc<Semaphore>,
    acquire_timeout: Duration,
    script: Mutex<Script>,
    committed: Mutex<Vec<String>>,
    executed_labels: Mutex<Vec<String>>,
    acquisitions: AtomicUsize,
    begins: AtomicUsize,
    executed: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
    releases: AtomicUsize,
    discards: AtomicUsize,
}

/// A pool of `size` fake connections. Writes become visible in
/// [`committed`](Self::committed) only after COMMIT.
#[derive(Clone)]
pub struct ScriptedSource {
    shared: Arc<Shared>,
}

impl ScriptedSource {
    pub fn new(size: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                permits: Arc::new(Semaphore::new(size)),
                acquire_timeout: Duration::from_millis(200),
                script: Mutex::new(Script::default()),
                committed: Mutex::new(Vec::new()),
                executed_labels: Mutex::new(Vec::new()),
                acquisitions: AtomicUsize::new(0),
                begins: AtomicUsize::new(0),
                executed: AtomicUsize::new(0),
                commits: AtomicUsize::new(0),
                rollbacks: AtomicUsize::new(0),
                releases: AtomicUsize::new(0),
                discards: AtomicUsize::new(0),
            }),
        }
    }

    pub fn set_script(&self, script: Script) {
        *self.shared.script.lock().unwrap() = script;
    }

    pub fn committed(&self) -> Vec<String> {
        self.shared.committed.lock().unwrap().clone()
    }

    pub fn executed_labels(&self) -> Vec<String> {
        self.shared.executed_labels.lock().unwrap().clone()
    }

    pub fn available(&self) -> usize {
        self.shared.permits.available_permits()
    }

    pub fn counters(&self) -> Counters {
        let s = &self.shared;
        Counters {
            acquisitions: s.acquisitions.load(Ordering::SeqCst),
            begins: s.begins.load(Ordering::SeqCst),
            executed: s.executed.load(Ordering::SeqCst),
            commits: s.commits.load(Ordering::SeqCst),
            rollbacks: s.rollbacks.load(Ordering::SeqCst),
            releases: s.releases.load(Ordering::SeqCst),
            discards: s.discards.load(Ordering::SeqCst),
        }
    }

    fn script(&self) -> Script {
        self.shared.script.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConnectionSource for ScriptedSource {
    type Connection = ScriptedConnection;

    async fn acquire(&self) -> Result<ScriptedConnection, StoreError> {
        let script = self.script();
        if script.fail_acquire {
            return Err(StoreError::backend("connection refused"));
        }

        let permit = tokio::time::timeout(
            self.shared.acquire_timeout,
            self.shared.permits.clone().acquire_owned(),
        )
        .await
        .map_err(|_| StoreError::PoolTimedOut)?
        .map_err(|_| StoreError::PoolClosed)?;

        self.shared.acquisitions.fetch_add(1, Ordering::SeqCst);
        Ok(ScriptedConnection {
            shared: Arc::clone(&self.shared),
            script,
            permit: Some(permit),
            pending: Vec::new(),
            position: 0,
            in_transaction: false,
        })
    }
}

pub struct ScriptedConnection {
    shared: Arc<Shared>,
    script: Script,
    permit: Option<OwnedSemaphorePermit>,
    pending: Vec<String>,
    position: usize,
    in_transaction: bool,
}

impl ScriptedConnection {
    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }
}

#[async_trait]
impl StoreConnection for ScriptedConnection {
    async fn begin(&mut self) -> Result<(), StoreError> {
        self.shared.begins.fetch_add(1, Ordering::SeqCst);
        if self.script.fail_begin {
            return Err(StoreError::backend("server is shutting down"));
        }
        self.in_transaction = true;
        Ok(())
    }

    async fn execute(&mut self, operation: &Operation) -> Result<u64, StoreError> {
        assert!(self.in_transaction, "execute outside a transaction");
        let index = self.position;
        self.position += 1;
        self.shared.executed.fetch_add(1, Ordering::SeqCst);
        self.shared
            .executed_labels
            .lock()
            .unwrap()
            .push(operation.label().to_string());

        if self.script.hang_at == Some(index) {
            std::future::pending::<()>().await;
        }
        if self.script.fail_at == Some(index) {
            return Err(StoreError::backend("constraint violation"));
        }
        self.pending.push(operation.sql().to_string());
        Ok(1)
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        self.shared.commits.fetch_add(1, Ordering::SeqCst);
        if self.script.fail_commit {
            return Err(StoreError::backend("serialization failure"));
        }
        let writes = std::mem::take(&mut self.pending);
        self.shared.committed.lock().unwrap().extend(writes);
        self.in_transaction = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        self.shared.rollbacks.fetch_add(1, Ordering::SeqCst);
        self.pending.clear();
        if self.script.fail_rollback {
            return Err(StoreError::backend("connection reset"));
        }
        self.in_transaction = false;
        Ok(())
    }

    async fn release(mut self, disposition: Release) -> Result<(), StoreError> {
        assert!(self.permit.is_some(), "connection released twice");
        self.shared.releases.fetch_add(1, Ordering::SeqCst);
        if disposition == Release::Discard {
            self.shared.discards.fetch_add(1, Ordering::SeqCst);
        }
        // The slot goes back to the pool even when the release itself fails.
        self.permit.take();
        if self.script.fail_release {
            return Err(StoreError::backend("connection reset during release"));
        }
        Ok(())
    }
}
