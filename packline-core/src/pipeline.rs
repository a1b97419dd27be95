//! Transactional write pipeline.
//!
//! Runs an ordered list of [`Operation`]s on one pooled connection inside a
//! single transaction. Either every operation is committed or the
//! transaction is rolled back; the connection goes back to its source
//! exactly once on every path that acquired it.
//!
//! ```text
//! IDLE -> ACQUIRING -> ACQUIRE_FAILED
//!                   -> ACQUIRED -> BEGINNING -> BEGIN_FAILED
//!                                            -> IN_TRANSACTION -> ABORTING -> ROLLED_BACK
//!                                                              -> COMMITTING -> COMMITTED
//!                                                                            -> ABORTING
//! ```

use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn, Instrument};
use uuid::Uuid;

use crate::connection::{ConnectionSource, Release, StoreConnection};
use crate::error::{PipelineError, StoreError};
use crate::operation::Operation;

/// Where an invocation is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineState {
    Idle,
    Acquiring,
    AcquireFailed,
    Acquired,
    Beginning,
    BeginFailed,
    InTransaction,
    Committing,
    Committed,
    Aborting,
    RolledBack,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PipelineState::AcquireFailed
                | PipelineState::BeginFailed
                | PipelineState::Committed
                | PipelineState::RolledBack
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PipelineState::Idle => "IDLE",
            PipelineState::Acquiring => "ACQUIRING",
            PipelineState::AcquireFailed => "ACQUIRE_FAILED",
            PipelineState::Acquired => "ACQUIRED",
            PipelineState::Beginning => "BEGINNING",
            PipelineState::BeginFailed => "BEGIN_FAILED",
            PipelineState::InTransaction => "IN_TRANSACTION",
            PipelineState::Committing => "COMMITTING",
            PipelineState::Committed => "COMMITTED",
            PipelineState::Aborting => "ABORTING",
            PipelineState::RolledBack => "ROLLED_BACK",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tuning knobs for a pipeline.
#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    /// Deadline for each individual operation. Expiry aborts the
    /// transaction. COMMIT is never subject to it.
    pub statement_timeout: Option<Duration>,
}

impl PipelineOptions {
    pub fn with_statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = Some(timeout);
        self
    }
}

/// Acknowledgment returned once COMMIT succeeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub id: Uuid,
    pub operations: usize,
    pub rows_affected: u64,
    pub elapsed: Duration,
}

/// Executes operation lists atomically against an injected connection
/// source.
#[derive(Debug, Clone)]
pub struct TransactionPipeline<P> {
    source: P,
    options: PipelineOptions,
}

impl<P: ConnectionSource> TransactionPipeline<P> {
    pub fn new(source: P) -> Self {
        Self::with_options(source, PipelineOptions::default())
    }

    pub fn with_options(source: P, options: PipelineOptions) -> Self {
        Self { source, options }
    }

    pub fn source(&self) -> &P {
        &self.source
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Run `operations` in order inside one transaction.
    pub async fn execute(&self, operations: &[Operation]) -> Result<Receipt, PipelineError> {
        self.run(operations, None).await
    }

    /// Like [`execute`](Self::execute), but stops when `cancel` fires.
    ///
    /// Cancellation while an operation is running aborts the transaction:
    /// the rollback is awaited and the connection released before this
    /// returns. A commit already in progress is allowed to finish.
    pub async fn execute_with_cancel(
        &self,
        operations: &[Operation],
        cancel: &CancellationToken,
    ) -> Result<Receipt, PipelineError> {
        self.run(operations, Some(cancel)).await
    }

    async fn run(
        &self,
        operations: &[Operation],
        cancel: Option<&CancellationToken>,
    ) -> Result<Receipt, PipelineError> {
        if operations.is_empty() {
            return Err(PipelineError::EmptyOperationList);
        }

        let id = Uuid::new_v4();
        let span = tracing::debug_span!("pipeline", %id, operations = operations.len());
        self.run_inner(id, operations, cancel).instrument(span).await
    }

    async fn run_inner(
        &self,
        id: Uuid,
        operations: &[Operation],
        cancel: Option<&CancellationToken>,
    ) -> Result<Receipt, PipelineError> {
        let started = Instant::now();
        let mut tracker = Tracker::new();

        tracker.advance(PipelineState::Acquiring);
        let acquired = match until_cancelled(cancel, self.source.acquire()).await {
            Some(result) => result,
            None => {
                tracker.advance(PipelineState::AcquireFailed);
                return Err(PipelineError::Cancelled {
                    index: 0,
                    state: PipelineState::AcquireFailed,
                });
            }
        };
        let mut conn = match acquired {
            Ok(conn) => conn,
            Err(source) => {
                tracker.advance(PipelineState::AcquireFailed);
                warn!(error = %source, "could not acquire connection");
                return Err(match source {
                    StoreError::PoolTimedOut => PipelineError::PoolExhausted { source },
                    source => PipelineError::ConnectionError { source },
                });
            }
        };
        tracker.advance(PipelineState::Acquired);

        tracker.advance(PipelineState::Beginning);
        if let Err(source) = conn.begin().await {
            tracker.advance(PipelineState::BeginFailed);
            warn!(error = %source, "BEGIN rejected");
            // A half-opened transaction must not be handed to the next caller.
            release(conn, Release::Discard).await;
            return Err(PipelineError::TransactionStartError { source });
        }
        tracker.advance(PipelineState::InTransaction);

        let mut rows_affected = 0u64;
        for (index, operation) in operations.iter().enumerate() {
            trace!(index, label = operation.label(), "executing operation");
            let outcome = until_cancelled(cancel, self.run_operation(&mut conn, operation)).await;
            let failure = match outcome {
                Some(Ok(rows)) => {
                    rows_affected += rows;
                    continue;
                }
                Some(Err(source)) => PipelineError::OperationFailed {
                    index,
                    label: operation.label().to_string(),
                    source,
                },
                None => PipelineError::Cancelled {
                    index,
                    state: PipelineState::RolledBack,
                },
            };
            return Err(abort(conn, &mut tracker, failure).await);
        }

        tracker.advance(PipelineState::Committing);
        if let Err(source) = conn.commit().await {
            return Err(abort(conn, &mut tracker, PipelineError::CommitFailed { source }).await);
        }
        tracker.advance(PipelineState::Committed);
        release(conn, Release::Reuse).await;

        let receipt = Receipt {
            id,
            operations: operations.len(),
            rows_affected,
            elapsed: started.elapsed(),
        };
        debug!(
            rows_affected = receipt.rows_affected,
            elapsed_ms = receipt.elapsed.as_millis() as u64,
            "transaction committed"
        );
        Ok(receipt)
    }

    async fn run_operation(
        &self,
        conn: &mut P::Connection,
        operation: &Operation,
    ) -> Result<u64, StoreError> {
        match self.options.statement_timeout {
            Some(limit) => tokio::time::timeout(limit, conn.execute(operation))
                .await
                .map_err(|_| StoreError::TimedOut(limit))?,
            None => conn.execute(operation).await,
        }
    }
}

/// Roll back, release, and hand the original failure back to the caller.
async fn abort<C: StoreConnection>(
    mut conn: C,
    tracker: &mut Tracker,
    failure: PipelineError,
) -> PipelineError {
    tracker.advance(PipelineState::Aborting);
    warn!(error = %failure, "aborting transaction");

    let disposition = match conn.rollback().await {
        Ok(()) => Release::Reuse,
        Err(err) => {
            error!(error = %err, "rollback failed, discarding connection");
            Release::Discard
        }
    };
    tracker.advance(PipelineState::RolledBack);
    release(conn, disposition).await;
    failure
}

async fn release<C: StoreConnection>(conn: C, disposition: Release) {
    if let Err(err) = conn.release(disposition).await {
        error!(error = %err, ?disposition, "failed to release connection");
    }
}

/// `None` if `cancel` fires before `fut` completes.
async fn until_cancelled<F: Future>(
    cancel: Option<&CancellationToken>,
    fut: F,
) -> Option<F::Output> {
    match cancel {
        Some(token) => tokio::select! {
            biased;
            _ = token.cancelled() => None,
            output = fut => Some(output),
        },
        None => Some(fut.await),
    }
}

struct Tracker {
    state: PipelineState,
}

impl Tracker {
    fn new() -> Self {
        Self {
            state: PipelineState::Idle,
        }
    }

    fn advance(&mut self, next: PipelineState) {
        trace!(from = %self.state, to = %next, "pipeline transition");
        debug_assert!(!self.state.is_terminal(), "transition out of terminal state");
        self.state = next;
    }
}
