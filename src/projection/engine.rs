use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgAdvisoryLock, PgAdvisoryLockGuard, PgAdvisoryLockKey};
use sqlx::{PgPool, Postgres, Transaction};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::Error;
use crate::event::StoredEvent;
use crate::logstore;
use crate::store::{Eventstore, StoreError};
use crate::types::Position;

use super::state::{self, ProjectionState, ProjectionStatus};
use super::{Handler, ProjectionConfig};

/// In-band retries of a batch that failed with a transient error.
const TRANSIENT_RETRIES: u32 = 3;

/// Registry plus worker supervisor for all projections of one process.
pub struct ProjectionEngine {
    pool: PgPool,
    es: Arc<dyn Eventstore>,
    registrations: Vec<Registration>,
    workers: tokio::sync::Mutex<HashMap<&'static str, Worker>>,
}

struct Registration {
    config: ProjectionConfig,
    handler: Arc<Handler>,
}

struct Worker {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Why a worker gave up on its current batch.
enum WorkerFault {
    /// `error_count` crossed `max_errors`: the projection goes to `error`.
    Threshold,
    /// The storage layer is unreachable; retried on the next tick.
    Storage(StoreError),
}

enum WorkerMode {
    Normal,
    /// Catch up from zero; switch the status to `running` once the cursor
    /// passes the head observed at rebuild time.
    Rebuild { until: Position },
}

impl ProjectionEngine {
    pub fn new(pool: PgPool, es: Arc<dyn Eventstore>) -> Self {
        Self {
            pool,
            es,
            registrations: Vec::new(),
            workers: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Registers a handler: runs its one-time init and persists the
    /// bookkeeping row (position 0, stopped) when missing.
    pub async fn register(&mut self, config: ProjectionConfig, handler: Handler) -> Result<(), Error> {
        if self.registrations.iter().any(|r| r.config.name == config.name) {
            return Err(Error::internal(
                "PROJECTION-Reg01",
                format!("projection {} registered twice", config.name),
            ));
        }

        handler.init(&self.pool).await?;
        state::register(&self.pool, config.name).await?;

        self.registrations.push(Registration {
            config,
            handler: Arc::new(handler),
        });
        Ok(())
    }

    /// Starts every registered projection, upstreams before dependents.
    /// Projections flagged `rebuild_on_start` are rebuilt instead.
    pub async fn start_all(&self) -> Result<(), Error> {
        for name in self.topological_order()? {
            let rebuild = self
                .registration(&name)
                .map(|r| r.config.rebuild_on_start)
                .unwrap_or(false);
            if rebuild {
                self.rebuild(&name).await?;
            } else {
                self.start(&name).await?;
            }
        }
        Ok(())
    }

    /// Starts one projection worker. Starting a running projection is a
    /// no-op.
    pub async fn start(&self, name: &str) -> Result<(), Error> {
        let registration = self
            .registration(name)
            .ok_or_else(|| Error::internal("PROJECTION-Strt01", format!("unknown projection {name}")))?;

        let mut workers = self.workers.lock().await;
        if workers.contains_key(registration.config.name) {
            return Ok(());
        }

        state::set_status(&self.pool, name, ProjectionStatus::Running).await?;
        workers.insert(
            registration.config.name,
            self.spawn_worker(registration, WorkerMode::Normal),
        );
        Ok(())
    }

    /// Signals the worker and waits for the current batch to finish.
    pub async fn stop(&self, name: &str) -> Result<(), Error> {
        let worker = self.workers.lock().await.remove(name);
        if let Some(worker) = worker {
            let _ = worker.stop.send(true);
            let _ = worker.task.await;
            state::set_status(&self.pool, name, ProjectionStatus::Stopped).await?;
        }
        Ok(())
    }

    /// Stops the worker, truncates the projection's tables, resets the
    /// cursor to zero and restarts. The status is `rebuilding` until the
    /// worker catches up with the head observed now.
    pub async fn rebuild(&self, name: &str) -> Result<(), Error> {
        let registration = self
            .registration(name)
            .ok_or_else(|| Error::internal("PROJECTION-Rbld01", format!("unknown projection {name}")))?;

        self.stop(name).await?;

        let mut transaction: Transaction<Postgres> = self.pool.begin().await.map_err(StoreError::Sqlx)?;
        for table in &registration.config.tables {
            let _ = sqlx::query(&format!("TRUNCATE {table} CASCADE"))
                .execute(&mut *transaction)
                .await
                .map_err(StoreError::Sqlx)?;
        }
        state::reset_cursor(&mut transaction, name).await?;
        transaction.commit().await.map_err(StoreError::Sqlx)?;
        state::set_status(&self.pool, name, ProjectionStatus::Rebuilding).await?;

        let until = self.es.latest_position(None).await?;
        tracing::info!(projection = name, %until, "rebuilding projection from zero");

        let mut workers = self.workers.lock().await;
        workers.insert(
            registration.config.name,
            self.spawn_worker(registration, WorkerMode::Rebuild { until }),
        );
        Ok(())
    }

    /// Bookkeeping rows of every projection, for operators.
    pub async fn states(&self) -> Result<Vec<ProjectionState>, Error> {
        Ok(state::all(&self.pool).await?)
    }

    fn registration(&self, name: &str) -> Option<&Registration> {
        self.registrations.iter().find(|r| r.config.name == name)
    }

    fn spawn_worker(&self, registration: &Registration, mode: WorkerMode) -> Worker {
        let (stop, stop_rx) = watch::channel(false);
        let pool = self.pool.clone();
        let es = Arc::clone(&self.es);
        let config = registration.config.clone();
        let handler = Arc::clone(&registration.handler);

        let task = tokio::spawn(async move {
            run_worker(pool, es, config, handler, stop_rx, mode).await;
        });

        Worker { stop, task }
    }

    /// Start order honoring `requires` declarations.
    fn topological_order(&self) -> Result<Vec<String>, Error> {
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut in_degree: HashMap<&str, usize> = HashMap::new();

        for registration in &self.registrations {
            in_degree.entry(registration.config.name).or_insert(0);
            for upstream in &registration.config.requires {
                if !self.registrations.iter().any(|r| r.config.name == *upstream) {
                    return Err(Error::internal(
                        "PROJECTION-Topo01",
                        format!("projection {} requires unknown {upstream}", registration.config.name),
                    ));
                }
                dependents.entry(upstream).or_default().push(registration.config.name);
                *in_degree.entry(registration.config.name).or_insert(0) += 1;
            }
        }

        let mut queue: VecDeque<&str> = self
            .registrations
            .iter()
            .map(|r| r.config.name)
            .filter(|name| in_degree[name] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.registrations.len());

        while let Some(name) = queue.pop_front() {
            order.push(name.to_owned());
            for dependent in dependents.get(name).into_iter().flatten() {
                let degree = in_degree.get_mut(dependent).expect("dependent is registered");
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(dependent);
                }
            }
        }

        if order.len() != self.registrations.len() {
            return Err(Error::internal(
                "PROJECTION-Topo02",
                "projection dependencies form a cycle",
            ));
        }
        Ok(order)
    }
}

async fn run_worker(
    pool: PgPool,
    es: Arc<dyn Eventstore>,
    config: ProjectionConfig,
    handler: Arc<Handler>,
    mut stop_rx: watch::Receiver<bool>,
    mode: WorkerMode,
) {
    let mut subscription = es.subscribe();
    let mut rebuild_until = match mode {
        WorkerMode::Normal => None,
        WorkerMode::Rebuild { until } => Some(until),
    };

    loop {
        if *stop_rx.borrow() {
            break;
        }

        match process_batch(&pool, es.as_ref(), &config, handler.as_ref()).await {
            Ok(0) => {
                if let Some(until) = rebuild_until {
                    if let Ok(state) = state::get(&pool, config.name).await {
                        if state.position >= until {
                            let _ = state::set_status(&pool, config.name, ProjectionStatus::Running).await;
                            rebuild_until = None;
                            tracing::info!(projection = config.name, "rebuild caught up");
                        }
                    }
                }

                tokio::select! {
                    _ = stop_rx.changed() => {}
                    _ = subscription.recv() => {}
                    _ = tokio::time::sleep(config.poll_interval) => {}
                }
            }
            Ok(_) => {}
            Err(WorkerFault::Threshold) => {
                let _ = state::set_status(&pool, config.name, ProjectionStatus::Error).await;
                tracing::error!(projection = config.name, "error threshold reached, stopping worker");
                break;
            }
            Err(WorkerFault::Storage(err)) => {
                tracing::error!(projection = config.name, error = %err, "batch failed on storage, backing off");
                tokio::select! {
                    _ = stop_rx.changed() => {}
                    _ = tokio::time::sleep(config.poll_interval) => {}
                }
            }
        }
    }
}

/// Guard owning both the advisory lock and the connection it is held on.
/// The lock is released when the guard drops.
#[ouroboros::self_referencing]
struct ProjectionLockGuard {
    lock: PgAdvisoryLock,
    #[borrows(lock)]
    #[covariant]
    guard: PgAdvisoryLockGuard<'this, PoolConnection<Postgres>>,
}

async fn acquire_lock(pool: &PgPool, name: &str) -> Result<ProjectionLockGuard, StoreError> {
    let connection = pool.acquire().await?;
    let guard = ProjectionLockGuardAsyncSendTryBuilder {
        lock: PgAdvisoryLock::with_key(PgAdvisoryLockKey::BigInt(lock_key(name))),
        guard_builder: |lock: &PgAdvisoryLock| Box::pin(async move { lock.acquire(connection).await }),
    }
    .try_build()
    .await?;
    Ok(guard)
}

/// FNV-1a over the projection name, so every replica derives the same
/// advisory-lock key.
fn lock_key(name: &str) -> i64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in name.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash as i64
}

#[tracing::instrument(skip_all, fields(projection = config.name))]
async fn process_batch(
    pool: &PgPool,
    es: &dyn Eventstore,
    config: &ProjectionConfig,
    handler: &Handler,
) -> Result<usize, WorkerFault> {
    let _lock = if config.enable_locking {
        Some(acquire_lock(pool, config.name).await.map_err(WorkerFault::Storage)?)
    } else {
        None
    };

    let state = state::get(pool, config.name).await.map_err(WorkerFault::Storage)?;
    let events = es
        .filter(&config.filter_after(state.position))
        .await
        .map_err(WorkerFault::Storage)?;
    if events.is_empty() {
        return Ok(0);
    }

    let started = Instant::now();
    let mut attempts: u32 = 0;
    loop {
        match apply_batch(pool, config, handler, &events).await {
            Ok(()) => {
                tracing::debug!(events = events.len(), "batch applied");
                logstore::record_execution(
                    pool,
                    &events[0].instance_id,
                    "projection.batch",
                    started.elapsed(),
                    serde_json::json!({ "projection": config.name, "events": events.len() }),
                )
                .await;
                return Ok(events.len());
            }
            Err((index, error)) => {
                if is_transient(&error) && attempts < TRANSIENT_RETRIES {
                    attempts += 1;
                    tracing::warn!(attempts, error = %error, "transient batch failure, retrying in-band");
                    continue;
                }

                let event: &StoredEvent = &events[index];
                tracing::error!(
                    event_type = %event.event_type,
                    position = %event.position,
                    error = %error,
                    "event failed, recording in failed_events"
                );
                let error_count = state::record_failure(pool, config.name, event, &error.to_string(), attempts as i32)
                    .await
                    .map_err(WorkerFault::Storage)?;

                if error_count >= config.max_errors as i32 {
                    return Err(WorkerFault::Threshold);
                }
                // The cursor did not advance: the batch is retried on the
                // next tick.
                return Ok(0);
            }
        }
    }
}

/// Applies one batch in a single transaction: every event through the
/// handler, then the cursor, then commit. Returns the index of the failing
/// event on error.
async fn apply_batch(
    pool: &PgPool,
    config: &ProjectionConfig,
    handler: &Handler,
    events: &[StoredEvent],
) -> Result<(), (usize, Error)> {
    let mut transaction: Transaction<Postgres> =
        pool.begin().await.map_err(|e| (0, Error::from(StoreError::Sqlx(e))))?;

    for (index, event) in events.iter().enumerate() {
        handler
            .reduce(event, &mut transaction)
            .await
            .map_err(|error| (index, error))?;
    }

    let last = events.last().expect("apply_batch is never called with an empty batch");
    state::advance_cursor(&mut *transaction, config.name, last.position)
        .await
        .map_err(|e| (events.len() - 1, Error::from(e)))?;

    transaction
        .commit()
        .await
        .map_err(|e| (events.len() - 1, Error::from(StoreError::Sqlx(e))))?;
    Ok(())
}

fn is_transient(error: &Error) -> bool {
    match error {
        Error::Storage(StoreError::Sqlx(err)) => match err {
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
            sqlx::Error::Database(db) => {
                // serialization_failure, deadlock_detected
                matches!(db.code().as_deref(), Some("40001") | Some("40P01"))
            }
            _ => false,
        },
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::lock_key;

    #[test]
    fn lock_keys_are_stable_and_distinct() {
        assert_eq!(lock_key("orgs"), lock_key("orgs"));
        assert_ne!(lock_key("orgs"), lock_key("users"));
    }

    #[tokio::test]
    async fn topological_order_respects_requires() {
        use crate::projection::{Handler, ProjectionConfig};
        use crate::store::memory::InMemoryEventStore;

        // The engine only needs a pool for IO; ordering is pure, so a lazy
        // pool that never connects is enough here.
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(1)
            .connect_lazy("postgres://localhost/unused")
            .unwrap();

        let mut engine = super::ProjectionEngine::new(pool, Arc::new(InMemoryEventStore::new()));

        struct Noop;
        #[async_trait::async_trait]
        impl crate::projection::DeclarativeHandler for Noop {
            async fn init(&self, _pool: &sqlx::PgPool) -> Result<(), crate::error::Error> {
                Ok(())
            }
            fn project(
                &self,
                _event: &crate::event::StoredEvent,
            ) -> Result<Vec<crate::projection::RowOp>, crate::error::Error> {
                Ok(vec![])
            }
        }

        let config = |name: &'static str, requires: Vec<&'static str>| {
            ProjectionConfig::builder()
                .name(name)
                .tables(vec![])
                .requires(requires)
                .build()
        };

        // Bypass register() to keep the test off the database.
        engine.registrations.push(super::Registration {
            config: config("members", vec!["users", "orgs"]),
            handler: Arc::new(Handler::Declarative(Box::new(Noop))),
        });
        engine.registrations.push(super::Registration {
            config: config("orgs", vec![]),
            handler: Arc::new(Handler::Declarative(Box::new(Noop))),
        });
        engine.registrations.push(super::Registration {
            config: config("users", vec![]),
            handler: Arc::new(Handler::Declarative(Box::new(Noop))),
        });

        let order = engine.topological_order().unwrap();
        let position = |name: &str| order.iter().position(|n| n == name).unwrap();
        assert!(position("orgs") < position("members"));
        assert!(position("users") < position("members"));
    }

    #[tokio::test]
    async fn unknown_upstream_is_rejected() {
        use crate::projection::{Handler, ProjectionConfig};
        use crate::store::memory::InMemoryEventStore;

        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(1)
            .connect_lazy("postgres://localhost/unused")
            .unwrap();
        let mut engine = super::ProjectionEngine::new(pool, Arc::new(InMemoryEventStore::new()));

        struct Noop;
        #[async_trait::async_trait]
        impl crate::projection::DeclarativeHandler for Noop {
            async fn init(&self, _pool: &sqlx::PgPool) -> Result<(), crate::error::Error> {
                Ok(())
            }
            fn project(
                &self,
                _event: &crate::event::StoredEvent,
            ) -> Result<Vec<crate::projection::RowOp>, crate::error::Error> {
                Ok(vec![])
            }
        }

        engine.registrations.push(super::Registration {
            config: ProjectionConfig::builder()
                .name("members")
                .tables(vec![])
                .requires(vec!["ghost"])
                .build(),
            handler: Arc::new(Handler::Declarative(Box::new(Noop))),
        });

        assert!(engine.topological_order().is_err());
    }
}
