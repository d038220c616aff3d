use crate::job::{
    dead_key, delay_key, queue_from_running_key, running_key, unix_now, DeadJob, JobEnvelope,
};
use crate::storage::Storage;
use crate::{LazyqError, Result};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Tick interval shared by the delay scheduler and the dead-job cleaner.
const TICK_INTERVAL: Duration = Duration::from_secs(1);

pub type HandleFunc =
    Arc<dyn Fn(Vec<u8>) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub struct ServerOptions {
    /// Upper bound on a single blocking fetch; also bounds how long a
    /// shutdown request can go unnoticed while the running lists are empty.
    pub fetch_timeout: Duration,
    /// Per-job execution deadline. Zero means unbounded.
    pub job_timeout: Duration,
    /// How long dead jobs are retained before the cleaner removes them.
    pub dead_job_ttl: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(10),
            job_timeout: Duration::from_secs(3),
            dead_job_ttl: Duration::from_secs(60 * 60),
        }
    }
}

/// The dispatch core: pops jobs from registered queues and runs them against
/// their handlers, with delayed-job promotion and dead-letter cleanup running
/// as periodic background tasks.
///
/// Lifecycle: handlers are registered while the server is being built, then
/// [`run`](Server::run) makes a one-way transition into the running state and
/// loops until [`graceful_stop`](Server::graceful_stop) is called or a fatal
/// storage error occurs. In both cases in-flight jobs are drained, never
/// killed.
pub struct Server<S> {
    options: ServerOptions,
    storage: Arc<S>,
    handlers: Arc<RwLock<HashMap<String, HandleFunc>>>,
    running: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
    server_id: String,
}

impl<S: Storage + 'static> Server<S> {
    pub fn new(storage: S) -> Self {
        Self::with_options(storage, ServerOptions::default())
    }

    pub fn with_options(storage: S, options: ServerOptions) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            options,
            storage: Arc::new(storage),
            handlers: Arc::new(RwLock::new(HashMap::new())),
            running: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            workers: Arc::new(Mutex::new(Vec::new())),
            server_id: Uuid::new_v4().to_string(),
        }
    }

    /// Associate a handler with a queue name. Exactly one handler per queue;
    /// registering again for the same name replaces the previous handler.
    ///
    /// Valid only before [`run`](Server::run): once the server is running the
    /// registration table is frozen and this fails with `AlreadyRunning`.
    pub async fn register<F, Fut>(&self, queue: &str, handler: F) -> Result<()>
    where
        F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let mut handlers = self.handlers.write().await;

        // Checked under the table's write lock: run() flips the flag while
        // holding the same lock, so a registration either lands before the
        // queue list is snapshotted or fails here.
        if self.running.load(Ordering::SeqCst) {
            return Err(LazyqError::AlreadyRunning);
        }

        let handler: HandleFunc = Arc::new(move |payload| Box::pin(handler(payload)));
        handlers.insert(queue.to_string(), handler);
        drop(handlers);

        info!("registered handler for queue {}", queue);
        Ok(())
    }

    /// Registered queue names, for read-only consumers such as a dashboard.
    pub async fn queues(&self) -> Vec<String> {
        self.handlers.read().await.keys().cloned().collect()
    }

    /// Run the dispatch loop until shutdown.
    ///
    /// Spawns one delay scheduler and one dead-job cleaner per registered
    /// queue, then fetches and dispatches jobs. Returns `Ok(())` on a
    /// graceful shutdown, or the triggering error after a fatal storage
    /// failure; either way every spawned task has finished by the time this
    /// returns.
    pub async fn run(&self) -> Result<()> {
        // The one-way Building -> Running transition happens under the
        // handler table's write lock so the flag flip and the table freeze
        // are a single step with respect to register().
        let queues: Vec<String> = {
            let handlers = self.handlers.write().await;
            if handlers.is_empty() {
                return Err(LazyqError::NothingToWork);
            }
            if self
                .running
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return Err(LazyqError::AlreadyRunning);
            }
            handlers.keys().cloned().collect()
        };

        info!(
            "server {} starting with {} queue(s)",
            self.server_id,
            queues.len()
        );

        let mut periodic = Vec::with_capacity(queues.len() * 2);
        for queue in &queues {
            let srv = self.clone();
            let name = queue.clone();
            periodic.push(tokio::spawn(async move {
                srv.delay_job_scheduler(name).await;
            }));

            let srv = self.clone();
            let name = queue.clone();
            periodic.push(tokio::spawn(async move {
                srv.dead_job_cleaner(name).await;
            }));
        }

        let keys: Vec<String> = queues.iter().map(|q| running_key(q)).collect();
        let result = self.dispatch_loop(&keys).await;

        // Draining: the loop no longer pops; periodic tasks exit at their
        // next shutdown check and in-flight workers run to completion.
        futures::future::join_all(periodic).await;
        let workers: Vec<_> = self.workers.lock().await.drain(..).collect();
        futures::future::join_all(workers).await;

        info!("server {} stopped", self.server_id);
        result
    }

    /// Request shutdown. Idempotent: the signal fires exactly once no matter
    /// how many tasks call this concurrently. Unblocks a pending fetch and
    /// lets [`run`](Server::run) drain and return.
    pub fn graceful_stop(&self) {
        if !self.shutdown.swap(true, Ordering::SeqCst) {
            info!("server {} shutting down", self.server_id);
            let _ = self.shutdown_tx.send(());
        }
    }

    async fn dispatch_loop(&self, keys: &[String]) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return Ok(());
            }

            let popped = tokio::select! {
                _ = shutdown_rx.recv() => return Ok(()),
                popped = self.storage.blocking_pop(keys, self.options.fetch_timeout) => popped,
            };

            match popped {
                // Fetch timeout with nothing available; loop to re-check shutdown.
                Ok(None) => continue,
                Ok(Some((key, raw))) => {
                    let queue = queue_from_running_key(&key).to_string();
                    let envelope: JobEnvelope = match serde_json::from_str(&raw) {
                        Ok(envelope) => envelope,
                        Err(e) => {
                            error!("failed to decode job envelope from {}: {}", key, e);
                            self.graceful_stop();
                            return Err(LazyqError::Deserialization(e.to_string()));
                        }
                    };

                    debug!("dispatching job from queue {}", queue);

                    let srv = self.clone();
                    let handle = tokio::spawn(async move {
                        srv.handle_job(queue, envelope).await;
                    });

                    let mut workers = self.workers.lock().await;
                    workers.retain(|h| !h.is_finished());
                    workers.push(handle);
                }
                Err(e) => {
                    error!("storage failure while fetching jobs: {}", e);
                    self.graceful_stop();
                    return Err(e);
                }
            }
        }
    }

    /// Execute one job: exactly one attempt, dead-lettered on failure.
    async fn handle_job(&self, queue: String, mut job: JobEnvelope) {
        let handler = self.handlers.read().await.get(&queue).cloned();
        let Some(handler) = handler else {
            // Only reachable if the store yields a key we never registered.
            warn!("no handler registered for queue {}", queue);
            job.attempts += 1;
            self.add_dead_job(
                &queue,
                job,
                &LazyqError::Handler(format!("no handler registered for queue {}", queue)),
            )
            .await;
            return;
        };

        job.attempts += 1;

        let fut = handler(job.payload.clone());
        let result = if self.options.job_timeout.is_zero() {
            fut.await
        } else {
            match tokio::time::timeout(self.options.job_timeout, fut).await {
                Ok(result) => result,
                Err(_) => Err(LazyqError::HandlerTimeout),
            }
        };

        if let Err(e) = result {
            self.add_dead_job(&queue, job, &e).await;
        }
    }

    /// Record a failed job in the dead set, scored by failure time. A job that
    /// cannot be recorded would vanish without trace, so failure here takes
    /// the whole server down.
    async fn add_dead_job(&self, queue: &str, job: JobEnvelope, reason: &LazyqError) {
        warn!(
            "job in queue {} failed after {} attempt(s): {}",
            queue, job.attempts, reason
        );

        let dead = DeadJob {
            job,
            reason: reason.to_string(),
        };
        let raw = match serde_json::to_string(&dead) {
            Ok(raw) => raw,
            Err(e) => {
                error!("failed to serialize dead job for queue {}: {}", queue, e);
                self.graceful_stop();
                return;
            }
        };

        if let Err(e) = self
            .storage
            .add_scored(&dead_key(queue), unix_now(), &raw)
            .await
        {
            error!("failed to record dead job for queue {}: {}", queue, e);
            self.graceful_stop();
        }
    }

    /// Promote due delay-set entries to the running list, once per tick.
    ///
    /// The conditional remove is the cross-process claim: among concurrent
    /// servers polling the same delay set, only the one whose remove reports
    /// a removal may push the entry.
    async fn delay_job_scheduler(&self, queue: String) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut tick = tokio::time::interval(TICK_INTERVAL);

        let delay = delay_key(&queue);
        let running = running_key(&queue);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => return,
                _ = tick.tick() => {}
            }
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }

            let due = match self.storage.range_by_score(&delay, unix_now()).await {
                Ok(due) => due,
                Err(e) => {
                    error!("failed to list delayed jobs for queue {}: {}", queue, e);
                    self.graceful_stop();
                    return;
                }
            };

            for entry in due {
                match self.storage.remove_value(&delay, &entry).await {
                    // Another process already claimed this entry.
                    Ok(0) => continue,
                    Ok(_) => {
                        if let Err(e) = self.storage.push_tail(&running, &entry).await {
                            // Claimed but never pushed: the job is gone from
                            // both structures and nothing can recover it.
                            error!("job lost while promoting to queue {}: {}", queue, e);
                            self.graceful_stop();
                            return;
                        }
                        debug!("promoted delayed job to queue {}", queue);
                    }
                    Err(e) => {
                        error!("failed to claim delayed job for queue {}: {}", queue, e);
                        self.graceful_stop();
                        return;
                    }
                }
            }
        }
    }

    /// Drop dead-set entries older than the retention window, once per tick.
    async fn dead_job_cleaner(&self, queue: String) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut tick = tokio::time::interval(TICK_INTERVAL);

        let dead = dead_key(&queue);
        let ttl = self.options.dead_job_ttl.as_secs() as i64;

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => return,
                _ = tick.tick() => {}
            }
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }

            match self
                .storage
                .remove_range_by_score(&dead, unix_now() - ttl)
                .await
            {
                Ok(0) => {}
                Ok(removed) => debug!("cleaned {} dead job(s) from queue {}", removed, queue),
                Err(e) => {
                    error!("failed to clean dead jobs for queue {}: {}", queue, e);
                    self.graceful_stop();
                    return;
                }
            }
        }
    }
}

impl<S> Clone for Server<S> {
    fn clone(&self) -> Self {
        Self {
            options: self.options,
            storage: self.storage.clone(),
            handlers: self.handlers.clone(),
            running: self.running.clone(),
            shutdown: self.shutdown.clone(),
            shutdown_tx: self.shutdown_tx.clone(),
            workers: self.workers.clone(),
            server_id: self.server_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::storage::MemoryStorage;

    fn test_options() -> ServerOptions {
        ServerOptions {
            fetch_timeout: Duration::from_millis(100),
            ..ServerOptions::default()
        }
    }

    async fn dead_entries(storage: &MemoryStorage, queue: &str) -> Vec<DeadJob> {
        storage
            .range_by_score(&dead_key(queue), i64::MAX)
            .await
            .unwrap()
            .iter()
            .map(|raw| serde_json::from_str(raw).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn run_without_handlers_fails() {
        let server = Server::new(MemoryStorage::new());
        assert!(matches!(
            server.run().await.unwrap_err(),
            LazyqError::NothingToWork
        ));
    }

    #[tokio::test]
    async fn register_after_run_fails() {
        let server = Server::with_options(MemoryStorage::new(), test_options());
        server.register("emails", |_| async { Ok(()) }).await.unwrap();

        let srv = server.clone();
        let run = tokio::spawn(async move { srv.run().await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = server
            .register("other", |_| async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, LazyqError::AlreadyRunning));

        server.graceful_stop();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn registration_racing_run_is_polled_or_rejected_never_dropped() {
        let storage = MemoryStorage::new();
        let client = Client::new(storage.clone());
        let server = Server::with_options(storage.clone(), test_options());

        server.register("emails", |_| async { Ok(()) }).await.unwrap();

        let seen = Arc::new(AtomicBool::new(false));
        let seen_by_handler = seen.clone();

        let srv = server.clone();
        let run = tokio::spawn(async move { srv.run().await });

        // Race a late registration against the startup snapshot. It must
        // either land before the queue list is frozen (and then be polled)
        // or fail fast; a silently accepted-but-never-polled queue is the
        // one forbidden outcome.
        let registered = server
            .register("late", move |_| {
                let seen = seen_by_handler.clone();
                async move {
                    seen.store(true, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;

        match registered {
            Ok(()) => {
                client.enqueue("late", "job").await.unwrap();
                tokio::time::sleep(Duration::from_millis(400)).await;
                assert!(seen.load(Ordering::SeqCst));
            }
            Err(e) => assert!(matches!(e, LazyqError::AlreadyRunning)),
        }

        server.graceful_stop();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn second_run_fails() {
        let server = Server::with_options(MemoryStorage::new(), test_options());
        server.register("emails", |_| async { Ok(()) }).await.unwrap();

        let srv = server.clone();
        let run = tokio::spawn(async move { srv.run().await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(matches!(
            server.run().await.unwrap_err(),
            LazyqError::AlreadyRunning
        ));

        server.graceful_stop();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn successful_job_is_delivered_exactly_once() {
        let storage = MemoryStorage::new();
        let client = Client::new(storage.clone());
        let server = Server::with_options(storage.clone(), test_options());

        let seen: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_by_handler = seen.clone();
        server
            .register("emails", move |payload| {
                let seen = seen_by_handler.clone();
                async move {
                    seen.lock().await.push(payload);
                    Ok(())
                }
            })
            .await
            .unwrap();

        let srv = server.clone();
        let run = tokio::spawn(async move { srv.run().await });

        client.enqueue("emails", "job-A").await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        server.graceful_stop();
        run.await.unwrap().unwrap();

        let seen = seen.lock().await;
        assert_eq!(*seen, vec![b"job-A".to_vec()]);
        assert!(dead_entries(&storage, "emails").await.is_empty());
    }

    #[tokio::test]
    async fn failed_job_lands_in_dead_set_with_reason_and_one_attempt() {
        let storage = MemoryStorage::new();
        let client = Client::new(storage.clone());
        let server = Server::with_options(storage.clone(), test_options());

        server
            .register("emails", |_| async {
                Err(LazyqError::Handler("smtp down".to_string()))
            })
            .await
            .unwrap();

        let srv = server.clone();
        let run = tokio::spawn(async move { srv.run().await });

        client.enqueue("emails", "job-B").await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        server.graceful_stop();
        run.await.unwrap().unwrap();

        let dead = dead_entries(&storage, "emails").await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].job.payload, b"job-B".to_vec());
        assert_eq!(dead[0].reason, "smtp down");
        assert_eq!(dead[0].job.attempts, 1);
    }

    #[tokio::test]
    async fn slow_handler_hits_job_timeout() {
        let storage = MemoryStorage::new();
        let client = Client::new(storage.clone());
        let server = Server::with_options(
            storage.clone(),
            ServerOptions {
                fetch_timeout: Duration::from_millis(100),
                job_timeout: Duration::from_millis(100),
                ..ServerOptions::default()
            },
        );

        server
            .register("slow", |_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await
            .unwrap();

        let srv = server.clone();
        let run = tokio::spawn(async move { srv.run().await });

        client.enqueue("slow", "job").await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;

        server.graceful_stop();
        run.await.unwrap().unwrap();

        let dead = dead_entries(&storage, "slow").await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, "job execution timed out");
    }

    #[tokio::test]
    async fn delayed_job_is_promoted_and_executed() {
        let storage = MemoryStorage::new();
        let client = Client::new(storage.clone());
        let server = Server::with_options(storage.clone(), test_options());

        let seen: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_by_handler = seen.clone();
        server
            .register("emails", move |payload| {
                let seen = seen_by_handler.clone();
                async move {
                    seen.lock().await.push(payload);
                    Ok(())
                }
            })
            .await
            .unwrap();

        let srv = server.clone();
        let run = tokio::spawn(async move { srv.run().await });

        client
            .enqueue_after("emails", "job-A", Duration::from_secs(2))
            .await
            .unwrap();

        let (running, delayed, _) = storage
            .queue_sizes(
                &running_key("emails"),
                &delay_key("emails"),
                &dead_key("emails"),
            )
            .await
            .unwrap();
        assert_eq!((running, delayed), (0, 1));
        assert!(seen.lock().await.is_empty());

        // Past the due time plus one scheduler tick the job must have been
        // promoted, dispatched, and executed.
        tokio::time::sleep(Duration::from_millis(3500)).await;

        let (_, delayed, _) = storage
            .queue_sizes(
                &running_key("emails"),
                &delay_key("emails"),
                &dead_key("emails"),
            )
            .await
            .unwrap();
        assert_eq!(delayed, 0);
        assert_eq!(*seen.lock().await, vec![b"job-A".to_vec()]);

        server.graceful_stop();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn cleaner_expires_old_dead_jobs_only() {
        let storage = MemoryStorage::new();
        let server = Server::with_options(
            storage.clone(),
            ServerOptions {
                fetch_timeout: Duration::from_millis(100),
                dead_job_ttl: Duration::from_secs(3600),
                ..ServerOptions::default()
            },
        );
        server.register("emails", |_| async { Ok(()) }).await.unwrap();

        let key = dead_key("emails");
        storage
            .add_scored(&key, unix_now() - 7200, "expired-entry")
            .await
            .unwrap();
        storage
            .add_scored(&key, unix_now(), "fresh-entry")
            .await
            .unwrap();

        let srv = server.clone();
        let run = tokio::spawn(async move { srv.run().await });
        tokio::time::sleep(Duration::from_millis(300)).await;

        server.graceful_stop();
        run.await.unwrap().unwrap();

        let remaining = storage.range_by_score(&key, i64::MAX).await.unwrap();
        assert_eq!(remaining, vec!["fresh-entry".to_string()]);
    }

    #[tokio::test]
    async fn graceful_stop_drains_in_flight_jobs() {
        let storage = MemoryStorage::new();
        let client = Client::new(storage.clone());
        let server = Server::with_options(storage.clone(), test_options());

        let finished = Arc::new(AtomicBool::new(false));
        let finished_by_handler = finished.clone();
        server
            .register("slow", move |_| {
                let finished = finished_by_handler.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    finished.store(true, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await
            .unwrap();

        let srv = server.clone();
        let run = tokio::spawn(async move { srv.run().await });

        client.enqueue("slow", "job").await.unwrap();
        // Let the job get picked up, then stop while it is still running.
        tokio::time::sleep(Duration::from_millis(100)).await;
        server.graceful_stop();
        server.graceful_stop();

        run.await.unwrap().unwrap();
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn no_dispatch_after_graceful_stop() {
        let storage = MemoryStorage::new();
        let client = Client::new(storage.clone());
        let server = Server::with_options(storage.clone(), test_options());

        let seen = Arc::new(AtomicBool::new(false));
        let seen_by_handler = seen.clone();
        server
            .register("emails", move |_| {
                let seen = seen_by_handler.clone();
                async move {
                    seen.store(true, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await
            .unwrap();

        let srv = server.clone();
        let run = tokio::spawn(async move { srv.run().await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        server.graceful_stop();
        run.await.unwrap().unwrap();

        client.enqueue("emails", "late-job").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(!seen.load(Ordering::SeqCst));
        let (running, _, _) = storage
            .queue_sizes(
                &running_key("emails"),
                &delay_key("emails"),
                &dead_key("emails"),
            )
            .await
            .unwrap();
        assert_eq!(running, 1);
    }
}
