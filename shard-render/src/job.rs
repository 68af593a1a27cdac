//! A4 — Job Scheduler.
//!
//! Thin wrapper over `choir::Choir` providing the `dispatch`/`wait_for_all`
//! contract used by C8's per-layer parallel secondary command buffer
//! recording. One worker thread per available core (minus the main thread)
//! is spun up at construction and lives for the scheduler's lifetime.

use choir::Choir;

pub struct JobScheduler {
    choir: Choir,
    _workers: Vec<choir::WorkerHandle>,
}

impl JobScheduler {
    pub fn new(worker_count: usize) -> Self {
        let choir = Choir::new();
        let workers = (0..worker_count.max(1))
            .map(|i| choir.add_worker(&format!("shard-render-worker-{i}")))
            .collect();
        JobScheduler { choir, _workers: workers }
    }

    /// Spawns `f` as an independent task; returns a handle joinable via
    /// [`JobScheduler::wait_for_all`].
    pub fn dispatch(&self, name: &str, f: impl FnOnce() + Send + 'static) -> choir::RunningTask {
        self.choir.spawn(name).init(move |_| f()).run()
    }

    /// Blocks until every task in `tasks` has completed. Mirrors
    /// `choir::IC::wait_for_all` for the caller-collected handle slice named
    /// in the render graph's per-layer execution step.
    pub fn wait_for_all(&self, tasks: Vec<choir::RunningTask>) {
        for task in tasks {
            task.join();
        }
    }
}
