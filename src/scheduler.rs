//! Fixed-rate simulation loop
//!
//! One tick task drives `World::update` and `EventHook::update` on an aligned
//! schedule. Late ticks are delayed, never bursted. Autosave passes run on a
//! single worker task, one at a time, each on the blocking pool.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::ServerConfig;
use crate::game::{DataSaver, EventHook, World};

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub tick_rate: u32,
    pub autosave_interval: Duration,
    pub shutdown_timeout: Duration,
}

impl SchedulerOptions {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            tick_rate: config.tick_rate.max(1),
            autosave_interval: config.autosave_interval(),
            shutdown_timeout: config.shutdown_timeout(),
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / self.tick_rate.max(1) as u64)
    }
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self::from_config(&ServerConfig::default())
    }
}

/// Outcome of one autosave pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AutosaveReport {
    pub saved: usize,
    pub failed: usize,
    /// Ephemeral players, never saved.
    pub skipped: usize,
    pub global_ok: bool,
}

/// Saves every non-ephemeral player, then global data once. A failing or
/// panicking player save is logged and does not stop the pass.
pub fn run_autosave(world: &dyn World, saver: &dyn DataSaver) -> AutosaveReport {
    let mut report = AutosaveReport::default();

    let players = match std::panic::catch_unwind(AssertUnwindSafe(|| world.players())) {
        Ok(players) => players,
        Err(_) => {
            tracing::error!("[autosave] player snapshot panicked");
            Vec::new()
        }
    };

    for player in &players {
        if player.is_ephemeral() {
            report.skipped += 1;
            continue;
        }
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
            saver.save_player_data(player.as_ref())
        }));
        match result {
            Ok(Ok(())) => report.saved += 1,
            Ok(Err(e)) => {
                report.failed += 1;
                tracing::error!("[autosave] player={} save failed: {:#}", player.id(), e);
            }
            Err(_) => {
                report.failed += 1;
                tracing::error!("[autosave] player={} save panicked", player.id());
            }
        }
    }

    match std::panic::catch_unwind(AssertUnwindSafe(|| saver.save_global_data())) {
        Ok(Ok(())) => report.global_ok = true,
        Ok(Err(e)) => tracing::error!("[autosave] global save failed: {:#}", e),
        Err(_) => tracing::error!("[autosave] global save panicked"),
    }

    tracing::info!(
        "[autosave] done saved={} failed={} skipped={} global_ok={}",
        report.saved,
        report.failed,
        report.skipped,
        report.global_ok
    );
    report
}

/// State shared by the tick task.
struct TickLoop {
    world: Arc<dyn World>,
    events: Arc<dyn EventHook>,
    interval: Duration,
    autosave_interval: Duration,
    tick_count: Arc<AtomicU64>,
    autosave_tx: mpsc::Sender<()>,
}

impl TickLoop {
    async fn run(self, mut stop_rx: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_save = Instant::now();

        loop {
            tokio::select! {
                biased;
                _ = stop_rx.wait_for(|stop| *stop) => break,
                _ = interval.tick() => {}
            }
            self.tick(&mut last_save);
        }
        tracing::debug!("[tick] loop stopped");
    }

    fn tick(&self, last_save: &mut Instant) {
        let started = Instant::now();
        let tick = self.tick_count.load(Ordering::Relaxed);

        guarded(tick, "world update", || self.world.update(self.interval));
        guarded(tick, "event update", || self.events.update(Utc::now()));

        if started.duration_since(*last_save) >= self.autosave_interval {
            *last_save = started;
            submit_autosave(&self.autosave_tx);
        }

        self.tick_count.fetch_add(1, Ordering::Relaxed);

        let took = started.elapsed();
        if took > self.interval {
            tracing::warn!(
                "[tick] tick={} overran: took {:?}, budget {:?}",
                tick,
                took,
                self.interval
            );
        }
    }
}

fn guarded(tick: u64, what: &str, f: impl FnOnce() -> anyhow::Result<()>) {
    match std::panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("[tick] tick={} {} failed: {:#}", tick, what, e),
        Err(_) => tracing::error!("[tick] tick={} {} panicked", tick, what),
    }
}

fn submit_autosave(tx: &mpsc::Sender<()>) -> bool {
    match tx.try_send(()) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(())) => {
            tracing::debug!("[autosave] pass already pending, request coalesced");
            false
        }
        Err(mpsc::error::TrySendError::Closed(())) => false,
    }
}

async fn autosave_worker(
    mut rx: mpsc::Receiver<()>,
    world: Arc<dyn World>,
    saver: Arc<dyn DataSaver>,
) {
    while rx.recv().await.is_some() {
        let world = Arc::clone(&world);
        let saver = Arc::clone(&saver);
        let pass = tokio::task::spawn_blocking(move || run_autosave(world.as_ref(), saver.as_ref()));
        if let Err(e) = pass.await {
            tracing::error!("[autosave] pass aborted: {}", e);
        }
    }
    tracing::debug!("[autosave] worker stopped");
}

struct Running {
    stop_tx: watch::Sender<bool>,
    autosave_tx: mpsc::Sender<()>,
    tick_task: JoinHandle<()>,
    autosave_task: JoinHandle<()>,
}

pub struct TickScheduler {
    world: Arc<dyn World>,
    events: Arc<dyn EventHook>,
    saver: Arc<dyn DataSaver>,
    options: SchedulerOptions,
    tick_count: Arc<AtomicU64>,
    running: Mutex<Option<Running>>,
}

impl TickScheduler {
    pub fn new(
        options: SchedulerOptions,
        world: Arc<dyn World>,
        events: Arc<dyn EventHook>,
        saver: Arc<dyn DataSaver>,
    ) -> Self {
        Self {
            world,
            events,
            saver,
            options,
            tick_count: Arc::new(AtomicU64::new(0)),
            running: Mutex::new(None),
        }
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawns the tick task and the autosave worker. Must be called inside a
    /// tokio runtime.
    pub fn start(&self) {
        let mut running = self.running();
        if running.is_some() {
            tracing::warn!("[tick] scheduler already running");
            return;
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        // one queued pass at most; further requests coalesce
        let (autosave_tx, autosave_rx) = mpsc::channel(1);

        let tick_loop = TickLoop {
            world: Arc::clone(&self.world),
            events: Arc::clone(&self.events),
            interval: self.options.tick_interval(),
            autosave_interval: self.options.autosave_interval,
            tick_count: Arc::clone(&self.tick_count),
            autosave_tx: autosave_tx.clone(),
        };

        let tick_task = tokio::spawn(tick_loop.run(stop_rx));
        let autosave_task = tokio::spawn(autosave_worker(
            autosave_rx,
            Arc::clone(&self.world),
            Arc::clone(&self.saver),
        ));

        *running = Some(Running {
            stop_tx,
            autosave_tx,
            tick_task,
            autosave_task,
        });
        tracing::info!(
            "[tick] started tps={} autosave_every={:?}",
            self.options.tick_rate,
            self.options.autosave_interval
        );
    }

    /// Stops ticking and lets the autosave worker finish its current pass.
    /// No-op when stopped.
    pub async fn stop(&self) {
        let running = self.running().take();
        let Some(running) = running else {
            return;
        };
        let limit = self.options.shutdown_timeout;

        running.stop_tx.send_replace(true);
        let mut tick_task = running.tick_task;
        if tokio::time::timeout(limit, &mut tick_task).await.is_err() {
            tracing::warn!("[tick] tick did not finish in {:?}, aborting", limit);
            tick_task.abort();
        }

        // last sender gone: the worker exits after the pass in hand
        drop(running.autosave_tx);
        let mut autosave_task = running.autosave_task;
        if tokio::time::timeout(limit, &mut autosave_task).await.is_err() {
            tracing::warn!("[autosave] pass still running after {:?}, detaching", limit);
        }

        tracing::info!("[tick] stopped after {} ticks", self.tick_count());
    }

    /// Queues an autosave pass now. Returns false when stopped or when a
    /// pass is already queued.
    pub fn request_autosave(&self) -> bool {
        match self.running().as_ref() {
            Some(running) => submit_autosave(&running.autosave_tx),
            None => false,
        }
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count.load(Ordering::Relaxed)
    }

    /// Configured ticks per second.
    pub fn tps(&self) -> u32 {
        self.options.tick_rate
    }

    pub fn is_running(&self) -> bool {
        self.running().is_some()
    }
}
