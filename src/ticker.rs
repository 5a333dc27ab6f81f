//! # Tick Scheduler
//!
//! A cooperative, fixed-rate pulse that drives all periodic registry work.
//!
//! Handlers are phase-distributed: each registration gets an offset equal to its
//! registration counter modulo the tick rate, so handlers sharing an interval do
//! not all fire on the same tick. On tick `t`, a handler with offset `h` and an
//! interval of `n` ticks fires iff `t % n == h % n`. For whole-second intervals
//! this is `t % (ticks_per_second * s) == h % ticks_per_second`.
//!
//! Handlers due on the same tick run sequentially in registration order. A
//! failing handler is logged and never stops the loop or its siblings.
//!
//! The scheduler can run on the system clock or on a manual clock. With the
//! manual clock nothing advances by itself: tests call [`TickScheduler::tick`]
//! and [`TickScheduler::advance`] to step time deterministically.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::{
    sync::{oneshot, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, trace};

use crate::{config::TickerConfig, types::Timestamp, RegistryError, RegistryResult};

/// Wall-clock milliseconds since the Unix epoch.
pub fn system_now() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as Timestamp)
        .unwrap_or_default()
}

pub type TickHandler = Arc<dyn Fn() -> BoxFuture<'static, RegistryResult<()>> + Send + Sync>;

type HandlerTable = DashMap<u64, RegisteredHandler>;

struct RegisteredHandler {
    name: String,
    handler: TickHandler,
    offset: u64,
    interval_ticks: u64,
}

impl RegisteredHandler {
    fn is_due(&self, tick: u64) -> bool {
        tick % self.interval_ticks == self.offset % self.interval_ticks
    }
}

enum Clock {
    System,
    Manual(AtomicU64),
}

/// Cancels a handler registration. Dropping it does not cancel.
pub struct TickRegistration {
    id: u64,
    handlers: Weak<HandlerTable>,
}

impl TickRegistration {
    pub fn cancel(&self) {
        if let Some(handlers) = self.handlers.upgrade() {
            if let Some((_, removed)) = handlers.remove(&self.id) {
                debug!("Tick handler cancelled: {}", removed.name);
            }
        }
    }
}

pub struct TickScheduler {
    ticks_per_second: u64,
    clock: Clock,
    tick: AtomicU64,
    next_id: AtomicU64,
    handlers: Arc<HandlerTable>,
    waiters: DashMap<u64, Vec<oneshot::Sender<()>>>,
    running: Arc<AtomicBool>,
    task_handle: Mutex<Option<JoinHandle<()>>>,
}

impl TickScheduler {
    /// Scheduler on the system clock.
    pub fn new(ticks_per_second: u32) -> Self {
        Self::with_clock(ticks_per_second, Clock::System)
    }

    /// Scheduler on a manual clock starting at zero.
    pub fn manual(ticks_per_second: u32) -> Self {
        Self::with_clock(ticks_per_second, Clock::Manual(AtomicU64::new(0)))
    }

    pub fn from_config(config: &TickerConfig) -> Self {
        Self::new(config.ticks_per_second)
    }

    fn with_clock(ticks_per_second: u32, clock: Clock) -> Self {
        Self {
            ticks_per_second: u64::from(ticks_per_second.max(1)),
            clock,
            tick: AtomicU64::new(0),
            next_id: AtomicU64::new(0),
            handlers: Arc::new(DashMap::new()),
            waiters: DashMap::new(),
            running: Arc::new(AtomicBool::new(false)),
            task_handle: Mutex::new(None),
        }
    }

    pub fn ticks_per_second(&self) -> u64 {
        self.ticks_per_second
    }

    /// Current time in milliseconds.
    pub fn now(&self) -> Timestamp {
        match &self.clock {
            Clock::System => system_now(),
            Clock::Manual(time) => time.load(Ordering::SeqCst),
        }
    }

    /// Sets the manual clock. Ignored on the system clock.
    pub fn set_time(&self, now: Timestamp) {
        if let Clock::Manual(time) = &self.clock {
            time.store(now, Ordering::SeqCst);
        }
    }

    /// Moves the manual clock forward. Ignored on the system clock.
    pub fn advance(&self, by: Duration) {
        if let Clock::Manual(time) = &self.clock {
            time.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
        }
    }

    pub fn current_tick(&self) -> u64 {
        self.tick.load(Ordering::SeqCst)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Registers a periodic handler. An interval shorter than one tick fires on
    /// every tick.
    pub fn register(
        &self,
        name: impl Into<String>,
        handler: TickHandler,
        interval: Duration,
    ) -> TickRegistration {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let interval_ticks =
            ((interval.as_millis() as u64).saturating_mul(self.ticks_per_second) / 1000).max(1);
        let name = name.into();
        debug!(
            "Tick handler registered: {} (every {} ticks, offset {})",
            name,
            interval_ticks,
            id % self.ticks_per_second
        );
        self.handlers.insert(
            id,
            RegisteredHandler {
                name,
                handler,
                offset: id % self.ticks_per_second,
                interval_ticks,
            },
        );
        TickRegistration {
            id,
            handlers: Arc::downgrade(&self.handlers),
        }
    }

    /// Resolves once `ticks` further ticks have been processed.
    pub fn wait_tick(&self, ticks: u64) -> impl Future<Output = RegistryResult<()>> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        if ticks == 0 {
            let _ = tx.send(());
        } else {
            let target = self.current_tick() + ticks;
            self.waiters.entry(target).or_default().push(tx);
        }
        async move {
            rx.await.map_err(|_| {
                RegistryError::internal("Tick scheduler dropped before the awaited tick")
            })
        }
    }

    /// Processes one tick: wakes waiters for this tick, then runs due handlers.
    pub async fn tick(&self) {
        let tick = self.tick.fetch_add(1, Ordering::SeqCst) + 1;
        trace!("Tick {}", tick);

        let ready: Vec<u64> = self
            .waiters
            .iter()
            .filter(|entry| *entry.key() <= tick)
            .map(|entry| *entry.key())
            .collect();
        for key in ready {
            if let Some((_, senders)) = self.waiters.remove(&key) {
                for sender in senders {
                    let _ = sender.send(());
                }
            }
        }

        let mut due: Vec<(u64, String, TickHandler)> = self
            .handlers
            .iter()
            .filter(|entry| entry.value().is_due(tick))
            .map(|entry| {
                (
                    *entry.key(),
                    entry.value().name.clone(),
                    entry.value().handler.clone(),
                )
            })
            .collect();
        due.sort_by_key(|(id, _, _)| *id);

        for (_, name, handler) in due {
            if let Err(e) = handler().await {
                error!("Tick handler {} failed: {}", name, e);
            }
        }
    }

    /// Spawns the tick loop. Calling it on a running scheduler is a no-op.
    pub async fn start(self: &Arc<Self>) -> RegistryResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Clock::Manual(_) = self.clock {
            debug!("Tick scheduler started on a manual clock");
        }
        let period = Duration::from_millis((1000 / self.ticks_per_second).max(1));
        let scheduler = Arc::downgrade(self);
        let running = self.running.clone();

        let handle = tokio::spawn(async move {
            let mut interval_timer = tokio::time::interval(period);
            // the first tick of a tokio interval completes immediately
            interval_timer.tick().await;
            while running.load(Ordering::SeqCst) {
                interval_timer.tick().await;
                let Some(scheduler) = scheduler.upgrade() else {
                    break;
                };
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                scheduler.tick().await;
            }
        });
        *self.task_handle.lock().await = Some(handle);
        debug!("Tick scheduler started: {:?} per tick", period);
        Ok(())
    }

    /// Stops the tick loop after the tick in progress. Must not be awaited from
    /// inside a tick handler.
    pub async fn stop(&self) -> RegistryResult<()> {
        debug!("Tick scheduler stopping");
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.task_handle.lock().await.take() {
            handle
                .await
                .map_err(|e| RegistryError::internal(format!("Tick loop failed: {}", e)))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::sleep;

    fn counting_handler(counter: Arc<AtomicUsize>) -> TickHandler {
        Arc::new(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            .boxed()
        })
    }

    type TickLog = Arc<std::sync::Mutex<Vec<(u64, &'static str)>>>;

    fn recording_handler(
        name: &'static str,
        log: TickLog,
        scheduler: Weak<TickScheduler>,
    ) -> TickHandler {
        Arc::new(move || {
            let log = log.clone();
            let scheduler = scheduler.clone();
            async move {
                let tick = scheduler
                    .upgrade()
                    .map(|s| s.current_tick())
                    .unwrap_or_default();
                log.lock().unwrap().push((tick, name));
                Ok(())
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn test_handlers_with_same_interval_are_phase_shifted() {
        let scheduler = Arc::new(TickScheduler::manual(10));
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let _a = scheduler.register(
            "a",
            recording_handler("a", log.clone(), Arc::downgrade(&scheduler)),
            Duration::from_secs(1),
        );
        let _b = scheduler.register(
            "b",
            recording_handler("b", log.clone(), Arc::downgrade(&scheduler)),
            Duration::from_secs(1),
        );

        for _ in 0..20 {
            scheduler.tick().await;
        }

        let log = log.lock().unwrap().clone();
        // offsets 0 and 1 with a period of 10 ticks
        assert_eq!(log, vec![(1, "b"), (10, "a"), (11, "b"), (20, "a")]);
    }

    #[tokio::test]
    async fn test_sub_tick_interval_fires_every_tick() {
        let scheduler = TickScheduler::manual(10);
        let counter = Arc::new(AtomicUsize::new(0));
        let _reg = scheduler.register("every", counting_handler(counter.clone()), Duration::ZERO);
        for _ in 0..5 {
            scheduler.tick().await;
        }
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_block_others() {
        let scheduler = TickScheduler::manual(10);
        let counter = Arc::new(AtomicUsize::new(0));
        let _failing = scheduler.register(
            "failing",
            Arc::new(|| async { Err(RegistryError::internal("boom")) }.boxed()),
            Duration::ZERO,
        );
        let _counting =
            scheduler.register("counting", counting_handler(counter.clone()), Duration::ZERO);

        scheduler.tick().await;
        scheduler.tick().await;

        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancel_removes_handler() {
        let scheduler = TickScheduler::manual(10);
        let counter = Arc::new(AtomicUsize::new(0));
        let registration =
            scheduler.register("every", counting_handler(counter.clone()), Duration::ZERO);
        assert_eq!(scheduler.handler_count(), 1);

        scheduler.tick().await;
        registration.cancel();
        scheduler.tick().await;

        assert_eq!(scheduler.handler_count(), 0);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wait_tick_resolves_before_handlers_of_target_tick() {
        let scheduler = Arc::new(TickScheduler::manual(10));
        let waiter = Arc::new(std::sync::Mutex::new(Some(scheduler.wait_tick(2).boxed())));
        let seen: Arc<std::sync::Mutex<Vec<(u64, bool)>>> = Arc::default();

        let observer: TickHandler = {
            let waiter = waiter.clone();
            let seen = seen.clone();
            let weak = Arc::downgrade(&scheduler);
            Arc::new(move || {
                let mut slot = waiter.lock().unwrap();
                let outcome = slot.as_mut().map(|pending| pending.as_mut().now_or_never());
                let resolved = match outcome {
                    Some(Some(result)) => {
                        result.unwrap();
                        *slot = None;
                        true
                    }
                    Some(None) => false,
                    None => true,
                };
                let tick = weak.upgrade().map(|s| s.current_tick()).unwrap_or_default();
                seen.lock().unwrap().push((tick, resolved));
                async { Ok(()) }.boxed()
            })
        };
        let _reg = scheduler.register("observer", observer, Duration::ZERO);

        scheduler.tick().await;
        scheduler.tick().await;

        assert_eq!(*seen.lock().unwrap(), vec![(1, false), (2, true)]);
    }

    #[tokio::test]
    async fn test_wait_zero_ticks_is_immediate() {
        let scheduler = TickScheduler::manual(10);
        scheduler.wait_tick(0).await.unwrap();
    }

    #[tokio::test]
    async fn test_manual_clock() {
        let scheduler = TickScheduler::manual(10);
        assert_eq!(scheduler.now(), 0);
        scheduler.advance(Duration::from_secs(2));
        assert_eq!(scheduler.now(), 2000);
        scheduler.set_time(500);
        assert_eq!(scheduler.now(), 500);
    }

    #[tokio::test]
    async fn test_start_stop() {
        let scheduler = Arc::new(TickScheduler::new(100));
        let counter = Arc::new(AtomicUsize::new(0));
        let _reg = scheduler.register("every", counting_handler(counter.clone()), Duration::ZERO);

        scheduler.start().await.unwrap();
        assert!(scheduler.is_running());
        sleep(Duration::from_millis(100)).await;
        scheduler.stop().await.unwrap();

        assert!(!scheduler.is_running());
        let fired = counter.load(Ordering::SeqCst);
        assert!(fired > 0);

        sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), fired);
    }

    #[tokio::test]
    async fn test_wait_tick_on_running_scheduler() {
        let scheduler = Arc::new(TickScheduler::new(100));
        scheduler.start().await.unwrap();
        tokio::time::timeout(Duration::from_millis(500), scheduler.wait_tick(3))
            .await
            .unwrap()
            .unwrap();
        assert!(scheduler.current_tick() >= 3);
        scheduler.stop().await.unwrap();
    }
}
