//! Repeating gateway poll. One tick loop per [`PollingScheduler`]; results
//! from a stopped or restarted loop are discarded.

use std::cell::Cell;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::beacon::{BeaconClient, NetworkError, StatusSource};
use crate::presence::{PatientIdentity, PatientLocationRecord, RawPresenceMap, UnmatchedDevice};
use crate::resolver;
use crate::roster::RosterProvider;
use crate::settings::{self, SettingsStore};

const MIN_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
}

thread_local! {
    /// Address of the `Shared` whose callback is running on this thread, or 0.
    static DELIVERING: Cell<usize> = const { Cell::new(0) };
}

#[derive(Default)]
struct Shared {
    generation: AtomicU64,
    /// Held for the whole of a delivery.
    delivery: Mutex<()>,
    snapshot: Mutex<Vec<PatientLocationRecord>>,
    unmatched: Mutex<Vec<UnmatchedDevice>>,
}

impl Shared {
    fn id(&self) -> usize {
        self as *const Shared as usize
    }

    /// Moves to a new generation and waits out any delivery in progress, so
    /// no callback of an older generation runs after this returns.
    ///
    /// From inside the callback itself there is nothing to wait for: the
    /// running delivery is the last one its loop will make.
    fn retire(&self) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if DELIVERING.with(Cell::get) == self.id() {
            debug!("Scheduler stopped from inside its own update callback");
        } else {
            drop(lock(&self.delivery));
        }
        generation
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct PollingScheduler<S = BeaconClient> {
    source: Arc<S>,
    settings: Arc<dyn SettingsStore>,
    shared: Arc<Shared>,
    runtime: Handle,
    running: Option<Running>,
}

impl<S: StatusSource + 'static> PollingScheduler<S> {
    /// Creates an idle scheduler that will spawn its loop on the current Tokio
    /// runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn new(source: S, settings: Arc<dyn SettingsStore>) -> Self {
        Self::with_runtime(source, settings, Handle::current())
    }

    pub fn with_runtime(source: S, settings: Arc<dyn SettingsStore>, runtime: Handle) -> Self {
        PollingScheduler {
            source: Arc::new(source),
            settings,
            shared: Arc::new(Shared::default()),
            runtime,
            running: None,
        }
    }

    pub fn state(&self) -> SchedulerState {
        match self.running {
            Some(_) => SchedulerState::Running,
            None => SchedulerState::Idle,
        }
    }

    /// The records most recently handed to `on_update`.
    pub fn latest(&self) -> Vec<PatientLocationRecord> {
        lock(&self.shared.snapshot).clone()
    }

    /// Gateway keys from the last successful poll that matched no patient.
    pub fn unmatched(&self) -> Vec<UnmatchedDevice> {
        lock(&self.shared.unmatched).clone()
    }

    /// Starts polling: one tick now, then one every `interval`.
    ///
    /// A loop that is already running is stopped first. `on_update` runs on the
    /// scheduler's task and may itself call `stop` or `start` on this scheduler.
    pub fn start<R, F>(&mut self, roster: R, interval: Duration, on_update: F)
    where
        R: RosterProvider + 'static,
        F: FnMut(Vec<PatientLocationRecord>) + Send + 'static,
    {
        self.stop();

        let interval = if interval < MIN_INTERVAL {
            warn!("Poll interval {:?} too short, using {:?}", interval, MIN_INTERVAL);
            MIN_INTERVAL
        } else {
            interval
        };

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let cancel = CancellationToken::new();
        let tick_loop = TickLoop {
            source: Arc::clone(&self.source),
            settings: Arc::clone(&self.settings),
            shared: Arc::clone(&self.shared),
            generation,
            cancel: cancel.clone(),
            roster,
            on_update,
        };
        let task = self.runtime.spawn(tick_loop.run(interval));

        info!(
            "Started gateway polling every {:?} (generation {})",
            interval, generation
        );
        self.running = Some(Running { cancel, task });
    }

    /// Stops polling. Does nothing if already idle.
    pub fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        let generation = self.shared.retire();
        running.cancel.cancel();
        running.task.abort();

        info!("Stopped gateway polling (generation {})", generation);
    }
}

impl<S> Drop for PollingScheduler<S> {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            self.shared.retire();
            running.cancel.cancel();
            running.task.abort();
        }
    }
}

struct TickLoop<S, R, F> {
    source: Arc<S>,
    settings: Arc<dyn SettingsStore>,
    shared: Arc<Shared>,
    generation: u64,
    cancel: CancellationToken,
    roster: R,
    on_update: F,
}

impl<S, R, F> TickLoop<S, R, F>
where
    S: StatusSource,
    R: RosterProvider,
    F: FnMut(Vec<PatientLocationRecord>) + Send,
{
    async fn run(mut self, interval: Duration) {
        let mut deadline = Instant::now();

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep_until(deadline) => {}
            }

            let roster = self.roster.roster();
            let endpoint = settings::current_endpoint(&*self.settings);
            debug!(
                "Polling {} for {} patient(s) (generation {})",
                endpoint,
                roster.len(),
                self.generation
            );

            let fetched = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                result = self.source.fetch_status(&endpoint) => result,
            };
            self.deliver(&roster, fetched);

            deadline += interval;
            let now = Instant::now();
            let mut skipped = 0u32;
            while deadline <= now {
                deadline += interval;
                skipped += 1;
            }
            if skipped > 0 {
                debug!("Poll overran, skipped {} tick(s)", skipped);
            }
        }

        debug!("Tick loop for generation {} exited", self.generation);
    }

    fn deliver(
        &mut self,
        roster: &[PatientIdentity],
        fetched: Result<RawPresenceMap, NetworkError>,
    ) {
        let previous = lock(&self.shared.snapshot).clone();

        let (records, unmatched) = match fetched {
            Ok(raw) => {
                let resolution = resolver::resolve_at(roster, &raw, &previous, Utc::now());
                for device in &resolution.unmatched {
                    debug!("{} is {}", device.label, device.state);
                }
                (resolution.records, resolution.unmatched)
            }
            Err(err) => {
                warn!("Gateway poll failed, reporting all patients unknown: {}", err);
                (resolver::degrade(roster, &previous), Vec::new())
            }
        };

        let _delivery = lock(&self.shared.delivery);
        let current = self.shared.generation.load(Ordering::SeqCst);
        if current != self.generation {
            debug!(
                "Discarding poll from generation {} (now {})",
                self.generation, current
            );
            return;
        }

        *lock(&self.shared.snapshot) = records.clone();
        *lock(&self.shared.unmatched) = unmatched;

        let outer = DELIVERING.with(|d| d.replace(self.shared.id()));
        let on_update = &mut self.on_update;
        if catch_unwind(AssertUnwindSafe(|| on_update(records))).is_err() {
            error!("Location update callback panicked");
        }
        DELIVERING.with(|d| d.set(outer));
    }
}
