use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Playback flags shared between the feeder, the engine's stream task and
/// the interruption callback.
///
/// Every playback run gets a generation number. Completion reported by a
/// stale run (one that was stopped or replaced) is ignored, so a finished
/// old stream can never clear the flag of a newer one.
#[derive(Debug)]
pub struct PlaybackState {
    active: AtomicBool,
    first_audio: AtomicBool,
    generation: AtomicU64,
    started_at: Mutex<Option<Instant>>,
    first_audio_latency: Mutex<Option<Duration>>,
    drained: Notify,
}

impl Default for PlaybackState {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackState {
    pub fn new() -> Self {
        Self {
            active: AtomicBool::new(false),
            first_audio: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            started_at: Mutex::new(None),
            first_audio_latency: Mutex::new(None),
            drained: Notify::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn has_first_audio(&self) -> bool {
        self.first_audio.load(Ordering::Acquire)
    }

    /// Begin a run. Returns its generation, or `None` if one is already active.
    pub fn mark_started(&self) -> Option<u64> {
        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.first_audio.store(false, Ordering::Release);
        *lock(&self.started_at) = Some(Instant::now());
        *lock(&self.first_audio_latency) = None;
        Some(generation)
    }

    /// Record that audio reached the sink. True only for the first call of
    /// the current run.
    pub fn mark_first_audio(&self, generation: u64) -> bool {
        if generation != self.generation() {
            return false;
        }
        if self.first_audio.swap(true, Ordering::AcqRel) {
            return false;
        }
        let latency = lock(&self.started_at).map(|started| started.elapsed());
        *lock(&self.first_audio_latency) = latency;
        true
    }

    /// A run played to completion. Ignored if the run is no longer current.
    pub fn mark_finished(&self, generation: u64) {
        if generation != self.generation() {
            return;
        }
        if self
            .active
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.drained.notify_waiters();
        }
    }

    /// Playback was cut off. Invalidates the current run.
    pub fn mark_stopped(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.active.store(false, Ordering::Release);
        self.drained.notify_waiters();
    }

    pub fn first_audio_latency(&self) -> Option<Duration> {
        *lock(&self.first_audio_latency)
    }

    /// Resolve once no run is active.
    pub async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_active() {
                return;
            }
            notified.await;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Snapshot of one playback session's counters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlaybackStats {
    pub characters_fed: usize,
    pub playbacks_started: u64,
    pub stops: u64,
    pub recreations: u64,
    pub last_first_audio_latency: Option<Duration>,
}

/// Bookkeeping for one engine instance. Replaced wholesale on recreate.
#[derive(Debug)]
pub struct PlaybackSession {
    created_at: Instant,
    stats: PlaybackStats,
}

impl PlaybackSession {
    pub fn new(recreations: u64) -> Self {
        Self {
            created_at: Instant::now(),
            stats: PlaybackStats {
                recreations,
                ..PlaybackStats::default()
            },
        }
    }

    pub fn record_fed(&mut self, characters: usize) {
        self.stats.characters_fed += characters;
    }

    pub fn record_started(&mut self) {
        self.stats.playbacks_started += 1;
    }

    pub fn record_stop(&mut self) {
        self.stats.stops += 1;
    }

    pub fn record_first_audio(&mut self, latency: Option<Duration>) {
        if latency.is_some() {
            self.stats.last_first_audio_latency = latency;
        }
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn stats(&self) -> PlaybackStats {
        self.stats.clone()
    }
}
