//! Lock-step reference scheduler.
//!
//! Every tick wakes all tick threads at once, then waits for each of them,
//! so no thread starts tick `n + 1` before every thread finished tick `n`.
//!
//! This is not a token hand-off: the barrier is never passed to a single
//! thread that then wakes the next one. All threads of a tick run
//! concurrently and [`AudioLoop::tick`] itself is the only synchronization
//! point between ticks.

use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, TryRecvError};
use vesper_types::ScopeSelection;

use crate::channel_thread::TickThread;
use crate::telemetry::{TickSummary, TickTelemetry};

/// How often [`AudioLoop::run_until`] logs telemetry.
const SUMMARY_INTERVAL: Duration = Duration::from_secs(5);

pub struct AudioLoop {
    samplerate: u32,
    buffer_size: u32,
    overclock: u32,
    selection: ScopeSelection,
    threads: Vec<TickThread>,
    position: u64,
    telemetry: TickTelemetry,
}

impl AudioLoop {
    pub fn new(samplerate: u32, buffer_size: u32, overclock: u32) -> Self {
        let buffer_size = buffer_size.max(1);
        let budget = Duration::from_secs_f64(buffer_size as f64 / samplerate.max(1) as f64);
        Self {
            samplerate,
            buffer_size,
            overclock,
            selection: ScopeSelection::All,
            threads: Vec::new(),
            position: 0,
            telemetry: TickTelemetry::new(budget),
        }
    }

    /// Ticks per second.
    pub fn frequency(&self) -> f64 {
        self.samplerate as f64 / self.buffer_size as f64 + self.overclock as f64
    }

    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.frequency())
    }

    pub fn samplerate(&self) -> u32 {
        self.samplerate
    }

    pub fn buffer_size(&self) -> u32 {
        self.buffer_size
    }

    pub fn overclock(&self) -> u32 {
        self.overclock
    }

    /// Restrict every following tick to `selection`.
    pub fn set_selection(&mut self, selection: ScopeSelection) {
        self.selection = selection;
    }

    pub fn add_thread(&mut self, thread: TickThread) {
        log::debug!(target: "audio::thread", "scheduling {}", thread.name());
        self.threads.push(thread);
    }

    /// Stop and drop the thread named `name`.
    pub fn remove_thread(&mut self, name: &str) -> bool {
        let Some(index) = self.threads.iter().position(|t| t.name() == name) else {
            return false;
        };
        let mut thread = self.threads.remove(index);
        if let Err(err) = thread.stop() {
            log::warn!(target: "audio::thread", "{}", err);
        }
        true
    }

    pub fn threads(&self) -> &[TickThread] {
        &self.threads
    }

    /// The tick the next call to [`tick`](Self::tick) processes.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Run one tick on every thread and advance the position.
    pub fn tick(&mut self) {
        let started = Instant::now();
        let position = self.position;

        let mut woken = Vec::with_capacity(self.threads.len());
        for thread in &self.threads {
            woken.push(thread.wake(position, self.selection));
        }
        for (thread, woken) in self.threads.iter().zip(woken) {
            if woken {
                thread.wait_done();
            }
        }

        self.position += 1;
        self.telemetry.record(started.elapsed());
    }

    /// Run `ticks` ticks back to back, ignoring wall time.
    pub fn run_ticks(&mut self, ticks: u64) {
        for _ in 0..ticks {
            self.tick();
        }
    }

    /// Tick at [`frequency`](Self::frequency) until `stop` receives or
    /// disconnects.
    pub fn run_until(&mut self, stop: &Receiver<()>) {
        self.run_until_with(stop, |_| {});
    }

    /// Like [`run_until`](Self::run_until), calling `after_tick` with the
    /// finished position after every tick.
    pub fn run_until_with(&mut self, stop: &Receiver<()>, mut after_tick: impl FnMut(u64)) {
        let period = self.period();
        let mut last_tick = Instant::now();
        let mut last_summary = Instant::now();

        loop {
            let remaining = period.saturating_sub(last_tick.elapsed());
            crossbeam_channel::select! {
                recv(stop) -> _ => break,
                default(remaining) => {}
            }
            match stop.try_recv() {
                Ok(()) | Err(TryRecvError::Disconnected) => break,
                Err(TryRecvError::Empty) => {}
            }

            if last_tick.elapsed() >= period {
                last_tick = Instant::now();
                self.tick();
                after_tick(self.position - 1);
            }

            if last_summary.elapsed() >= SUMMARY_INTERVAL {
                last_summary = Instant::now();
                let summary = self.telemetry.take_summary();
                log::debug!(
                    target: "audio::thread",
                    "tick avg {}us max {}us p95 {}us overruns {}",
                    summary.avg_us,
                    summary.max_us,
                    summary.p95_us,
                    summary.overruns
                );
            }
        }
    }

    pub fn summary(&mut self) -> TickSummary {
        self.telemetry.take_summary()
    }

    /// Stop every thread. Errors are logged; the remaining threads are still
    /// stopped.
    pub fn stop(&mut self) -> usize {
        let mut failed = 0;
        for mut thread in self.threads.drain(..) {
            if let Err(err) = thread.stop() {
                log::warn!(target: "audio::thread", "{}", err);
                failed += 1;
            }
        }
        failed
    }
}

impl Drop for AudioLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel_thread::TickWork;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    struct Count(Arc<AtomicU64>);

    impl TickWork for Count {
        fn process(&mut self, _selection: ScopeSelection, _tick: u64) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn frequency_includes_overclock() {
        let audio_loop = AudioLoop::new(44100, 441, 2);
        assert_eq!(audio_loop.frequency(), 102.0);
        assert_eq!(AudioLoop::new(48000, 512, 0).frequency(), 93.75);
    }

    #[test]
    fn ticks_every_thread_in_lock_step() {
        let a = Arc::new(AtomicU64::new(0));
        let b = Arc::new(AtomicU64::new(0));
        let mut audio_loop = AudioLoop::new(44100, 512, 0);
        audio_loop.add_thread(TickThread::start("loop-a", Count(a.clone())).unwrap());
        audio_loop.add_thread(TickThread::start("loop-b", Count(b.clone())).unwrap());

        audio_loop.run_ticks(20);
        assert_eq!(a.load(Ordering::SeqCst), 20);
        assert_eq!(b.load(Ordering::SeqCst), 20);
        assert_eq!(audio_loop.position(), 20);
        assert_eq!(audio_loop.summary().ticks, 20);

        assert!(audio_loop.remove_thread("loop-a"));
        audio_loop.tick();
        assert_eq!(a.load(Ordering::SeqCst), 20);
        assert_eq!(b.load(Ordering::SeqCst), 21);
        assert_eq!(audio_loop.stop(), 0);
    }

    #[test]
    fn run_until_returns_on_disconnect() {
        let mut audio_loop = AudioLoop::new(8000, 16, 0);
        let (tx, rx) = crossbeam_channel::bounded::<()>(1);
        drop(tx);
        audio_loop.run_until(&rx);
    }
}
