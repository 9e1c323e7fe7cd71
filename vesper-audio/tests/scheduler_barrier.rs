mod common;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use vesper_audio::channel_thread::ThreadPhase;
use vesper_audio::{AudioLoop, TickThread, TickWork};
use vesper_types::{ScopeSelection, SoundScope};

/// Shared sequence used to order events across threads.
#[derive(Default)]
struct Clock(AtomicU64);

impl Clock {
    fn now(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy)]
struct Observed {
    tick: u64,
    woke_at: u64,
    finished_at: u64,
}

struct Jittery {
    clock: Arc<Clock>,
    seen: Arc<Mutex<Vec<Observed>>>,
    max_delay_us: u64,
}

impl TickWork for Jittery {
    fn process(&mut self, _selection: ScopeSelection, tick: u64) {
        let woke_at = self.clock.now();
        let delay = rand::thread_rng().gen_range(0..=self.max_delay_us);
        if delay > 0 {
            std::thread::sleep(Duration::from_micros(delay));
        }
        let finished_at = self.clock.now();
        self.seen.lock().unwrap().push(Observed {
            tick,
            woke_at,
            finished_at,
        });
    }
}

#[test]
fn done_is_observed_once_per_tick_after_wakeup() {
    const TICKS: u64 = 1000;
    let clock = Arc::new(Clock::default());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut thread = TickThread::start(
        "barrier",
        Jittery {
            clock: clock.clone(),
            seen: seen.clone(),
            max_delay_us: 50,
        },
    )
    .unwrap();

    let mut windows = Vec::with_capacity(TICKS as usize);
    for tick in 0..TICKS {
        let woken_at = clock.now();
        assert!(thread.run(tick, ScopeSelection::All));
        let done_at = clock.now();
        windows.push((woken_at, done_at));

        // Exactly one tick processed per handshake.
        assert_eq!(seen.lock().unwrap().len() as u64, tick + 1);
        assert_eq!(thread.ticks_completed(), tick + 1);
    }

    let seen = seen.lock().unwrap();
    for (tick, (observed, (woken_at, done_at))) in seen.iter().zip(&windows).enumerate() {
        assert_eq!(observed.tick, tick as u64);
        assert!(*woken_at < observed.woke_at, "tick {} ran before wakeup", tick);
        assert!(observed.finished_at < *done_at, "tick {} done before work ended", tick);
    }
    drop(seen);

    thread.stop().unwrap();
    assert_eq!(thread.phase(), ThreadPhase::Stopped);
}

struct Counter(Arc<AtomicU64>);

impl TickWork for Counter {
    fn process(&mut self, _selection: ScopeSelection, _tick: u64) {
        let delay = rand::thread_rng().gen_range(0..30);
        std::thread::sleep(Duration::from_micros(delay));
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn audio_loop_keeps_threads_in_lock_step() {
    let counters: Vec<Arc<AtomicU64>> = (0..4).map(|_| Arc::new(AtomicU64::new(0))).collect();
    let mut audio_loop = AudioLoop::new(common::SR, common::BS as u32, 0);
    for (i, counter) in counters.iter().enumerate() {
        let thread = TickThread::start(&format!("lock-step-{}", i), Counter(counter.clone())).unwrap();
        audio_loop.add_thread(thread);
    }

    for tick in 1..=200u64 {
        audio_loop.tick();
        for counter in &counters {
            assert_eq!(counter.load(Ordering::SeqCst), tick);
        }
    }
    assert_eq!(audio_loop.stop(), 0);
}

/// Waits inside `process` until every thread of the tick has arrived.
struct Rendezvous {
    arrived: Arc<AtomicU64>,
    met: Arc<AtomicU64>,
    expected: u64,
}

impl TickWork for Rendezvous {
    fn process(&mut self, _selection: ScopeSelection, tick: u64) {
        let target = self.expected * (tick + 1);
        self.arrived.fetch_add(1, Ordering::SeqCst);
        let deadline = Instant::now() + common::DEADLINE;
        while self.arrived.load(Ordering::SeqCst) < target && Instant::now() < deadline {
            std::thread::yield_now();
        }
        if self.arrived.load(Ordering::SeqCst) >= target {
            self.met.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[test]
fn audio_loop_runs_all_threads_of_a_tick_concurrently() {
    let arrived = Arc::new(AtomicU64::new(0));
    let met = Arc::new(AtomicU64::new(0));
    let mut audio_loop = AudioLoop::new(common::SR, common::BS as u32, 0);
    for i in 0..3 {
        let work = Rendezvous {
            arrived: arrived.clone(),
            met: met.clone(),
            expected: 3,
        };
        audio_loop.add_thread(TickThread::start(&format!("rendezvous-{}", i), work).unwrap());
    }

    for _ in 0..4 {
        audio_loop.tick();
    }
    assert_eq!(arrived.load(Ordering::SeqCst), 12);
    assert_eq!(met.load(Ordering::SeqCst), 12);
    assert_eq!(audio_loop.stop(), 0);
}

struct Selections(Arc<Mutex<Vec<ScopeSelection>>>);

impl TickWork for Selections {
    fn process(&mut self, selection: ScopeSelection, _tick: u64) {
        self.0.lock().unwrap().push(selection);
    }
}

#[test]
fn selection_reaches_the_thread() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut audio_loop = AudioLoop::new(common::SR, common::BS as u32, 0);
    audio_loop.add_thread(TickThread::start("selection", Selections(seen.clone())).unwrap());

    audio_loop.tick();
    audio_loop.set_selection(ScopeSelection::One(SoundScope::Sequencer));
    audio_loop.tick();

    assert_eq!(
        *seen.lock().unwrap(),
        vec![ScopeSelection::All, ScopeSelection::One(SoundScope::Sequencer)]
    );
}

#[test]
fn stopping_mid_run_does_not_strand_the_scheduler() {
    let counter = Arc::new(AtomicU64::new(0));
    let mut thread = TickThread::start("stop-mid-run", Counter(counter.clone())).unwrap();
    for tick in 0..10 {
        thread.run(tick, ScopeSelection::All);
    }
    assert!(thread.wake(10, ScopeSelection::All));
    thread.stop().unwrap();
    // Returns even though no further tick will ever be processed.
    thread.wait_done();
    assert!(counter.load(Ordering::SeqCst) >= 10);
}
