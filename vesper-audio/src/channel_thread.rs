//! Per-channel and per-audio tick threads.
//!
//! The scheduler and a [`TickThread`] meet at a two-phase barrier: `wake`
//! hands over one tick and `wait_done` blocks until the thread finished it.
//! Both sides sleep on condition variables between ticks. Stopping always
//! completes the handshake, so a scheduler blocked in `wait_done` is
//! released even when no further tick runs.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use vesper_types::ScopeSelection;

use crate::lock;
use crate::staging::{StagingEngine, TickReport};
use crate::topology::{AudioNode, ChannelNode};

/// Work a tick thread performs once per tick.
pub trait TickWork: Send + 'static {
    fn process(&mut self, selection: ScopeSelection, tick: u64);
}

/// Runs the staging program over one channel subtree.
pub struct ChannelWork {
    engine: Arc<StagingEngine>,
    channel: Arc<ChannelNode>,
    last: TickReport,
}

impl ChannelWork {
    pub fn new(engine: Arc<StagingEngine>, channel: Arc<ChannelNode>) -> Self {
        Self {
            engine,
            channel,
            last: TickReport::default(),
        }
    }
}

impl TickWork for ChannelWork {
    fn process(&mut self, selection: ScopeSelection, tick: u64) {
        self.last = self.engine.run_channel(&self.channel, selection, tick);
        if self.last.finished > 0 {
            log::trace!(
                target: "audio::thread",
                "channel {}: {} voices finished at tick {}",
                self.channel.id(),
                self.last.finished,
                tick
            );
        }
    }
}

/// Runs the staging program over every output channel of one audio.
pub struct AudioWork {
    engine: Arc<StagingEngine>,
    audio: Arc<AudioNode>,
    last: TickReport,
}

impl AudioWork {
    pub fn new(engine: Arc<StagingEngine>, audio: Arc<AudioNode>) -> Self {
        Self {
            engine,
            audio,
            last: TickReport::default(),
        }
    }
}

impl TickWork for AudioWork {
    fn process(&mut self, selection: ScopeSelection, tick: u64) {
        self.last = self.engine.run_audio(&self.audio, selection, tick);
        if self.last.finished > 0 {
            log::trace!(
                target: "audio::thread",
                "audio {}: {} voices finished at tick {}",
                self.audio.id(),
                self.last.finished,
                tick
            );
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadPhase {
    Created,
    /// Waiting for the next wakeup.
    Started,
    Processing,
    Stopped,
}

struct HandshakeState {
    phase: ThreadPhase,
    wakeup_pending: bool,
    done: bool,
    stop: bool,
    tick: u64,
    selection: ScopeSelection,
    completed: u64,
    panics: u64,
}

struct Handshake {
    state: Mutex<HandshakeState>,
    wakeup: Condvar,
    done: Condvar,
}

/// A named OS thread processing one tick per handshake.
pub struct TickThread {
    name: String,
    shared: Arc<Handshake>,
    handle: Option<JoinHandle<()>>,
}

pub type ChannelThread = TickThread;
pub type AudioThread = TickThread;

impl TickThread {
    /// Spawn the thread and wait until it sits at the barrier.
    pub fn start<W: TickWork>(name: &str, work: W) -> std::io::Result<Self> {
        let shared = Arc::new(Handshake {
            state: Mutex::new(HandshakeState {
                phase: ThreadPhase::Created,
                wakeup_pending: false,
                done: false,
                stop: false,
                tick: 0,
                selection: ScopeSelection::All,
                completed: 0,
                panics: 0,
            }),
            wakeup: Condvar::new(),
            done: Condvar::new(),
        });

        let thread_shared = shared.clone();
        let thread_name = name.to_string();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || tick_loop(&thread_name, &thread_shared, work))?;

        let mut state = lock(&shared.state);
        while state.phase == ThreadPhase::Created {
            state = shared
                .done
                .wait(state)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
        drop(state);
        log::debug!(target: "audio::thread", "{} started", name);

        Ok(Self {
            name: name.to_string(),
            shared,
            handle: Some(handle),
        })
    }

    /// Spawn a thread advancing `channel`.
    pub fn for_channel(engine: Arc<StagingEngine>, channel: Arc<ChannelNode>) -> std::io::Result<Self> {
        let name = format!("vesper-channel-{}", channel.id());
        Self::start(&name, ChannelWork::new(engine, channel))
    }

    /// Spawn a thread advancing every output channel of `audio`.
    pub fn for_audio(engine: Arc<StagingEngine>, audio: Arc<AudioNode>) -> std::io::Result<Self> {
        let name = format!("vesper-audio-{}", audio.id());
        Self::start(&name, AudioWork::new(engine, audio))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn phase(&self) -> ThreadPhase {
        lock(&self.shared.state).phase
    }

    /// Ticks fully processed so far.
    pub fn ticks_completed(&self) -> u64 {
        lock(&self.shared.state).completed
    }

    /// Ticks whose work panicked. The thread keeps running.
    pub fn panics(&self) -> u64 {
        lock(&self.shared.state).panics
    }

    /// Hand tick `tick` to the thread. Returns `false` once stopped.
    pub fn wake(&self, tick: u64, selection: ScopeSelection) -> bool {
        let mut state = lock(&self.shared.state);
        if state.stop || state.phase == ThreadPhase::Stopped {
            return false;
        }
        state.tick = tick;
        state.selection = selection;
        state.done = false;
        state.wakeup_pending = true;
        self.shared.wakeup.notify_one();
        true
    }

    /// Block until the woken tick finished or the thread stopped.
    pub fn wait_done(&self) {
        let mut state = lock(&self.shared.state);
        while !state.done && state.phase != ThreadPhase::Stopped {
            state = self
                .shared
                .done
                .wait(state)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
        state.done = false;
    }

    /// Run exactly one tick on the thread.
    pub fn run(&self, tick: u64, selection: ScopeSelection) -> bool {
        if !self.wake(tick, selection) {
            return false;
        }
        self.wait_done();
        true
    }

    /// Stop after the current tick and join. Returns an error when the
    /// thread itself died.
    pub fn stop(&mut self) -> Result<(), String> {
        {
            let mut state = lock(&self.shared.state);
            state.stop = true;
            self.shared.wakeup.notify_one();
        }
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        let joined = handle
            .join()
            .map_err(|_| format!("{} terminated abnormally", self.name));

        let mut state = lock(&self.shared.state);
        state.phase = ThreadPhase::Stopped;
        state.done = true;
        self.shared.done.notify_all();
        drop(state);
        log::debug!(target: "audio::thread", "{} stopped", self.name);
        joined
    }
}

impl Drop for TickThread {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            log::warn!(target: "audio::thread", "{}", err);
        }
    }
}

fn tick_loop<W: TickWork>(name: &str, shared: &Handshake, mut work: W) {
    {
        let mut state = lock(&shared.state);
        state.phase = ThreadPhase::Started;
        shared.done.notify_all();
    }

    loop {
        let (tick, selection) = {
            let mut state = lock(&shared.state);
            while !state.wakeup_pending && !state.stop {
                state = shared
                    .wakeup
                    .wait(state)
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
            }
            if !state.wakeup_pending {
                break;
            }
            state.wakeup_pending = false;
            state.phase = ThreadPhase::Processing;
            (state.tick, state.selection)
        };

        let result = catch_unwind(AssertUnwindSafe(|| work.process(selection, tick)));

        let mut state = lock(&shared.state);
        if result.is_err() {
            state.panics += 1;
            log::error!(target: "audio::thread", "{}: tick {} panicked", name, tick);
        }
        state.completed += 1;
        state.phase = ThreadPhase::Started;
        state.done = true;
        shared.done.notify_all();
    }

    let mut state = lock(&shared.state);
    state.phase = ThreadPhase::Stopped;
    state.done = true;
    shared.done.notify_all();
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder(Arc<Mutex<Vec<(u64, ScopeSelection)>>>);

    impl TickWork for Recorder {
        fn process(&mut self, selection: ScopeSelection, tick: u64) {
            self.0.lock().unwrap().push((tick, selection));
        }
    }

    struct Explodes;

    impl TickWork for Explodes {
        fn process(&mut self, _selection: ScopeSelection, tick: u64) {
            if tick == 1 {
                panic!("tick one");
            }
        }
    }

    #[test]
    fn runs_each_tick_once() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut thread = TickThread::start("test-tick", Recorder(seen.clone())).unwrap();
        assert_eq!(thread.phase(), ThreadPhase::Started);

        for tick in 0..5 {
            assert!(thread.run(tick, ScopeSelection::All));
        }
        assert_eq!(thread.ticks_completed(), 5);
        assert_eq!(seen.lock().unwrap().len(), 5);
        assert_eq!(seen.lock().unwrap()[3].0, 3);

        thread.stop().unwrap();
        assert_eq!(thread.phase(), ThreadPhase::Stopped);
        assert!(!thread.run(5, ScopeSelection::All));
    }

    #[test]
    fn a_panicking_tick_still_signals_done() {
        let mut thread = TickThread::start("test-panic", Explodes).unwrap();
        for tick in 0..3 {
            thread.run(tick, ScopeSelection::All);
        }
        assert_eq!(thread.ticks_completed(), 3);
        assert_eq!(thread.panics(), 1);
        thread.stop().unwrap();
    }

    #[test]
    fn stop_releases_a_waiting_scheduler() {
        let mut thread = TickThread::start("test-stop", Recorder(Arc::default())).unwrap();
        thread.stop().unwrap();
        thread.wait_done();
        assert!(thread.stop().is_ok());
    }
}
