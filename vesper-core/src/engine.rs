//! Engine: wires the configuration, the plugin registry, the staging engine
//! and the audio loop together.
//!
//! Drive it by hand with [`Engine::tick`] or move it onto its own thread with
//! [`Engine::spawn`]; [`RunningEngine::stop`] hands it back.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::Sender;
use thiserror::Error;
use vesper_audio::plugin::{AdapterRole, PluginAdapter, PluginError, PluginRegistry};
use vesper_audio::{AudioLoop, AudioNode, ChannelNode, Port, StagingEngine, TickThread};
use vesper_types::{PluginFormat, ScopeSelection};

use crate::config::EngineConfig;
use crate::monitor::{port_monitor, PortMonitor, PortPublisher};
use crate::registry::NativePluginRegistry;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("could not spawn thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error("engine thread panicked")]
    Panicked,
}

pub struct Engine {
    config: EngineConfig,
    registry: Arc<dyn PluginRegistry>,
    native: Option<Arc<NativePluginRegistry>>,
    staging: Arc<StagingEngine>,
    audio_loop: AudioLoop,
    publisher: PortPublisher,
    monitor: Option<PortMonitor>,
    monitored: Vec<Arc<Port>>,
}

impl Engine {
    /// An engine resolving plugins from the configured search paths.
    pub fn new(config: EngineConfig) -> Self {
        let native = Arc::new(NativePluginRegistry::from_config(&config));
        let mut engine = Self::with_registry(config, native.clone());
        engine.native = Some(native);
        engine
    }

    /// An engine resolving plugins through `registry`.
    pub fn with_registry(config: EngineConfig, registry: Arc<dyn PluginRegistry>) -> Self {
        let staging = Arc::new(StagingEngine::new(
            config.program().clone(),
            config.staging_policy(),
        ));
        let audio_loop = AudioLoop::new(
            config.samplerate(),
            config.buffer_size(),
            config.overclock(),
        );
        let (publisher, monitor) = port_monitor();
        log::info!(
            target: "core::engine",
            "engine at {} Hz, {} frames per buffer, {:?}",
            config.samplerate(),
            config.buffer_size(),
            config.staging_policy()
        );
        Self {
            config,
            registry,
            native: None,
            staging,
            audio_loop,
            publisher,
            monitor: Some(monitor),
            monitored: Vec::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn staging(&self) -> &Arc<StagingEngine> {
        &self.staging
    }

    /// The filesystem registry, when the engine was built with [`Engine::new`].
    pub fn native_registry(&self) -> Option<&Arc<NativePluginRegistry>> {
        self.native.as_ref()
    }

    /// The reader half of the port monitor. Only the first call gets it.
    pub fn take_monitor(&mut self) -> Option<PortMonitor> {
        self.monitor.take()
    }

    pub fn position(&self) -> u64 {
        self.audio_loop.position()
    }

    pub fn thread_count(&self) -> usize {
        self.audio_loop.threads().len()
    }

    pub fn set_selection(&mut self, selection: ScopeSelection) {
        self.audio_loop.set_selection(selection);
    }

    /// Give `channel` its own tick thread.
    pub fn add_channel(&mut self, channel: Arc<ChannelNode>) -> Result<(), EngineError> {
        let thread = TickThread::for_channel(self.staging.clone(), channel)?;
        log::debug!(target: "core::engine", "added {}", thread.name());
        self.audio_loop.add_thread(thread);
        Ok(())
    }

    /// Give `audio` one tick thread driving all of its output channels.
    pub fn add_audio(&mut self, audio: Arc<AudioNode>) -> Result<(), EngineError> {
        let thread = TickThread::for_audio(self.staging.clone(), audio)?;
        log::debug!(target: "core::engine", "added {}", thread.name());
        self.audio_loop.add_thread(thread);
        Ok(())
    }

    pub fn remove_thread(&mut self, name: &str) -> bool {
        self.audio_loop.remove_thread(name)
    }

    pub fn effect_adapter(&self, format: PluginFormat, filename: &str, effect: &str) -> PluginAdapter {
        self.adapter(format, AdapterRole::Effect, filename, effect)
    }

    pub fn instrument_adapter(
        &self,
        format: PluginFormat,
        filename: &str,
        effect: &str,
    ) -> PluginAdapter {
        self.adapter(format, AdapterRole::Instrument, filename, effect)
    }

    /// An effect adapter with its plugin instantiated and ports created.
    pub fn load_effect(
        &self,
        format: PluginFormat,
        filename: &str,
        effect: &str,
    ) -> Result<PluginAdapter, EngineError> {
        let adapter = self.effect_adapter(format, filename, effect);
        adapter.load_plugin()?;
        adapter.load_ports()?;
        Ok(adapter)
    }

    fn adapter(&self, format: PluginFormat, role: AdapterRole, filename: &str, effect: &str) -> PluginAdapter {
        PluginAdapter::new(
            self.registry.clone(),
            format,
            role,
            filename,
            effect,
            self.config.samplerate(),
            self.config.buffer_size() as usize,
        )
    }

    /// Publish `ports` to the monitor after every tick.
    pub fn monitor_ports(&mut self, ports: impl IntoIterator<Item = Arc<Port>>) {
        self.monitored.extend(ports);
    }

    /// One lock-step tick over every thread, then a monitor publish.
    pub fn tick(&mut self) {
        self.audio_loop.tick();
        self.publisher
            .publish(self.audio_loop.position() - 1, &self.monitored);
    }

    pub fn run_ticks(&mut self, ticks: u64) {
        for _ in 0..ticks {
            self.tick();
        }
    }

    /// Tick in real time on a thread of its own.
    pub fn spawn(self) -> Result<RunningEngine, EngineError> {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
        let handle = thread::Builder::new()
            .name("vesper-engine".to_string())
            .spawn(move || {
                let mut engine = self;
                let Engine {
                    audio_loop,
                    publisher,
                    monitored,
                    ..
                } = &mut engine;
                audio_loop.run_until_with(&stop_rx, |tick| publisher.publish(tick, monitored));
                engine
            })?;
        log::info!(target: "core::engine", "engine thread started");
        Ok(RunningEngine {
            stop_tx,
            handle: Some(handle),
        })
    }

    /// Stop every tick thread; returns how many failed to stop cleanly.
    pub fn shutdown(&mut self) -> usize {
        let summary = self.audio_loop.summary();
        log::info!(
            target: "core::engine",
            "shutting down after {} ticks (avg {}us, overruns {})",
            self.audio_loop.position(),
            summary.avg_us,
            summary.overruns
        );
        self.audio_loop.stop()
    }
}

/// An [`Engine`] ticking on its own thread.
pub struct RunningEngine {
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<Engine>>,
}

impl RunningEngine {
    /// Stop ticking and take the engine back.
    pub fn stop(mut self) -> Result<Engine, EngineError> {
        self.join()
    }

    fn join(&mut self) -> Result<Engine, EngineError> {
        let _ = self.stop_tx.try_send(());
        let handle = self.handle.take().ok_or(EngineError::Panicked)?;
        handle.join().map_err(|_| EngineError::Panicked)
    }
}

impl Drop for RunningEngine {
    fn drop(&mut self) {
        if self.handle.is_some() {
            if let Err(e) = self.join() {
                log::error!(target: "core::engine", "{}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vesper_audio::plugin::test_support::NullRegistry;
    use vesper_audio::PortValue;

    fn engine() -> Engine {
        Engine::with_registry(EngineConfig::default(), Arc::new(NullRegistry))
    }

    #[test]
    fn adapters_use_the_configured_sizes() {
        let config = EngineConfig::from_toml_str("[audio]\nsamplerate = 48000\nbuffer_size = 64\n").unwrap();
        let engine = Engine::with_registry(config, Arc::new(NullRegistry));
        let adapter = engine.effect_adapter(PluginFormat::Ladspa, "amp.so", "amp");
        assert_eq!(adapter.samplerate(), 48_000);
        assert_eq!(adapter.buffer_size(), 64);
        assert_eq!(adapter.role(), AdapterRole::Effect);
        assert_eq!(
            engine
                .instrument_adapter(PluginFormat::Dssi, "synth.so", "synth")
                .role(),
            AdapterRole::Instrument
        );
    }

    #[test]
    fn ticks_publish_monitored_ports() {
        let mut engine = engine();
        let mut monitor = engine.take_monitor().unwrap();
        assert!(engine.take_monitor().is_none());

        let port = Arc::new(Port::new("amp", "gain", "1/1", PortValue::Float(0.25)));
        engine.monitor_ports([port.clone()]);
        engine.run_ticks(3);

        let snapshot = monitor.latest();
        assert_eq!(engine.position(), 3);
        assert_eq!(snapshot.tick, 2);
        assert_eq!(snapshot.find("amp", "gain"), Some(&PortValue::Float(0.25)));
    }

    #[test]
    fn spawned_engine_comes_back_on_stop() {
        let running = engine().spawn().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(100));
        let mut engine = running.stop().unwrap();
        assert!(engine.position() > 0);
        assert_eq!(engine.shutdown(), 0);
    }
}
