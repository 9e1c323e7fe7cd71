mod common;

use std::sync::Arc;

use vesper_audio::plugin::test_support::{gain_plugin, PluginOp, StaticPluginRegistry, TestPlugin};
use vesper_audio::plugin::{AdapterPhase, AdapterRole, ParamChange, PluginAdapter, PluginError};
use vesper_audio::AudioBuffer;
use vesper_types::{PluginFormat, PluginKind, SoundScope, SoundcardFormat};

fn adapter_for(registry: &Arc<StaticPluginRegistry>, effect: &str) -> PluginAdapter {
    PluginAdapter::new(
        registry.clone(),
        PluginFormat::Ladspa,
        AdapterRole::Effect,
        "test.so",
        effect,
        common::SR,
        common::BS,
    )
}

#[test]
fn ports_and_arrays_are_sized_for_every_scope() {
    let registry = Arc::new(StaticPluginRegistry::new());
    for (inputs, outputs, controls) in [(1, 1, 1), (2, 2, 3), (0, 2, 0), (4, 1, 7)] {
        let effect = format!("fx-{}-{}-{}", inputs, outputs, controls);
        registry.register(TestPlugin::new(
            "test.so",
            &effect,
            PluginKind::Effect,
            common::port_table(inputs, outputs, controls),
        ));

        let adapter = adapter_for(&registry, &effect);
        adapter.load_plugin().unwrap();
        let ports = adapter.load_ports().unwrap();

        assert_eq!(ports.len(), controls);
        assert_eq!(adapter.input_count(), inputs);
        assert_eq!(adapter.output_count(), outputs);
        for scope in SoundScope::ALL {
            assert!(adapter.has_handle(scope), "{} {}", effect, scope);
            assert_eq!(
                adapter.scope_buffer_lens(scope),
                (inputs * common::BS, outputs * common::BS),
                "{} {}",
                effect,
                scope
            );
        }
        for (k, port) in ports.iter().enumerate() {
            assert_eq!(port.control_port(), format!("{}/{}", k + 1, controls));
            assert_eq!(port.read_f32(), 0.5);
        }
    }
}

#[test]
fn teardown_happens_exactly_once() {
    let registry = Arc::new(StaticPluginRegistry::new());
    let plugin = registry.register(gain_plugin("test.so", "gain"));
    let adapter = adapter_for(&registry, "gain");
    adapter.load_plugin().unwrap();
    adapter.load_ports().unwrap();
    assert_eq!(plugin.live_instances(), SoundScope::COUNT);

    assert!(adapter.unload());
    assert!(!adapter.unload());
    drop(adapter);

    assert_eq!(plugin.live_instances(), 0);
    let cleanups = registry
        .ops()
        .iter()
        .filter(|op| matches!(op, PluginOp::Cleanup { .. }))
        .count();
    assert_eq!(cleanups, SoundScope::COUNT);
}

#[test]
fn reset_reloads_with_the_new_buffer_size() {
    let registry = Arc::new(StaticPluginRegistry::new());
    registry.register(gain_plugin("test.so", "gain"));
    let adapter = adapter_for(&registry, "gain");
    adapter.load_plugin().unwrap();
    let ports = adapter.load_ports().unwrap();

    adapter.reset(16, 48000);
    assert_eq!(adapter.phase(), AdapterPhase::PortsLoaded);
    assert_eq!(adapter.scope_buffer_lens(SoundScope::Playback), (16, 16));
    assert_eq!(adapter.samplerate(), 48000);
    // Ports survive the reload.
    assert!(Arc::ptr_eq(&ports[0], &adapter.ports()[0]));

    let instantiations = registry
        .ops()
        .iter()
        .filter(|op| matches!(op, PluginOp::Instantiate { samplerate: 48000, .. }))
        .count();
    assert_eq!(instantiations, SoundScope::COUNT);
}

#[test]
fn a_reset_of_an_unloaded_adapter_stays_unloaded() {
    let registry = Arc::new(StaticPluginRegistry::new());
    registry.register(gain_plugin("test.so", "gain"));
    let adapter = adapter_for(&registry, "gain");
    adapter.reset(64, 44100);
    assert_eq!(adapter.phase(), AdapterPhase::Unloaded);
    assert!(registry.ops().is_empty());
}

#[test]
fn process_scales_by_gain_and_reports_level() {
    let registry = Arc::new(StaticPluginRegistry::new());
    registry.register(gain_plugin("test.so", "gain"));
    let adapter = adapter_for(&registry, "gain");
    adapter.load_plugin().unwrap();
    let ports = adapter.load_ports().unwrap();

    let gain = ports.iter().find(|p| p.specifier() == "gain").unwrap();
    gain.write_f32(2.0);

    let mut buffer = AudioBuffer::new(SoundcardFormat::Float, common::BS);
    for i in 0..common::BS {
        buffer.set_sample(i, 0.125 * (i + 1) as f64);
    }
    assert!(adapter.process(SoundScope::Notation, &mut buffer));

    for i in 0..common::BS {
        assert_eq!(buffer.sample(i), 0.25 * (i + 1) as f64);
    }
    let level = ports.iter().find(|p| p.specifier() == "level").unwrap();
    assert_eq!(level.read_f32(), 1.0);
}

#[test]
fn queued_parameters_reach_only_their_scope() {
    let registry = Arc::new(StaticPluginRegistry::new());
    registry.register(gain_plugin("test.so", "gain"));
    let adapter = adapter_for(&registry, "gain");
    adapter.load_plugin().unwrap();
    adapter.load_ports().unwrap();
    registry.clear_ops();

    adapter.queue_param(SoundScope::Sequencer, ParamChange { index: 2, value: 0.75 });
    let mut buffer = AudioBuffer::new(SoundcardFormat::Float, common::BS);
    adapter.process(SoundScope::Playback, &mut buffer);
    assert!(!registry
        .ops()
        .iter()
        .any(|op| matches!(op, PluginOp::SetParameter { .. })));

    adapter.process(SoundScope::Sequencer, &mut buffer);
    assert!(registry.ops().iter().any(|op| matches!(
        op,
        PluginOp::SetParameter { index: 2, value, .. } if *value == 0.75
    )));
}

#[test]
fn instruments_are_rejected_by_effect_adapters() {
    let registry = Arc::new(StaticPluginRegistry::new());
    registry.register(TestPlugin::new(
        "test.so",
        "synth",
        PluginKind::Instrument,
        common::port_table(0, 1, 1),
    ));
    let adapter = adapter_for(&registry, "synth");
    assert!(matches!(
        adapter.load_plugin(),
        Err(PluginError::InstrumentNotAllowed { .. })
    ));
    assert_eq!(adapter.phase(), AdapterPhase::Unloaded);
    assert!(matches!(adapter.load_ports(), Err(PluginError::NotLoaded { .. })));
}
