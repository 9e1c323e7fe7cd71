mod common;

use std::sync::Arc;

use vesper_audio::plugin::test_support::{gain_plugin, StaticPluginRegistry};
use vesper_audio::plugin::{AdapterRole, PluginAdapter, PluginRun};
use vesper_audio::{
    AudioNode, AudioSignal, Recall, RecallId, RecallKind, RecallLevel, RecyclingContext,
    StagingEngine, TickThread,
};
use vesper_types::{
    AudioId, Note, PluginFormat, ScopeSelection, SoundScope, SoundcardFormat,
};

#[test]
fn note_voice_tiles_the_template_loop() {
    let recycling = common::ramp_recycling(4);
    let template = recycling.template().unwrap();
    {
        let mut state = template.lock();
        state.loop_start = 2 * common::BS as u64;
        state.loop_end = 4 * common::BS as u64;
    }
    let node = common::playback_channel(0, recycling.clone());

    let engine = StagingEngine::default();
    let id = engine.start_voice(&node, SoundScope::Playback, Some(Note::new(0, 10, 60)), None);

    let signals = recycling.find_by_context(id.context());
    assert_eq!(signals.len(), 1);
    let voice = signals[0].snapshot();
    let tpl = template.snapshot();

    assert_eq!(voice.length(), 10);
    assert_eq!(voice.frame_count, 10 * common::BS as u64);
    assert_eq!(voice.stream[0], tpl.stream[0]);
    assert_eq!(voice.stream[1], tpl.stream[1]);
    for b in 2..10 {
        let expected = &tpl.stream[2 + (b - 2) % 2];
        assert_eq!(&voice.stream[b], expected, "buffer {}", b);
    }
}

#[test]
fn done_is_idempotent_and_propagates_upwards() {
    let node = common::playback_channel(0, common::ramp_recycling(2));
    let engine = StagingEngine::default();
    let id = engine.start_voice(&node, SoundScope::Playback, None, None);

    let instances: Vec<Arc<Recall>> = node
        .recalls()
        .into_iter()
        .filter(|r| !r.is_template())
        .collect();
    let root = instances
        .iter()
        .find(|r| r.level() == RecallLevel::Channel)
        .unwrap()
        .clone();
    let leaf = instances
        .iter()
        .find(|r| r.level() == RecallLevel::AudioSignal)
        .unwrap()
        .clone();

    assert!(leaf.done());
    assert!(!leaf.done());
    assert!(leaf.is_done());
    assert!(root.is_done(), "last child finishing completes the parent");
    assert!(node.is_done(id.context()));
}

#[test]
fn templates_refuse_to_finish() {
    let node = common::playback_channel(0, common::ramp_recycling(2));
    for template in node.templates() {
        assert!(!template.done());
        assert!(!template.is_done());
    }
}

#[test]
fn playback_runs_out_and_the_voice_is_retired() {
    let recycling = common::ramp_recycling(3);
    let node = common::playback_channel(0, recycling.clone());
    let engine = StagingEngine::default();
    let id = engine.start_voice(&node, SoundScope::Playback, None, None);

    let mut finished_at = None;
    for position in 0..10 {
        let report = engine.run_channel(&node, ScopeSelection::One(SoundScope::Playback), position);
        if report.finished > 0 {
            finished_at = Some(position);
            break;
        }
    }
    assert!(finished_at.is_some());
    assert!(id.is_done());
    assert!(node.voices().is_empty());
    assert_eq!(recycling.signal_count(), 1);
    assert_eq!(node.recall_count(), 2);
}

#[test]
fn plugin_run_processes_the_voice_signal() {
    let registry = Arc::new(StaticPluginRegistry::new());
    let plugin = registry.register(gain_plugin("test.so", "gain"));

    let recycling = common::ramp_recycling(4);
    let node = common::playback_channel(0, recycling.clone());
    let adapter = PluginAdapter::new(
        registry.clone(),
        PluginFormat::Ladspa,
        AdapterRole::Effect,
        "test.so",
        "gain",
        common::SR,
        common::BS,
    );
    node.add_template(Recall::new_template(
        "gain",
        RecallLevel::AudioSignal,
        Box::new(PluginRun::new(adapter)),
    ));

    let engine = StagingEngine::default();
    node.schedule_note(SoundScope::Playback, Note::new(0, 4, 60));
    let mut finished = 0;
    for position in 0..6 {
        finished += engine
            .run_channel(&node, ScopeSelection::One(SoundScope::Playback), position)
            .finished;
    }

    assert_eq!(finished, 1);
    assert!(node.voices().is_empty());
    assert_eq!(plugin.live_instances(), 0, "the instance unloads its adapter when done");
    assert!(registry.resolve_count() >= 1);
}

#[test]
fn audio_threads_drive_their_output_channels() {
    let out_a = common::playback_channel(0, common::ramp_recycling(2));
    let out_b = common::playback_channel(1, common::ramp_recycling(2));
    let audio = AudioNode::new(AudioId::new(7));
    audio.add_output(out_a.clone());
    audio.add_output(out_b.clone());

    let engine = Arc::new(StagingEngine::default());
    engine.start_voice(&out_a, SoundScope::Playback, None, None);
    engine.start_voice(&out_b, SoundScope::Playback, None, None);

    let mut thread = TickThread::for_audio(engine, audio).unwrap();
    assert_eq!(thread.name(), "vesper-audio-7");
    for tick in 0..6 {
        thread.run(tick, ScopeSelection::All);
    }
    thread.stop().unwrap();

    assert!(out_a.voices().is_empty());
    assert!(out_b.voices().is_empty());
}

#[test]
fn duplicating_needs_a_template() {
    let node = common::playback_channel(0, common::ramp_recycling(1));
    let template = node.templates()[0].clone();
    let id = RecallId::new(
        SoundScope::Playback,
        RecyclingContext::with_recycling(std::slice::from_ref(node.recycling())),
    );
    let signal = Arc::new(AudioSignal::new(common::SR, common::BS, SoundcardFormat::Float));

    let instance = template
        .duplicate(&id, RecallKind::AudioSignal(signal.clone()))
        .unwrap();
    assert!(instance.duplicate(&id, RecallKind::AudioSignal(signal)).is_none());
}
