#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use vesper_audio::recall::{NoopHandler, SignalPlayback};
use vesper_audio::{ChannelNode, Recall, RecallLevel, Recycling};
use vesper_types::{ChannelId, PortDescriptor, PortDirection, SoundcardFormat};

pub const SR: u32 = 44100;
pub const BS: usize = 4;

/// Generous upper bound for anything that should finish promptly.
pub const DEADLINE: Duration = Duration::from_secs(10);

/// A recycling whose float template holds `buffers` buffers of a ramp:
/// frame `i` carries `(i + 1) / 1000`.
pub fn ramp_recycling(buffers: usize) -> Arc<Recycling> {
    let recycling = Recycling::with_template(SR, BS, SoundcardFormat::Float, buffers);
    if let Some(template) = recycling.template() {
        let mut state = template.lock();
        for (b, buffer) in state.stream.iter_mut().enumerate() {
            for i in 0..BS {
                buffer.set_sample(i, ((b * BS + i + 1) as f64) / 1000.0);
            }
        }
    }
    recycling
}

/// A channel that plays its signals back with a channel-level recall on top.
pub fn playback_channel(id: u32, recycling: Arc<Recycling>) -> Arc<ChannelNode> {
    let node = ChannelNode::new(ChannelId::new(id), recycling);
    node.add_template(Recall::new_template(
        "playback",
        RecallLevel::AudioSignal,
        Box::new(SignalPlayback),
    ));
    node.add_template(Recall::new_template(
        "channel",
        RecallLevel::Channel,
        Box::new(NoopHandler),
    ));
    node
}

/// Port table with `inputs` and `outputs` audio ports followed by `controls`
/// control inputs named `c0`, `c1`, ...
pub fn port_table(inputs: usize, outputs: usize, controls: usize) -> Vec<PortDescriptor> {
    let mut table = Vec::new();
    let mut index = 0;
    for i in 0..inputs {
        table.push(PortDescriptor::audio(index, &format!("in{}", i), PortDirection::Input));
        index += 1;
    }
    for o in 0..outputs {
        table.push(PortDescriptor::audio(index, &format!("out{}", o), PortDirection::Output));
        index += 1;
    }
    for c in 0..controls {
        table.push(PortDescriptor::control_input(index, &format!("c{}", c), 0.0, 1.0, 0.5));
        index += 1;
    }
    table
}
