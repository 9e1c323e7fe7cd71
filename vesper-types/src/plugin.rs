use serde::{Deserialize, Serialize};

/// Native plugin ABI family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PluginFormat {
    Ladspa,
    Dssi,
    Vst3,
}

impl PluginFormat {
    pub fn name(self) -> &'static str {
        match self {
            PluginFormat::Ladspa => "LADSPA",
            PluginFormat::Dssi => "DSSI",
            PluginFormat::Vst3 => "VST3",
        }
    }
}

impl std::fmt::Display for PluginFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Whether a plugin transforms audio or generates it from note events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PluginKind {
    Effect,
    Instrument,
}

/// A bank/program pair exposed by an instrument plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramInfo {
    pub bank: u32,
    pub program: u32,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MidiEventKind {
    NoteOn { key: u8, velocity: u8 },
    NoteOff { key: u8 },
}

/// A note event delivered to an instrument, `frame` frames into the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MidiEvent {
    pub frame: u32,
    pub channel: u8,
    pub kind: MidiEventKind,
}

impl MidiEvent {
    pub fn note_on(frame: u32, key: u8, velocity: u8) -> Self {
        Self {
            frame,
            channel: 0,
            kind: MidiEventKind::NoteOn { key, velocity },
        }
    }

    pub fn note_off(frame: u32, key: u8) -> Self {
        Self {
            frame,
            channel: 0,
            kind: MidiEventKind::NoteOff { key },
        }
    }
}
