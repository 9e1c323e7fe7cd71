use serde::{Deserialize, Serialize};

/// One of the concurrent playback purposes processed independently per tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SoundScope {
    Playback,
    Sequencer,
    Notation,
    Wave,
    Midi,
}

impl SoundScope {
    pub const COUNT: usize = 5;

    pub const ALL: [SoundScope; SoundScope::COUNT] = [
        SoundScope::Playback,
        SoundScope::Sequencer,
        SoundScope::Notation,
        SoundScope::Wave,
        SoundScope::Midi,
    ];

    /// Dense slot index, used for per-scope arrays.
    pub fn index(self) -> usize {
        match self {
            SoundScope::Playback => 0,
            SoundScope::Sequencer => 1,
            SoundScope::Notation => 2,
            SoundScope::Wave => 3,
            SoundScope::Midi => 4,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            SoundScope::Playback => "playback",
            SoundScope::Sequencer => "sequencer",
            SoundScope::Notation => "notation",
            SoundScope::Wave => "wave",
            SoundScope::Midi => "midi",
        }
    }
}

impl std::fmt::Display for SoundScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

static SCOPES: [SoundScope; SoundScope::COUNT] = SoundScope::ALL;

/// Which scopes a thread advances on one tick.
///
/// The raw form used at the scheduler boundary is an `i32` where `-1`
/// selects every scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScopeSelection {
    One(SoundScope),
    All,
}

impl ScopeSelection {
    pub fn from_raw(raw: i32) -> Option<Self> {
        if raw == -1 {
            return Some(ScopeSelection::All);
        }
        usize::try_from(raw)
            .ok()
            .and_then(SoundScope::from_index)
            .map(ScopeSelection::One)
    }

    pub fn to_raw(self) -> i32 {
        match self {
            ScopeSelection::One(scope) => scope.index() as i32,
            ScopeSelection::All => -1,
        }
    }

    pub fn scopes(self) -> &'static [SoundScope] {
        match self {
            ScopeSelection::One(scope) => {
                let i = scope.index();
                &SCOPES[i..=i]
            }
            ScopeSelection::All => &SCOPES,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_matches_all_order() {
        for (i, scope) in SoundScope::ALL.iter().enumerate() {
            assert_eq!(scope.index(), i);
            assert_eq!(SoundScope::from_index(i), Some(*scope));
        }
        assert_eq!(SoundScope::from_index(5), None);
    }

    #[test]
    fn raw_minus_one_selects_every_scope() {
        let all = ScopeSelection::from_raw(-1).unwrap();
        assert_eq!(all, ScopeSelection::All);
        assert_eq!(all.scopes().len(), SoundScope::COUNT);

        let notation = ScopeSelection::from_raw(2).unwrap();
        assert_eq!(notation.scopes(), &[SoundScope::Notation]);
        assert_eq!(notation.to_raw(), 2);

        assert_eq!(ScopeSelection::from_raw(-2), None);
        assert_eq!(ScopeSelection::from_raw(9), None);
    }
}
