//! Port values published for meters and editors.
//!
//! The engine side copies every port value into the back slot of a triple
//! buffer and publishes it; the reader swaps in the freshest complete
//! snapshot without waiting on the writer.
//!
//! Slot state byte: `[fresh:1][unused:1][back:2][middle:2][front:2]`.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use vesper_audio::{Port, PortValue};

const FRONT_SHIFT: u8 = 0;
const MIDDLE_SHIFT: u8 = 2;
const BACK_SHIFT: u8 = 4;
const SLOT_MASK: u8 = 0b11;
const FRESH: u8 = 0x80;
const INITIAL_STATE: u8 = (2 << BACK_SHIFT) | (1 << MIDDLE_SHIFT);

#[derive(Debug, Clone, PartialEq)]
pub struct PortReading {
    pub plugin_name: String,
    pub specifier: String,
    pub value: PortValue,
}

/// All port values of one publish call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PortSnapshot {
    /// Publish counter, starting at 1 for the first snapshot.
    pub sequence: u64,
    pub tick: u64,
    pub readings: Vec<PortReading>,
}

impl PortSnapshot {
    pub fn find(&self, plugin_name: &str, specifier: &str) -> Option<&PortValue> {
        self.readings
            .iter()
            .find(|r| r.plugin_name == plugin_name && r.specifier == specifier)
            .map(|r| &r.value)
    }
}

struct Slots {
    slots: [UnsafeCell<PortSnapshot>; 3],
    state: AtomicU8,
}

// SAFETY: the state machine hands each slot to at most one side at a time;
// the writer and reader halves are unique and require `&mut self`.
unsafe impl Send for Slots {}
unsafe impl Sync for Slots {}

impl Slots {
    fn back(state: u8) -> usize {
        ((state >> BACK_SHIFT) & SLOT_MASK) as usize
    }

    fn middle(state: u8) -> usize {
        ((state >> MIDDLE_SHIFT) & SLOT_MASK) as usize
    }

    fn front(state: u8) -> usize {
        ((state >> FRONT_SHIFT) & SLOT_MASK) as usize
    }

    /// Swap back and middle and mark the middle fresh.
    fn publish(&self) {
        let mut state = self.state.load(Ordering::Acquire);
        loop {
            let next = ((Self::middle(state) as u8) << BACK_SHIFT)
                | ((Self::back(state) as u8) << MIDDLE_SHIFT)
                | ((Self::front(state) as u8) << FRONT_SHIFT)
                | FRESH;
            match self
                .state
                .compare_exchange_weak(state, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(actual) => state = actual,
            }
        }
    }

    /// Swap front and middle when the middle is fresh.
    fn consume(&self) {
        let mut state = self.state.load(Ordering::Acquire);
        loop {
            if state & FRESH == 0 {
                return;
            }
            let next = ((Self::back(state) as u8) << BACK_SHIFT)
                | ((Self::front(state) as u8) << MIDDLE_SHIFT)
                | ((Self::middle(state) as u8) << FRONT_SHIFT);
            match self
                .state
                .compare_exchange_weak(state, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(actual) => state = actual,
            }
        }
    }
}

/// Engine half: publishes snapshots.
pub struct PortPublisher {
    shared: Arc<Slots>,
    sequence: u64,
}

/// Reader half: sees the latest published snapshot.
pub struct PortMonitor {
    shared: Arc<Slots>,
}

/// A connected publisher and monitor.
pub fn port_monitor() -> (PortPublisher, PortMonitor) {
    let shared = Arc::new(Slots {
        slots: std::array::from_fn(|_| UnsafeCell::new(PortSnapshot::default())),
        state: AtomicU8::new(INITIAL_STATE),
    });
    (
        PortPublisher {
            shared: shared.clone(),
            sequence: 0,
        },
        PortMonitor { shared },
    )
}

impl PortPublisher {
    /// Copy every port's value, one port lock at a time, and publish.
    /// The back slot's allocation is reused.
    pub fn publish(&mut self, tick: u64, ports: &[Arc<Port>]) {
        self.sequence += 1;
        let state = self.shared.state.load(Ordering::Acquire);
        // SAFETY: the back slot belongs to the single writer until `publish`.
        let back = unsafe { &mut *self.shared.slots[Slots::back(state)].get() };
        back.sequence = self.sequence;
        back.tick = tick;
        back.readings.clear();
        back.readings.extend(ports.iter().map(|port| PortReading {
            plugin_name: port.plugin_name().to_string(),
            specifier: port.specifier().to_string(),
            value: port.safe_read_raw(),
        }));
        self.shared.publish();
    }

    pub fn published(&self) -> u64 {
        self.sequence
    }
}

impl PortMonitor {
    /// Whether a snapshot newer than the last one read is waiting.
    pub fn has_fresh(&self) -> bool {
        self.shared.state.load(Ordering::Acquire) & FRESH != 0
    }

    /// Run `f` on the freshest complete snapshot.
    pub fn with_latest<R>(&mut self, f: impl FnOnce(&PortSnapshot) -> R) -> R {
        self.shared.consume();
        let state = self.shared.state.load(Ordering::Acquire);
        // SAFETY: the front slot belongs to the single reader.
        f(unsafe { &*self.shared.slots[Slots::front(state)].get() })
    }

    pub fn latest(&mut self) -> PortSnapshot {
        self.with_latest(PortSnapshot::clone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(name: &str, value: f32) -> Arc<Port> {
        Arc::new(Port::new("amp", name, "1/1", PortValue::Float(value)))
    }

    #[test]
    fn reader_sees_the_latest_publish() {
        let (mut publisher, mut monitor) = port_monitor();
        assert_eq!(monitor.latest(), PortSnapshot::default());

        let gain = port("gain", 0.5);
        publisher.publish(1, &[gain.clone()]);
        gain.write_f32(0.75);
        publisher.publish(2, &[gain.clone()]);

        assert!(monitor.has_fresh());
        let snapshot = monitor.latest();
        assert_eq!(snapshot.sequence, 2);
        assert_eq!(snapshot.tick, 2);
        assert_eq!(snapshot.find("amp", "gain"), Some(&PortValue::Float(0.75)));
        assert!(!monitor.has_fresh());
        assert_eq!(monitor.latest().sequence, 2);
    }

    #[test]
    fn concurrent_publish_never_tears() {
        let (mut publisher, mut monitor) = port_monitor();
        let ports: Vec<Arc<Port>> = (0..4).map(|i| port(&format!("p{}", i), 0.0)).collect();

        let writer = std::thread::spawn(move || {
            for tick in 1..=2000u64 {
                for p in &ports {
                    p.write_f32(tick as f32);
                }
                publisher.publish(tick, &ports);
            }
        });

        let mut last = 0;
        while !writer.is_finished() || monitor.has_fresh() {
            monitor.with_latest(|snapshot| {
                assert!(snapshot.sequence >= last);
                last = snapshot.sequence;
                if let Some(first) = snapshot.readings.first() {
                    // Every reading of one snapshot comes from the same tick.
                    assert!(snapshot.readings.iter().all(|r| r.value == first.value));
                    assert_eq!(first.value, PortValue::Float(snapshot.tick as f32));
                }
            });
        }
        writer.join().unwrap();
        assert_eq!(monitor.latest().sequence, 2000);
    }
}
