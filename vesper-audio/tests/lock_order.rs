//! Concurrent mutation of a recycling tree must never deadlock.

mod common;

use std::sync::{Arc, Barrier};
use std::thread;

use vesper_audio::plugin::PluginAdapter;
use vesper_audio::{AudioSignal, Port, PortValue, RecallId, Recycling, RecyclingContext};
use vesper_types::{SoundScope, SoundcardFormat};

const DEPTH: usize = 6;
const ROUNDS: usize = 300;

/// A chain of recyclings, each the parent of the next.
fn recycling_tree(depth: usize) -> Vec<Arc<Recycling>> {
    let nodes: Vec<Arc<Recycling>> = (0..depth).map(|_| common::ramp_recycling(2)).collect();
    for pair in nodes.windows(2) {
        pair[1].set_parent(Some(&pair[0]));
    }
    Recycling::link_chain(&nodes);
    nodes
}

#[test]
fn concurrent_add_remove_across_levels() {
    let nodes = recycling_tree(DEPTH);
    let barrier = Arc::new(Barrier::new(DEPTH));
    let (done_tx, done_rx) = crossbeam_channel::unbounded::<usize>();

    for level in 0..DEPTH {
        let nodes = nodes.clone();
        let barrier = barrier.clone();
        let done_tx = done_tx.clone();
        thread::Builder::new()
            .name(format!("level-{}", level))
            .spawn(move || {
                let own = nodes[level].clone();
                let neighbour = nodes[(level + 1) % nodes.len()].clone();
                let context = RecyclingContext::with_recycling(std::slice::from_ref(&own));
                let recall_id = RecallId::new(SoundScope::Playback, context.clone());
                barrier.wait();

                for _ in 0..ROUNDS {
                    let signal = Arc::new(AudioSignal::new(
                        common::SR,
                        common::BS,
                        SoundcardFormat::Float,
                    ));
                    own.create_with_frame_count(&signal, 3 * common::BS as u64, 0.0, 0);
                    signal.set_recall_id(Some(recall_id.clone()));
                    own.add_audio_signal(signal.clone());

                    // Cross-level reads while other threads mutate.
                    let _ = neighbour.audio_signals();
                    let _ = neighbour.parent().map(|p| p.signal_count());
                    let _ = own.find_by_context(&context);
                    signal.advance();

                    assert!(own.remove_audio_signal(&signal));
                }
                done_tx.send(level).unwrap();
            })
            .unwrap();
    }
    drop(done_tx);

    let mut finished = Vec::new();
    for _ in 0..DEPTH {
        finished.push(done_rx.recv_timeout(common::DEADLINE).expect("worker stalled"));
    }
    finished.sort_unstable();
    assert_eq!(finished, (0..DEPTH).collect::<Vec<_>>());
    for node in &nodes {
        assert_eq!(node.signal_count(), 1, "only the template remains");
    }
}

#[test]
fn contexts_grow_and_shrink_concurrently() {
    let nodes = recycling_tree(DEPTH);
    let root = RecyclingContext::with_recycling(&nodes[..1]);
    let (done_tx, done_rx) = crossbeam_channel::unbounded::<()>();

    for level in 0..DEPTH {
        let nodes = nodes.clone();
        let root = root.clone();
        let done_tx = done_tx.clone();
        thread::spawn(move || {
            for _ in 0..ROUNDS {
                let child = root.add(&nodes[level]);
                root.add_child(&child);
                let _ = child.depth();
                let _ = root.children().len();
                assert!(root.remove_child(&child));
            }
            done_tx.send(()).unwrap();
        });
    }
    drop(done_tx);

    for _ in 0..DEPTH {
        done_rx.recv_timeout(common::DEADLINE).expect("worker stalled");
    }
    assert!(root.children().is_empty());
}

#[test]
fn port_writers_never_block_the_adapter_reader() {
    let ports: Vec<Arc<Port>> = (0..8)
        .map(|i| Arc::new(Port::new("test", &format!("c{}", i), "", PortValue::Float(0.0))))
        .collect();
    let (done_tx, done_rx) = crossbeam_channel::unbounded::<()>();

    for writer in 0..4 {
        let ports = ports.clone();
        let done_tx = done_tx.clone();
        thread::spawn(move || {
            for round in 0..ROUNDS {
                for port in &ports {
                    port.write_f32((writer * ROUNDS + round) as f32);
                }
            }
            done_tx.send(()).unwrap();
        });
    }
    {
        let ports = ports.clone();
        let done_tx = done_tx.clone();
        thread::spawn(move || {
            let mut values = Vec::new();
            for _ in 0..ROUNDS {
                PluginAdapter::read_controls(&ports, &mut values);
                assert_eq!(values.len(), ports.len());
                PluginAdapter::store_outputs(&ports, &values);
            }
            done_tx.send(()).unwrap();
        });
    }
    drop(done_tx);

    for _ in 0..5 {
        done_rx.recv_timeout(common::DEADLINE).expect("worker stalled");
    }
}
