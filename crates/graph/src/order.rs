//! Processing order and consumption.
//!
//! Streams are processed so that every stream runs after the streams feeding it. Strongly
//! connected components of the port graph are cycles: their members are muted and run in a fixed
//! but otherwise arbitrary order. No transform delays its input, so nothing can break a cycle
//! and every cycle stays muted.
use tracing::debug;
use util::collections::{map, BitSet, Key, Map};

use crate::{
    engine::Engine,
    listener::{Consumption, Notification},
    stream::Stream,
    StreamId,
};

/// Strongly connected components of the graph given by `edges`, each component listed after
/// every component it has an edge into.
pub(crate) fn tarjan(edges: &[Vec<usize>]) -> Vec<Vec<usize>> {
    struct State {
        index: Vec<Option<usize>>,
        lowlink: Vec<usize>,
        on_stack: BitSet,
        stack: Vec<usize>,
        counter: usize,
    }

    impl State {
        fn visit(&mut self, v: usize) {
            self.index[v] = Some(self.counter);
            self.lowlink[v] = self.counter;
            self.counter += 1;
            self.stack.push(v);
            self.on_stack.set(v);
        }
    }

    let n = edges.len();
    let mut state = State {
        index: vec![None; n],
        lowlink: vec![0; n],
        on_stack: BitSet::with_capacity(n),
        stack: Vec::with_capacity(n),
        counter: 0,
    };
    let mut components = vec![];
    let mut call: Vec<(usize, usize)> = vec![];

    for root in 0..n {
        if state.index[root].is_some() {
            continue;
        }
        state.visit(root);
        call.push((root, 0));
        while let Some((v, next)) = call.last_mut() {
            let v = *v;
            if let Some(&w) = edges[v].get(*next) {
                *next += 1;
                match state.index[w] {
                    None => {
                        state.visit(w);
                        call.push((w, 0));
                    }
                    Some(index) if state.on_stack.get(w) => {
                        state.lowlink[v] = state.lowlink[v].min(index);
                    }
                    Some(_) => (),
                }
                continue;
            }
            call.pop();
            if let Some(&(parent, _)) = call.last() {
                state.lowlink[parent] = state.lowlink[parent].min(state.lowlink[v]);
            }
            if state.index[v] == Some(state.lowlink[v]) {
                let mut component = vec![];
                while let Some(w) = state.stack.pop() {
                    state.on_stack.clear(w);
                    component.push(w);
                    if w == v {
                        break;
                    }
                }
                components.push(component);
            }
        }
    }
    components
}

impl Engine {
    pub(crate) fn update_stream_order(&mut self) {
        let keys: Vec<Key> = self.streams.keys().collect();
        let dense: Map<Key, usize> = {
            let mut dense = map::map();
            dense.extend(keys.iter().enumerate().map(|(index, key)| (*key, index)));
            dense
        };
        let mut edges = vec![vec![]; keys.len()];
        for (index, key) in keys.iter().enumerate() {
            let Some(stream) = self.streams.get(*key) else {
                continue;
            };
            for port in stream.inputs() {
                let Some(port) = self.ports.get(port.0) else {
                    continue;
                };
                if let Some(source) = dense.get(&port.source.0) {
                    edges[*source].push(index);
                }
            }
        }

        self.order.clear();
        for component in tarjan(&edges).into_iter().rev() {
            let cycle = component.len() > 1 || edges[component[0]].contains(&component[0]);
            if cycle {
                debug!(streams = component.len(), "muted cycle");
            }
            for index in component {
                let key = keys[index];
                if let Some(processed) = self.streams.get_mut(key).and_then(Stream::as_processed_mut)
                {
                    processed.in_muted_cycle = cycle;
                }
                self.order.push(StreamId(key));
            }
        }
        self.order_dirty = false;
    }

    /// A stream is consumed if it has an output or feeds a consumed stream. Sources whose
    /// consumption changed tell their listeners.
    pub(crate) fn update_consumption(&mut self) {
        let mut work = vec![];
        for (key, stream) in self.streams.iter() {
            if !stream.audio_outputs.is_empty() || !stream.video_outputs.is_empty() {
                work.push(StreamId(key));
            }
        }
        for stream in self.streams.values_mut() {
            stream.consumed = false;
        }
        while let Some(id) = work.pop() {
            let Some(stream) = self.streams.get_mut(id.0) else {
                continue;
            };
            if stream.consumed {
                continue;
            }
            stream.consumed = true;
            for port in stream.inputs() {
                if let Some(port) = self.ports.get(port.0) {
                    work.push(port.source);
                }
            }
        }
        for stream in self.streams.values_mut() {
            if stream.source().is_none() {
                continue;
            }
            let consumption = if stream.consumed {
                Consumption::Consumed
            } else {
                Consumption::NotConsumed
            };
            if consumption != stream.last_consumption {
                stream.last_consumption = consumption;
                self.outbox.notify(
                    &stream.listeners,
                    Notification::ConsumptionChanged(consumption),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::tarjan;

    fn position(order: &[Vec<usize>], v: usize) -> usize {
        order.iter().position(|c| c.contains(&v)).unwrap()
    }

    #[test]
    fn chains_come_out_sinks_first() {
        // 0 -> 1 -> 2, 0 -> 2
        let edges = vec![vec![1, 2], vec![2], vec![]];
        let components = tarjan(&edges);
        assert_eq!(components, vec![vec![2], vec![1], vec![0]]);
    }

    #[test]
    fn cycles_are_grouped() {
        // 0 -> 1 -> 2 -> 1, 2 -> 3, 4 -> 4
        let edges = vec![vec![1], vec![2], vec![1, 3], vec![], vec![4]];
        let components = tarjan(&edges);
        assert_eq!(components.len(), 4);
        let cycle = &components[position(&components, 1)];
        let mut sorted = cycle.clone();
        sorted.sort();
        assert_eq!(sorted, vec![1, 2]);
        assert!(position(&components, 3) < position(&components, 1));
        assert!(position(&components, 1) < position(&components, 0));
        assert_eq!(components[position(&components, 4)], vec![4]);
    }

    #[test]
    fn removing_a_cycle_member_terminates() {
        // A three-member cycle 0 -> 1 -> 2 -> 0 feeding 3.
        let full = vec![vec![1], vec![2], vec![0, 3], vec![]];
        assert_eq!(tarjan(&full).len(), 2);
        for removed in 0..3 {
            let edges: Vec<Vec<usize>> = full
                .iter()
                .enumerate()
                .map(|(v, out)| {
                    if v == removed {
                        vec![]
                    } else {
                        out.iter().copied().filter(|w| *w != removed).collect()
                    }
                })
                .collect();
            let components = tarjan(&edges);
            assert_eq!(components.len(), 4, "without {removed}");
            assert!(components.iter().all(|c| c.len() == 1));
        }
    }

    #[test]
    fn deep_chains_do_not_recurse() {
        let n = 100_000;
        let edges: Vec<Vec<usize>> = (0..n)
            .map(|v| if v + 1 < n { vec![v + 1] } else { vec![] })
            .collect();
        let components = tarjan(&edges);
        assert_eq!(components.len(), n);
        assert_eq!(components[0], vec![n - 1]);
    }
}
