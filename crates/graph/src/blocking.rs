//! Blocking decisions.
//!
//! Blocking is decided from the state-computed time up to the end of the next iteration, for
//! each set of streams coupled by blocking ports. At every time where some input to the decision
//! changes, the blocked set is rebuilt from its seeds:
//!
//! - a finished stream whose data has all been played,
//! - a stream with a positive explicit-blocker count,
//! - a source whose buffered data runs out.
//!
//! and then closed over the ports: the destination of a [PortFlags::BLOCK_OUTPUT] port is blocked
//! if its source is, the source of a [PortFlags::BLOCK_INPUT] port is blocked if its destination
//! is. A destination with several `BLOCK_OUTPUT` inputs is therefore blocked whenever any one of
//! those sources is.
use tracing::{trace, warn};
use util::{
    collections::BitSet,
    time::{GraphTime, GRAPH_TIME_MAX},
};

use crate::{engine::Engine, port::PortFlags, stream::Stream, StreamId};

impl Engine {
    /// Decide blocking for every stream up to `end` and make `end` the new state-computed time.
    pub(crate) fn recompute_blocking(&mut self, end: GraphTime) {
        let start = self.state_computed_time;
        let mut visited = BitSet::with_capacity(self.streams.capacity());
        let order = std::mem::take(&mut self.order);
        for id in &order {
            if visited.get(id.index()) {
                continue;
            }
            let related = self.blocking_related_streams(*id, &mut visited);
            let mut t = start;
            while t < end {
                let next = self.recompute_blocking_at(&related, t, end);
                t = if next > t { next } else { end };
            }
        }
        self.order = order;
        self.state_computed_time = end.max(start);
    }

    /// Every stream reachable from `id` through ports that carry blocking.
    fn blocking_related_streams(&self, id: StreamId, visited: &mut BitSet) -> Vec<StreamId> {
        let mut related = vec![];
        let mut work = vec![id];
        visited.set(id.index());
        while let Some(id) = work.pop() {
            let Some(stream) = self.streams.get(id.0) else {
                continue;
            };
            related.push(id);
            for port in stream.inputs().iter().chain(&stream.consumers) {
                let Some(port) = self.ports.get(port.0) else {
                    continue;
                };
                if !port
                    .flags
                    .intersects(PortFlags::BLOCK_INPUT | PortFlags::BLOCK_OUTPUT)
                {
                    continue;
                }
                for other in [port.source, port.dest] {
                    if visited.insert(other.index()) {
                        work.push(other);
                    }
                }
            }
        }
        related
    }

    /// Decide blocking for `related` from `time` onwards. Returns the next time at which the
    /// decision might change.
    fn recompute_blocking_at(
        &mut self,
        related: &[StreamId],
        time: GraphTime,
        end_decisions: GraphTime,
    ) -> GraphTime {
        let clock = self.clock();
        let mut next = GRAPH_TIME_MAX;
        let mut blocked = BitSet::new();
        for id in related {
            let Some(stream) = self.streams.get(id.0) else {
                continue;
            };
            if stream.finished {
                let all_played = stream.stream_time_to_graph_time(
                    clock,
                    stream.buffer.all_tracks_end(),
                    false,
                );
                if all_played <= time {
                    trace!(stream = ?id, time, "blocked: finished");
                    self.mark_stream_blocking(*id, &mut blocked);
                    continue;
                }
                next = next.min(all_played);
            }
            let (blockers, change) = stream.explicit_blockers.get_with_end(time);
            next = next.min(change);
            if blockers > 0 {
                trace!(stream = ?id, time, blockers, "blocked: explicit");
                self.mark_stream_blocking(*id, &mut blocked);
                continue;
            }
            if will_underrun(stream, clock, time, end_decisions, &mut next) {
                trace!(stream = ?id, time, "blocked: underrun");
                self.mark_stream_blocking(*id, &mut blocked);
            }
        }
        for id in related {
            let Some(stream) = self.streams.get_mut(id.0) else {
                continue;
            };
            if let Err(error) = stream.blocked.set_from(time, blocked.get(id.index())) {
                warn!(stream = ?id, %error, "blocking decision out of order");
            }
        }
        next
    }

    /// Block `id` and everything the ports force to block with it.
    fn mark_stream_blocking(&self, id: StreamId, blocked: &mut BitSet) {
        let mut work = vec![id];
        while let Some(id) = work.pop() {
            if !blocked.insert(id.index()) {
                continue;
            }
            let Some(stream) = self.streams.get(id.0) else {
                continue;
            };
            for port in &stream.consumers {
                if let Some(port) = self.ports.get(port.0) {
                    if port.flags.contains(PortFlags::BLOCK_OUTPUT) {
                        work.push(port.dest);
                    }
                }
            }
            for port in stream.inputs() {
                if let Some(port) = self.ports.get(port.0) {
                    if port.flags.contains(PortFlags::BLOCK_INPUT) {
                        work.push(port.source);
                    }
                }
            }
        }
    }
}

/// Whether a source runs out of data at `time`. A source that is already blocked stays blocked
/// until it has data up to `end_decisions`, so it does not flap on every block of new data.
fn will_underrun(
    stream: &Stream,
    clock: crate::stream::Clock,
    time: GraphTime,
    end_decisions: GraphTime,
    next: &mut GraphTime,
) -> bool {
    if stream.finished || stream.source().is_none() {
        return false;
    }
    let buffer_end = stream.stream_time_to_graph_time(clock, stream.buffer.end(), true);
    if buffer_end <= time {
        return true;
    }
    if buffer_end <= end_decisions && stream.blocked.get_before(time) {
        return true;
    }
    *next = (*next).min(buffer_end);
    false
}
