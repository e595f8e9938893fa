//! Directed edges from any stream into a processed stream.
use std::ops::BitOr;

use util::{
    collections::Key,
    time::{GraphTime, GRAPH_TIME_MAX},
};

use crate::{stream::Stream, StreamId};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortId(pub(crate) Key);

/// How blocking propagates across a port.
///
/// - [PortFlags::BLOCK_INPUT]: when the destination is blocked, so is the source.
/// - [PortFlags::BLOCK_OUTPUT]: when the source is blocked, so is the destination.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct PortFlags(u8);

impl PortFlags {
    pub const NONE: Self = Self(0);
    pub const BLOCK_INPUT: Self = Self(1);
    pub const BLOCK_OUTPUT: Self = Self(2);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for PortFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// A span of graph time during which the destination is unblocked and the source's blocking
/// state does not change.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct InputInterval {
    pub start: GraphTime,
    pub end: GraphTime,
    pub input_is_blocked: bool,
}

#[derive(Clone, Debug)]
pub(crate) struct Port {
    pub(crate) source: StreamId,
    pub(crate) dest: StreamId,
    pub(crate) flags: PortFlags,
    pub(crate) input_number: u16,
    pub(crate) output_number: u16,
}

impl Port {
    /// The first interval at or after `time`. If the destination stays blocked forever the
    /// interval starts and ends at [GRAPH_TIME_MAX].
    pub(crate) fn next_input_interval(
        source: &Stream,
        dest: &Stream,
        time: GraphTime,
    ) -> InputInterval {
        let mut t = time;
        let end = loop {
            let (blocked, end) = dest.blocked.get_with_end(t);
            if !blocked {
                break end;
            }
            if end >= GRAPH_TIME_MAX {
                return InputInterval {
                    start: GRAPH_TIME_MAX,
                    end: GRAPH_TIME_MAX,
                    input_is_blocked: false,
                };
            }
            t = end;
        };
        let (input_is_blocked, source_end) = source.blocked.get_with_end(t);
        InputInterval {
            start: t,
            end: end.min(source_end),
            input_is_blocked,
        }
    }
}
