//! The two time domains of the graph.
//!
//! Both are integer tick counts at the graph's sample rate. [GraphTime] is shared by every stream
//! and only ever moves forward. [StreamTime] is private to a stream and only advances while that
//! stream is not blocked.

/// A point on the shared timeline.
pub type GraphTime = i64;

/// A point on a stream's private timeline.
pub type StreamTime = i64;

/// Samples per second.
pub type TrackRate = u32;

/// The largest representable time. Used as "never" and "not known yet".
pub const TIME_MAX: i64 = (1 << 62) - 1;
pub const GRAPH_TIME_MAX: GraphTime = TIME_MAX;
pub const STREAM_TIME_MAX: StreamTime = TIME_MAX;

const MICROSECONDS_PER_SECOND: i128 = 1_000_000;

/// Convert `ticks` from `from` ticks per second to `to` ticks per second, rounding down.
pub fn rate_convert_round_down(to: TrackRate, from: TrackRate, ticks: i64) -> i64 {
    if ticks >= TIME_MAX {
        return TIME_MAX;
    }
    let scaled = i128::from(ticks) * i128::from(to);
    clamp(scaled.div_euclid(i128::from(from.max(1))))
}

/// Convert `ticks` from `from` ticks per second to `to` ticks per second, rounding up.
pub fn rate_convert_round_up(to: TrackRate, from: TrackRate, ticks: i64) -> i64 {
    if ticks >= TIME_MAX {
        return TIME_MAX;
    }
    let from = i128::from(from.max(1));
    let scaled = i128::from(ticks) * i128::from(to);
    clamp(-((-scaled).div_euclid(from)))
}

/// Convert `ticks` between rates, rounding to the nearest tick.
pub fn rate_convert_round(to: TrackRate, from: TrackRate, ticks: i64) -> i64 {
    if ticks >= TIME_MAX {
        return TIME_MAX;
    }
    let from = i128::from(from.max(1));
    let scaled = i128::from(ticks) * i128::from(to);
    clamp((2 * scaled + from).div_euclid(2 * from))
}

pub fn ticks_to_seconds(rate: TrackRate, ticks: i64) -> f64 {
    ticks as f64 / f64::from(rate.max(1))
}

pub fn seconds_to_ticks_round_down(rate: TrackRate, seconds: f64) -> i64 {
    let ticks = (seconds * f64::from(rate)).floor();
    if ticks >= TIME_MAX as f64 {
        TIME_MAX
    } else {
        ticks as i64
    }
}

pub fn ticks_to_microseconds(rate: TrackRate, ticks: i64) -> i64 {
    let scaled = i128::from(ticks) * MICROSECONDS_PER_SECOND;
    clamp(scaled.div_euclid(i128::from(rate.max(1))))
}

pub fn microseconds_to_ticks_round_down(rate: TrackRate, microseconds: i64) -> i64 {
    let scaled = i128::from(microseconds) * i128::from(rate);
    clamp(scaled.div_euclid(MICROSECONDS_PER_SECOND))
}

pub fn milliseconds_to_ticks(rate: TrackRate, milliseconds: u32) -> i64 {
    i64::from(rate) * i64::from(milliseconds) / 1000
}

/// Round `time` up to the next multiple of `block`.
pub fn round_up_to_block(time: i64, block: i64) -> i64 {
    if block <= 1 || time >= TIME_MAX {
        return time;
    }
    let rem = time.rem_euclid(block);
    if rem == 0 {
        time
    } else {
        time - rem + block
    }
}

fn clamp(value: i128) -> i64 {
    if value >= i128::from(TIME_MAX) {
        TIME_MAX
    } else if value <= -i128::from(TIME_MAX) {
        -TIME_MAX
    } else {
        value as i64
    }
}
