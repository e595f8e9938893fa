//! Listener traits and the notifications the graph thread queues for them.
//!
//! Listeners never receive a handle to the engine. A listener that wants to change the graph
//! holds a [crate::Graph] and goes through the same message queue as every other thread.
use std::{
    ops::{BitOr, BitOrAssign},
    sync::Arc,
};

use buffer::{MediaSegment, TrackId};
use util::time::{GraphTime, StreamTime};

use crate::StreamId;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Consumption {
    Consumed,
    NotConsumed,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Blocking {
    Blocked,
    Unblocked,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StreamEvent {
    Finished,
    Removed,
    HasDirectListeners,
    HasNoDirectListeners,
}

/// What happened to a track alongside a queued data notification.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct TrackEvents(u8);

impl TrackEvents {
    pub const NONE: Self = Self(0);
    pub const CREATED: Self = Self(1);
    pub const ENDED: Self = Self(2);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for TrackEvents {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for TrackEvents {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Receives stream notifications on the graph thread.
///
/// Callbacks run without any graph lock held but directly delay processing, so they must not
/// block. Every method has an empty default.
pub trait MediaStreamListener: Send + Sync {
    /// Sources only: whether anything downstream plays this stream.
    fn notify_consumption_changed(&self, _consumption: Consumption) {}

    /// Sources with pulling enabled: data is wanted up to `desired_time`. Called synchronously;
    /// data appended from inside the callback is picked up by the current iteration.
    fn notify_pull(&self, _desired_time: StreamTime) {}

    fn notify_blocking_changed(&self, _blocking: Blocking) {}

    fn notify_has_current_data(&self) {}

    /// The graph advanced to `current_time` and this stream played part of it.
    fn notify_output(&self, _current_time: GraphTime) {}

    fn notify_event(&self, _event: StreamEvent) {}

    fn notify_queued_track_changes(
        &self,
        _track: TrackId,
        _offset: StreamTime,
        _events: TrackEvents,
        _data: &MediaSegment,
    ) {
    }

    /// Every track created in this iteration has been reported.
    fn notify_finished_track_creation(&self) {}
}

/// Receives data on the producer thread as soon as it is appended to a source.
pub trait DirectListener: Send + Sync {
    fn notify_realtime_data(
        &self,
        track: TrackId,
        offset: StreamTime,
        events: TrackEvents,
        data: &MediaSegment,
    );
}

/// Receives main-thread state changes from [crate::Graph::update_main_thread_state].
pub trait MainThreadListener: Send + Sync {
    fn notify_stream_finished(&self, stream: StreamId);
}

#[derive(Clone, Debug)]
pub(crate) enum Notification {
    ConsumptionChanged(Consumption),
    BlockingChanged(Blocking),
    HasCurrentData,
    Output(GraphTime),
    Event(StreamEvent),
    QueuedTrackChanges {
        track: TrackId,
        offset: StreamTime,
        events: TrackEvents,
        data: MediaSegment,
    },
    FinishedTrackCreation,
}

impl Notification {
    fn deliver(&self, listener: &dyn MediaStreamListener) {
        match self {
            Self::ConsumptionChanged(consumption) => {
                listener.notify_consumption_changed(*consumption)
            }
            Self::BlockingChanged(blocking) => listener.notify_blocking_changed(*blocking),
            Self::HasCurrentData => listener.notify_has_current_data(),
            Self::Output(time) => listener.notify_output(*time),
            Self::Event(event) => listener.notify_event(*event),
            Self::QueuedTrackChanges {
                track,
                offset,
                events,
                data,
            } => listener.notify_queued_track_changes(*track, *offset, *events, data),
            Self::FinishedTrackCreation => listener.notify_finished_track_creation(),
        }
    }
}

/// Notifications and callbacks collected during an iteration, delivered once it is published.
#[derive(Default)]
pub(crate) struct Outbox {
    pending: Vec<(Arc<dyn MediaStreamListener>, Notification)>,
    callbacks: Vec<Box<dyn FnOnce() + Send>>,
}

impl Outbox {
    pub(crate) fn notify(
        &mut self,
        listeners: &[Arc<dyn MediaStreamListener>],
        notification: Notification,
    ) {
        for listener in listeners {
            self.pending.push((listener.clone(), notification.clone()));
        }
    }

    pub(crate) fn notify_one(
        &mut self,
        listener: Arc<dyn MediaStreamListener>,
        notification: Notification,
    ) {
        self.pending.push((listener, notification));
    }

    pub(crate) fn defer(&mut self, callback: Box<dyn FnOnce() + Send>) {
        self.callbacks.push(callback);
    }

    pub(crate) fn dispatch(&mut self) {
        for (listener, notification) in std::mem::take(&mut self.pending) {
            notification.deliver(listener.as_ref());
        }
        for callback in std::mem::take(&mut self.callbacks) {
            callback();
        }
    }
}

pub(crate) fn same_listener<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}
