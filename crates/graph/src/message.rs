//! Control messages from other threads to the graph thread.
use std::{fmt, sync::Arc};

use buffer::TrackId;

use crate::{
    listener::MediaStreamListener,
    output::VideoFrameContainer,
    port::{PortFlags, PortId},
    stream::Kind,
    StreamId,
};

pub(crate) enum Message {
    CreateStream {
        id: StreamId,
        kind: Kind,
    },
    DestroyStream(StreamId),
    SetAutofinish {
        stream: StreamId,
        autofinish: bool,
    },
    Finish(StreamId),
    CreatePort {
        id: PortId,
        source: StreamId,
        dest: StreamId,
        flags: PortFlags,
        input_number: u16,
        output_number: u16,
    },
    DestroyPort(PortId),
    AddAudioOutput {
        stream: StreamId,
        key: u64,
    },
    SetAudioOutputVolume {
        stream: StreamId,
        key: u64,
        volume: f32,
    },
    RemoveAudioOutput {
        stream: StreamId,
        key: u64,
    },
    AddVideoOutput {
        stream: StreamId,
        container: VideoFrameContainer,
    },
    RemoveVideoOutput {
        stream: StreamId,
        container: VideoFrameContainer,
    },
    ChangeExplicitBlockerCount {
        stream: StreamId,
        delta: i32,
    },
    SetUserBlocked {
        stream: StreamId,
        blocked: bool,
    },
    AddListener {
        stream: StreamId,
        listener: Arc<dyn MediaStreamListener>,
    },
    RemoveListener {
        stream: StreamId,
        listener: Arc<dyn MediaStreamListener>,
    },
    SetTrackEnabled {
        stream: StreamId,
        track: TrackId,
        enabled: bool,
    },
    DirectListenersChanged {
        stream: StreamId,
        present: bool,
    },
    /// Run once every message queued before it has been applied.
    RunAfter(Box<dyn FnOnce() + Send>),
}

pub(crate) enum Command {
    /// Messages applied atomically between two iterations.
    Batch(Vec<Message>),
    /// Nothing to apply, but the graph should not keep sleeping.
    Wake,
    Shutdown,
}

impl Message {
    /// The stream this message changes, if any.
    pub(crate) fn stream(&self) -> Option<StreamId> {
        match self {
            Self::CreateStream { id, .. } => Some(*id),
            Self::DestroyStream(stream) | Self::Finish(stream) => Some(*stream),
            Self::CreatePort { dest, .. } => Some(*dest),
            Self::DestroyPort(_) | Self::RunAfter(_) => None,
            Self::SetAutofinish { stream, .. }
            | Self::AddAudioOutput { stream, .. }
            | Self::SetAudioOutputVolume { stream, .. }
            | Self::RemoveAudioOutput { stream, .. }
            | Self::AddVideoOutput { stream, .. }
            | Self::RemoveVideoOutput { stream, .. }
            | Self::ChangeExplicitBlockerCount { stream, .. }
            | Self::SetUserBlocked { stream, .. }
            | Self::AddListener { stream, .. }
            | Self::RemoveListener { stream, .. }
            | Self::SetTrackEnabled { stream, .. }
            | Self::DirectListenersChanged { stream, .. } => Some(*stream),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::CreateStream { .. } => "CreateStream",
            Self::DestroyStream(_) => "DestroyStream",
            Self::SetAutofinish { .. } => "SetAutofinish",
            Self::Finish(_) => "Finish",
            Self::CreatePort { .. } => "CreatePort",
            Self::DestroyPort(_) => "DestroyPort",
            Self::AddAudioOutput { .. } => "AddAudioOutput",
            Self::SetAudioOutputVolume { .. } => "SetAudioOutputVolume",
            Self::RemoveAudioOutput { .. } => "RemoveAudioOutput",
            Self::AddVideoOutput { .. } => "AddVideoOutput",
            Self::RemoveVideoOutput { .. } => "RemoveVideoOutput",
            Self::ChangeExplicitBlockerCount { .. } => "ChangeExplicitBlockerCount",
            Self::SetUserBlocked { .. } => "SetUserBlocked",
            Self::AddListener { .. } => "AddListener",
            Self::RemoveListener { .. } => "RemoveListener",
            Self::SetTrackEnabled { .. } => "SetTrackEnabled",
            Self::DirectListenersChanged { .. } => "DirectListenersChanged",
            Self::RunAfter(_) => "RunAfter",
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(self.name())
            .field("stream", &self.stream())
            .finish()
    }
}
