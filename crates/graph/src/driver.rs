//! The loop that runs on the graph thread.
//!
//! A realtime graph advances with the wall clock, deciding blocking a little ahead of it. A
//! non-realtime graph runs iterations back to back until it reaches the end time requested with
//! [crate::Graph::start_non_realtime_processing], then sleeps until told otherwise.
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use tracing::{debug, error, info_span, trace};
use util::{
    cast_ticks,
    time::{microseconds_to_ticks_round_down, round_up_to_block, GraphTime},
};

use crate::{
    engine::Engine,
    message::{Command, Message},
};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Running,
    ShuttingDown,
    Stopped,
}

pub(crate) struct Monitor {
    pub(crate) lifecycle: Lifecycle,
    /// Non-realtime graphs process up to here.
    pub(crate) end_time: GraphTime,
    /// The graph thread is asleep and wants a [Command::Wake] for new work.
    pub(crate) waiting: bool,
    pub(crate) fatal: Option<String>,
}

/// Lets any thread reach the graph thread.
pub(crate) struct Waker {
    sender: Sender<Command>,
    pub(crate) monitor: Mutex<Monitor>,
}

impl Waker {
    pub(crate) fn new(sender: Sender<Command>) -> Self {
        Self {
            sender,
            monitor: Mutex::new(Monitor {
                lifecycle: Lifecycle::Running,
                end_time: 0,
                waiting: false,
                fatal: None,
            }),
        }
    }

    /// Returns false if the graph thread is gone.
    pub(crate) fn send(&self, command: Command) -> bool {
        self.sender.send(command).is_ok()
    }

    pub(crate) fn is_running(&self) -> bool {
        self.monitor.lock().lifecycle == Lifecycle::Running
    }

    /// Make sure a sleeping graph thread runs another iteration.
    pub(crate) fn ensure_next_iteration(&self) {
        let waiting = std::mem::replace(&mut self.monitor.lock().waiting, false);
        if waiting {
            self.send(Command::Wake);
        }
    }
}

pub(crate) struct Driver {
    pub(crate) engine: Engine,
    receiver: Receiver<Command>,
    waker: std::sync::Arc<Waker>,
    /// Wall-clock instant that graph time `anchor_time` corresponds to. Reset after idling.
    anchor: Instant,
    anchor_time: GraphTime,
    batches: Vec<Vec<Message>>,
    shutdown: bool,
}

impl Driver {
    pub(crate) fn new(
        engine: Engine,
        receiver: Receiver<Command>,
        waker: std::sync::Arc<Waker>,
    ) -> Self {
        Self {
            engine,
            receiver,
            waker,
            anchor: Instant::now(),
            anchor_time: 0,
            batches: vec![],
            shutdown: false,
        }
    }

    pub(crate) fn run(mut self) {
        let span = info_span!("graph", realtime = self.engine.options.realtime);
        let _enter = span.enter();
        debug!("graph thread started");
        self.reanchor();
        while !self.shutdown {
            let end = if self.engine.options.realtime {
                self.wait_realtime()
            } else {
                self.wait_non_realtime()
            };
            if self.shutdown {
                break;
            }
            if let Err(error) = self.iterate(end) {
                error!(%error, "graph thread stopped");
                let mut monitor = self.waker.monitor.lock();
                monitor.fatal = Some(error.to_string());
                monitor.lifecycle = Lifecycle::Stopped;
                return;
            }
        }
        self.engine.shutdown();
        self.waker.monitor.lock().lifecycle = Lifecycle::Stopped;
        debug!("graph thread stopped");
    }

    /// Run a single iteration up to `end` with whatever has been sent so far.
    #[cfg(test)]
    pub(crate) fn step_to(&mut self, end: GraphTime) -> crate::Result<()> {
        while let Ok(command) = self.receiver.try_recv() {
            self.receive(command);
        }
        self.iterate(end)
    }

    fn iterate(&mut self, end: GraphTime) -> crate::Result<()> {
        let batches = std::mem::take(&mut self.batches);
        trace!(end, batches = batches.len(), "iteration");
        self.engine.one_iteration(end, batches)
    }

    fn receive(&mut self, command: Command) {
        match command {
            Command::Batch(batch) => self.batches.push(batch),
            Command::Wake => (),
            Command::Shutdown => self.shutdown = true,
        }
    }

    fn drain(&mut self) {
        loop {
            match self.receiver.try_recv() {
                Ok(command) => self.receive(command),
                Err(TryRecvError::Empty) => return,
                Err(TryRecvError::Disconnected) => {
                    self.shutdown = true;
                    return;
                }
            }
        }
    }

    /// Map the current instant to the state-computed time.
    fn reanchor(&mut self) {
        self.anchor = Instant::now();
        self.anchor_time = self.engine.state_computed_time;
    }

    /// Sleep until the next iteration is due, collecting messages. Returns the end of the
    /// iteration: the wall clock plus the audio target, held back while the sink has a backlog
    /// and never more than [crate::Options::max_iteration_ticks] past the state-computed time.
    fn wait_realtime(&mut self) -> GraphTime {
        let options = &self.engine.options;
        let period = Duration::from_millis(u64::from(options.iteration_ms));
        let computed = self.engine.state_computed_time;
        if self.engine.streams.is_empty() && self.batches.is_empty() {
            self.sleep_until_woken();
            self.reanchor();
        } else {
            let deadline = Instant::now() + period;
            while !self.shutdown {
                match self.receiver.recv_deadline(deadline) {
                    Ok(command) => self.receive(command),
                    Err(RecvTimeoutError::Timeout) => break,
                    Err(RecvTimeoutError::Disconnected) => self.shutdown = true,
                }
            }
        }

        let options = &self.engine.options;
        let elapsed = cast_ticks!(self.anchor.elapsed().as_micros());
        let now = self.anchor_time + microseconds_to_ticks_round_down(options.sample_rate, elapsed);
        let target = now + options.audio_target_ticks();
        let backlog = self
            .engine
            .sink
            .written_frames()
            .saturating_sub(self.engine.sink.position());
        if cast_ticks!(backlog) > 2 * options.audio_target_ticks() {
            return computed;
        }
        round_up_to_block(target, options.block_ticks())
            .min(computed + options.max_iteration_ticks())
            .max(computed)
    }

    /// Collect messages and return the next end, sleeping once the end time has been reached.
    fn wait_non_realtime(&mut self) -> GraphTime {
        self.drain();
        let computed = self.engine.state_computed_time;
        let end_time = self.waker.monitor.lock().end_time;
        if computed < end_time {
            return (computed + self.engine.options.iteration_ticks()).min(end_time);
        }
        if self.batches.is_empty() {
            self.sleep_until_woken();
        }
        let end_time = self.waker.monitor.lock().end_time;
        (computed + self.engine.options.iteration_ticks()).min(end_time.max(computed))
    }

    fn sleep_until_woken(&mut self) {
        self.waker.monitor.lock().waiting = true;
        match self.receiver.recv() {
            Ok(command) => self.receive(command),
            Err(_) => self.shutdown = true,
        }
        self.waker.monitor.lock().waiting = false;
        self.drain();
    }
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Duration};

    use crate::{output::NullSink, testing::init_tracing, Graph, Options};

    #[test]
    fn realtime_iterations_stay_bounded_after_idling() {
        init_tracing();
        let options = Options::realtime(48_000);
        let max = options.max_iteration_ticks();
        let (graph, mut driver) = Graph::build(options, Box::new(NullSink::default())).unwrap();
        driver.reanchor();

        thread::sleep(Duration::from_millis(200));
        let _union = graph.create_track_union_stream();
        graph.commit_changes().unwrap();
        let end = driver.wait_realtime();
        assert!(end <= max, "resumed at {end}");
        driver.iterate(end).unwrap();

        // A stalled graph thread catches up one bounded step at a time.
        thread::sleep(Duration::from_millis(200));
        let computed = driver.engine.state_computed_time;
        let next = driver.wait_realtime();
        assert!(next > computed);
        assert!(next <= computed + max, "stepped from {computed} to {next}");
    }
}
