//! The lifecycle of a stream as seen by the graph.
//!
//! ```text
//!            Block              Finish
//!   Active <-------> Blocked ----------> Finished
//!            Unblock                        |
//!      \__________ Destroy _________________|___> Destroyed
//! ```
//!
//! Finished streams stay blocked forever. Destroyed is terminal.

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum StreamState {
    Active,
    #[default]
    Blocked,
    Finished,
    Destroyed,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum StateEvent {
    Block,
    Unblock,
    Finish,
    Destroy,
}

impl StreamState {
    pub fn on(self, event: StateEvent) -> Self {
        use StateEvent::*;
        use StreamState::*;
        match (self, event) {
            (Destroyed, _) | (_, Destroy) => Destroyed,
            (Finished, _) | (_, Finish) => Finished,
            (_, Block) => Blocked,
            (_, Unblock) => Active,
        }
    }

    pub fn is_blocked(self) -> bool {
        self != Self::Active
    }

    pub fn is_finished(self) -> bool {
        matches!(self, Self::Finished | Self::Destroyed)
    }

    pub fn is_destroyed(self) -> bool {
        self == Self::Destroyed
    }
}

#[cfg(test)]
mod tests {
    use super::{StateEvent::*, StreamState::*, *};

    #[test]
    fn transition_table() {
        let table = [
            (Active, Block, Blocked),
            (Active, Unblock, Active),
            (Active, Finish, Finished),
            (Active, Destroy, Destroyed),
            (Blocked, Block, Blocked),
            (Blocked, Unblock, Active),
            (Blocked, Finish, Finished),
            (Blocked, Destroy, Destroyed),
            (Finished, Block, Finished),
            (Finished, Unblock, Finished),
            (Finished, Finish, Finished),
            (Finished, Destroy, Destroyed),
            (Destroyed, Block, Destroyed),
            (Destroyed, Unblock, Destroyed),
            (Destroyed, Finish, Destroyed),
            (Destroyed, Destroy, Destroyed),
        ];
        for (from, event, to) in table {
            assert_eq!(from.on(event), to, "{from:?} --{event:?}-->");
        }
    }

    #[test]
    fn finished_implies_blocked() {
        for state in [Active, Blocked, Finished, Destroyed] {
            if state.is_finished() {
                assert!(state.is_blocked());
            }
        }
        assert!(!Active.is_blocked());
        assert_eq!(StreamState::default(), Blocked);
    }

    #[test]
    fn destroy_is_idempotent() {
        for state in [Active, Blocked, Finished, Destroyed] {
            let once = state.on(Destroy);
            assert_eq!(once, once.on(Destroy));
            assert!(once.is_destroyed());
        }
    }
}
