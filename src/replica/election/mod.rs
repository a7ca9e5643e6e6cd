mod clock;
mod election_state;
mod leader_state;
mod state_change_listener;
mod timers;

pub(crate) use election_state::{ElectionConfig, ElectionState};
pub(crate) use leader_state::{LeaderStateTracker, PeerState, PeerStateUpdate};
pub(crate) use state_change_listener::{ElectionStateChangeListener, ElectionStateSnapshot};
