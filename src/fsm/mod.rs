//! The replicated state machine: commands, applying them, and proposing them.
mod command;
mod driver;
mod entity_fsm;
mod proposer;

pub use command::FsmCommand;
pub use command::InvalidCommand;
pub use command::RequestId;
pub use entity_fsm::Applied;
pub use entity_fsm::ApplyError;
pub use entity_fsm::ApplyOutcome;
pub use entity_fsm::EntityEvent;

pub(crate) use driver::FsmDriver;
pub(crate) use entity_fsm::EntityFsm;
pub(crate) use proposer::PendingApplies;
pub(crate) use proposer::ProposeError;
pub(crate) use proposer::Proposer;

#[cfg(test)]
pub(crate) use command::tests_support;
