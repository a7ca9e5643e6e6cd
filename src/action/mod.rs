//! Actions, action logs and the entities built from them.
mod action;
mod action_log;
mod effective;
mod entity;
mod migrate;

pub use action::Action;
pub use action::ActionId;
pub use action::ActionKind;
pub use action::AdjustScore;
pub use action::CreateGame;
pub use action::CreateTeam;
pub use action::EndGame;
pub use action::EndPeriod;
pub use action::RecordNote;
pub use action::RecordScore;
pub use action::SetLineup;
pub use action::Side;
pub use action::StartPeriod;
pub use action::Substitution;
pub use action::Undo;
pub use action::UnknownAction;
pub use action::UpdateRoster;
pub use action::UserId;
pub use action::CURRENT_SCHEMA_VERSION;
pub use action_log::ActionLog;
pub use action_log::Revision;
pub use effective::effective_actions;
pub use effective::next_redo_candidate;
pub use effective::next_undo_candidate;
pub use effective::Resolution;
pub use entity::EntityId;
pub use entity::EntityKind;
pub use entity::EntityMetadata;
pub use entity::EntityRecord;
pub use entity::WriteOutcome;
pub use migrate::MigrationError;
