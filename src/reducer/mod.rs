mod game;
mod reducer;
mod team;
mod view;

pub use game::GameReducer;
pub use game::GameState;
pub use game::GameStatus;
pub use game::ScoreEvent;
pub use reducer::ConsistencyReport;
pub use reducer::Reducer;
pub use reducer::Replay;
pub use team::TeamReducer;
pub use team::TeamState;
pub use view::MaterializedView;
pub use view::ViewMismatch;
