pub mod server;
pub mod types;

pub use server::StatusBroadcaster;
pub use types::{
    EngineStatus, GridLevelsView, LevelInfo, MarketEvent, OrderEvent, WSEvent,
};
