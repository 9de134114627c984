pub mod store;
pub mod worker;

pub use store::{split_symbol, CheckGuard, Position, PositionInfo, PositionKey, PositionStore};
pub use worker::{NewPosition, PositionEvent, PositionWorker};
