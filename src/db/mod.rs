pub use self::core::{now_millis, Db, DbConnection};
pub use history::{HistoryQuery, HistoryRecorder, HistoryRepository};
pub use query::SelectQuery;
pub use types::*;

pub mod core;
pub mod history;
pub mod query;
pub mod schema;
pub mod types;
