pub mod audit;
pub mod bus;
pub mod catalog;
pub mod config;
pub mod criteria;
pub mod db;
pub mod error;

pub use audit::{Audited, EntityEvent, FieldChange, FieldText};
pub use bus::{Event, EventBus, Listener};
pub use catalog::Catalog;
pub use config::Config;
pub use criteria::{apply_criteria, Criterion, Operator, Pagination, Queryable};
pub use db::Db;
pub use error::CriteriaError;
pub use rusqlite;
pub use rusqlite_migration;
