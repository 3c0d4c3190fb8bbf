pub mod agents;
pub mod audit;
pub mod database;
pub mod dispatch;
pub mod migrations;
pub mod models;
pub mod rate_limit;
pub mod sessions;
pub mod users;
pub mod vault;

mod error;

pub use database::Database;
pub use error::StoreError;
pub use models::*;
