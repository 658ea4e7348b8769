pub mod backup;
pub mod catalog;
pub mod cluster;
pub mod context;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod models;
pub mod restore;
pub mod schedule;
pub mod scheduler;
pub mod sinks;

pub use error::{Result, SentinelError};
