pub mod api;
pub mod config;
pub mod entities;
pub mod error;
pub mod metrics;
pub mod migrator;
pub mod pipeline;
pub mod queue;
pub mod roster;
pub mod storage;
pub mod telemetry;
pub mod token;
pub mod watermark;
pub mod worker;

pub use sea_orm;
pub use redis;
