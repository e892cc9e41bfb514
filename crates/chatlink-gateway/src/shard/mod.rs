//! Shard supervision

mod supervisor;

pub use supervisor::ShardSupervisor;
