//! Priority job queue and bounded worker pool for heavyweight media jobs.
//!
//! Jobs are brokered (Redis in production, in-process for tests), owned by one worker while
//! processing, and always end in a terminal status that callers poll through [`client::JobClient`].

pub mod client;
pub mod config;
pub mod error;
pub mod job;
pub mod pool;
pub mod queue;
pub mod redis_queue;
pub mod supervisor;
pub mod worker;

pub use client::JobClient;
pub use config::WorkerConfig;
pub use error::TaskQueueError;
pub use job::{Job, JobPayload, JobStatus, JobType, StatusRecord};
pub use pool::WorkerPool;
pub use queue::{InMemoryJobQueue, JobQueue};
pub use redis_queue::RedisJobQueue;
pub use worker::{HeavyPermit, HeavySlots, HeavyTool, HeavyToolGauge};
