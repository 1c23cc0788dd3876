//! Delayed lifecycle actions on top of a shared ordered store.
//!
//! Messages live in an ordered set scored by delivery time, with a lookup
//! hash from sandbox id to its single pending message and a separate
//! dead-letter set. Delivery is at-least-once: a failed handler is retried
//! with exponential backoff and dead-lettered once `max_retries` is exceeded.

mod config;
mod error;
mod message;
mod retry;
mod scheduler;
mod store;

pub use config::{DEFAULT_QUEUE_NAME, SchedulerConfig};
pub use error::{QueueError, Result};
pub use message::{Action, ScheduledMessage};
pub use retry::RetryPolicy;
pub use scheduler::{HandlerError, MessageHandler, Scheduler};
pub use store::{DelayStore, MemoryDelayStore, RedisDelayStore};
