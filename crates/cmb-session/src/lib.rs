//! Per-client session tracking: each session owns one sandbox executor.

mod resolver;

pub use resolver::{ExecutorFactory, SINGLETON_SESSION_ID, SessionResolver, new_session_id};
