//! Event-processing primitives for the VDP uplink agent.
//!
//! This crate provides the building blocks the agent's control loop is made
//! of:
//!
//! - [`PriorityQueue`]: Multi-producer, single-consumer queue ordered by
//!   priority, FIFO within one priority, with async wakeup
//! - [`PeriodicTask`]: Supervised timer-driven background task
//! - [`TaskStatus`] / [`TaskError`]: Outcome taxonomy for processing one
//!   queued message
//!
//! # Architecture
//!
//! The agent runs a fixed set of cooperating tasks:
//!
//! 1. One consumer drains the main [`PriorityQueue`]
//! 2. Producers (request intake, uplink detection) push messages
//! 3. Messages that must be retried are parked in a second queue
//! 4. A [`PeriodicTask`] moves parked messages back onto the main queue
//!
//! # Example
//!
//! ```ignore
//! use vdp_orch_common::{PeriodicTask, PriorityQueue};
//!
//! let queue = Arc::new(PriorityQueue::new("main"));
//! queue.push(10, msg);
//!
//! let task = PeriodicTask::spawn("drain", Duration::from_secs(30), move || {
//!     let queue = queue.clone();
//!     async move { Ok::<_, std::convert::Infallible>(()) }
//! });
//! ```

mod periodic;
mod queue;
mod task;

pub use periodic::{supervise, PeriodicTask};
pub use queue::PriorityQueue;
pub use task::{TaskError, TaskResult, TaskResultExt, TaskStatus};
