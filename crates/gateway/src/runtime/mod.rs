//! Task runtime: admission, per-task event queues, and the background
//! graph-driving runner (C7).

pub mod tasks;

pub use tasks::{StartTaskRequest, TaskEvent, TaskHub};
