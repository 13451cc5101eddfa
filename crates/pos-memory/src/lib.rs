//! # pos-memory
//!
//! Persistent user, task, and avatar snapshot storage for POS (SQLite-backed).

pub mod store;

pub use store::{NewTask, NewUser, Store, Task, TaskPriority, TaskStatus, User};
