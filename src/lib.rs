//! Taskflow — task lifecycle and queue management core.

pub mod config;
pub mod error;
pub mod store;
pub mod tasks;
