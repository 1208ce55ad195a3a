//! Core library for repcoach.
//!
//! Pure engines (timer reconstruction, interval replay, streaks and XP,
//! weekly aggregation) plus the SQLite store and the service facade the
//! server and CLI share.

pub mod clock;
pub mod coach;
pub mod db;
pub mod gamification;
pub mod interval;
pub mod log_import;
pub mod models;
pub mod service;
pub mod tool_state;
pub mod weekly;
