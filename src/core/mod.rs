//! Core logic: declaration types, parsing, reference resolution, planning,
//! refresh, state polling and execution.

pub mod executor;
pub mod parser;
pub mod planner;
pub mod refresh;
pub mod resolver;
pub mod state;
pub mod types;
pub mod wait;
