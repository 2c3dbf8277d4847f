pub mod config;
pub mod core;
pub mod expr;
pub mod orchestration;
pub mod pipeline;
pub mod scheduler;
pub mod shared;
