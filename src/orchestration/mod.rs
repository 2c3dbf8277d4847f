pub mod actions;
pub mod engine;
pub mod error;
pub mod event;
pub mod observers;
pub mod rules;
pub mod state_store;
