//! Sync Service - cursor-driven transaction feed sync with idempotent
//! period/category rollups.

pub mod config;
pub mod dtos;
pub mod error;
pub mod handlers;
pub mod models;
pub mod services;
pub mod startup;

pub use startup::{AppState, Application};
