//! Product Visualizer
//!
//! Batch orchestration for AI product lifestyle images: job descriptors are
//! validated, submitted to an external image provider, polled to a terminal
//! state under a bounded worker pool, and collected into a run log.

pub mod app_state;
pub mod config;
pub mod models;
pub mod routes;
pub mod services;
