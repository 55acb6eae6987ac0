//! Consumer bill-number extraction
//!
//! Batch engine that reads a consumer bill number off each submitted
//! image through a rate-limited vision model (Google Gemini), deduplicates
//! the numbers against a registry, and routes every image to a success,
//! failed or pending location.

pub mod app_state;
pub mod config;
pub mod db;
pub mod engine;
pub mod intake;
pub mod models;
pub mod services;
