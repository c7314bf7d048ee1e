//! Content-addressable document store: event-sourced descriptors and
//! handles, the projections read from them, and the conversion pipeline.

pub mod config;
pub mod domain;
pub mod error;
pub mod eventlog;
pub mod pipeline;
pub mod projections;
pub mod repository;
pub mod service;
pub mod state;

pub use error::{Result, ServiceError};
