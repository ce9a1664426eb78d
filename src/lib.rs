//! notegraph - A graph engine for linked notes: force-directed layout and graph analytics.
//!
//! The engine keeps an authoritative [`store::GraphStore`], runs the layout
//! simulation inline or on a background worker, and caches derived results.
//! Most callers only need [`engine::EngineFacade`].

pub mod analytics;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod io;
pub mod model;
pub mod protocol;
pub mod simulation;
pub mod store;
pub mod worker;

pub use engine::{EngineEvent, EngineFacade, EngineState};
pub use error::{EngineError, EngineResult};
