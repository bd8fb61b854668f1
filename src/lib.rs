//! Transpass - Caching Translation Pass-Through Engine
//!
//! Translates batches of strings through paid translation APIs while spending
//! as little of their monthly character quota as possible: repeated inputs are
//! collapsed, previous translations are served from LRU caches, and providers
//! are tried in priority order with per-provider budget checks.

pub mod batch;
pub mod cache;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod provider;
pub mod quota;
pub mod router;
pub mod settings;
pub mod store;

pub use engine::{Engine, EngineOptions, TranslateRequest};
pub use error::{Result, TranspassError};
pub use router::{TranslateResponse, TranslationError, UsedProvider};
