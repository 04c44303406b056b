//! LangScan - batch target-language text detection for game QA
//!
//! Screenshots are fingerprinted, answered from a content-addressed result
//! cache when possible, and otherwise run through an escalating multi-round
//! detection schedule on a pool of recognition-engine handles.

pub mod app;
pub mod batch;
pub mod cache;
pub mod config;
pub mod detection;
pub mod engine;
pub mod errors;
pub mod shared;
pub mod storage;
pub mod vision;

pub use app::LangScanApp;
pub use config::AppConfig;
