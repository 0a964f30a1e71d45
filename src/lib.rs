pub mod app;
pub mod config;
pub mod context;
pub mod error;
pub mod extraction;
pub mod llm;
pub mod prompting;
pub mod scan_queue;
pub mod shutdown;
pub mod store;
pub mod types;
