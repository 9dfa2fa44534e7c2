pub mod config;
pub mod dispatch;
pub mod error;
pub mod fallback;
pub mod image_source;
pub mod orchestrator;
pub mod parsers;
pub mod progress;
pub mod response;
pub mod server;
pub mod tools;
