//! Lead Pipeline — mailbox in, classified reservation leads out.

pub mod classifier;
pub mod config;
pub mod error;
pub mod llm;
pub mod logging;
pub mod mail;
pub mod pipeline;
pub mod queue;
pub mod store;
