//! Persistence layer — the finalized record stream and the customer index built from it.

pub mod jsonl;

pub use jsonl::JsonlRecordSink;
