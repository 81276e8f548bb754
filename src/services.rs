#![forbid(unsafe_code)]

pub mod forwarder;
pub mod ingest_listener;
pub mod store;
pub mod web_front;
