// src/messaging/mod.rs
// Broker-independent building blocks shared by the workers and their callers

pub mod queue;
pub mod types;
