//! Host service for a supervised game server: watchdog state machine,
//! A/B build and engine-version staging, and the loopback interop
//! channel the hosted process calls back on.

pub mod engine;
pub mod interop;
pub mod logbuf;
pub mod metrics;
pub mod notify;
pub mod reattach;
pub mod staging;
pub mod supervisor;
pub mod support;
