//! Target-side executor core for a coverage-guided kernel fuzzer: the shared
//! input region, fixed-arity call dispatch, and the kernel coverage buffer
//! lifecycle for every execution unit

pub mod err;
pub mod misc;
pub mod config;
pub mod env;
pub mod dispatch;
pub mod cover;
pub mod classify;
pub mod trace;
pub mod executor;
