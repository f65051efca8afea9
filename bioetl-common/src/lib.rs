pub mod client;
pub mod determinism;
pub mod error;
pub mod pagination;
pub mod qc;
pub mod schema;
