pub mod backoff;
pub mod diag;
pub mod envelope;
pub mod errors;
pub mod ids;
pub mod wire;
