// Library interface for chatd
// The binaries, tests and benchmarks all go through these modules

pub mod error;
pub mod router;
pub mod server;
pub mod signal;
pub mod store;
