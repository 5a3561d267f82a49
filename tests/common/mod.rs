//! Common test utilities for batch-enrich integration tests

#[allow(dead_code)]
pub mod assertions;
#[allow(dead_code)]
pub mod enrichers;
#[allow(dead_code)]
pub mod fixtures;

#[allow(unused_imports)]
pub use assertions::*;
#[allow(unused_imports)]
pub use enrichers::*;
#[allow(unused_imports)]
pub use fixtures::*;
