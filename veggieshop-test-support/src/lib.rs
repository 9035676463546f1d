//! Shared test harness: a deterministic signer and `proptest` strategies
//! for this workspace's validated types (ambient, §4.8). `FakeClock` lives
//! in `veggieshop-base` itself and is re-exported here for convenience so
//! test code only needs one `use`.

mod signer;
pub mod strategies;

pub use signer::FixedSigner;
pub use veggieshop_base::FakeClock;
