//! Weighted BFT consensus: a round-based voting engine ([`pooling`]), a
//! ledger that seals and commits one block per epoch ([`chain`]), and the
//! epoch driver that runs both under rotating committees ([`swell`]).

pub mod chain;
pub mod committee;
pub mod crypto;
pub mod mempool;
pub mod metrics;
pub mod network;
pub mod permission;
pub mod pooling;
pub mod swell;
pub mod types;
pub mod wire;
