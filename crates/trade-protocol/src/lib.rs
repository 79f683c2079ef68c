//! Trade Protocol - Decentralized fiat/crypto trade coordination
//!
//! Coordinates an escrow-less fiat-for-crypto trade between two peers over a
//! P2P network. The core is a per-trade state machine driven by peer messages,
//! user commands and chain-confirmation polling, orchestrated by a service
//! that keeps many trades running concurrently and resumes them after restart.
//!
//! Key components:
//! - Per-trade state machine with a strict transition table (`machine`)
//! - Orchestrating service with per-trade event serialization (`service`)
//! - Chain-lookup polling with exponential backoff (`chain`, `explorer`)
//! - Durable, versioned trade records (`record`, `store`)

pub mod chain;
pub mod channel;
pub mod config;
pub mod error;
pub mod explorer;
pub mod logging;
pub mod machine;
pub mod record;
pub mod service;
pub mod store;
pub mod types;

pub use error::TradeError;
pub use record::TradeRecord;
pub use service::ProtocolService;
pub use types::{PeerId, TradeId, TradeRole, TradeState};
