//! Consensus constants and per-network parameters.

pub mod constants;
pub mod params;

pub use params::{
    chain_params, consensus_params, hash256_from_hex, hash256_to_hex, ChainParams,
    ConsensusParams, Hash256, HexError, Network,
};
