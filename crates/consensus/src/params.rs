//! Consensus parameter definitions.

pub type Hash256 = [u8; 32];

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Mainnet => "main",
            Network::Testnet => "test",
            Network::Regtest => "regtest",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "main" | "mainnet" => Some(Network::Mainnet),
            "test" | "testnet" => Some(Network::Testnet),
            "regtest" => Some(Network::Regtest),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ConsensusParams {
    pub network: Network,
    pub hash_genesis_block: Hash256,
    pub genesis_time: u32,
    pub pow_limit: Hash256,
    pub pow_target_spacing: i64,
    /// Cumulative work a header chain must carry before the node trusts it for sync.
    pub minimum_chain_work: Hash256,
    /// Block whose ancestors may skip script verification. All zero disables it.
    pub default_assume_valid: Hash256,
}

impl ConsensusParams {
    pub fn assume_valid(&self) -> Option<Hash256> {
        if self.default_assume_valid == [0u8; 32] {
            None
        } else {
            Some(self.default_assume_valid)
        }
    }
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    pub consensus: ConsensusParams,
    /// Estimated size of the block files in GB.
    pub assumed_blockchain_size: u64,
    /// Estimated size of the UTXO set in GB.
    pub assumed_chain_state_size: u64,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum HexError {
    InvalidLength,
    InvalidHex,
}

impl std::fmt::Display for HexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HexError::InvalidLength => write!(f, "invalid hex length"),
            HexError::InvalidHex => write!(f, "invalid hex digit"),
        }
    }
}

impl std::error::Error for HexError {}

/// Parses a big-endian display hex string into little-endian hash bytes.
pub fn hash256_from_hex(input: &str) -> Result<Hash256, HexError> {
    let mut hex = input.trim();
    if let Some(stripped) = hex.strip_prefix("0x").or_else(|| hex.strip_prefix("0X")) {
        hex = stripped;
    }
    if hex.is_empty() || hex.len() > 64 {
        return Err(HexError::InvalidLength);
    }

    let mut padded = [b'0'; 64];
    padded[64 - hex.len()..].copy_from_slice(hex.as_bytes());

    let mut bytes = [0u8; 32];
    for (byte_out, pair) in bytes.iter_mut().zip(padded.chunks_exact(2)) {
        *byte_out = (hex_nibble(pair[0])? << 4) | hex_nibble(pair[1])?;
    }
    bytes.reverse();
    Ok(bytes)
}

fn hex_nibble(digit: u8) -> Result<u8, HexError> {
    match digit {
        b'0'..=b'9' => Ok(digit - b'0'),
        b'a'..=b'f' => Ok(digit - b'a' + 10),
        b'A'..=b'F' => Ok(digit - b'A' + 10),
        _ => Err(HexError::InvalidHex),
    }
}

pub fn hash256_to_hex(hash: &Hash256) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(64);
    for byte in hash.iter().rev() {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

pub fn consensus_params(network: Network) -> ConsensusParams {
    match network {
        Network::Mainnet => mainnet_consensus_params(),
        Network::Testnet => testnet_consensus_params(),
        Network::Regtest => regtest_consensus_params(),
    }
}

pub fn chain_params(network: Network) -> ChainParams {
    let consensus = consensus_params(network);
    let (assumed_blockchain_size, assumed_chain_state_size) = match network {
        Network::Mainnet => (211, 3),
        Network::Testnet => (55, 2),
        Network::Regtest => (0, 0),
    };
    ChainParams {
        network,
        consensus,
        assumed_blockchain_size,
        assumed_chain_state_size,
    }
}

// The tables below are compile-time constants; a parse failure is a programming error.
fn constant_hash(hex: &str) -> Hash256 {
    match hash256_from_hex(hex) {
        Ok(hash) => hash,
        Err(err) => panic!("invalid built-in hash constant {hex}: {err}"),
    }
}

fn mainnet_consensus_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Mainnet,
        hash_genesis_block: constant_hash(
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f",
        ),
        genesis_time: 1_231_006_505,
        pow_limit: constant_hash(
            "00000000ffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
        ),
        pow_target_spacing: 600,
        minimum_chain_work: constant_hash(
            "000000000000000000000000000000000000000001702757f739b28558639346",
        ),
        default_assume_valid: constant_hash(
            "000000000000000010d1a581ad207c42991c24cf41d9a65c96e80b68f90a763e",
        ),
    }
}

fn testnet_consensus_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Testnet,
        hash_genesis_block: constant_hash(
            "000000000933ea01ad0ee984209779baaec3ced90fa3f408719526f8d77f4943",
        ),
        genesis_time: 1_296_688_602,
        pow_limit: constant_hash(
            "00000000ffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
        ),
        pow_target_spacing: 600,
        minimum_chain_work: constant_hash(
            "00000000000000000000000000000000000000000000006eb4cae9e90e1b2921",
        ),
        default_assume_valid: constant_hash(
            "00000000000cd69b8fbce15756d5e8d497514e6887092dc50d8822aace81fdd1",
        ),
    }
}

fn regtest_consensus_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Regtest,
        hash_genesis_block: constant_hash(
            "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206",
        ),
        genesis_time: 1_296_688_602,
        pow_limit: constant_hash(
            "7fffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
        ),
        pow_target_spacing: 600,
        minimum_chain_work: [0u8; 32],
        default_assume_valid: [0u8; 32],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mainnet_trust_params() {
        let params = chain_params(Network::Mainnet);
        assert_eq!(
            hash256_to_hex(&params.consensus.default_assume_valid),
            "000000000000000010d1a581ad207c42991c24cf41d9a65c96e80b68f90a763e"
        );
        assert_eq!(
            hash256_to_hex(&params.consensus.minimum_chain_work),
            "000000000000000000000000000000000000000001702757f739b28558639346"
        );
        assert_eq!(params.assumed_blockchain_size, 211);
        assert_eq!(params.assumed_chain_state_size, 3);
        assert!(params.consensus.assume_valid().is_some());
    }

    #[test]
    fn testnet_trust_params() {
        let params = chain_params(Network::Testnet);
        assert_eq!(
            hash256_to_hex(&params.consensus.minimum_chain_work),
            "00000000000000000000000000000000000000000000006eb4cae9e90e1b2921"
        );
        assert_eq!(params.assumed_blockchain_size, 55);
        assert_eq!(params.assumed_chain_state_size, 2);
    }

    #[test]
    fn regtest_disables_assume_valid() {
        let params = consensus_params(Network::Regtest);
        assert_eq!(params.assume_valid(), None);
        assert_eq!(params.minimum_chain_work, [0u8; 32]);
    }

    #[test]
    fn hex_roundtrip_is_byte_reversed() {
        let hash = hash256_from_hex("0x01").expect("hex");
        assert_eq!(hash[0], 1);
        assert!(hash[1..].iter().all(|byte| *byte == 0));
        assert_eq!(hash256_to_hex(&hash).len(), 64);
        assert!(hash256_to_hex(&hash).ends_with("01"));
    }

    #[test]
    fn hex_rejects_garbage() {
        assert_eq!(hash256_from_hex(""), Err(HexError::InvalidLength));
        assert_eq!(hash256_from_hex("zz"), Err(HexError::InvalidHex));
        assert_eq!(
            hash256_from_hex(&"0".repeat(65)),
            Err(HexError::InvalidLength)
        );
    }

    #[test]
    fn hex_rejects_non_ascii_input() {
        assert_eq!(hash256_from_hex("\u{e9}a"), Err(HexError::InvalidHex));
        assert_eq!(hash256_from_hex("0x\u{1f600}"), Err(HexError::InvalidHex));
        assert_eq!(
            hash256_from_hex("00AbCd"),
            hash256_from_hex("00abcd")
        );
    }

    #[test]
    fn parse_network() {
        assert_eq!(Network::parse("MAIN"), Some(Network::Mainnet));
        assert_eq!(Network::parse("testnet"), Some(Network::Testnet));
        assert_eq!(Network::parse("regtest"), Some(Network::Regtest));
        assert_eq!(Network::parse("nope"), None);
    }
}
