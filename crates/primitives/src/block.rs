//! Block header type.

use blocktree_consensus::constants::BLOCK_HEADER_SIZE;
use blocktree_consensus::Hash256;

use crate::encoding::{DecodeError, Decoder, Encoder};
use crate::hash::sha256d;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn is_null(&self) -> bool {
        self.bits == 0
    }

    pub fn has_prev(&self) -> bool {
        self.prev_block != [0u8; 32]
    }

    pub fn consensus_encode(&self) -> [u8; BLOCK_HEADER_SIZE] {
        let mut encoder = Encoder::new();
        self.encode_into(&mut encoder);
        let bytes = encoder.into_inner();
        let mut out = [0u8; BLOCK_HEADER_SIZE];
        out.copy_from_slice(&bytes);
        out
    }

    pub fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_hash_le(&self.prev_block);
        encoder.write_hash_le(&self.merkle_root);
        encoder.write_u32_le(self.time);
        encoder.write_u32_le(self.bits);
        encoder.write_u32_le(self.nonce);
    }

    pub fn hash(&self) -> Hash256 {
        sha256d(&self.consensus_encode())
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let header = Self::consensus_decode_from(&mut decoder)?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(header)
    }

    pub fn consensus_decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            version: decoder.read_i32_le()?,
            prev_block: decoder.read_hash_le()?,
            merkle_root: decoder.read_hash_le()?,
            time: decoder.read_u32_le()?,
            bits: decoder.read_u32_le()?,
            nonce: decoder.read_u32_le()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blocktree_consensus::params::{consensus_params, Network};

    fn genesis_header() -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_block: [0u8; 32],
            merkle_root: blocktree_consensus::hash256_from_hex(
                "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b",
            )
            .expect("merkle root"),
            time: 1_231_006_505,
            bits: 0x1d00_ffff,
            nonce: 2_083_236_893,
        }
    }

    #[test]
    fn mainnet_genesis_hash() {
        let params = consensus_params(Network::Mainnet);
        assert_eq!(genesis_header().hash(), params.hash_genesis_block);
    }

    #[test]
    fn encoded_header_is_eighty_bytes() {
        let header = genesis_header();
        let bytes = header.consensus_encode();
        assert_eq!(bytes.len(), BLOCK_HEADER_SIZE);
        assert_eq!(BlockHeader::consensus_decode(&bytes).expect("decode"), header);
    }

    #[test]
    fn decode_rejects_short_and_long_input() {
        let bytes = genesis_header().consensus_encode();
        assert_eq!(
            BlockHeader::consensus_decode(&bytes[..79]),
            Err(DecodeError::UnexpectedEof)
        );
        let mut long = bytes.to_vec();
        long.push(0);
        assert_eq!(
            BlockHeader::consensus_decode(&long),
            Err(DecodeError::TrailingBytes)
        );
    }

    #[test]
    fn genesis_has_no_prev() {
        assert!(!genesis_header().has_prev());
        assert!(!genesis_header().is_null());
        assert!(BlockHeader::default().is_null());
    }
}
