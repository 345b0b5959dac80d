//! Locators into external flat block and undo files.

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub struct FlatFilePos {
    pub file_id: u32,
    pub offset: u32,
}

impl FlatFilePos {
    pub const fn new(file_id: u32, offset: u32) -> Self {
        Self { file_id, offset }
    }

    pub fn encode(&self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[0..4].copy_from_slice(&self.file_id.to_le_bytes());
        out[4..8].copy_from_slice(&self.offset.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 8 {
            return None;
        }
        let file_id = u32::from_le_bytes(bytes[0..4].try_into().ok()?);
        let offset = u32::from_le_bytes(bytes[4..8].try_into().ok()?);
        Some(Self { file_id, offset })
    }
}
