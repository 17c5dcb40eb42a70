//! Deterministic binary transaction writer

use super::ChainError;

#[derive(Default)]
pub(crate) struct TxWriter {
    buf: Vec<u8>,
}

impl TxWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u32(&mut self, value: u32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn u64(&mut self, value: u64) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Bitcoin-style compact size
    pub fn varint(&mut self, value: u64) -> &mut Self {
        match value {
            0..=0xfc => self.buf.push(value as u8),
            0xfd..=0xffff => {
                self.buf.push(0xfd);
                self.buf.extend_from_slice(&(value as u16).to_le_bytes());
            }
            0x1_0000..=0xffff_ffff => {
                self.buf.push(0xfe);
                self.buf.extend_from_slice(&(value as u32).to_le_bytes());
            }
            _ => {
                self.buf.push(0xff);
                self.buf.extend_from_slice(&value.to_le_bytes());
            }
        }
        self
    }

    /// Length-prefixed bytes
    pub fn bytes(&mut self, data: &[u8]) -> &mut Self {
        self.varint(data.len() as u64);
        self.buf.extend_from_slice(data);
        self
    }

    /// Length-prefixed bytes from a hex string
    pub fn hex(&mut self, data: &str) -> Result<&mut Self, ChainError> {
        let decoded =
            hex::decode(data).map_err(|e| ChainError::Encoding(format!("{}: {}", data, e)))?;
        Ok(self.bytes(&decoded))
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}
