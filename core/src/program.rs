//! Program image loading — header validation and section layout.
//!
//! An image is a 20-byte header followed by the code section and the
//! initial data section:
//!
//! ```text
//! +0   magic "ESET-VM2"           (8 bytes)
//! +8   codeSize                   (LE u32)
//! +12  dataSize                   (LE u32)
//! +16  initialDataSize            (LE u32)
//! +20  code bytes                 (codeSize bytes)
//! +20+codeSize  initial data      (initialDataSize bytes)
//! ```
//!
//! The live guest address space is `dataSize` bytes, zero-initialized
//! except for the initial data copied to offset 0.

use std::fs;
use std::path::Path;

use thiserror::Error;

/// 8-byte magic at the start of every image.
pub const MAGIC: &[u8; 8] = b"ESET-VM2";

/// Fixed header size: magic plus three LE32 size fields.
pub const HEADER_SIZE: usize = 20;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("file too small for header ({0} bytes)")]
    TooSmall(usize),
    #[error("invalid magic number")]
    BadMagic,
    #[error("truncated file: sections need {expected} bytes, {actual} present")]
    Truncated { expected: usize, actual: usize },
    #[error("initial data size {initial} exceeds data size {data}")]
    InitialDataTooLarge { initial: u32, data: u32 },
}

/// A validated program image.
pub struct Program {
    code: Vec<u8>,
    initial_data: Vec<u8>,
    data_size: u32,
}

impl Program {
    /// Load and validate an image file.
    pub fn load(path: &Path) -> Result<Self, LoadError> {
        Self::from_bytes(&fs::read(path)?)
    }

    /// Validate an in-memory image.
    pub fn from_bytes(file: &[u8]) -> Result<Self, LoadError> {
        if file.len() < HEADER_SIZE {
            return Err(LoadError::TooSmall(file.len()));
        }
        if &file[..8] != MAGIC {
            return Err(LoadError::BadMagic);
        }

        let code_size = read_le32(&file[8..12]) as usize;
        let data_size = read_le32(&file[12..16]);
        let initial_data_size = read_le32(&file[16..20]);

        if initial_data_size > data_size {
            return Err(LoadError::InitialDataTooLarge {
                initial: initial_data_size,
                data: data_size,
            });
        }

        let expected = HEADER_SIZE + code_size + initial_data_size as usize;
        if file.len() < expected {
            return Err(LoadError::Truncated {
                expected,
                actual: file.len(),
            });
        }

        let code_end = HEADER_SIZE + code_size;
        Ok(Self {
            code: file[HEADER_SIZE..code_end].to_vec(),
            initial_data: file[code_end..expected].to_vec(),
            data_size,
        })
    }

    /// Code section bytes (the bit-packed instruction stream).
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Initial data, copied to guest offset 0 at startup.
    pub fn initial_data(&self) -> &[u8] {
        &self.initial_data
    }

    /// Live guest data memory size in bytes.
    pub fn data_size(&self) -> u32 {
        self.data_size
    }
}

fn read_le32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(code: &[u8], data_size: u32, initial: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&(code.len() as u32).to_le_bytes());
        out.extend_from_slice(&data_size.to_le_bytes());
        out.extend_from_slice(&(initial.len() as u32).to_le_bytes());
        out.extend_from_slice(code);
        out.extend_from_slice(initial);
        out
    }

    #[test]
    fn test_valid_image() {
        let file = image(&[0xAA, 0xBB], 64, &[1, 2, 3]);
        let p = Program::from_bytes(&file).unwrap();
        assert_eq!(p.code(), &[0xAA, 0xBB]);
        assert_eq!(p.initial_data(), &[1, 2, 3]);
        assert_eq!(p.data_size(), 64);
    }

    #[test]
    fn test_too_small() {
        assert!(matches!(
            Program::from_bytes(b"ESET-VM2"),
            Err(LoadError::TooSmall(8))
        ));
    }

    #[test]
    fn test_bad_magic() {
        let mut file = image(&[], 0, &[]);
        file[0] = b'X';
        assert!(matches!(
            Program::from_bytes(&file),
            Err(LoadError::BadMagic)
        ));
    }

    #[test]
    fn test_truncated_code() {
        let mut file = image(&[1, 2, 3, 4], 16, &[]);
        file.truncate(HEADER_SIZE + 2);
        assert!(matches!(
            Program::from_bytes(&file),
            Err(LoadError::Truncated { .. })
        ));
    }

    #[test]
    fn test_initial_data_exceeds_data_size() {
        let file = image(&[], 2, &[1, 2, 3, 4]);
        assert!(matches!(
            Program::from_bytes(&file),
            Err(LoadError::InitialDataTooLarge { initial: 4, data: 2 })
        ));
    }

    #[test]
    fn test_load_from_disk() {
        let file = image(&[0x55], 8, &[9]);
        let dir = std::env::temp_dir();
        let path = dir.join(format!("evm2_core_test_{}.evm", std::process::id()));
        fs::write(&path, &file).unwrap();
        let p = Program::load(&path).unwrap();
        assert_eq!(p.code(), &[0x55]);
        let _ = fs::remove_file(&path);
    }
}
