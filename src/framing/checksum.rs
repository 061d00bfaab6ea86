//! Checksum algorithms for frame validation
//!
//! A frame handed to [`validate`] carries its checksum as trailing bytes.
//! The checksum is computed over everything before them.

use crate::error::{ChecksumError, ProcessorError};
use std::str::FromStr;

// ============================================================================
// Types
// ============================================================================

/// Supported checksum algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ChecksumAlgorithm {
    /// Validation disabled
    #[default]
    None,
    /// XOR of all bytes
    Xor,
    /// CRC-8 polynomial 0x07, init 0x00
    Crc8,
    /// CRC-16 CCITT (XModem) polynomial 0x1021, init 0x0000, big-endian
    Crc16,
    /// CRC-16 Modbus polynomial 0x8005 reflected, init 0xFFFF, little-endian
    Crc16Modbus,
    /// CRC-32 IEEE 802.3, big-endian
    Crc32,
    /// Fletcher-16, emitted as `[sum2, sum1]`
    Fletcher16,
    /// Fletcher-32 over big-endian 16-bit words, odd input zero-padded
    Fletcher32,
}

impl ChecksumAlgorithm {
    /// Number of trailing bytes this algorithm occupies
    pub fn output_bytes(&self) -> usize {
        match self {
            ChecksumAlgorithm::None => 0,
            ChecksumAlgorithm::Xor => 1,
            ChecksumAlgorithm::Crc8 => 1,
            ChecksumAlgorithm::Crc16 => 2,
            ChecksumAlgorithm::Crc16Modbus => 2,
            ChecksumAlgorithm::Crc32 => 4,
            ChecksumAlgorithm::Fletcher16 => 2,
            ChecksumAlgorithm::Fletcher32 => 4,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ChecksumAlgorithm::None => "none",
            ChecksumAlgorithm::Xor => "XOR",
            ChecksumAlgorithm::Crc8 => "CRC-8",
            ChecksumAlgorithm::Crc16 => "CRC-16",
            ChecksumAlgorithm::Crc16Modbus => "CRC-16-MODBUS",
            ChecksumAlgorithm::Crc32 => "CRC-32",
            ChecksumAlgorithm::Fletcher16 => "Fletcher-16",
            ChecksumAlgorithm::Fletcher32 => "Fletcher-32",
        }
    }

    /// Compute the checksum bytes in wire order
    pub fn compute(&self, data: &[u8]) -> Vec<u8> {
        match self {
            ChecksumAlgorithm::None => Vec::new(),
            ChecksumAlgorithm::Xor => vec![xor_checksum(data)],
            ChecksumAlgorithm::Crc8 => vec![crc8_checksum(data)],
            ChecksumAlgorithm::Crc16 => crc16_checksum(data).to_be_bytes().to_vec(),
            ChecksumAlgorithm::Crc16Modbus => crc16_modbus_checksum(data).to_le_bytes().to_vec(),
            ChecksumAlgorithm::Crc32 => crc32_checksum(data).to_be_bytes().to_vec(),
            ChecksumAlgorithm::Fletcher16 => fletcher16_checksum(data).to_vec(),
            ChecksumAlgorithm::Fletcher32 => fletcher32_checksum(data).to_vec(),
        }
    }
}

impl std::fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = ProcessorError;

    /// Case-insensitive; `-` and `_` are ignored, so `crc_16` == `CRC-16`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '-' && *c != '_' && !c.is_whitespace())
            .collect::<String>()
            .to_ascii_uppercase();

        match normalized.as_str() {
            "" | "NONE" => Ok(ChecksumAlgorithm::None),
            "XOR" => Ok(ChecksumAlgorithm::Xor),
            "CRC8" => Ok(ChecksumAlgorithm::Crc8),
            "CRC16" | "CRC16CCITT" | "CRC16XMODEM" => Ok(ChecksumAlgorithm::Crc16),
            "CRC16MODBUS" => Ok(ChecksumAlgorithm::Crc16Modbus),
            "CRC32" => Ok(ChecksumAlgorithm::Crc32),
            "FLETCHER16" => Ok(ChecksumAlgorithm::Fletcher16),
            "FLETCHER32" => Ok(ChecksumAlgorithm::Fletcher32),
            _ => Err(ProcessorError::Configuration(format!(
                "Unknown checksum algorithm: {}",
                s
            ))),
        }
    }
}

// ============================================================================
// Validation
// ============================================================================

/// Verify the trailing checksum of `frame` and return the payload before it
pub fn validate(frame: &[u8], algorithm: ChecksumAlgorithm) -> Result<&[u8], ChecksumError> {
    let len = algorithm.output_bytes();
    if len == 0 {
        return Ok(frame);
    }

    if frame.len() < len {
        return Err(ChecksumError {
            algorithm: algorithm.name().to_string(),
            expected: frame.to_vec(),
            computed: Vec::new(),
        });
    }

    let (payload, trailer) = frame.split_at(frame.len() - len);
    let computed = algorithm.compute(payload);
    if computed == trailer {
        Ok(payload)
    } else {
        Err(ChecksumError {
            algorithm: algorithm.name().to_string(),
            expected: trailer.to_vec(),
            computed,
        })
    }
}

// ============================================================================
// Algorithms
// ============================================================================

/// XOR of all bytes
pub fn xor_checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc ^ b)
}

/// CRC-8 with polynomial 0x07, init 0x00, no reflection
pub fn crc8_checksum(data: &[u8]) -> u8 {
    let mut crc: u8 = 0x00;
    for &byte in data {
        crc ^= byte;
        for _ in 0..8 {
            if crc & 0x80 != 0 {
                crc = (crc << 1) ^ 0x07;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// CRC-16 CCITT with polynomial 0x1021 and init 0x0000 (XModem)
pub fn crc16_checksum(data: &[u8]) -> u16 {
    let mut crc: u16 = 0x0000;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// CRC-16 Modbus (reflected 0x8005, init 0xFFFF)
pub fn crc16_modbus_checksum(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// CRC-32 IEEE (reflected 0x04C11DB7, init and xorout 0xFFFFFFFF)
pub fn crc32_checksum(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB8_8320;
            } else {
                crc >>= 1;
            }
        }
    }
    crc ^ 0xFFFF_FFFF
}

/// Fletcher-16 as `[sum2, sum1]`
pub fn fletcher16_checksum(data: &[u8]) -> [u8; 2] {
    let mut sum1: u16 = 0;
    let mut sum2: u16 = 0;
    for &byte in data {
        sum1 = (sum1 + byte as u16) % 255;
        sum2 = (sum2 + sum1) % 255;
    }
    [sum2 as u8, sum1 as u8]
}

/// Fletcher-32 over big-endian words as `[sum2_hi, sum2_lo, sum1_hi, sum1_lo]`
pub fn fletcher32_checksum(data: &[u8]) -> [u8; 4] {
    let mut sum1: u32 = 0;
    let mut sum2: u32 = 0;
    for chunk in data.chunks(2) {
        let word = match chunk {
            [hi, lo] => u16::from_be_bytes([*hi, *lo]),
            [hi] => u16::from_be_bytes([*hi, 0]),
            _ => 0,
        };
        sum1 = (sum1 + word as u32) % 65_535;
        sum2 = (sum2 + sum1) % 65_535;
    }
    let [a, b] = (sum2 as u16).to_be_bytes();
    let [c, d] = (sum1 as u16).to_be_bytes();
    [a, b, c, d]
}
