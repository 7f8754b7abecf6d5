// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Data carried between stages.

use std::fmt;

/// How the bytes of a stage boundary are interpreted.
///
/// Selected by which capacity export the module provides. An `I32Array`
/// output has its length reported by `run` in elements, not bytes, and its
/// textual form is one `%08x` line per element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataEncoding {
    Raw,
    Utf8,
    I32Array,
}

impl DataEncoding {
    /// Bytes per reported output item.
    pub fn item_factor(self) -> u32 {
        match self {
            DataEncoding::I32Array => 4,
            DataEncoding::Raw | DataEncoding::Utf8 => 1,
        }
    }
}

impl fmt::Display for DataEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataEncoding::Raw => write!(f, "raw"),
            DataEncoding::Utf8 => write!(f, "utf8"),
            DataEncoding::I32Array => write!(f, "i32[]"),
        }
    }
}

/// Bytes plus their encoding tag. Stage output bytes are always copied out
/// of module memory before the instance is released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Content {
    pub bytes: Vec<u8>,
    pub encoding: DataEncoding,
}

impl Content {
    pub fn raw(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            encoding: DataEncoding::Raw,
        }
    }
}

/// Render content for an HTTP body or stdout: raw and UTF-8 pass through,
/// i32 arrays become little-endian words formatted as `%08x\n`.
pub fn format_output_bytes(content: &Content) -> Vec<u8> {
    match content.encoding {
        DataEncoding::Raw | DataEncoding::Utf8 => content.bytes.clone(),
        DataEncoding::I32Array => {
            let mut out = String::with_capacity(content.bytes.len() / 4 * 9);
            for chunk in content.bytes.chunks_exact(4) {
                let word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                out.push_str(&format!("{word:08x}\n"));
            }
            out.into_bytes()
        }
    }
}
