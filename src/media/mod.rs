// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

pub mod bmp;
pub mod sniff;

pub use bmp::{decode_bmp, encode_bmp};
pub use sniff::{is_bmp_bytes, is_ico_bytes};
