// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! The BMP bridge between scalar and tile stages.
//!
//! Reads 24- and 32-bpp uncompressed BMPs (BITMAPINFOHEADER or later,
//! bottom-up or top-down, 24-bpp rows 4-byte aligned). Writes are always
//! 32 bpp, bottom-up, with the 54-byte header and a `width * 4` row
//! stride.

use image::RgbaImage;

use crate::errors::{Error, Result};

const FILE_HEADER_LEN: usize = 14;
const INFO_HEADER_LEN: usize = 40;
const PIXEL_DATA_OFFSET: usize = FILE_HEADER_LEN + INFO_HEADER_LEN;

fn u16_at(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

fn u32_at(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

pub fn decode_bmp(input: &[u8]) -> Result<RgbaImage> {
    if input.len() < PIXEL_DATA_OFFSET {
        return Err(Error::ChainTopology("BMP input too small".to_string()));
    }
    if input[0] != b'B' || input[1] != b'M' {
        return Err(Error::ChainTopology("Input is not a BMP file".to_string()));
    }

    let data_offset = u32_at(input, 10) as usize;
    let dib_size = u32_at(input, 14);
    if dib_size < INFO_HEADER_LEN as u32 {
        return Err(Error::ChainTopology("Unsupported BMP DIB header".to_string()));
    }
    let width = u32_at(input, 18) as i32;
    let height = u32_at(input, 22) as i32;
    let planes = u16_at(input, 26);
    let bpp = u16_at(input, 28);
    let compression = u32_at(input, 30);

    if width <= 0 || height == 0 {
        return Err(Error::ChainTopology("Unsupported BMP dimensions".to_string()));
    }
    if planes != 1 {
        return Err(Error::ChainTopology("Unsupported BMP planes".to_string()));
    }
    if compression != 0 {
        return Err(Error::ChainTopology("Unsupported BMP compression".to_string()));
    }
    if bpp != 24 && bpp != 32 {
        return Err(Error::ChainTopology("Unsupported BMP bit depth".to_string()));
    }

    let top_down = height < 0;
    let abs_height = height.unsigned_abs() as usize;
    let abs_width = width as usize;

    let bytes_per_pixel = usize::from(bpp / 8);
    let mut row_stride = abs_width * bytes_per_pixel;
    if bpp == 24 {
        row_stride = (row_stride + 3) & !3;
    }

    if data_offset > input.len() {
        return Err(Error::ChainTopology("Invalid BMP data offset".to_string()));
    }
    if data_offset + row_stride * abs_height > input.len() {
        return Err(Error::ChainTopology("BMP pixel data out of range".to_string()));
    }

    let mut img = RgbaImage::new(abs_width as u32, abs_height as u32);
    let pix: &mut [u8] = &mut img;
    for y in 0..abs_height {
        let src_y = if top_down { y } else { abs_height - 1 - y };
        let src_row = data_offset + src_y * row_stride;
        let dst_row = y * abs_width * 4;
        for x in 0..abs_width {
            let s = src_row + x * bytes_per_pixel;
            let d = dst_row + x * 4;
            pix[d] = input[s + 2];
            pix[d + 1] = input[s + 1];
            pix[d + 2] = input[s];
            pix[d + 3] = if bytes_per_pixel == 4 { input[s + 3] } else { 0xFF };
        }
    }

    Ok(img)
}

pub fn encode_bmp(img: &RgbaImage) -> Result<Vec<u8>> {
    let width = img.width() as usize;
    let height = img.height() as usize;
    if width == 0 || height == 0 {
        return Err(Error::ChainTopology("Invalid BMP image size".to_string()));
    }

    let row_stride = width * 4;
    let data_size = row_stride * height;
    let file_size = PIXEL_DATA_OFFSET + data_size;

    let mut buf = vec![0u8; file_size];
    buf[0] = b'B';
    buf[1] = b'M';
    buf[2..6].copy_from_slice(&(file_size as u32).to_le_bytes());
    buf[10..14].copy_from_slice(&(PIXEL_DATA_OFFSET as u32).to_le_bytes());
    buf[14..18].copy_from_slice(&(INFO_HEADER_LEN as u32).to_le_bytes());
    buf[18..22].copy_from_slice(&(width as u32).to_le_bytes());
    buf[22..26].copy_from_slice(&(height as u32).to_le_bytes());
    buf[26..28].copy_from_slice(&1u16.to_le_bytes());
    buf[28..30].copy_from_slice(&32u16.to_le_bytes());
    buf[30..34].copy_from_slice(&0u32.to_le_bytes());
    buf[34..38].copy_from_slice(&(data_size as u32).to_le_bytes());

    let pix: &[u8] = img.as_raw();
    for y in 0..height {
        let src_y = height - 1 - y;
        let src_row = src_y * width * 4;
        let dst_row = PIXEL_DATA_OFFSET + y * row_stride;
        for x in 0..width {
            let s = src_row + x * 4;
            let d = dst_row + x * 4;
            buf[d] = pix[s + 2];
            buf[d + 1] = pix[s + 1];
            buf[d + 2] = pix[s];
            buf[d + 3] = pix[s + 3];
        }
    }

    Ok(buf)
}
