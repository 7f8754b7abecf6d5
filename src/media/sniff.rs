// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Magic-header detection for response content-type negotiation.

/// BMP: `BM` signature, a self-consistent file size, a pixel offset inside
/// the file, and a DIB header that fits.
pub fn is_bmp_bytes(data: &[u8]) -> bool {
    if data.len() < 18 {
        return false;
    }
    if data[0] != b'B' || data[1] != b'M' {
        return false;
    }

    let file_size = u32::from_le_bytes([data[2], data[3], data[4], data[5]]);
    if file_size != 0 && file_size as usize > data.len() {
        return false;
    }

    let pixel_offset = u32::from_le_bytes([data[10], data[11], data[12], data[13]]);
    if pixel_offset < 14 || pixel_offset as usize > data.len() {
        return false;
    }

    let dib_size = u32::from_le_bytes([data[14], data[15], data[16], data[17]]);
    if dib_size < 12 {
        return false;
    }
    if 14 + dib_size as usize > data.len() {
        return false;
    }

    true
}

/// ICO: reserved 0, type 1, at least one directory entry, and a first
/// entry whose payload lies inside the file after the directory.
pub fn is_ico_bytes(data: &[u8]) -> bool {
    if data.len() < 22 {
        return false;
    }
    if u16::from_le_bytes([data[0], data[1]]) != 0 {
        return false;
    }
    if u16::from_le_bytes([data[2], data[3]]) != 1 {
        return false;
    }
    let count = u16::from_le_bytes([data[4], data[5]]);
    if count == 0 {
        return false;
    }
    let dir_size = 6 + usize::from(count) * 16;
    if data.len() < dir_size {
        return false;
    }

    let image_size = u32::from_le_bytes([data[14], data[15], data[16], data[17]]);
    let image_offset = u32::from_le_bytes([data[18], data[19], data[20], data[21]]);
    if image_size == 0 {
        return false;
    }
    if (image_offset as usize) < dir_size {
        return false;
    }
    if image_offset as usize > data.len() {
        return false;
    }
    if image_size as usize > data.len() - image_offset as usize {
        return false;
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_ico() -> Vec<u8> {
        let mut data = vec![0u8; 22 + 4];
        data[2] = 1; // type: icon
        data[4] = 1; // one entry
        data[14..18].copy_from_slice(&4u32.to_le_bytes()); // image size
        data[18..22].copy_from_slice(&22u32.to_le_bytes()); // image offset
        data
    }

    #[test]
    fn accepts_minimal_ico() {
        assert!(is_ico_bytes(&sample_ico()));
    }

    #[test]
    fn rejects_ico_with_payload_past_end() {
        let mut data = sample_ico();
        data[14..18].copy_from_slice(&5u32.to_le_bytes());
        assert!(!is_ico_bytes(&data));
    }

    #[test]
    fn rejects_ico_with_offset_inside_directory() {
        let mut data = sample_ico();
        data[18..22].copy_from_slice(&10u32.to_le_bytes());
        assert!(!is_ico_bytes(&data));
    }

    #[test]
    fn rejects_cursor_files() {
        let mut data = sample_ico();
        data[2] = 2; // type: cursor
        assert!(!is_ico_bytes(&data));
    }

    #[test]
    fn accepts_encoded_bmp() {
        let img = image::RgbaImage::new(2, 2);
        let bytes = crate::media::bmp::encode_bmp(&img).unwrap();
        assert!(is_bmp_bytes(&bytes));
    }

    #[test]
    fn rejects_short_or_mislabeled_bmp() {
        assert!(!is_bmp_bytes(b"BM"));
        assert!(!is_bmp_bytes(&[0u8; 32]));
        let mut data = vec![0u8; 32];
        data[0] = b'B';
        data[1] = b'M';
        // pixel offset below the file header is invalid
        data[10] = 4;
        data[14] = 40;
        assert!(!is_bmp_bytes(&data));
    }
}
