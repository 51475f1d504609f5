// PanelSync - Offline Chapter Reader for Mobile
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! Image format sniffing and corruption sampling
//!
//! Only file headers and a few fixed-size windows are ever read.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Bytes needed to recognize every supported format
pub const HEADER_LEN: usize = 16;

/// Size of one deep-scan sample window
pub const SAMPLE_WINDOW: usize = 256;

/// Recognized page image formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Jpeg,
    Png,
    Gif,
    Webp,
    Bmp,
    Avif,
}

impl ImageFormat {
    /// Uncompressed formats legitimately contain long uniform runs
    pub fn is_compressed(&self) -> bool {
        !matches!(self, ImageFormat::Bmp)
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ImageFormat::Jpeg => "jpeg",
            ImageFormat::Png => "png",
            ImageFormat::Gif => "gif",
            ImageFormat::Webp => "webp",
            ImageFormat::Bmp => "bmp",
            ImageFormat::Avif => "avif",
        };
        f.write_str(name)
    }
}

/// Identify an image format from its leading bytes
pub fn sniff_format(header: &[u8]) -> Option<ImageFormat> {
    const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

    if header.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some(ImageFormat::Jpeg)
    } else if header.starts_with(PNG) {
        Some(ImageFormat::Png)
    } else if header.starts_with(b"GIF87a") || header.starts_with(b"GIF89a") {
        Some(ImageFormat::Gif)
    } else if header.len() >= 12 && &header[0..4] == b"RIFF" && &header[8..12] == b"WEBP" {
        Some(ImageFormat::Webp)
    } else if header.len() >= 12
        && &header[4..8] == b"ftyp"
        && (&header[8..12] == b"avif" || &header[8..12] == b"avis")
    {
        Some(ImageFormat::Avif)
    } else if header.starts_with(b"BM") {
        Some(ImageFormat::Bmp)
    } else {
        None
    }
}

/// Corruption found in a sample window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum CorruptionPattern {
    /// Zero-filled region (typical of an interrupted write)
    AllZero,
    /// The same byte repeated across the window
    RepeatedByte { byte: u8 },
}

impl fmt::Display for CorruptionPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorruptionPattern::AllZero => f.write_str("zero-filled region"),
            CorruptionPattern::RepeatedByte { byte } => write!(f, "repeated byte 0x{:02X}", byte),
        }
    }
}

/// Check one window for a corruption pattern
pub fn scan_window(window: &[u8]) -> Option<CorruptionPattern> {
    let (&first, rest) = window.split_first()?;
    if window.len() < SAMPLE_WINDOW / 2 || rest.iter().any(|&b| b != first) {
        return None;
    }
    if first == 0 {
        Some(CorruptionPattern::AllZero)
    } else {
        Some(CorruptionPattern::RepeatedByte { byte: first })
    }
}

/// Evenly spread sample offsets past the header
pub fn sample_offsets(file_size: u64, samples: usize) -> Vec<u64> {
    let start = HEADER_LEN as u64;
    let window = SAMPLE_WINDOW as u64;
    if samples == 0 || file_size < start + window {
        return Vec::new();
    }

    let span = file_size - start - window;
    let mut offsets: Vec<u64> = (1..=samples as u64)
        .map(|i| start + span * i / (samples as u64 + 1))
        .collect();
    offsets.dedup();
    offsets
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sniff_known_formats() {
        assert_eq!(sniff_format(&[0xFF, 0xD8, 0xFF, 0xE0]), Some(ImageFormat::Jpeg));
        assert_eq!(
            sniff_format(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0]),
            Some(ImageFormat::Png)
        );
        assert_eq!(sniff_format(b"GIF89a......"), Some(ImageFormat::Gif));
        assert_eq!(sniff_format(b"RIFF\x10\0\0\0WEBPVP8 "), Some(ImageFormat::Webp));
        assert_eq!(sniff_format(b"\0\0\0\x1cftypavif\0\0"), Some(ImageFormat::Avif));
        assert_eq!(sniff_format(b"BM\x36\0"), Some(ImageFormat::Bmp));
    }

    #[test]
    fn test_sniff_rejects_unknown() {
        assert_eq!(sniff_format(b"<html><body>"), None);
        assert_eq!(sniff_format(&[]), None);
        assert_eq!(sniff_format(b"RIFF"), None);
    }

    #[test]
    fn test_scan_window_patterns() {
        assert_eq!(scan_window(&[0u8; SAMPLE_WINDOW]), Some(CorruptionPattern::AllZero));
        assert_eq!(
            scan_window(&[0xAA; SAMPLE_WINDOW]),
            Some(CorruptionPattern::RepeatedByte { byte: 0xAA })
        );

        let varied: Vec<u8> = (0..SAMPLE_WINDOW).map(|i| (i * 7) as u8).collect();
        assert_eq!(scan_window(&varied), None);
        // Short tails are not judged
        assert_eq!(scan_window(&[0u8; 8]), None);
    }

    #[test]
    fn test_sample_offsets_within_bounds() {
        let offsets = sample_offsets(10_000, 4);
        assert_eq!(offsets.len(), 4);
        for offset in &offsets {
            assert!(*offset >= HEADER_LEN as u64);
            assert!(offset + SAMPLE_WINDOW as u64 <= 10_000);
        }
        assert!(sample_offsets(100, 4).is_empty());
    }
}
