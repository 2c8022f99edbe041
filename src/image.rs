//! Pixel dimensions of JPEG, PNG and GIF payloads
//!
//! Only the leading bytes are inspected; a payload that is truncated or not
//! what its name claims yields `None`.

use crate::mime::{GIF, JPEG, PNG};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimension {
    pub width: u32,
    pub height: u32,
}

fn be_u16(buf: &[u8], at: usize) -> Option<u32> {
    let bytes = buf.get(at..at + 2)?;
    Some(u32::from(u16::from_be_bytes([bytes[0], bytes[1]])))
}

fn le_u16(buf: &[u8], at: usize) -> Option<u32> {
    let bytes = buf.get(at..at + 2)?;
    Some(u32::from(u16::from_le_bytes([bytes[0], bytes[1]])))
}

fn be_u32(buf: &[u8], at: usize) -> Option<u32> {
    let bytes = buf.get(at..at + 4)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Start-of-frame markers carrying the frame size
fn is_sof(marker: u8) -> bool {
    matches!(
        marker,
        0xc0..=0xc3 | 0xc5..=0xc7 | 0xc9..=0xcb | 0xcd..=0xcf
    )
}

pub fn dimension_jpeg(buf: &[u8]) -> Option<Dimension> {
    if !buf.starts_with(&[0xff, 0xd8]) {
        return None;
    }

    let mut offset = 2;
    loop {
        while *buf.get(offset)? != 0xff {
            offset += 1;
        }
        while *buf.get(offset)? == 0xff {
            offset += 1;
        }

        let marker = *buf.get(offset)?;
        if is_sof(marker) {
            return Some(Dimension {
                height: be_u16(buf, offset + 4)?,
                width: be_u16(buf, offset + 6)?,
            });
        }

        // Skip the segment: its length includes the two length bytes
        let length = be_u16(buf, offset + 1)? as usize;
        offset += 1 + length;
    }
}

pub fn dimension_png(buf: &[u8]) -> Option<Dimension> {
    if buf.get(1..4)? != &b"PNG"[..] {
        return None;
    }
    Some(Dimension {
        width: be_u32(buf, 16)?,
        height: be_u32(buf, 20)?,
    })
}

pub fn dimension_gif(buf: &[u8]) -> Option<Dimension> {
    if !buf.starts_with(b"GIF") {
        return None;
    }
    Some(Dimension {
        width: le_u16(buf, 6)?,
        height: le_u16(buf, 8)?,
    })
}

/// Dimensions for any sniffable content type
pub fn sniff(content_type: &str, buf: &[u8]) -> Option<Dimension> {
    match content_type {
        JPEG => dimension_jpeg(buf),
        PNG => dimension_png(buf),
        GIF => dimension_gif(buf),
        _ => None,
    }
}
