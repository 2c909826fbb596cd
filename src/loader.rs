//! Program image loader.
//!
//! The image format is line oriented: a line carries bytes when it contains
//! a hexadecimal address followed by a colon, e.g.
//!
//! ```text
//! 0x00a: 30f00300000000000000 | irmovq $3, %rax
//! ```
//!
//! Everything after a `|` is commentary; lines without an `address:` marker
//! are ignored entirely.

use regex::Regex;

use crate::mem::Memory;

/// Parse `src` and store its payload bytes, returning how many bytes the
/// image carried. Bytes addressed outside the memory are dropped silently.
pub fn load_image(src: &str, mem: &mut Memory) -> usize {
    let marker = Regex::new(r"0x([^:]*):").unwrap();
    let mut loaded = 0;
    for line in src.lines() {
        let Some(caps) = marker.captures(line) else {
            continue;
        };
        let Ok(addr) = u64::from_str_radix(caps[1].trim(), 16) else {
            continue;
        };
        let payload = &line[caps.get(0).expect("whole match").end()..];
        let payload = match payload.find('|') {
            Some(bar) => &payload[..bar],
            None => payload,
        };
        let digits: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
        // pairs of hex digits; an odd trailing digit is dropped
        for (i, pair) in digits.as_bytes().chunks_exact(2).enumerate() {
            let Ok(byte) = u8::from_str_radix(std::str::from_utf8(pair).unwrap_or(""), 16) else {
                break;
            };
            mem.write_byte(addr + i as u64, byte);
            loaded += 1;
        }
    }
    tracing::debug!("loaded {} bytes from program image", loaded);
    loaded
}
