use std::num::IntErrorKind;

use crate::mem::{Memory, MEM_SIZE};

/// Parse a decimal or `0x` hexadecimal literal from assembly source.
///
/// Out-of-range values saturate to the nearest representable 64-bit
/// integer, matching `strtoll`.
pub fn parse_literal(s: &str) -> Option<i64> {
    let (neg, body) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let (radix, digits) = match body.strip_prefix("0x").or_else(|| body.strip_prefix("0X")) {
        Some(hex) => (16, hex),
        None => (10, body),
    };
    let signed = if neg {
        format!("-{digits}")
    } else {
        digits.to_string()
    };
    match i64::from_str_radix(&signed, radix) {
        Ok(val) => Some(val),
        Err(err) => match err.kind() {
            IntErrorKind::PosOverflow => Some(i64::MAX),
            IntErrorKind::NegOverflow => Some(i64::MIN),
            _ => None,
        },
    }
}

/// logging configuration for development
pub fn logging_setup(max_level: tracing::Level) {
    use tracing_subscriber::{filter, prelude::*};

    let filter = filter::filter_fn(move |meta| *meta.level() <= max_level);
    let terminal_log = tracing_subscriber::fmt::layer()
        .compact()
        .with_file(false)
        .with_target(false)
        .without_time()
        .with_thread_names(false)
        .with_writer(std::io::stderr)
        .with_filter(filter);

    tracing_subscriber::registry().with(terminal_log).init();
}

/// Print changed quad words between two memory images to stderr.
pub fn mem_diff(left: &Memory, right: &Memory) {
    for offset in (0..MEM_SIZE).step_by(8) {
        if left.bytes()[offset..offset + 8] != right.bytes()[offset..offset + 8] {
            eprint!("{:#06x}: ", offset);
            for byte in &left.bytes()[offset..offset + 8] {
                eprint!("{:02x}", byte)
            }
            eprint!(" -> ");
            for byte in &right.bytes()[offset..offset + 8] {
                eprint!("{:02x}", byte)
            }
            eprintln!()
        }
    }
}
