//! String helpers
//!
//! Number parsing follows `strtol(s, &end, 0)`: an optional sign, then a
//! `0x` prefix selects hex and a leading `0` selects octal. Unlike
//! `strtol`, trailing characters are an error.

use crate::error::Error;

/// Duplicate `s` into a fresh allocation
///
/// Returns `None`, and logs, when memory runs out.
pub fn strdup(s: &str) -> Option<String> {
    let mut dup = String::new();
    if dup.try_reserve_exact(s.len()).is_err() {
        error!("Cannot allocate memory for string of {} bytes", s.len());
        return None;
    }
    dup.push_str(s);
    Some(dup)
}

/// Split the sign from the magnitude, and parse the magnitude
fn parse(s: &str) -> Result<(bool, u64), Error> {
    let s = s.trim_start();
    let (negative, s) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let (radix, digits) = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        (16, hex)
    } else if s.len() > 1 && s.starts_with('0') {
        (8, &s[1..])
    } else {
        (10, s)
    };
    if digits.is_empty() || !digits.chars().all(|c| c.is_digit(radix)) {
        return Err(Error::InvalidArgument);
    }
    u64::from_str_radix(digits, radix)
        .map(|magnitude| (negative, magnitude))
        .map_err(|_| Error::InvalidArgument)
}

/// Parse a signed integer
pub fn atoi(s: &str) -> Result<i32, Error> {
    let (negative, magnitude) = parse(s)?;
    let value = if negative {
        0i64.checked_sub_unsigned(magnitude)
    } else {
        i64::try_from(magnitude).ok()
    };
    value
        .and_then(|value| i32::try_from(value).ok())
        .ok_or(Error::InvalidArgument)
}

/// Parse an unsigned integer
///
/// A leading minus sign is an error.
pub fn atoui(s: &str) -> Result<u32, Error> {
    match parse(s)? {
        (false, magnitude) => u32::try_from(magnitude).map_err(|_| Error::InvalidArgument),
        (true, _) => Err(Error::InvalidArgument),
    }
}

/// Convert UTF-8 to UTF-16LE, as used by USB string descriptors
///
/// Conversion stops at the end of `src`, at a NUL, or when `dst` can't
/// hold another code unit. Returns the number of code units written.
/// Characters outside the basic multilingual plane, surrogates, overlong
/// and truncated sequences are rejected with [`Error::InvalidArgument`].
pub fn utf8_to_utf16le(src: &[u8], dst: &mut [u8]) -> Result<usize, Error> {
    let mut bytes = src.iter().copied();
    let mut written = 0;
    let capacity = dst.len() / 2;

    fn continuation(bytes: &mut impl Iterator<Item = u8>) -> Result<u16, Error> {
        match bytes.next() {
            Some(c) if c & 0xc0 == 0x80 => Ok(u16::from(c & 0x3f)),
            _ => Err(Error::InvalidArgument),
        }
    }

    while written < capacity {
        let c = match bytes.next() {
            None | Some(0) => break,
            Some(c) => c,
        };
        let unit = if c & 0x80 == 0 {
            u16::from(c)
        } else if c & 0xe0 == 0xc0 {
            let unit = (u16::from(c & 0x1f) << 6) | continuation(&mut bytes)?;
            if unit < 0x80 {
                return Err(Error::InvalidArgument);
            }
            unit
        } else if c & 0xf0 == 0xe0 {
            let high = u16::from(c & 0x0f) << 12;
            let unit = high | (continuation(&mut bytes)? << 6) | continuation(&mut bytes)?;
            if unit < 0x800 || (0xd800..=0xdfff).contains(&unit) {
                return Err(Error::InvalidArgument);
            }
            unit
        } else {
            return Err(Error::InvalidArgument);
        };
        dst[written * 2..written * 2 + 2].copy_from_slice(&super::byteorder::cpu_to_le16(unit));
        written += 1;
    }
    Ok(written)
}
