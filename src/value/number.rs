//! Number parsing and formatting
//!
//! Conversions between strings and numbers follow Lua rules: decimal
//! literals, hexadecimal integers and hexadecimal floats (`0x1.8p3`) are
//! accepted with surrounding whitespace; numbers print like C's `%.14g`.

/// Parse a numeric string with Lua coercion rules
pub fn parse_number(text: &str) -> Option<f64> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    let (negative, body) = match trimmed.as_bytes()[0] {
        b'-' => (true, &trimmed[1..]),
        b'+' => (false, &trimmed[1..]),
        _ => (false, trimmed),
    };

    let magnitude = if body.len() > 2 && (body.starts_with("0x") || body.starts_with("0X")) {
        parse_hex_float(&body[2..])?
    } else {
        parse_decimal(body)?
    };

    Some(if negative { -magnitude } else { magnitude })
}

fn parse_decimal(body: &str) -> Option<f64> {
    // Rust's parser also accepts "inf", "nan" and friends, Lua does not
    let mut digits = 0;
    for c in body.chars() {
        match c {
            '0'..='9' => digits += 1,
            '.' | 'e' | 'E' | '+' | '-' => {}
            _ => return None,
        }
    }
    if digits == 0 {
        return None;
    }
    body.parse::<f64>().ok()
}

/// Parse the part of a hexadecimal literal after `0x`.
///
/// The mantissa accumulates integer and fractional digits alike; every
/// fractional digit scales the result by 2^-4, and an optional `p` exponent
/// adds a binary power: `mantissa * 2^(frac_digits * -4 + exp)`.
fn parse_hex_float(body: &str) -> Option<f64> {
    let bytes = body.as_bytes();
    let mut pos = 0;
    let mut mantissa = 0.0f64;
    let mut frac_digits = 0i32;
    let mut any_digit = false;

    while pos < bytes.len() {
        match hex_digit(bytes[pos]) {
            Some(d) => {
                mantissa = mantissa * 16.0 + d as f64;
                any_digit = true;
                pos += 1;
            }
            None => break,
        }
    }

    if pos < bytes.len() && bytes[pos] == b'.' {
        pos += 1;
        while pos < bytes.len() {
            match hex_digit(bytes[pos]) {
                Some(d) => {
                    mantissa = mantissa * 16.0 + d as f64;
                    frac_digits += 1;
                    any_digit = true;
                    pos += 1;
                }
                None => break,
            }
        }
    }

    if !any_digit {
        return None;
    }

    let mut exponent = 0i32;
    if pos < bytes.len() && (bytes[pos] == b'p' || bytes[pos] == b'P') {
        pos += 1;
        let mut exp_negative = false;
        if pos < bytes.len() && (bytes[pos] == b'+' || bytes[pos] == b'-') {
            exp_negative = bytes[pos] == b'-';
            pos += 1;
        }
        let start = pos;
        while pos < bytes.len() && bytes[pos].is_ascii_digit() {
            exponent = exponent.saturating_mul(10).saturating_add((bytes[pos] - b'0') as i32);
            pos += 1;
        }
        if pos == start {
            return None;
        }
        if exp_negative {
            exponent = -exponent;
        }
    }

    if pos != bytes.len() {
        return None;
    }

    // anything past this range is already 0 or infinity
    let scale = (exponent as i64 - 4 * frac_digits as i64).clamp(-4096, 4096) as i32;
    Some(mantissa * 2f64.powi(scale))
}

fn hex_digit(b: u8) -> Option<u32> {
    (b as char).to_digit(16)
}

/// Format a number the way `tostring` does
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        return if n.is_sign_negative() { "-nan".to_string() } else { "nan".to_string() };
    }
    if n.is_infinite() {
        return if n > 0.0 { "inf".to_string() } else { "-inf".to_string() };
    }
    if n == n.trunc() && n.abs() < 1e15 {
        // -0.0 prints as "-0" in Lua
        if n == 0.0 && n.is_sign_negative() {
            return "-0".to_string();
        }
        return format!("{}", n as i64);
    }

    // %.14g: 14 significant digits, scientific outside [1e-4, 1e14)
    let sci = format!("{:.13e}", n);
    let (mantissa, exp) = match sci.split_once('e') {
        Some((m, e)) => (m, e.parse::<i32>().unwrap_or(0)),
        None => (sci.as_str(), 0),
    };

    if exp < -4 || exp >= 14 {
        let mantissa = trim_fraction(mantissa);
        let sign = if exp < 0 { '-' } else { '+' };
        format!("{}e{}{:02}", mantissa, sign, exp.abs())
    } else {
        let decimals = (13 - exp).max(0) as usize;
        trim_fraction(&format!("{:.*}", decimals, n)).to_string()
    }
}

fn trim_fraction(text: &str) -> &str {
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.')
    } else {
        text
    }
}

/// If `n` is an integral value representable as `i64`, return it
pub fn as_integer(n: f64) -> Option<i64> {
    if n.fract() == 0.0 && n >= i64::MIN as f64 && n < i64::MAX as f64 {
        Some(n as i64)
    } else {
        None
    }
}
