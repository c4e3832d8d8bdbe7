//! Big-integer-safe JSON pre-processing: quotes integer
//! tokens with 15 or more digits at the lexer level, before the text ever
//! reaches `serde_json`, so that platform IDs beyond the safe `f64`
//! integer range survive round-tripping as strings instead of being
//! silently rounded.

const BIG_INT_DIGIT_THRESHOLD: usize = 15;

/// Rewrites `raw` so that any bare JSON integer literal (not a decimal, not
/// an exponent, not inside a string) with `>= 15` digits is wrapped in
/// quotes. Safe to call on any valid JSON text; a no-op on text with no
/// such tokens.
pub fn quote_big_integers(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 8);
    let mut in_string = false;
    let mut escaped = false;
    let mut iter = raw.char_indices().peekable();

    while let Some((i, c)) = iter.next() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }

        if c == '"' {
            in_string = true;
            out.push(c);
            continue;
        }

        let next_is_digit = iter
            .peek()
            .map(|(_, next_char)| next_char.is_ascii_digit())
            .unwrap_or(false);
        let is_number_start = c.is_ascii_digit() || (c == '-' && next_is_digit);
        if is_number_start {
            // Numbers are pure ASCII, so byte length equals char count —
            // safe to slice `raw` at `i` and skip that many iterator items.
            let (token, consumed_bytes, is_plain_integer) = scan_number(&raw[i..]);
            let digit_count = token.chars().filter(|d| d.is_ascii_digit()).count();
            if is_plain_integer && digit_count >= BIG_INT_DIGIT_THRESHOLD {
                out.push('"');
                out.push_str(token);
                out.push('"');
            } else {
                out.push_str(token);
            }
            for _ in 1..consumed_bytes {
                iter.next();
            }
            continue;
        }

        out.push(c);
    }

    out
}

/// Returns `(token_text, byte_length, is_plain_integer)` for the JSON
/// number starting at the beginning of `s`. `is_plain_integer` is false
/// when a fraction or exponent part is present.
fn scan_number(s: &str) -> (&str, usize, bool) {
    let bytes = s.as_bytes();
    let mut i = 0;
    if bytes.first() == Some(&b'-') {
        i += 1;
    }
    while bytes.get(i).is_some_and(|b| b.is_ascii_digit()) {
        i += 1;
    }
    let integer_end = i;
    let mut is_plain = true;

    if bytes.get(i) == Some(&b'.') {
        is_plain = false;
        i += 1;
        while bytes.get(i).is_some_and(|b| b.is_ascii_digit()) {
            i += 1;
        }
    }
    if matches!(bytes.get(i), Some(b'e') | Some(b'E')) {
        is_plain = false;
        i += 1;
        if matches!(bytes.get(i), Some(b'+') | Some(b'-')) {
            i += 1;
        }
        while bytes.get(i).is_some_and(|b| b.is_ascii_digit()) {
            i += 1;
        }
    }

    if is_plain {
        (&s[..integer_end], integer_end, true)
    } else {
        (&s[..i], i, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn leaves_small_integers_untouched() {
        let input = r#"{"id": 123}"#;
        assert_eq!(quote_big_integers(input), input);
    }

    #[test]
    fn quotes_integers_with_15_or_more_digits() {
        let input = r#"{"chat":{"id":1234567890123456}}"#;
        let output = quote_big_integers(input);
        let value: Value = serde_json::from_str(&output).unwrap();
        assert_eq!(value["chat"]["id"], json!("1234567890123456"));
    }

    #[test]
    fn quotes_negative_big_integers() {
        let input = r#"{"id":-1234567890123456}"#;
        let output = quote_big_integers(input);
        let value: Value = serde_json::from_str(&output).unwrap();
        assert_eq!(value["id"], json!("-1234567890123456"));
    }

    #[test]
    fn does_not_touch_big_digit_runs_inside_strings() {
        let input = r#"{"note":"1234567890123456"}"#;
        assert_eq!(quote_big_integers(input), input);
    }

    #[test]
    fn leaves_decimals_and_exponents_unquoted_even_if_long() {
        let input = r#"{"value":123456789012345.0}"#;
        assert_eq!(quote_big_integers(input), input);
        let input2 = r#"{"value":1e20}"#;
        assert_eq!(quote_big_integers(input2), input2);
    }

    #[test]
    fn round_trips_through_serde_json_value_losslessly() {
        let input = r#"{"update_id": 1, "message": {"chat": {"id": 9223372036854775807}}}"#;
        let output = quote_big_integers(input);
        let value: Value = serde_json::from_str(&output).unwrap();
        assert_eq!(value["message"]["chat"]["id"], json!("9223372036854775807"));
        assert_eq!(value["update_id"], json!(1));
    }
}
