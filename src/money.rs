//! Currency amounts as integer minor units.
//!
//! The model is asked to drop the decimal separator itself (`€27,90 → 2790`),
//! but it does not always comply. Anything that still carries a separator is
//! converted here by removing the separator, never by multiplying by 100:
//! locales disagree on which of `.` and `,` is decimal, and a value that is
//! already in minor units must come out unchanged.
//!
//! Rules for a string amount:
//!
//! * currency symbols, codes and whitespace are ignored;
//! * the last `.` or `,` is a decimal separator when 1–2 digits follow it;
//!   the fraction is right-padded to two digits (`27.9 → 2790`);
//! * every other separator is a thousands separator (`1.234,56 → 123456`);
//! * a grouped amount with no fraction is whole units (`1,234 → 123400`);
//! * a bare digit string is already in minor units (`2790 → 2790`).
//!
//! JSON numbers follow the same split: an integer token is minor units, any
//! token with a decimal point (`27.0`, `27.90`) is a display value.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static RE_NOT_AMOUNT: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^0-9.,\-]").unwrap());

/// Convert a display amount (`"27.90"`, `"€ 1.234,56"`, `"2790"`) to minor units.
///
/// Returns `None` when the input contains no digits or overflows `i64`.
pub fn to_minor_units(input: &str) -> Option<i64> {
    let cleaned = RE_NOT_AMOUNT.replace_all(input.trim(), "");
    let negative = cleaned.starts_with('-');
    let body = cleaned.trim_start_matches('-');

    if !body.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }

    let decimal_at = body.rfind(['.', ',']).filter(|&idx| {
        let fraction = &body[idx + 1..];
        (1..=2).contains(&fraction.len()) && fraction.chars().all(|c| c.is_ascii_digit())
    });

    let digits: String = match decimal_at {
        Some(idx) => {
            let whole: String = body[..idx].chars().filter(char::is_ascii_digit).collect();
            let fraction = &body[idx + 1..];
            format!("{whole}{fraction:0<2}")
        }
        None => {
            let whole: String = body.chars().filter(char::is_ascii_digit).collect();
            if body.contains(['.', ',']) {
                format!("{whole}00")
            } else {
                whole
            }
        }
    };

    let value: i64 = digits.parse().ok()?;
    Some(if negative { -value } else { value })
}

/// Read an amount from a JSON value.
///
/// Integer tokens are taken as minor units. Any other number is rendered
/// back to its decimal text and goes through [`to_minor_units`], so `27.0`
/// and `"27.00"` agree. Numbers outside the `i64` range, and numbers that
/// render in exponent form, are `None`.
pub fn json_amount(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                return Some(i);
            }
            if let Some(u) = n.as_u64() {
                return i64::try_from(u).ok();
            }
            let f = n.as_f64()?;
            if !f.is_finite() || f.abs() * 100.0 >= i64::MAX as f64 {
                return None;
            }
            let text = n.to_string();
            if text.contains(['e', 'E']) {
                return None;
            }
            to_minor_units(&text)
        }
        Value::String(s) => to_minor_units(s),
        _ => None,
    }
}

/// Render minor units for display, e.g. `2790, "EUR"` → `27.90 EUR`.
pub fn format_minor_units(amount: i64, currency: Option<&str>) -> String {
    let sign = if amount < 0 { "-" } else { "" };
    let abs = amount.unsigned_abs();
    let body = format!("{sign}{}.{:02}", abs / 100, abs % 100);
    match currency {
        Some(code) => format!("{body} {code}"),
        None => body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decimal_point_is_stripped_not_multiplied() {
        assert_eq!(to_minor_units("27.90"), Some(2790));
        assert_eq!(to_minor_units("5.30"), Some(530));
        assert_eq!(to_minor_units("33.20"), Some(3320));
    }

    #[test]
    fn comma_decimal_and_currency_symbols() {
        assert_eq!(to_minor_units("€27,90"), Some(2790));
        assert_eq!(to_minor_units("EUR 5,30"), Some(530));
        assert_eq!(to_minor_units("$ 1,234.56"), Some(123456));
        assert_eq!(to_minor_units("1.234,56 €"), Some(123456));
    }

    #[test]
    fn single_fraction_digit_is_padded() {
        assert_eq!(to_minor_units("27.9"), Some(2790));
    }

    #[test]
    fn plain_integers_are_already_minor_units() {
        assert_eq!(to_minor_units("2790"), Some(2790));
        assert_eq!(to_minor_units("0"), Some(0));
    }

    #[test]
    fn grouped_whole_amounts_gain_a_zero_fraction() {
        // Three digits after the separator: thousands grouping.
        assert_eq!(to_minor_units("1.000"), Some(100000));
        assert_eq!(to_minor_units("€1.000"), Some(100000));
        assert_eq!(to_minor_units("$1,234"), Some(123400));
        assert_eq!(to_minor_units("1,234,567"), Some(123456700));
    }

    #[test]
    fn conversion_is_idempotent() {
        for input in ["27.90", "€27,90", "1.234,56", "27.9", "2790", "-5.00", "$1,234"] {
            let once = to_minor_units(input).unwrap();
            let twice = to_minor_units(&once.to_string()).unwrap();
            assert_eq!(once, twice, "input {input:?}");
        }
    }

    #[test]
    fn negative_amounts_keep_their_sign() {
        assert_eq!(to_minor_units("-5.00"), Some(-500));
        assert_eq!(to_minor_units("-€5,00"), Some(-500));
    }

    #[test]
    fn no_digits_is_none() {
        assert_eq!(to_minor_units(""), None);
        assert_eq!(to_minor_units("N/A"), None);
        assert_eq!(to_minor_units("€"), None);
    }

    #[test]
    fn json_amounts() {
        assert_eq!(json_amount(&json!(2790)), Some(2790));
        assert_eq!(json_amount(&json!(27.9)), Some(2790));
        assert_eq!(json_amount(&json!("27,90")), Some(2790));
        assert_eq!(json_amount(&json!(null)), None);
        assert_eq!(json_amount(&json!(true)), None);
    }

    #[test]
    fn json_decimal_tokens_match_their_quoted_form() {
        let parsed: Value = serde_json::from_str(r#"{"a": 27.00, "b": "27.00", "c": 2790.0}"#).unwrap();
        assert_eq!(json_amount(&parsed["a"]), Some(2700));
        assert_eq!(json_amount(&parsed["b"]), Some(2700));
        assert_eq!(json_amount(&parsed["c"]), Some(279000));
        assert_eq!(json_amount(&json!(27.0)), Some(2700));
    }

    #[test]
    fn out_of_range_json_numbers_are_rejected() {
        let parsed: Value = serde_json::from_str(r#"[1e300, -1e300, 1e17]"#).unwrap();
        assert_eq!(json_amount(&parsed[0]), None);
        assert_eq!(json_amount(&parsed[1]), None);
        assert_eq!(json_amount(&parsed[2]), None);
    }

    #[test]
    fn format_for_display() {
        assert_eq!(format_minor_units(2790, Some("EUR")), "27.90 EUR");
        assert_eq!(format_minor_units(5, None), "0.05");
        assert_eq!(format_minor_units(-500, Some("USD")), "-5.00 USD");
    }
}
