//! Locale-aware price text normalization.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("not a canonical price: {value:?}")]
pub struct PriceParseError {
    pub value: String,
}

/// Collapse whitespace runs to single spaces and trim.
pub fn normalize_text(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Normalize raw price text (`"1 171,00 zł"`, `"$1,234.56"`, `"1.234.56"`) to a
/// two-decimal canonical string. Anything unparseable yields `None`.
pub fn normalize_price(raw: Option<&str>) -> Option<String> {
    let raw = raw?;
    let run = first_numeric_run(raw)?;

    let mut numeric: String = run.chars().filter(|c| !c.is_whitespace()).collect();
    if numeric.contains(',') {
        numeric = numeric.replace('.', "").replacen(',', ".", 1);
    } else {
        let mut parts: Vec<&str> = numeric.split('.').collect();
        if parts.len() > 2 {
            let decimal = parts.pop().unwrap_or_default();
            numeric = format!("{}.{}", parts.concat(), decimal);
        }
    }

    let parsed = leading_decimal(&numeric)?;
    Some(format!("{parsed:.2}"))
}

/// Parse a canonical price string produced by [`normalize_price`] or read back
/// from the store.
pub fn parse_price(value: &str) -> Result<f64, PriceParseError> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| PriceParseError {
            value: value.to_string(),
        })
}

/// First digit followed by any digits, grouping punctuation or whitespace
/// (non-breaking space included).
fn first_numeric_run(text: &str) -> Option<&str> {
    let start = text.find(|c: char| c.is_ascii_digit())?;
    let rest = &text[start..];
    let end = rest
        .char_indices()
        .find(|(_, c)| !(c.is_ascii_digit() || *c == '.' || *c == ',' || c.is_whitespace()))
        .map(|(idx, _)| idx)
        .unwrap_or(rest.len());
    Some(&rest[..end])
}

/// Longest `digits[.digits]` prefix, so trailing separators like `"171,"` still parse.
fn leading_decimal(numeric: &str) -> Option<f64> {
    let mut end = 0;
    let mut seen_dot = false;
    for (idx, ch) in numeric.char_indices() {
        if ch.is_ascii_digit() {
            end = idx + 1;
        } else if ch == '.' && !seen_dot {
            seen_dot = true;
        } else {
            break;
        }
    }
    numeric[..end].parse::<f64>().ok().filter(|v| v.is_finite())
}
