//! Price-change classification against the previous price and historical low.

use serde::{Deserialize, Serialize};

use crate::price::{parse_price, PriceParseError};

/// A drop strictly above this percentage is anomalous.
pub const ANOMALOUS_DROP_THRESHOLD_PERCENT: f64 = 30.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceChangeType {
    FirstPrice,
    NoChange,
    PriceIncrease,
    NormalDrop,
    AnomalousDrop,
}

impl PriceChangeType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FirstPrice => "first_price",
            Self::NoChange => "no_change",
            Self::PriceIncrease => "price_increase",
            Self::NormalDrop => "normal_drop",
            Self::AnomalousDrop => "anomalous_drop",
        }
    }

    pub fn is_drop(self) -> bool {
        matches!(self, Self::NormalDrop | Self::AnomalousDrop)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceChangeResult {
    #[serde(rename = "type")]
    pub change_type: PriceChangeType,
    pub drop_percent: f64,
    pub is_historical_low: bool,
}

/// Classify canonical price strings. Fails only when a string is not a number.
pub fn analyze_price_change(
    old_price: Option<&str>,
    new_price: &str,
    historical_low: Option<&str>,
) -> Result<PriceChangeResult, PriceParseError> {
    let old = old_price.map(parse_price).transpose()?;
    let new = parse_price(new_price)?;
    let low = historical_low.map(parse_price).transpose()?;
    Ok(classify_price_change(old, new, low))
}

pub fn classify_price_change(old: Option<f64>, new: f64, historical_low: Option<f64>) -> PriceChangeResult {
    // Absent low behaves as +inf, so a first observation is itself a low.
    let is_historical_low = new < historical_low.unwrap_or(f64::INFINITY);

    let Some(old) = old else {
        return PriceChangeResult {
            change_type: PriceChangeType::FirstPrice,
            drop_percent: 0.0,
            is_historical_low,
        };
    };

    if new >= old {
        let change_type = if new == old {
            PriceChangeType::NoChange
        } else {
            PriceChangeType::PriceIncrease
        };
        return PriceChangeResult {
            change_type,
            drop_percent: 0.0,
            is_historical_low,
        };
    }

    let drop_percent = (old - new) / old * 100.0;
    let change_type = if drop_percent > ANOMALOUS_DROP_THRESHOLD_PERCENT {
        PriceChangeType::AnomalousDrop
    } else {
        PriceChangeType::NormalDrop
    };
    PriceChangeResult {
        change_type,
        drop_percent,
        is_historical_low,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 0.01
    }

    #[test]
    fn detects_normal_drop() {
        let result = analyze_price_change(Some("199.00"), "149.00", Some("140.00")).unwrap();
        assert_eq!(result.change_type, PriceChangeType::NormalDrop);
        assert!(close(result.drop_percent, 25.13));
        assert!(!result.is_historical_low);
    }

    #[test]
    fn detects_anomalous_drop() {
        let result = analyze_price_change(Some("199.00"), "99.00", Some("140.00")).unwrap();
        assert_eq!(result.change_type, PriceChangeType::AnomalousDrop);
        assert!(close(result.drop_percent, 50.25));
    }

    #[test]
    fn anomaly_threshold_splits_drops() {
        let result = classify_price_change(Some(100.0), 71.0, None);
        assert_eq!(result.change_type, PriceChangeType::NormalDrop);
        let result = classify_price_change(Some(100.0), 69.99, None);
        assert_eq!(result.change_type, PriceChangeType::AnomalousDrop);
    }

    #[test]
    fn detects_new_historical_low() {
        let result = analyze_price_change(Some("199.00"), "130.00", Some("140.00")).unwrap();
        assert!(result.is_historical_low);
        assert_eq!(result.change_type, PriceChangeType::AnomalousDrop);
    }

    #[test]
    fn exactly_thirty_percent_is_not_anomalous() {
        let result = analyze_price_change(Some("100.00"), "70.00", None).unwrap();
        assert_eq!(result.change_type, PriceChangeType::NormalDrop);
        assert!(close(result.drop_percent, 30.0));
    }

    #[test]
    fn detects_no_change_and_increase() {
        let same = analyze_price_change(Some("199.00"), "199.00", Some("140.00")).unwrap();
        assert_eq!(same.change_type, PriceChangeType::NoChange);
        assert_eq!(same.drop_percent, 0.0);

        let up = analyze_price_change(Some("199.00"), "249.00", Some("140.00")).unwrap();
        assert_eq!(up.change_type, PriceChangeType::PriceIncrease);
        assert_eq!(up.drop_percent, 0.0);
        assert!(!up.is_historical_low);
    }

    #[test]
    fn increases_never_report_a_drop() {
        for (old, new) in [(1.0, 1.01), (10.0, 200.0), (199.99, 200.0), (0.5, 1000.0)] {
            let result = classify_price_change(Some(old), new, Some(0.1));
            assert_eq!(result.change_type, PriceChangeType::PriceIncrease);
            assert_eq!(result.drop_percent, 0.0);
        }
    }

    #[test]
    fn increase_can_still_be_a_low_after_external_correction() {
        let result = classify_price_change(Some(100.0), 120.0, Some(150.0));
        assert_eq!(result.change_type, PriceChangeType::PriceIncrease);
        assert!(result.is_historical_low);
    }

    #[test]
    fn first_price_without_low_is_a_low() {
        let result = analyze_price_change(None, "199.00", None).unwrap();
        assert_eq!(result.change_type, PriceChangeType::FirstPrice);
        assert_eq!(result.drop_percent, 0.0);
        assert!(result.is_historical_low);

        let result = analyze_price_change(None, "199.00", Some("150.00")).unwrap();
        assert_eq!(result.change_type, PriceChangeType::FirstPrice);
        assert!(!result.is_historical_low);
    }

    #[test]
    fn classification_is_repeatable() {
        let a = analyze_price_change(Some("199.00"), "149.00", Some("140.00")).unwrap();
        let b = analyze_price_change(Some("199.00"), "149.00", Some("140.00")).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn malformed_strings_are_rejected() {
        assert!(analyze_price_change(Some("n/a"), "10.00", None).is_err());
        assert!(analyze_price_change(None, "", None).is_err());
    }
}
