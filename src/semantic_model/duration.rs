//! Refresh intervals are written as compact strings such as `30m`, `1.5h` or `500ms`.

use std::time::Duration;

const UNITS: [(&str, u128); 7] = [
    ("d", 86_400_000_000_000),
    ("h", 3_600_000_000_000),
    ("m", 60_000_000_000),
    ("s", 1_000_000_000),
    ("ms", 1_000_000),
    ("us", 1_000),
    ("ns", 1),
];

fn unit_nanos(unit: &str) -> Option<u128> {
    UNITS
        .iter()
        .find(|(name, _)| *name == unit)
        .map(|(_, nanos)| *nanos)
}

pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    let split = value
        .find(|c: char| c.is_ascii_alphabetic())
        .ok_or_else(|| format!("duration '{}' has no unit", value))?;
    let (number, unit) = value.split_at(split);
    let number = number.trim();
    let nanos_per_unit =
        unit_nanos(unit.trim()).ok_or_else(|| format!("unknown duration unit in '{}'", value))?;

    if let Ok(whole) = number.parse::<u64>() {
        let nanos = u128::from(whole) * nanos_per_unit;
        return nanos_to_duration(nanos, value);
    }

    let fractional: f64 = number
        .parse()
        .map_err(|_| format!("invalid duration '{}'", value))?;
    if !fractional.is_finite() || fractional < 0.0 {
        return Err(format!("invalid duration '{}'", value));
    }
    nanos_to_duration((fractional * nanos_per_unit as f64).round() as u128, value)
}

fn nanos_to_duration(nanos: u128, original: &str) -> Result<Duration, String> {
    let secs = u64::try_from(nanos / 1_000_000_000)
        .map_err(|_| format!("duration '{}' is too large", original))?;
    Ok(Duration::new(secs, (nanos % 1_000_000_000) as u32))
}

/// Formats with the largest unit that represents the value exactly.
pub fn format_duration(duration: &Duration) -> String {
    let nanos = duration.as_nanos();
    if nanos == 0 {
        return "0s".to_string();
    }
    let (unit, per_unit) = UNITS
        .iter()
        .find(|(_, per_unit)| nanos % per_unit == 0)
        .copied()
        .unwrap_or(("ns", 1));
    format!("{}{}", nanos / per_unit, unit)
}

pub mod option {
    use super::{format_duration, parse_duration};
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(duration) => serializer.serialize_str(&format_duration(duration)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(deserializer)?
            .map(|raw| parse_duration(&raw).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::minutes("30m", Duration::from_secs(1800))]
    #[case::fractional_hours("1.5h", Duration::from_secs(5400))]
    #[case::millis("500ms", Duration::from_millis(500))]
    #[case::spaced("10 s", Duration::from_secs(10))]
    #[case::days("2d", Duration::from_secs(172_800))]
    fn test_parse_duration(#[case] raw: &str, #[case] expected: Duration) {
        assert_eq!(parse_duration(raw).unwrap(), expected);
    }

    #[rstest]
    #[case::no_unit("30")]
    #[case::unknown_unit("3 fortnights")]
    #[case::negative("-1s")]
    fn test_parse_duration_rejects(#[case] raw: &str) {
        assert!(parse_duration(raw).is_err());
    }

    #[rstest]
    #[case(Duration::from_secs(1800), "30m")]
    #[case(Duration::from_secs(5400), "90m")]
    #[case(Duration::from_millis(1500), "1500ms")]
    #[case(Duration::ZERO, "0s")]
    fn test_format_duration(#[case] duration: Duration, #[case] expected: &str) {
        assert_eq!(format_duration(&duration), expected);
    }
}
