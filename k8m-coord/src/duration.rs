//! Duration strings such as `1h30m`, `45s` or `250ms`

use std::time::Duration;

/// Indicates that a duration string could not be parsed
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid duration {input:?}: {reason}")]
pub struct InvalidDuration {
    input: String,
    reason: String,
}

/// Parses a nonzero duration made of one or more `<integer><unit>` parts,
/// such as `1h30m` or `500ms`
pub fn parse(s: &str) -> Result<Duration, InvalidDuration> {
    let invalid = |reason: String| InvalidDuration {
        input: s.to_string(),
        reason,
    };
    let duration = humantime::parse_duration(s).map_err(|e| invalid(e.to_string()))?;
    if duration.is_zero() {
        return Err(invalid("must be nonzero".to_string()));
    }
    Ok(duration)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_compound_durations() {
        assert_eq!(parse("45s"), Ok(Duration::from_secs(45)));
        assert_eq!(parse("1h30m"), Ok(Duration::from_secs(90 * 60)));
        assert_eq!(parse("2m500ms"), Ok(Duration::from_millis(120_500)));
        assert_eq!(parse("10us"), Ok(Duration::from_micros(10)));
    }

    #[test]
    fn rejects_malformed_durations() {
        for s in ["", "10", "s", "5x", "0s", "-1s"] {
            assert!(parse(s).is_err(), "{s:?} must not parse");
        }
    }
}
