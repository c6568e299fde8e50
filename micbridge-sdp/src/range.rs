//! Play windows carried by `a=range` attributes
//!
//! A range is either relative to the start of the presentation (`npt=`, normal play
//! time in seconds) or anchored to wall-clock time (`clock=`, UTC timestamps).

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

use crate::error::SdpError;

const CLOCK_FORMAT: &str = "%Y%m%dT%H%M%S";

/// A play window over which the remote side is asked to stream
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PlayRange {
    /// Normal play time, in seconds from the start of the presentation
    Npt { start: f64, end: Option<f64> },
    /// Absolute wall-clock time
    Clock {
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    },
}

impl PlayRange {
    /// The whole presentation, from the beginning to whatever end the server has
    pub fn full() -> Self {
        PlayRange::Npt {
            start: 0.0,
            end: None,
        }
    }

    /// Whether the range is indexed by absolute time
    pub fn is_absolute(&self) -> bool {
        matches!(self, PlayRange::Clock { .. })
    }

    /// Length of the window in seconds; `0.0` for open-ended (live) windows
    pub fn duration(&self) -> f64 {
        match *self {
            PlayRange::Npt { start, end } => end.map(|end| end - start).unwrap_or(0.0),
            PlayRange::Clock { start, end } => end
                .map(|end| (end - start).num_milliseconds() as f64 / 1000.0)
                .unwrap_or(0.0),
        }
    }

    pub(crate) fn parse_value(value: &str) -> Result<Self, String> {
        let value = value.trim();
        if let Some(npt) = value.strip_prefix("npt=") {
            let (start, end) = split_bounds(npt)?;
            let start = if start.is_empty() || start == "now" {
                0.0
            } else {
                parse_npt_time(start)?
            };
            let end = if end.is_empty() {
                None
            } else {
                Some(parse_npt_time(end)?)
            };
            Ok(PlayRange::Npt { start, end })
        } else if let Some(clock) = value.strip_prefix("clock=") {
            let (start, end) = split_bounds(clock)?;
            let start = parse_clock_time(start)?;
            let end = if end.is_empty() {
                None
            } else {
                Some(parse_clock_time(end)?)
            };
            Ok(PlayRange::Clock { start, end })
        } else {
            Err(format!("unsupported range unit in {value:?}"))
        }
    }
}

impl FromStr for PlayRange {
    type Err = SdpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_value(s).map_err(|reason| SdpError::InvalidRange { line: 0, reason })
    }
}

impl fmt::Display for PlayRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlayRange::Npt { start, end } => {
                write!(f, "npt={start:.3}-")?;
                if let Some(end) = end {
                    write!(f, "{end:.3}")?;
                }
                Ok(())
            }
            PlayRange::Clock { start, end } => {
                write!(f, "clock={}-", start.format("%Y%m%dT%H%M%SZ"))?;
                if let Some(end) = end {
                    write!(f, "{}", end.format("%Y%m%dT%H%M%SZ"))?;
                }
                Ok(())
            }
        }
    }
}

fn split_bounds(value: &str) -> Result<(&str, &str), String> {
    value
        .split_once('-')
        .map(|(start, end)| (start.trim(), end.trim()))
        .ok_or_else(|| format!("missing '-' separator in {value:?}"))
}

/// Parses `12.5` or `hh:mm:ss[.frac]` into seconds
fn parse_npt_time(value: &str) -> Result<f64, String> {
    let parts: Vec<&str> = value.split(':').collect();
    let number = |part: &str| {
        part.parse::<f64>()
            .map_err(|_| format!("invalid npt time {value:?}"))
    };

    let seconds = match *parts.as_slice() {
        [secs] => number(secs)?,
        [hours, minutes, secs] => {
            number(hours)? * 3600.0 + number(minutes)? * 60.0 + number(secs)?
        }
        _ => return Err(format!("invalid npt time {value:?}")),
    };

    if seconds.is_finite() && seconds >= 0.0 {
        Ok(seconds)
    } else {
        Err(format!("npt time out of range: {value:?}"))
    }
}

/// Parses `YYYYMMDDThhmmss[.frac]Z`
fn parse_clock_time(value: &str) -> Result<DateTime<Utc>, String> {
    let stamp = value
        .strip_suffix('Z')
        .ok_or_else(|| format!("clock time {value:?} is not UTC"))?;
    let (whole, fraction) = match stamp.split_once('.') {
        Some((whole, fraction)) => (whole, Some(fraction)),
        None => (stamp, None),
    };

    let naive = NaiveDateTime::parse_from_str(whole, CLOCK_FORMAT)
        .map_err(|e| format!("invalid clock time {value:?}: {e}"))?;
    let mut time = Utc.from_utc_datetime(&naive);

    if let Some(fraction) = fraction {
        let millis = format!("0.{fraction}")
            .parse::<f64>()
            .map_err(|_| format!("invalid clock fraction in {value:?}"))?;
        time = time + chrono::Duration::milliseconds((millis * 1000.0).round() as i64);
    }

    Ok(time)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("npt=0-", 0.0, None)]
    #[case("npt=0-30", 0.0, Some(30.0))]
    #[case("npt=now-", 0.0, None)]
    #[case("npt=2.5-10.25", 2.5, Some(10.25))]
    #[case("npt=00:01:00-00:02:30.5", 60.0, Some(150.5))]
    fn test_parse_npt(#[case] input: &str, #[case] start: f64, #[case] end: Option<f64>) {
        assert_eq!(
            PlayRange::parse_value(input).unwrap(),
            PlayRange::Npt { start, end }
        );
    }

    #[test]
    fn test_parse_clock_range() {
        let range = PlayRange::parse_value("clock=20240101T120000Z-20240101T121000.5Z").unwrap();
        assert!(range.is_absolute());
        assert_eq!(range.duration(), 600.5);
    }

    #[test]
    fn test_open_ranges_have_no_duration() {
        assert_eq!(PlayRange::full().duration(), 0.0);
        let live = PlayRange::parse_value("clock=20240101T120000Z-").unwrap();
        assert_eq!(live.duration(), 0.0);
    }

    #[rstest]
    #[case("smpte=0:10:20-")]
    #[case("npt=abc-")]
    #[case("npt=10")]
    #[case("clock=20240101T120000-")]
    fn test_invalid_ranges(#[case] input: &str) {
        assert!(input.parse::<PlayRange>().is_err());
    }

    #[test]
    fn test_display_matches_range_header_syntax() {
        assert_eq!(PlayRange::full().to_string(), "npt=0.000-");
        let range = PlayRange::parse_value("clock=20240101T120000Z-20240101T121000Z").unwrap();
        assert_eq!(range.to_string(), "clock=20240101T120000Z-20240101T121000Z");
    }
}
