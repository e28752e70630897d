//! Retention spec syntax and archive-set validation.
//!
//! A spec is `step:retention`, each side a number with an optional unit:
//! `s`=1, `m`=60, `h`=3600, `d`=86400, `w`=604800, `y`=31536000.  A bare
//! number on the right-hand side is a raw point count, not a duration:
//! `60:1440` and `1m:1d` both describe one minute of precision kept for one
//! day.

use std::sync::OnceLock;

use regex::Regex;

use crate::error::{Result, WhisperError};

/// One requested archive: `(seconds_per_point, points)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveSpec {
    pub seconds_per_point: u32,
    pub points:            u32,
}

impl ArchiveSpec {
    #[inline]
    pub fn retention(&self) -> u32 {
        self.seconds_per_point * self.points
    }
}

fn quantity_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d+)([smhdwy]?)$").expect("hardcoded regex"))
}

fn unit_multiplier(unit: &str) -> u32 {
    match unit {
        "m" => 60,
        "h" => 3600,
        "d" => 86400,
        "w" => 604800,
        "y" => 31536000,
        _   => 1, // "s" or bare
    }
}

/// Parse one side of a spec into `(value, had_unit)`.
fn parse_quantity(s: &str) -> Result<(u64, bool)> {
    let caps = quantity_re()
        .captures(s)
        .ok_or_else(|| WhisperError::InvalidConfiguration(format!("Invalid retention quantity '{s}'")))?;
    let number: u64 = caps[1]
        .parse()
        .map_err(|_| WhisperError::InvalidConfiguration(format!("Retention quantity '{s}' out of range")))?;
    let unit = &caps[2];
    Ok((number * unit_multiplier(unit) as u64, !unit.is_empty()))
}

/// Parse a `step:retention` spec into an [`ArchiveSpec`].
///
/// The left side is always a duration (bare numbers are seconds).  The right
/// side is a duration when it carries a unit, a raw point count otherwise.
pub fn parse_retention(def: &str) -> Result<ArchiveSpec> {
    let (precision, amount) = def
        .trim()
        .split_once(':')
        .ok_or_else(|| WhisperError::InvalidConfiguration(format!("Invalid retention spec '{def}' (expected step:retention)")))?;

    let (step, _) = parse_quantity(precision)?;
    if step == 0 {
        return Err(WhisperError::InvalidConfiguration(format!(
            "Invalid retention spec '{def}': step must be positive"
        )));
    }

    let (amount, had_unit) = parse_quantity(amount)?;
    let points = if had_unit { amount / step } else { amount };
    if points == 0 {
        return Err(WhisperError::InvalidConfiguration(format!(
            "Invalid retention spec '{def}': retention shorter than one step"
        )));
    }

    if step > u32::MAX as u64 || points > u32::MAX as u64 {
        return Err(WhisperError::InvalidConfiguration(format!(
            "Retention spec '{def}' out of range"
        )));
    }
    Ok(ArchiveSpec { seconds_per_point: step as u32, points: points as u32 })
}

/// Parse a whole archive set, e.g. `["60:1440", "5m:2d", "1h:1y"]`.
pub fn parse_retentions(defs: &[impl AsRef<str>]) -> Result<Vec<ArchiveSpec>> {
    defs.iter().map(|d| parse_retention(d.as_ref())).collect()
}

/// Sort an archive set by precision and enforce the format's layout rules:
///
/// 1. at least one archive;
/// 2. no two archives share a step;
/// 3. each coarser step is a whole multiple of the next finer step;
/// 4. each coarser archive retains strictly longer than the next finer one;
/// 5. each finer archive holds at least one whole coarser step of points,
///    so a coarse slot can always be aggregated from its fine neighbor.
pub fn validate_archives(specs: &mut Vec<ArchiveSpec>) -> Result<()> {
    if specs.is_empty() {
        return Err(WhisperError::InvalidConfiguration(
            "You must specify at least one archive (seconds_per_point, points)".into(),
        ));
    }
    specs.sort_by_key(|s| s.seconds_per_point);

    for pair in specs.windows(2) {
        let (fine, coarse) = (pair[0], pair[1]);

        if fine.seconds_per_point == coarse.seconds_per_point {
            return Err(WhisperError::InvalidConfiguration(format!(
                "Two archives share the precision {}s",
                fine.seconds_per_point
            )));
        }
        if coarse.seconds_per_point % fine.seconds_per_point != 0 {
            return Err(WhisperError::InvalidConfiguration(format!(
                "Step {}s is not a whole multiple of the finer step {}s",
                coarse.seconds_per_point, fine.seconds_per_point
            )));
        }
        if coarse.retention() <= fine.retention() {
            return Err(WhisperError::InvalidConfiguration(format!(
                "Archive {}s:{} does not retain longer than the finer {}s:{}",
                coarse.seconds_per_point, coarse.points,
                fine.seconds_per_point, fine.points
            )));
        }
        let per_coarse_slot = coarse.seconds_per_point / fine.seconds_per_point;
        if per_coarse_slot > fine.points {
            return Err(WhisperError::InvalidConfiguration(format!(
                "Archive {}s:{} holds fewer points than one {}s slot needs ({})",
                fine.seconds_per_point, fine.points,
                coarse.seconds_per_point, per_coarse_slot
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(step: u32, points: u32) -> ArchiveSpec {
        ArchiveSpec { seconds_per_point: step, points }
    }

    #[test]
    fn parses_bare_seconds_and_count() {
        assert_eq!(parse_retention("60:1440").unwrap(), spec(60, 1440));
    }

    #[test]
    fn parses_units_both_sides() {
        assert_eq!(parse_retention("1m:1d").unwrap(), spec(60, 1440));
        assert_eq!(parse_retention("15s:7d").unwrap(), spec(15, 40320));
        assert_eq!(parse_retention("1h:1y").unwrap(), spec(3600, 8760));
        assert_eq!(parse_retention("1w:52w").unwrap(), spec(604800, 52));
    }

    #[test]
    fn rejects_malformed() {
        assert!(parse_retention("60").is_err());
        assert!(parse_retention("60:").is_err());
        assert!(parse_retention(":60").is_err());
        assert!(parse_retention("1x:60").is_err());
        assert!(parse_retention("0:60").is_err());
        assert!(parse_retention("1d:1m").is_err()); // shorter than one step
    }

    #[test]
    fn validate_sorts_by_precision() {
        let mut specs = vec![spec(300, 288), spec(60, 1440)];
        validate_archives(&mut specs).unwrap();
        assert_eq!(specs[0].seconds_per_point, 60);
    }

    #[test]
    fn validate_rejects_bad_sets() {
        assert!(validate_archives(&mut vec![]).is_err());
        // duplicate precision
        assert!(validate_archives(&mut vec![spec(60, 10), spec(60, 20)]).is_err());
        // 90 is not a multiple of 60
        assert!(validate_archives(&mut vec![spec(60, 10), spec(90, 20)]).is_err());
        // coarser archive must retain strictly longer
        assert!(validate_archives(&mut vec![spec(60, 100), spec(300, 20)]).is_err());
        // finer archive too small to cover one coarse slot
        assert!(validate_archives(&mut vec![spec(60, 3), spec(300, 100)]).is_err());
    }
}
