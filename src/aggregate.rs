//! Aggregation method registry: frozen integer codes + reduction functions.
//!
//! # Identity rules
//! Every method is identified by a small integer code stored in the file
//! header.  The codes are permanent:
//!
//! ```text
//! Code  Token      Reduction over the covering fine slots
//!   1   average    sum(known) / count(known)
//!   2   sum        sum(known)
//!   3   last       known value with the greatest timestamp
//!   4   max        maximum of known values
//!   5   min        minimum of known values
//!   6   avg_zero   sum(known) / count(expected)   (missing counted as zero)
//!   7   absmax     known value of greatest |v|, original sign kept
//!   8   absmin     known value of smallest |v|, original sign kept
//! ```
//!
//! A code is NEVER reused.  Parsers MUST reject unknown codes at open time;
//! there is no fallback method.
//!
//! # Tie-break
//! `absmax`/`absmin` resolve equal magnitudes to the first-seen known value
//! (slot order), so re-running a reduction over unchanged slots is stable.

use crate::point::Point;

/// Runtime aggregation discriminant.  Carries the frozen header code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationMethod {
    Average,
    Sum,
    Last,
    Max,
    Min,
    AvgZero,
    AbsMax,
    AbsMin,
}

/// Every method, in header-code order.  For CLI help and validation loops.
pub const ALL_METHODS: [AggregationMethod; 8] = [
    AggregationMethod::Average,
    AggregationMethod::Sum,
    AggregationMethod::Last,
    AggregationMethod::Max,
    AggregationMethod::Min,
    AggregationMethod::AvgZero,
    AggregationMethod::AbsMax,
    AggregationMethod::AbsMin,
];

impl AggregationMethod {
    /// The frozen header code for this method.
    #[inline]
    pub fn code(self) -> u32 {
        match self {
            AggregationMethod::Average => 1,
            AggregationMethod::Sum     => 2,
            AggregationMethod::Last    => 3,
            AggregationMethod::Max     => 4,
            AggregationMethod::Min     => 5,
            AggregationMethod::AvgZero => 6,
            AggregationMethod::AbsMax  => 7,
            AggregationMethod::AbsMin  => 8,
        }
    }

    /// Resolve a header code.  Returns `None` for codes this build does not
    /// know — the caller must reject the file.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(AggregationMethod::Average),
            2 => Some(AggregationMethod::Sum),
            3 => Some(AggregationMethod::Last),
            4 => Some(AggregationMethod::Max),
            5 => Some(AggregationMethod::Min),
            6 => Some(AggregationMethod::AvgZero),
            7 => Some(AggregationMethod::AbsMax),
            8 => Some(AggregationMethod::AbsMin),
            _ => None,
        }
    }

    /// Token written by CLIs and shown in `info` output.
    pub fn name(self) -> &'static str {
        match self {
            AggregationMethod::Average => "average",
            AggregationMethod::Sum     => "sum",
            AggregationMethod::Last    => "last",
            AggregationMethod::Max     => "max",
            AggregationMethod::Min     => "min",
            AggregationMethod::AvgZero => "avg_zero",
            AggregationMethod::AbsMax  => "absmax",
            AggregationMethod::AbsMin  => "absmin",
        }
    }

    /// Parse a CLI token.
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "average"  => Some(AggregationMethod::Average),
            "sum"      => Some(AggregationMethod::Sum),
            "last"     => Some(AggregationMethod::Last),
            "max"      => Some(AggregationMethod::Max),
            "min"      => Some(AggregationMethod::Min),
            "avg_zero" => Some(AggregationMethod::AvgZero),
            "absmax"   => Some(AggregationMethod::AbsMax),
            "absmin"   => Some(AggregationMethod::AbsMin),
            _          => None,
        }
    }

    /// Reduce the known slots of one coarse interval to a single value.
    ///
    /// `known` holds only slots whose stored timestamp matched their expected
    /// slot timestamp, in slot order.  `expected` is the total slot count of
    /// the interval; only `avg_zero` looks at it.  Returns `None` when no
    /// slot is known — the caller stops propagation in that case.
    pub fn aggregate(self, known: &[Point], expected: usize) -> Option<f64> {
        let first = known.first()?;
        Some(match self {
            AggregationMethod::Average => {
                known.iter().map(|p| p.value).sum::<f64>() / known.len() as f64
            }
            AggregationMethod::Sum => known.iter().map(|p| p.value).sum(),
            AggregationMethod::Last => {
                known
                    .iter()
                    .fold(first, |best, p| if p.timestamp > best.timestamp { p } else { best })
                    .value
            }
            AggregationMethod::Max => known.iter().map(|p| p.value).fold(f64::MIN, f64::max),
            AggregationMethod::Min => known.iter().map(|p| p.value).fold(f64::MAX, f64::min),
            AggregationMethod::AvgZero => {
                known.iter().map(|p| p.value).sum::<f64>() / expected as f64
            }
            AggregationMethod::AbsMax => {
                known
                    .iter()
                    .fold(first, |best, p| if p.value.abs() > best.value.abs() { p } else { best })
                    .value
            }
            AggregationMethod::AbsMin => {
                known
                    .iter()
                    .fold(first, |best, p| if p.value.abs() < best.value.abs() { p } else { best })
                    .value
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pts(vals: &[(u32, f64)]) -> Vec<Point> {
        vals.iter().map(|&(t, v)| Point::new(t, v)).collect()
    }

    #[test]
    fn code_roundtrip() {
        for m in ALL_METHODS {
            assert_eq!(AggregationMethod::from_code(m.code()), Some(m));
            assert_eq!(AggregationMethod::from_name(m.name()), Some(m));
        }
        assert_eq!(AggregationMethod::from_code(0), None);
        assert_eq!(AggregationMethod::from_code(9), None);
    }

    #[test]
    fn average_over_known_only() {
        let known = pts(&[(60, 10.0), (120, 20.0), (180, 30.0)]);
        assert_eq!(AggregationMethod::Average.aggregate(&known, 5), Some(20.0));
    }

    #[test]
    fn avg_zero_divides_by_expected() {
        let known = pts(&[(60, 10.0), (120, 20.0), (180, 30.0)]);
        assert_eq!(AggregationMethod::AvgZero.aggregate(&known, 5), Some(12.0));
    }

    #[test]
    fn last_takes_greatest_timestamp() {
        let known = pts(&[(120, 2.0), (60, 1.0), (180, 3.0)]);
        assert_eq!(AggregationMethod::Last.aggregate(&known, 3), Some(3.0));
    }

    #[test]
    fn extrema() {
        let known = pts(&[(60, -5.0), (120, 2.0)]);
        assert_eq!(AggregationMethod::Max.aggregate(&known, 2), Some(2.0));
        assert_eq!(AggregationMethod::Min.aggregate(&known, 2), Some(-5.0));
        assert_eq!(AggregationMethod::Sum.aggregate(&known, 2), Some(-3.0));
    }

    #[test]
    fn absmax_keeps_sign_and_first_seen_ties() {
        let known = pts(&[(60, -5.0), (120, 2.0), (180, 5.0)]);
        // |-5| == |5|: the first-seen -5.0 wins.
        assert_eq!(AggregationMethod::AbsMax.aggregate(&known, 3), Some(-5.0));
        let known = pts(&[(60, 3.0), (120, -2.0), (180, 2.0)]);
        assert_eq!(AggregationMethod::AbsMin.aggregate(&known, 3), Some(-2.0));
    }

    #[test]
    fn empty_known_aborts() {
        assert_eq!(AggregationMethod::Average.aggregate(&[], 5), None);
        assert_eq!(AggregationMethod::AvgZero.aggregate(&[], 5), None);
    }
}
