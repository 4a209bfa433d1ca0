//! Comparison of worker result words against expected descriptors.
//!
//! Matching is strictly positional. Each descriptor consumes as many words as
//! its width (one for scalars and references, two for vectors) and the total
//! consumed must equal the number of words the worker produced.

use crate::protocol::Response;
use crate::value::{unpack_lanes, Expected, LaneExpect};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Mismatch {
    #[error("result count mismatch: expected {expected} words, got {found}")]
    Length { expected: usize, found: usize },
    #[error("result {index}: expected {expected}, got {actual}")]
    Value {
        index: usize,
        expected: String,
        actual: String,
    },
    #[error("result {index}: either mixes scalar and vector alternatives")]
    MixedEitherWidths { index: usize },
}

/// Number of wire words a descriptor consumes, or `None` for an `either`
/// whose alternatives disagree on width.
pub fn descriptor_width(expected: &Expected) -> Option<usize> {
    match expected {
        Expected::Vector(..) | Expected::VectorNanWildcard { .. } => Some(2),
        Expected::Either(alternatives) => {
            let mut widths = alternatives.iter().map(descriptor_width);
            let first = widths.next().unwrap_or(Some(1))?;
            for w in widths {
                if w? != first {
                    return None;
                }
            }
            Some(first)
        }
        _ => Some(1),
    }
}

/// Check `words` against `expected`, returning the first mismatch.
pub fn match_results(words: &[u64], expected: &[Expected]) -> Result<(), Mismatch> {
    let mut widths = Vec::with_capacity(expected.len());
    for (index, desc) in expected.iter().enumerate() {
        widths.push(descriptor_width(desc).ok_or(Mismatch::MixedEitherWidths { index })?);
    }
    let total: usize = widths.iter().sum();
    if total != words.len() {
        return Err(Mismatch::Length {
            expected: total,
            found: words.len(),
        });
    }

    let mut pos = 0;
    for (index, (desc, width)) in expected.iter().zip(widths).enumerate() {
        let slice = &words[pos..pos + width];
        if !matches(slice, desc) {
            return Err(Mismatch::Value {
                index,
                expected: desc.to_string(),
                actual: render(slice),
            });
        }
        pos += width;
    }
    Ok(())
}

fn matches(slice: &[u64], expected: &Expected) -> bool {
    match (expected, slice) {
        (Expected::Scalar(w), [actual]) => actual == w,
        (Expected::Vector(lo, hi), [a, b]) => a == lo && b == hi,
        (Expected::NanWildcard(width), [actual]) => width.is_nan(*actual),
        (Expected::VectorNanWildcard { lane_type, lanes }, [lo, hi]) => {
            let Some(width) = lane_type.float_width() else {
                return false;
            };
            let actual = unpack_lanes(*lane_type, *lo, *hi);
            actual.len() == lanes.len()
                && actual.iter().zip(lanes).all(|(bits, lane)| match lane {
                    LaneExpect::Bits(b) => bits == b,
                    LaneExpect::Nan => width.is_nan(*bits),
                })
        }
        (Expected::RefWildcard, [actual]) => *actual != 0,
        (Expected::Either(alternatives), _) => alternatives.iter().any(|alt| matches(slice, alt)),
        _ => false,
    }
}

fn render(slice: &[u64]) -> String {
    match slice {
        [w] => w.to_string(),
        [lo, hi] => format!("v128:{lo}:{hi}"),
        _ => format!("{slice:?}"),
    }
}

/// What a command expects from a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expectation {
    /// Plain action: any outcome is accepted and nothing is counted.
    None,
    Return(Vec<Expected>),
    /// A trap or exhaustion; the message is kept for reporting only.
    Trap(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Fail(String),
    Unchecked,
}

/// Judge a worker response against an expectation.
pub fn judge(response: &Response, expectation: &Expectation) -> Verdict {
    match (expectation, response) {
        (Expectation::None, _) => Verdict::Unchecked,
        (Expectation::Return(expected), Response::Ok(words)) => match match_results(words, expected) {
            Ok(()) => Verdict::Pass,
            Err(m) => Verdict::Fail(m.to_string()),
        },
        (Expectation::Return(_), Response::Error(msg)) => Verdict::Fail(format!("unexpected trap: {msg}")),
        (Expectation::Trap(_), Response::Error(_)) => Verdict::Pass,
        (Expectation::Trap(text), Response::Ok(words)) => {
            Verdict::Fail(format!("expected trap \"{text}\", got {}", render_all(words)))
        }
    }
}

fn render_all(words: &[u64]) -> String {
    if words.is_empty() {
        return "no results".to_string();
    }
    let rendered: Vec<String> = words.iter().map(u64::to_string).collect();
    format!("ok {}", rendered.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{pack_lanes, FloatWidth, LaneType};

    #[test]
    fn scalars_and_length() {
        assert!(match_results(&[5], &[Expected::Scalar(5)]).is_ok());
        assert_eq!(
            match_results(&[5, 6], &[Expected::Scalar(5)]),
            Err(Mismatch::Length { expected: 1, found: 2 })
        );
        assert!(matches!(
            match_results(&[4], &[Expected::Scalar(5)]),
            Err(Mismatch::Value { index: 0, .. })
        ));
        assert!(match_results(&[], &[]).is_ok());
    }

    #[test]
    fn nan_wildcard_matches_only_nans_of_its_width() {
        let f32_nan = [Expected::NanWildcard(FloatWidth::F32)];
        assert!(match_results(&[0x7FC0_0000], &f32_nan).is_ok());
        assert!(match_results(&[0xFFC0_0001], &f32_nan).is_ok());
        assert!(match_results(&[0x7F80_0001], &f32_nan).is_ok());
        // infinity, zero, and an f64 nan do not qualify
        assert!(match_results(&[0x7F80_0000], &f32_nan).is_err());
        assert!(match_results(&[0], &f32_nan).is_err());
        assert!(match_results(&[0x7FF8_0000_0000_0000], &f32_nan).is_err());

        let f64_nan = [Expected::NanWildcard(FloatWidth::F64)];
        assert!(match_results(&[0x7FF8_0000_0000_0000], &f64_nan).is_ok());
        assert!(match_results(&[0x7FF0_0000_0000_0000], &f64_nan).is_err());
    }

    #[test]
    fn vector_nan_wildcard_checks_each_lane() {
        let expected = [Expected::VectorNanWildcard {
            lane_type: LaneType::F32,
            lanes: vec![LaneExpect::Nan, LaneExpect::Bits(0x3F80_0000), LaneExpect::Nan, LaneExpect::Bits(0)],
        }];
        let (lo, hi) = pack_lanes(LaneType::F32, &[0x7FC0_0000, 0x3F80_0000, 0xFFC0_0000, 0]).unwrap();
        assert!(match_results(&[lo, hi], &expected).is_ok());
        let (lo, hi) = pack_lanes(LaneType::F32, &[0x7FC0_0000, 0x3F80_0000, 0, 0]).unwrap();
        assert!(match_results(&[lo, hi], &expected).is_err());
    }

    #[test]
    fn ref_wildcard_rejects_null() {
        assert!(match_results(&[3], &[Expected::RefWildcard]).is_ok());
        assert!(match_results(&[0], &[Expected::RefWildcard]).is_err());
    }

    #[test]
    fn either_uses_alternative_width() {
        let scalar_either = Expected::Either(vec![Expected::Scalar(1), Expected::Scalar(2)]);
        assert!(match_results(&[2, 7], &[scalar_either.clone(), Expected::Scalar(7)]).is_ok());
        assert!(match_results(&[3, 7], &[scalar_either, Expected::Scalar(7)]).is_err());

        let vector_either = Expected::Either(vec![Expected::Vector(1, 2), Expected::Vector(3, 4)]);
        assert!(match_results(&[3, 4], &[vector_either.clone()]).is_ok());
        assert_eq!(
            match_results(&[3], &[vector_either]),
            Err(Mismatch::Length { expected: 2, found: 1 })
        );
    }

    #[test]
    fn either_with_mixed_widths_is_rejected() {
        let mixed = Expected::Either(vec![Expected::Scalar(1), Expected::Vector(1, 0)]);
        assert_eq!(descriptor_width(&mixed), None);
        assert_eq!(
            match_results(&[1], &[Expected::Scalar(0), mixed]),
            Err(Mismatch::MixedEitherWidths { index: 1 })
        );
    }

    #[test]
    fn judge_outcomes() {
        let ret = Expectation::Return(vec![Expected::Scalar(5)]);
        assert_eq!(judge(&Response::Ok(vec![5]), &ret), Verdict::Pass);
        assert!(matches!(judge(&Response::Error("unreachable".into()), &ret), Verdict::Fail(_)));

        let trap = Expectation::Trap("out of bounds memory access".into());
        assert_eq!(judge(&Response::Error("oob".into()), &trap), Verdict::Pass);
        assert_eq!(
            judge(&Response::Ok(vec![]), &trap),
            Verdict::Fail("expected trap \"out of bounds memory access\", got no results".into())
        );
        assert_eq!(judge(&Response::Ok(vec![1]), &Expectation::None), Verdict::Unchecked);
    }
}
