//! Min-max scaling of detector scores.

/// Scale `values` into [0, 1] with min-max normalization.
///
/// If any input is NaN, the minimum or maximum is not finite, or they are
/// equal, every output is 0.0. Finite inputs whose range overflows `f64` are
/// scaled at half magnitude, so every output stays in [0, 1].
pub fn min_max(values: &[f64]) -> Vec<f64> {
    let (mut lo, mut hi) = (f64::INFINITY, f64::NEG_INFINITY);
    for &v in values {
        if v.is_nan() {
            return vec![0.0; values.len()];
        }
        lo = lo.min(v);
        hi = hi.max(v);
    }

    if !lo.is_finite() || !hi.is_finite() || hi <= lo {
        return vec![0.0; values.len()];
    }

    // hi - lo can overflow for finite extremes; halving keeps it finite.
    let scale = if (hi - lo).is_finite() { 1.0 } else { 0.5 };
    let span = hi * scale - lo * scale;
    values
        .iter()
        .map(|v| {
            let x = (v * scale - lo * scale) / span;
            if x.is_finite() {
                x.clamp(0.0, 1.0)
            } else {
                0.0
            }
        })
        .collect()
}

/// Orient a normalized score so that larger always means more anomalous.
pub fn orient(normalized: f64, flip: bool) -> f64 {
    if flip {
        1.0 - normalized
    } else {
        normalized
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_min_max_basic() {
        assert_eq!(min_max(&[10.0, 50.0, 30.0]), vec![0.0, 1.0, 0.5]);
    }

    #[test]
    fn test_constant_input_is_zero() {
        assert_eq!(min_max(&[3.0, 3.0, 3.0]), vec![0.0; 3]);
    }

    #[test]
    fn test_non_finite_is_zero() {
        assert_eq!(min_max(&[1.0, f64::NAN, 2.0]), vec![0.0; 3]);
        assert_eq!(min_max(&[1.0, f64::INFINITY]), vec![0.0; 2]);
    }

    #[test]
    fn test_overflowing_range_stays_in_unit_interval() {
        assert_eq!(min_max(&[-1e308, 0.0, 1e308]), vec![0.0, 0.5, 1.0]);
        assert_eq!(min_max(&[f64::MIN, f64::MAX]), vec![0.0, 1.0]);
    }

    #[test]
    fn test_empty() {
        assert!(min_max(&[]).is_empty());
    }

    #[test]
    fn test_orient() {
        assert_eq!(orient(0.25, true), 0.75);
        assert_eq!(orient(0.25, false), 0.25);
    }

    proptest! {
        #[test]
        fn prop_extremes_map_to_unit_interval(values in prop::collection::vec(prop_oneof![-1e6f64..1e6, prop::num::f64::NORMAL], 2..64)) {
            let out = min_max(&values);
            prop_assert_eq!(out.len(), values.len());
            prop_assert!(out.iter().all(|v| (0.0..=1.0).contains(v)));

            let lo = values.iter().cloned().fold(f64::INFINITY, f64::min);
            let hi = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            if hi > lo {
                let i_lo = values.iter().position(|v| *v == lo).unwrap();
                let i_hi = values.iter().position(|v| *v == hi).unwrap();
                prop_assert_eq!(out[i_lo], 0.0);
                prop_assert_eq!(out[i_hi], 1.0);
            } else {
                prop_assert!(out.iter().all(|v| *v == 0.0));
            }
        }

        #[test]
        fn prop_constant_vector_is_zero(v in -1e6f64..1e6, n in 0usize..32) {
            prop_assert!(min_max(&vec![v; n]).iter().all(|x| *x == 0.0));
        }
    }
}
