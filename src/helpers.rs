/// Overwrites the contents of a slice to zeros
pub fn zero(slice: &mut [f32]) {
    slice.iter_mut().for_each(|f| *f = 0.);
}

/// Index of the largest element. Ties go to the lowest index and NaNs are
/// never selected over a number.
pub fn arg_max(values: &[f32]) -> usize {
    let mut best = 0;
    for (i, v) in values.iter().enumerate().skip(1) {
        if *v > values[best] || (values[best].is_nan() && !v.is_nan()) {
            best = i;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn arg_max_basic() {
        assert_eq!(arg_max(&[0.1, 0.7, 0.2]), 1);
        assert_eq!(arg_max(&[3.]), 0);
        assert_eq!(arg_max(&[f32::NAN, -1.]), 1);
    }

    proptest! {
        #[test]
        fn arg_max_prefers_lowest_index(
            values in prop::collection::vec(-10f32..10., 2..32),
            a in 0usize..32,
            b in 0usize..32,
        ) {
            let mut values = values;
            let (a, b) = (a % values.len(), b % values.len());
            let max = values.iter().cloned().fold(f32::MIN, f32::max) + 1.;
            values[a] = max;
            values[b] = max;
            prop_assert_eq!(arg_max(&values), a.min(b));
        }
    }
}
