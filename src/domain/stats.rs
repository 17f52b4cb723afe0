const MAD_TO_SIGMA: f64 = 1.4826;

/// Iterative sigma-clipped median/sigma (MAD-based), used by the Star
/// Detector for robust background noise estimation. Mutates
/// `values` in place, discarding points outside `kappa` sigma of the
/// running median on each pass.
pub fn sigma_clipped_stats(values: &mut Vec<f32>, kappa: f32, iterations: usize) -> (f64, f64) {
    for _ in 0..iterations {
        if values.len() < 3 {
            break;
        }

        let median = exact_median_mut(values);

        let mut devs: Vec<f32> = values.iter().map(|&v| (v as f64 - median).abs() as f32).collect();
        let dev_mid = devs.len() / 2;
        devs.select_nth_unstable_by(dev_mid, |a, b| a.partial_cmp(b).unwrap());
        let mad = devs[dev_mid] as f64;
        let sig = (mad * MAD_TO_SIGMA).max(1e-30);

        let lo = (median - kappa as f64 * sig) as f32;
        let hi = (median + kappa as f64 * sig) as f32;
        values.retain(|&v| v >= lo && v <= hi);
    }

    if values.is_empty() {
        return (0.0, 1.0);
    }

    let median = exact_median_mut(values);
    let mut devs: Vec<f32> = values.iter().map(|&v| (v as f64 - median).abs() as f32).collect();
    let dev_mid = devs.len() / 2;
    devs.select_nth_unstable_by(dev_mid, |a, b| a.partial_cmp(b).unwrap());
    let sigma = (devs[dev_mid] as f64 * MAD_TO_SIGMA).max(1e-30);

    (median, sigma)
}

fn exact_median_mut(data: &mut [f32]) -> f64 {
    let n = data.len();
    if n == 0 {
        return 0.0;
    }
    let mid = n / 2;
    data.select_nth_unstable_by(mid, |a, b| {
        a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal)
    });
    if n % 2 == 0 {
        let right = data[mid] as f64;
        let left = data[..mid].iter().copied().fold(f32::MIN, f32::max) as f64;
        (left + right) / 2.0
    } else {
        data[mid] as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn median_odd() {
        let mut vals = vec![5.0f32, 1.0, 3.0, 2.0, 4.0];
        let m = exact_median_mut(&mut vals);
        assert!((m - 3.0).abs() < 1e-6);
    }

    #[test]
    fn median_even() {
        let mut vals = vec![1.0f32, 2.0, 3.0, 4.0];
        let m = exact_median_mut(&mut vals);
        assert!((m - 2.5).abs() < 1e-6);
    }

    #[test]
    fn sigma_clipped_rejects_outlier() {
        let mut vals: Vec<f32> = (1..=100).map(|i| i as f32).collect();
        vals.push(100_000.0);
        let (med, sig) = sigma_clipped_stats(&mut vals, 3.0, 3);
        assert!(med > 40.0 && med < 60.0);
        assert!(sig < 500.0);
    }

    #[test]
    fn empty_input_returns_default() {
        let mut vals: Vec<f32> = Vec::new();
        let (med, sig) = sigma_clipped_stats(&mut vals, 3.0, 3);
        assert_eq!(med, 0.0);
        assert_eq!(sig, 1.0);
    }
}
