use crate::model::Star;

/// Target number of bins for the uniformisation grid.
const UNIFORMISATION_BINS: usize = 10;

/// Produce the canonical ordering for a raw detected star list:
/// flux/raw-signal interleaving followed by spatial uniformisation. Returns
/// a permutation of `stars` with each input star appearing exactly once.
pub fn order_stars(stars: &[Star]) -> Vec<Star> {
    if stars.is_empty() {
        return Vec::new();
    }

    let interleaved = interleave_by_brightness(stars);
    uniformise(&interleaved)
}

/// Interleave the flux-sorted and raw-signal-sorted
/// permutations, each index emitted at most once.
fn interleave_by_brightness(stars: &[Star]) -> Vec<Star> {
    let n = stars.len();

    let mut by_flux: Vec<usize> = (0..n).collect();
    by_flux.sort_by(|&a, &b| {
        stars[b].flux.partial_cmp(&stars[a].flux).unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut by_raw: Vec<usize> = (0..n).collect();
    by_raw.sort_by(|&a, &b| {
        stars[b]
            .raw_signal()
            .partial_cmp(&stars[a].raw_signal())
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut emitted = vec![false; n];
    let mut out = Vec::with_capacity(n);

    for i in 0..n {
        let p1 = by_flux[i];
        if !emitted[p1] {
            emitted[p1] = true;
            out.push(stars[p1]);
        }
        let p2 = by_raw[i];
        if !emitted[p2] {
            emitted[p2] = true;
            out.push(stars[p2]);
        }
    }

    out
}

/// Reorder an already brightness-interleaved list so that any
/// prefix is spatially well-distributed, via a round-robin pick over a
/// `Nx x Ny` bin grid sized to target ~[`UNIFORMISATION_BINS`] total bins.
fn uniformise(ordered: &[Star]) -> Vec<Star> {
    let n = ordered.len();
    if n == 0 {
        return Vec::new();
    }

    let (min_x, max_x, min_y, max_y) = ordered.iter().fold(
        (f64::MAX, f64::MIN, f64::MAX, f64::MIN),
        |(mnx, mxx, mny, mxy), s| (mnx.min(s.x), mxx.max(s.x), mny.min(s.y), mxy.max(s.y)),
    );
    let bbox_w = (max_x - min_x).max(1e-9);
    let bbox_h = (max_y - min_y).max(1e-9);

    let target = UNIFORMISATION_BINS as f64;
    let nx = ((bbox_w * (target / (bbox_w * bbox_h)).sqrt()).round() as i64).max(1) as usize;
    let ny = ((target / nx as f64).round() as i64).max(1) as usize;

    let mut bins: Vec<Vec<usize>> = vec![Vec::new(); nx * ny];
    for (idx, s) in ordered.iter().enumerate() {
        let bx = (((s.x - min_x) / bbox_w) * nx as f64).floor() as i64;
        let by = (((s.y - min_y) / bbox_h) * ny as f64).floor() as i64;
        let bx = bx.clamp(0, nx as i64 - 1) as usize;
        let by = by.clamp(0, ny as i64 - 1) as usize;
        bins[by * nx + bx].push(idx);
    }

    let max_round = bins.iter().map(|b| b.len()).max().unwrap_or(0);
    let mut out = Vec::with_capacity(n);
    for round in 0..max_round {
        for bin in &bins {
            if let Some(&idx) = bin.get(round) {
                out.push(ordered[idx]);
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn star(x: f64, y: f64, flux: f64) -> Star {
        Star::new(x, y, flux, 0.0)
    }

    #[test]
    fn every_star_appears_exactly_once() {
        let stars: Vec<Star> = (0..37)
            .map(|i| star((i * 7 % 100) as f64, (i * 13 % 100) as f64, (100 - i) as f64))
            .collect();
        let ordered = order_stars(&stars);
        assert_eq!(ordered.len(), stars.len());

        let xs: HashSet<(u64, u64)> = stars.iter().map(|s| (s.x.to_bits(), s.y.to_bits())).collect();
        let ys: HashSet<(u64, u64)> = ordered.iter().map(|s| (s.x.to_bits(), s.y.to_bits())).collect();
        assert_eq!(xs, ys);
    }

    #[test]
    fn flux_interleaving_prefix_matches_union_of_top_k() {
        let stars: Vec<Star> = (0..20)
            .map(|i| {
                let flux = (20 - i) as f64;
                let raw_signal_bonus = if i % 2 == 0 { 50.0 } else { 0.0 };
                star(i as f64, 0.0, flux + 0.0).with_bg(raw_signal_bonus)
            })
            .collect();

        let interleaved = interleave_by_brightness(&stars);

        let k = 5;
        let mut by_flux: Vec<usize> = (0..stars.len()).collect();
        by_flux.sort_by(|&a, &b| stars[b].flux.partial_cmp(&stars[a].flux).unwrap());
        let top_flux: HashSet<usize> = by_flux[..k].iter().copied().collect();

        let mut by_raw: Vec<usize> = (0..stars.len()).collect();
        by_raw.sort_by(|&a, &b| stars[b].raw_signal().partial_cmp(&stars[a].raw_signal()).unwrap());
        let top_raw: HashSet<usize> = by_raw[..k].iter().copied().collect();

        let expected: HashSet<(u64, u64)> = top_flux
            .union(&top_raw)
            .map(|&i| (stars[i].x.to_bits(), stars[i].y.to_bits()))
            .collect();

        let got: HashSet<(u64, u64)> = interleaved[..2 * k]
            .iter()
            .map(|s| (s.x.to_bits(), s.y.to_bits()))
            .collect();

        assert_eq!(expected, got);
    }

    #[test]
    fn uniformisation_spreads_a_random_field() {
        let mut seed = 12345u64;
        let mut rand = || {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
            ((seed >> 33) as f64) / (u32::MAX as f64)
        };

        let stars: Vec<Star> = (0..100)
            .map(|i| star(rand() * 1024.0, rand() * 1024.0, (100 - i) as f64))
            .collect();

        let ordered = order_stars(&stars);
        assert_eq!(ordered.len(), 100);

        // Reproduce the algorithm's own bin grid (not a hand-picked 10x10
        // grid — a square bbox yields Nx*Ny close to, but not necessarily
        // exactly, UNIFORMISATION_BINS) and check property 2: no bin in any
        // prefix k>=bins holds more than ceil(k/bins) stars.
        let (min_x, max_x, min_y, max_y) = ordered.iter().fold(
            (f64::MAX, f64::MIN, f64::MAX, f64::MIN),
            |(a, b, c, d), s| (a.min(s.x), b.max(s.x), c.min(s.y), d.max(s.y)),
        );
        let bw = (max_x - min_x).max(1e-9);
        let bh = (max_y - min_y).max(1e-9);
        let target = UNIFORMISATION_BINS as f64;
        let nx = ((bw * (target / (bw * bh)).sqrt()).round() as i64).max(1) as usize;
        let ny = ((target / nx as f64).round() as i64).max(1) as usize;
        let bins = nx * ny;

        let bin_of = |s: &Star| -> usize {
            let bx = (((s.x - min_x) / bw) * nx as f64).floor().clamp(0.0, nx as f64 - 1.0) as usize;
            let by = (((s.y - min_y) / bh) * ny as f64).floor().clamp(0.0, ny as f64 - 1.0) as usize;
            by * nx + bx
        };

        let k = bins.max(10);
        let mut counts = vec![0usize; bins];
        for s in ordered.iter().take(k) {
            counts[bin_of(s)] += 1;
        }
        let limit = (k + bins - 1) / bins;
        assert!(counts.iter().all(|&c| c <= limit), "bin occupancy exceeded ceil(k/bins)");

        let distinct: HashSet<usize> = ordered.iter().take(bins.min(10)).map(bin_of).collect();
        assert_eq!(distinct.len(), bins.min(10), "first bins-many stars should occupy distinct bins");
    }

    trait WithBg {
        fn with_bg(self, bg: f64) -> Star;
    }
    impl WithBg for Star {
        fn with_bg(self, bg: f64) -> Star {
            Star::new(self.x, self.y, self.flux, bg)
        }
    }
}
