//! Frame Aligner: triangle-similarity hashing between two star
//! lists followed by RANSAC affine fitting.

use rand::Rng;

use crate::error::{Error, Result};
use crate::model::triangle::{canonical_descriptor, TriangleDescriptor};
use crate::model::{Affine, Star};

/// Parameters for [`align`], defaults reproducing the reference
/// implementation's tuning.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AlignerConfig {
    /// Both inputs are capped at this many brightest stars.
    pub max_stars: usize,
    /// Nearest neighbours considered per star when forming triangles.
    pub neighbours: usize,
    /// Tolerance on both side-length ratios for two triangles to match.
    pub ratio_tolerance: f64,
    pub max_correspondences: usize,
    pub ransac_iterations: usize,
    pub inlier_threshold_px: f64,
}

impl Default for AlignerConfig {
    fn default() -> Self {
        Self {
            max_stars: 50,
            neighbours: 5,
            ratio_tolerance: 0.01,
            max_correspondences: 10_000,
            ransac_iterations: 500,
            inlier_threshold_px: 3.0,
        }
    }
}

/// Result of a successful alignment: the best affine plus the fit quality
/// used to report `(inlier_count, rms_px)` at the public API surface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlignResult {
    /// Maps a new-frame pixel position to its corresponding reference-frame
    /// position: `ref_pos ≈ affine.apply(new_pos)`.
    pub affine: Affine,
    pub inliers: usize,
    pub rms_px: f64,
}

/// Align `new_stars` onto `ref_stars`: find the best 6-parameter
/// affine mapping new-frame pixel positions onto reference-frame positions.
pub fn align(ref_stars: &[Star], new_stars: &[Star], config: &AlignerConfig, rng: &mut impl Rng) -> Result<AlignResult> {
    let refs = top_n(ref_stars, config.max_stars);
    let news = top_n(new_stars, config.max_stars);

    if refs.len() < 3 || news.len() < 3 {
        return Err(Error::AlignFailed("fewer than 3 stars on one side".into()));
    }

    let ref_tris = build_triangles(&refs, config.neighbours);
    let new_tris = build_triangles(&news, config.neighbours);

    let correspondences = match_triangles(
        &news,
        &new_tris,
        &refs,
        &ref_tris,
        config.ratio_tolerance,
        config.max_correspondences,
    );
    if correspondences.len() < 3 {
        return Err(Error::AlignFailed(format!(
            "only {} correspondences, need at least 3",
            correspondences.len()
        )));
    }

    ransac(&correspondences, config, rng)
}

/// Keep the `n` brightest stars by flux.
fn top_n(stars: &[Star], n: usize) -> Vec<Star> {
    let mut v: Vec<Star> = stars.to_vec();
    v.sort_by(|a, b| b.flux.partial_cmp(&a.flux).unwrap_or(std::cmp::Ordering::Equal));
    v.truncate(n);
    v
}

/// For every star, form a triangle with every pair drawn from its
/// `neighbours` nearest other stars.
fn build_triangles(stars: &[Star], neighbours: usize) -> Vec<TriangleDescriptor> {
    let n = stars.len();
    let mut out = Vec::new();

    for i in 0..n {
        let mut dists: Vec<(usize, f64)> = (0..n)
            .filter(|&j| j != i)
            .map(|j| (j, stars[i].dist(&stars[j])))
            .collect();
        dists.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap());
        let nn: Vec<usize> = dists.into_iter().take(neighbours).map(|(j, _)| j).collect();

        for x in 0..nn.len() {
            for y in (x + 1)..nn.len() {
                let (a, b) = (nn[x], nn[y]);
                let positions = [stars[i].pos(), stars[a].pos(), stars[b].pos()];
                if let Some(desc) = canonical_descriptor(positions, [i, a, b]) {
                    out.push(desc);
                }
            }
        }
    }

    out
}

/// Correspondence pair: a new-frame pixel position and the matching
/// reference-frame pixel position, for one vertex of one matched triangle.
#[derive(Debug, Clone, Copy)]
struct Correspondence {
    new: (f64, f64),
    ref_: (f64, f64),
}

/// Match triangles between the two sides by ratio similarity, emitting
/// three correspondences (one per canonical vertex) per matched pair,
/// capped at `max_correspondences`. `star_indices` on each
/// descriptor index back into `news`/`refs` respectively.
fn match_triangles(
    news: &[Star],
    new_tris: &[TriangleDescriptor],
    refs: &[Star],
    ref_tris: &[TriangleDescriptor],
    tol: f64,
    max_correspondences: usize,
) -> Vec<Correspondence> {
    let mut out = Vec::new();

    'outer: for nt in new_tris {
        for rt in ref_tris {
            if (nt.ratios.0 - rt.ratios.0).abs() <= tol && (nt.ratios.1 - rt.ratios.1).abs() <= tol {
                for k in 0..3 {
                    out.push(Correspondence {
                        new: news[nt.star_indices[k]].pos(),
                        ref_: refs[rt.star_indices[k]].pos(),
                    });
                }
                if out.len() >= max_correspondences {
                    break 'outer;
                }
            }
        }
    }

    out.truncate(max_correspondences);
    out
}

fn ransac(
    correspondences: &[Correspondence],
    config: &AlignerConfig,
    rng: &mut impl Rng,
) -> Result<AlignResult> {
    let n = correspondences.len();
    let mut best: Option<AlignResult> = None;

    for _ in 0..config.ransac_iterations {
        let mut idx = [0usize; 3];
        idx[0] = rng.gen_range(0..n);
        idx[1] = rng.gen_range(0..n);
        idx[2] = rng.gen_range(0..n);
        if idx[0] == idx[1] || idx[1] == idx[2] || idx[0] == idx[2] {
            continue;
        }

        let src = [
            correspondences[idx[0]].new,
            correspondences[idx[1]].new,
            correspondences[idx[2]].new,
        ];
        let dst = [
            correspondences[idx[0]].ref_,
            correspondences[idx[1]].ref_,
            correspondences[idx[2]].ref_,
        ];

        let Ok(affine) = Affine::solve_exact(src, dst) else { continue };

        let mut inliers = 0usize;
        let mut sse = 0.0f64;
        for c in correspondences {
            let (px, py) = affine.apply(c.new.0, c.new.1);
            let dx = px - c.ref_.0;
            let dy = py - c.ref_.1;
            let err = (dx * dx + dy * dy).sqrt();
            if err < config.inlier_threshold_px {
                inliers += 1;
                sse += dx * dx + dy * dy;
            }
        }

        if inliers == 0 {
            continue;
        }
        let rms = (sse / inliers as f64).sqrt();

        let better = match &best {
            None => true,
            Some(b) => inliers > b.inliers || (inliers == b.inliers && rms < b.rms_px),
        };
        if better {
            best = Some(AlignResult { affine, inliers, rms_px: rms });
        }
    }

    best.ok_or_else(|| Error::AlignFailed("no RANSAC sample produced an inlying affine".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn rng() -> rand::rngs::StdRng {
        rand::rngs::StdRng::seed_from_u64(42)
    }

    fn square_and_centre(cx: f64, cy: f64, half: f64) -> Vec<Star> {
        vec![
            Star::new(cx - half, cy - half, 100.0, 0.0),
            Star::new(cx + half, cy - half, 90.0, 0.0),
            Star::new(cx - half, cy + half, 80.0, 0.0),
            Star::new(cx + half, cy + half, 70.0, 0.0),
            Star::new(cx, cy, 60.0, 0.0),
        ]
    }

    #[test]
    fn recovers_known_similarity() {
        let refs = square_and_centre(50.0, 50.0, 40.0);

        // `truth` describes how the new frame was produced from the
        // reference (ref -> new); the aligner must recover its inverse
        // (new -> ref).
        let theta: f64 = 30f64.to_radians();
        let (s, c) = theta.sin_cos();
        let truth = Affine { a: c, b: -s, c: s, d: c, tx: 5.0, ty: -3.0 };
        let news: Vec<Star> = refs
            .iter()
            .map(|r| {
                let (x, y) = truth.apply(r.x, r.y);
                Star::new(x, y, r.flux, r.background)
            })
            .collect();

        let config = AlignerConfig::default();
        let mut rng = rng();
        let result = align(&refs, &news, &config, &mut rng).unwrap();

        let expected = truth.invert();
        for n in &news {
            let (px, py) = result.affine.apply(n.x, n.y);
            let (ex, ey) = expected.apply(n.x, n.y);
            assert!((px - ex).abs() < 1e-3, "x mismatch: {} vs {}", px, ex);
            assert!((py - ey).abs() < 1e-3, "y mismatch: {} vs {}", py, ey);
        }
        assert!(result.rms_px < 0.5);
    }

    #[test]
    fn fails_with_too_few_stars() {
        let refs = vec![Star::new(0.0, 0.0, 1.0, 0.0), Star::new(1.0, 1.0, 1.0, 0.0)];
        let news = refs.clone();
        let config = AlignerConfig::default();
        let mut rng = rng();
        assert!(matches!(align(&refs, &news, &config, &mut rng), Err(Error::AlignFailed(_))));
    }

    #[test]
    fn fails_on_unrelated_random_positions() {
        let mut seed = 99u64;
        let mut rnd = || {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
            ((seed >> 33) as f64) / (u32::MAX as f64)
        };
        let refs: Vec<Star> = (0..20).map(|i| Star::new(rnd() * 500.0, rnd() * 500.0, 100.0 - i as f64, 0.0)).collect();
        let news: Vec<Star> = (0..20).map(|i| Star::new(rnd() * 500.0, rnd() * 500.0, 100.0 - i as f64, 0.0)).collect();

        let config = AlignerConfig::default();
        let mut rng = rng();
        // Not guaranteed to fail for every seed/config, but with unrelated
        // random fields a match is exceedingly unlikely; this guards
        // against a degenerate "always succeeds" implementation.
        let result = align(&refs, &news, &config, &mut rng);
        if let Ok(r) = result {
            assert!(r.inliers < 5);
        }
    }
}
