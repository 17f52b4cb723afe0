//! Plate solver: quad formation, index lookup, Bayesian
//! verification, log-odds tuning, and depth iteration over the ordered
//! star list.

use crate::domain::index::{IndexedQuad, SkyIndex};
use crate::error::{Error, Result};
use crate::model::wcs::{deproject_tan, project_tan};
use crate::model::{Quad, Star, WcsSolution};

/// Handedness of the pixel-to-sky mapping to try.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Parity {
    Positive,
    Negative,
    Both,
}

/// Parameters for [`solve`], defaults reproducing the reference
/// implementation's tuning.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SolverConfig {
    /// Field-diagonal fraction range a quad's diameter must fall within.
    pub quad_size_fraction: (f64, f64),
    /// Code-space match radius (Euclidean, in the unit-square code frame).
    pub codetol: f64,
    /// Verification match radius, in field pixels.
    pub verify_pix: f64,
    /// Prior probability a field star is noise rather than catalogue.
    pub distractor_ratio: f64,
    /// If true, every index star is scored regardless of distance from the
    /// originating quad; if false, only index stars projecting near the
    /// quad contribute to the log-odds.
    pub distance_from_quad_bonus: bool,
    /// Polynomial distortion order fit during tuning (0/1 disables it).
    pub tweak_order: usize,
    pub parity: Parity,
    /// Successive star-rank windows considered by depth iteration, e.g.
    /// `[(1, 10), (11, 20), ...]` (1-indexed, inclusive).
    pub depth_schedule: Vec<(usize, usize)>,
    pub logodds_keep: f64,
    pub logodds_tune: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            quad_size_fraction: (0.1, 1.0),
            codetol: 0.01,
            verify_pix: 1.0,
            distractor_ratio: 0.25,
            distance_from_quad_bonus: true,
            tweak_order: 2,
            parity: Parity::Both,
            depth_schedule: (0..20).map(|i| (i * 10 + 1, i * 10 + 10)).collect(),
            logodds_keep: (1_000_000_000.0_f64).ln(),
            logodds_tune: (1_000_000.0_f64).ln(),
        }
    }
}

/// Run the plate solver over an ordered star list.
///
/// `stars` is expected to already be in the Star Orderer's canonical order
/// ([`crate::domain::order::order_stars`]) — depth iteration relies on
/// "earlier positions are brighter and better distributed" to make its
/// growing active pool meaningful. `scale_low`/`scale_high` are the
/// acceptable pixel scale range in arcseconds per pixel.
pub fn solve(
    stars: &[Star],
    width: usize,
    height: usize,
    indices: &[&dyn SkyIndex],
    scale_low: f64,
    scale_high: f64,
    config: &SolverConfig,
) -> Result<WcsSolution> {
    if width == 0 || height == 0 {
        return Err(Error::InvalidInput("image dimensions must be positive".into()));
    }
    if scale_low <= 0.0 || scale_high < scale_low {
        return Err(Error::InvalidInput(format!(
            "invalid scale range [{}, {}]",
            scale_low, scale_high
        )));
    }
    if stars.len() < 4 {
        return Err(Error::SolveFailed);
    }

    let diag = ((width * width + height * height) as f64).sqrt();
    let min_diam_px = config.quad_size_fraction.0 * diag;
    let max_diam_px = config.quad_size_fraction.1 * diag;

    for &(lo, hi) in &config.depth_schedule {
        let _ = lo; // the active pool always starts at 0 and grows monotonically with each window
        let pool = hi.min(stars.len());
        if pool < 4 {
            continue;
        }
        log::debug!("solve: depth window [{}, {}], active pool {} stars", lo, hi, pool);

        if let Some(wcs) = solve_in_pool(
            &stars[..pool],
            width,
            height,
            indices,
            scale_low,
            scale_high,
            min_diam_px,
            max_diam_px,
            config,
        ) {
            return Ok(wcs);
        }
    }

    Err(Error::SolveFailed)
}

#[allow(clippy::too_many_arguments)]
fn solve_in_pool(
    pool: &[Star],
    width: usize,
    height: usize,
    indices: &[&dyn SkyIndex],
    scale_low: f64,
    scale_high: f64,
    min_diam_px: f64,
    max_diam_px: f64,
    config: &SolverConfig,
) -> Option<WcsSolution> {
    let n = pool.len();

    for a in 0..n {
        for b in (a + 1)..n {
            for c in (b + 1)..n {
                for d in (c + 1)..n {
                    let idxs = [a, b, c, d];
                    let positions = [pool[a].pos(), pool[b].pos(), pool[c].pos(), pool[d].pos()];

                    let quads = candidate_quads(positions, idxs, config.parity);
                    for quad in quads {
                        if quad.diameter < min_diam_px || quad.diameter > max_diam_px {
                            continue;
                        }

                        for &index in indices {
                            let (idx_lo, idx_hi) = index.scale_range();
                            if idx_hi < scale_low || idx_lo > scale_high {
                                continue;
                            }

                            let diam_arcsec_lo = quad.diameter * scale_low;
                            let diam_arcsec_hi = quad.diameter * scale_high;

                            let hits = index.codes_within(&quad.code, config.codetol);
                            for hit in hits {
                                if hit.diameter_arcsec < diam_arcsec_lo
                                    || hit.diameter_arcsec > diam_arcsec_hi
                                {
                                    continue;
                                }

                                if let Some(wcs) = try_candidate(
                                    pool, &quad, &hit, index, width, height, config,
                                ) {
                                    return Some(wcs);
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    None
}

/// Build the positive-parity quad and, if requested, the mirrored
/// negative-parity quad for one 4-star combination.
fn candidate_quads(positions: [(f64, f64); 4], idxs: [usize; 4], parity: Parity) -> Vec<Quad> {
    let mut out = Vec::with_capacity(2);
    if parity != Parity::Negative {
        if let Some(q) = quad_code(positions, idxs, false) {
            out.push(q);
        }
    }
    if parity != Parity::Positive {
        if let Some(q) = quad_code(positions, idxs, true) {
            out.push(q);
        }
    }
    out
}

/// Compute the scale/rotation-normalised code for one 4-star combination.
/// Picks the diameter pair (A,B) as the two stars farthest apart, maps
/// A->(0,0), B->(1,1) via a similarity transform, and projects the other
/// two (C,D) into that frame. `mirror` reflects the projection across the
/// AB diagonal to produce the opposite-parity code. Returns `None` if C or
/// D project outside the unit square (an invalid/degenerate quad shape).
fn quad_code(positions: [(f64, f64); 4], idxs: [usize; 4], mirror: bool) -> Option<Quad> {
    // Find the diameter pair among the 6 combinations of the 4 points.
    let mut best = (0usize, 1usize, 0.0f64);
    for i in 0..4 {
        for j in (i + 1)..4 {
            let dx = positions[j].0 - positions[i].0;
            let dy = positions[j].1 - positions[i].1;
            let d2 = dx * dx + dy * dy;
            if d2 > best.2 {
                best = (i, j, d2);
            }
        }
    }
    let (ai, bi, diam2) = best;
    let diameter = diam2.sqrt();
    if diameter < 1e-9 {
        return None;
    }
    let others: Vec<usize> = (0..4).filter(|&k| k != ai && k != bi).collect();
    let (ci, di) = (others[0], others[1]);

    let a = positions[ai];
    let b = positions[bi];
    let dx = b.0 - a.0;
    let dy = b.1 - a.1;
    let theta = std::f64::consts::FRAC_PI_4 - dy.atan2(dx);
    let scale = std::f64::consts::SQRT_2 / diameter;
    let (sin_t, cos_t) = theta.sin_cos();

    let project = |p: (f64, f64)| -> (f64, f64) {
        let lx = p.0 - a.0;
        let ly = p.1 - a.1;
        let rx = lx * cos_t - ly * sin_t;
        let ry = lx * sin_t + ly * cos_t;
        let mut u = rx * scale;
        let mut v = ry * scale;
        if mirror {
            v = 1.0 - v;
        }
        (u, v)
    };

    let (mut cx, mut cy) = project(positions[ci]);
    let (mut dx2, mut dy2) = project(positions[di]);

    if !(0.0..=1.0).contains(&cx)
        || !(0.0..=1.0).contains(&cy)
        || !(0.0..=1.0).contains(&dx2)
        || !(0.0..=1.0).contains(&dy2)
    {
        return None;
    }

    // Canonical ordering: break the C/D symmetry so the same 4 stars always
    // yield the same code regardless of discovery order.
    let (mut star_c, mut star_d) = (idxs[ci], idxs[di]);
    if cx > dx2 {
        std::mem::swap(&mut cx, &mut dx2);
        std::mem::swap(&mut cy, &mut dy2);
        std::mem::swap(&mut star_c, &mut star_d);
    }

    Some(Quad {
        stars: [idxs[ai], idxs[bi], star_c, star_d],
        code: [cx, cy, dx2, dy2],
        diameter,
    })
}

/// Attempt to turn one (field-quad, index-quad) hit into an accepted WCS
/// solution: derive the tangent projection from the four correspondences,
/// verify against the full index catalogue, and tune if the match is
/// strong enough.
fn try_candidate(
    pool: &[Star],
    field_quad: &Quad,
    index_quad: &IndexedQuad,
    index: &dyn SkyIndex,
    width: usize,
    height: usize,
    config: &SolverConfig,
) -> Option<WcsSolution> {
    let field_pos: [(f64, f64); 4] = std::array::from_fn(|i| pool[field_quad.stars[i]].pos());
    let mut radec = [(0.0, 0.0); 4];
    for i in 0..4 {
        radec[i] = index.star_radec(index_quad.star_ids[i])?;
    }

    // crpix/crval anchored on star A; solve the 2x2 CD matrix from B, C
    // (exactly determined; D is left as a verification check).
    let (crpix_x, crpix_y) = field_pos[0];
    let (crval_ra, crval_dec) = radec[0];

    let mut rows = Vec::with_capacity(3);
    for i in 1..4 {
        let dx = field_pos[i].0 - crpix_x;
        let dy = field_pos[i].1 - crpix_y;
        let (xi, eta) = project_tan(crval_ra, crval_dec, radec[i].0, radec[i].1);
        rows.push((dx, dy, xi, eta));
    }

    let cd = solve_cd_2x2(&rows[0], &rows[1])?;

    let wcs = WcsSolution {
        crval_ra,
        crval_dec,
        crpix_x,
        crpix_y,
        cd,
        log_odds: 0.0,
        tweak: None,
    };
    if wcs.determinant().abs() < 1e-20 {
        return None;
    }

    let (log_odds, inliers) = verify(&wcs, pool, field_quad, index, config);
    if log_odds < config.logodds_keep {
        return None;
    }

    let mut wcs = WcsSolution { log_odds, ..wcs };

    if log_odds >= config.logodds_tune && inliers.len() >= 3 {
        if let Some(tuned) = tune(&wcs, pool, &inliers, config) {
            let (tuned_odds, tuned_inliers) = verify(&tuned, pool, field_quad, index, config);
            if tuned_odds >= config.logodds_keep {
                wcs = WcsSolution { log_odds: tuned_odds, ..tuned };
                if config.tweak_order >= 2 {
                    wcs.tweak = fit_tweak(&wcs, pool, &tuned_inliers, config.tweak_order);
                }
            }
        }
    }

    Some(wcs)
}

/// Exact 2x2 solve of the CD matrix from two pixel-offset/tangent-plane
/// correspondences (4 unknowns, 4 equations: `xi = cd11*dx + cd12*dy`,
/// `eta = cd21*dx + cd22*dy`, evaluated at both points).
fn solve_cd_2x2(p: &(f64, f64, f64, f64), q: &(f64, f64, f64, f64)) -> Option<[[f64; 2]; 2]> {
    let det = p.0 * q.1 - p.1 * q.0;
    if det.abs() < 1e-15 {
        return None;
    }
    let inv = 1.0 / det;
    // Solve [dx dy; dx' dy'] [cd11; cd12] = [xi; xi'] and similarly for eta.
    let cd11 = (p.2 * q.1 - p.1 * q.2) * inv;
    let cd12 = (p.0 * q.2 - p.2 * q.0) * inv;
    let cd21 = (p.3 * q.1 - p.1 * q.3) * inv;
    let cd22 = (p.0 * q.3 - p.3 * q.0) * inv;
    Some([[cd11, cd12], [cd21, cd22]])
}

/// One field star matched to one projected index star, used as the basis
/// for the tuning least-squares refit.
struct Inlier {
    field: (f64, f64),
    radec: (f64, f64),
}

/// Project every star in the matched index into field pixel coordinates
/// and accumulate a Bayesian log-odds score against the detected field
/// stars.
fn verify(
    wcs: &WcsSolution,
    pool: &[Star],
    field_quad: &Quad,
    index: &dyn SkyIndex,
    config: &SolverConfig,
) -> (f64, Vec<Inlier>) {
    let quad_centre = {
        let (mut sx, mut sy) = (0.0, 0.0);
        for &s in &field_quad.stars {
            sx += pool[s].x;
            sy += pool[s].y;
        }
        (sx / 4.0, sy / 4.0)
    };
    let quad_radius = field_quad.diameter;

    let fg_bonus = ((1.0 - config.distractor_ratio) / config.distractor_ratio).ln();
    let bg_penalty = (config.distractor_ratio / (1.0 - config.distractor_ratio)).ln();

    let mut log_odds = 0.0f64;
    let mut inliers = Vec::new();

    let star_count = index.star_count();
    for star_id in 0..star_count {
        let Some((ra, dec)) = index.star_radec(star_id as u32) else { continue };
        let (px, py) = wcs.world_to_pixel_linear(ra, dec);
        if !px.is_finite() || !py.is_finite() {
            continue;
        }

        if !config.distance_from_quad_bonus {
            let dx = px - quad_centre.0;
            let dy = py - quad_centre.1;
            if (dx * dx + dy * dy).sqrt() > 4.0 * quad_radius {
                continue;
            }
        }

        let mut best: Option<(usize, f64)> = None;
        for (i, s) in pool.iter().enumerate() {
            let dx = s.x - px;
            let dy = s.y - py;
            let d = (dx * dx + dy * dy).sqrt();
            if d <= config.verify_pix && best.map_or(true, |(_, bd)| d < bd) {
                best = Some((i, d));
            }
        }

        match best {
            Some((i, _)) => {
                log_odds += fg_bonus;
                inliers.push(Inlier { field: pool[i].pos(), radec: (ra, dec) });
            }
            None => log_odds += bg_penalty,
        }
    }

    (log_odds, inliers)
}

/// Re-estimate crval/crpix/CD from all verified inliers by linear
/// least-squares.
fn tune(wcs: &WcsSolution, _pool: &[Star], inliers: &[Inlier], _config: &SolverConfig) -> Option<WcsSolution> {
    if inliers.len() < 3 {
        return None;
    }

    // Keep the same tangent point; refit CD by least squares over all
    // inliers' (pixel offset from crpix) -> (xi, eta) pairs.
    let crpix_x = wcs.crpix_x;
    let crpix_y = wcs.crpix_y;
    let crval_ra = wcs.crval_ra;
    let crval_dec = wcs.crval_dec;

    // Normal equations for [cd11, cd12] from dx,dy -> xi and
    // [cd21, cd22] from dx,dy -> eta (2x2 systems each).
    let mut sxx = 0.0;
    let mut sxy = 0.0;
    let mut syy = 0.0;
    let mut sxxi = 0.0;
    let mut syxi = 0.0;
    let mut sxeta = 0.0;
    let mut syeta = 0.0;

    for inl in inliers {
        let dx = inl.field.0 - crpix_x;
        let dy = inl.field.1 - crpix_y;
        let (xi, eta) = project_tan(crval_ra, crval_dec, inl.radec.0, inl.radec.1);
        sxx += dx * dx;
        sxy += dx * dy;
        syy += dy * dy;
        sxxi += dx * xi;
        syxi += dy * xi;
        sxeta += dx * eta;
        syeta += dy * eta;
    }

    let det = sxx * syy - sxy * sxy;
    if det.abs() < 1e-15 {
        return None;
    }
    let inv = 1.0 / det;
    let cd11 = (sxxi * syy - syxi * sxy) * inv;
    let cd12 = (sxx * syxi - sxy * sxxi) * inv;
    let cd21 = (sxeta * syy - syeta * sxy) * inv;
    let cd22 = (sxx * syeta - sxy * sxeta) * inv;

    Some(WcsSolution {
        crval_ra,
        crval_dec,
        crpix_x,
        crpix_y,
        cd: [[cd11, cd12], [cd21, cd22]],
        log_odds: wcs.log_odds,
        tweak: None,
    })
}

/// Fit a polynomial distortion of the given order on top of the tangent
/// projection, by least squares over the inliers' residuals.
fn fit_tweak(
    wcs: &WcsSolution,
    _pool: &[Star],
    inliers: &[Inlier],
    order: usize,
) -> Option<crate::model::wcs::PolyDistortion> {
    let basis = |x: f64, y: f64| -> Vec<f64> {
        let mut terms = Vec::new();
        for deg in 2..=order {
            for i in 0..=deg {
                terms.push(x.powi((deg - i) as i32) * y.powi(i as i32));
            }
        }
        terms
    };
    let nterms = basis(1.0, 1.0).len();
    if nterms == 0 || inliers.len() < nterms + 2 {
        return None;
    }

    let mut residual_xi = Vec::with_capacity(inliers.len());
    let mut residual_eta = Vec::with_capacity(inliers.len());
    let mut rows = Vec::with_capacity(inliers.len());

    for inl in inliers {
        let dx = inl.field.0 - wcs.crpix_x;
        let dy = inl.field.1 - wcs.crpix_y;
        let lin_xi = wcs.cd[0][0] * dx + wcs.cd[0][1] * dy;
        let lin_eta = wcs.cd[1][0] * dx + wcs.cd[1][1] * dy;
        let (xi, eta) = project_tan(wcs.crval_ra, wcs.crval_dec, inl.radec.0, inl.radec.1);
        residual_xi.push(xi - lin_xi);
        residual_eta.push(eta - lin_eta);
        rows.push(basis(dx, dy));
    }

    let dxi = least_squares(&rows, &residual_xi, nterms)?;
    let deta = least_squares(&rows, &residual_eta, nterms)?;

    Some(crate::model::wcs::PolyDistortion { order, dxi, deta })
}

/// Solve `A^T A x = A^T b` for a small dense system via Gauss-Jordan
/// elimination with partial pivoting.
fn least_squares(rows: &[Vec<f64>], b: &[f64], nterms: usize) -> Option<Vec<f64>> {
    let mut ata = vec![vec![0.0f64; nterms]; nterms];
    let mut atb = vec![0.0f64; nterms];

    for (row, &bv) in rows.iter().zip(b.iter()) {
        for i in 0..nterms {
            atb[i] += row[i] * bv;
            for j in 0..nterms {
                ata[i][j] += row[i] * row[j];
            }
        }
    }

    for col in 0..nterms {
        let mut pivot = col;
        let mut best = ata[col][col].abs();
        for row in (col + 1)..nterms {
            if ata[row][col].abs() > best {
                best = ata[row][col].abs();
                pivot = row;
            }
        }
        if best < 1e-15 {
            return None;
        }
        ata.swap(col, pivot);
        atb.swap(col, pivot);

        let diag = ata[col][col];
        for row in (col + 1)..nterms {
            let factor = ata[row][col] / diag;
            if factor == 0.0 {
                continue;
            }
            for k in col..nterms {
                ata[row][k] -= factor * ata[col][k];
            }
            atb[row] -= factor * atb[col];
        }
    }

    let mut x = vec![0.0f64; nterms];
    for row in (0..nterms).rev() {
        let mut sum = atb[row];
        for col in (row + 1)..nterms {
            sum -= ata[row][col] * x[col];
        }
        x[row] = sum / ata[row][row];
    }
    Some(x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::index::MmapSkyIndex;
    use std::path::Path;

    /// Builds a synthetic field plus the tangent-plane offsets of each star
    /// (needed to build index quad codes from a frame that is a true
    /// similarity transform of the field pixel frame — RA/Dec are related
    /// to pixel offsets by the gnomonic projection, which is anisotropic
    /// away from the tangent point and would not reproduce the same code).
    fn make_field(
        width: usize,
        height: usize,
        crval: (f64, f64),
        cd: [[f64; 2]; 2],
    ) -> (Vec<Star>, Vec<(f64, f64)>, Vec<(f64, f64)>) {
        let crpix = (width as f64 / 2.0, height as f64 / 2.0);
        let mut stars = Vec::new();
        let mut radec = Vec::new();
        let mut tangent = Vec::new();
        let mut seed = 7u64;
        let mut rnd = || {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
            ((seed >> 33) as f64) / (u32::MAX as f64)
        };
        for i in 0..40 {
            let x = 20.0 + rnd() * (width as f64 - 40.0);
            let y = 20.0 + rnd() * (height as f64 - 40.0);
            let dx = x - crpix.0;
            let dy = y - crpix.1;
            let xi = cd[0][0] * dx + cd[0][1] * dy;
            let eta = cd[1][0] * dx + cd[1][1] * dy;
            let (ra, dec) = deproject_tan(crval.0, crval.1, xi, eta);
            stars.push(Star::new(x, y, 1000.0 - i as f64, 10.0));
            radec.push((ra, dec));
            tangent.push((xi, eta));
        }
        (stars, radec, tangent)
    }

    fn write_index(
        path: &Path,
        radec: &[(f64, f64)],
        tangent: &[(f64, f64)],
        scale_low: f64,
        scale_high: f64,
    ) {
        // Build every quad from the first 12 catalogue stars so the field's
        // quads are guaranteed to have an exact code-space match. Codes are
        // computed from the tangent-plane coordinates (a similarity-equivalent
        // frame to field pixels), not from RA/Dec directly.
        let n = radec.len().min(12);
        let mut quads = Vec::new();
        for a in 0..n {
            for b in (a + 1)..n {
                for c in (b + 1)..n {
                    for d in (c + 1)..n {
                        let positions: [(f64, f64); 4] =
                            std::array::from_fn(|i| [tangent[a], tangent[b], tangent[c], tangent[d]][i]);
                        if let Some(q) = super::quad_code(positions, [a, b, c, d], false) {
                            quads.push(IndexedQuad {
                                code: q.code,
                                diameter_arcsec: q.diameter * 3600.0,
                                star_ids: [a as u32, b as u32, c as u32, d as u32],
                            });
                        }
                    }
                }
            }
        }
        MmapSkyIndex::write(path, &quads, radec, scale_low, scale_high).unwrap();
    }

    #[test]
    fn solves_a_synthetic_field() {
        // Builds a field whose stars are the tangent projection of a
        // synthetic catalogue, and an index whose quad codes are computed
        // from that same tangent-plane frame; exercises the lookup/verify/
        // accept path end-to-end without needing a real external index
        // file, matching S6's intent.
        let crval = (180.0, 45.0);
        let cd = [[-0.0005, 0.0], [0.0, 0.0005]];
        let (stars, radec, tangent) = make_field(1024, 1024, crval, cd);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.idx");
        write_index(&path, &radec, &tangent, 0.1, 10.0);

        let index = MmapSkyIndex::open(&path).unwrap();
        let indices: Vec<&dyn SkyIndex> = vec![&index];

        let mut config = SolverConfig { logodds_keep: 1.0, logodds_tune: 1.0e9, ..Default::default() };
        config.quad_size_fraction = (0.0, 10.0);
        config.codetol = 1e-6;

        let result = solve(&stars, 1024, 1024, &indices, 0.1, 10.0, &config);
        assert!(result.is_ok(), "expected a solve, got {:?}", result.err());
    }

    #[test]
    fn fails_with_too_few_stars() {
        let stars = vec![Star::new(1.0, 1.0, 10.0, 1.0), Star::new(2.0, 2.0, 10.0, 1.0)];
        let config = SolverConfig::default();
        let result = solve(&stars, 100, 100, &[], 1.0, 2.0, &config);
        assert!(matches!(result, Err(Error::SolveFailed)));
    }

    #[test]
    fn rejects_invalid_scale_range() {
        let stars: Vec<Star> = (0..5).map(|i| Star::new(i as f64, i as f64, 10.0, 1.0)).collect();
        let config = SolverConfig::default();
        let result = solve(&stars, 100, 100, &[], 5.0, 1.0, &config);
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }
}
