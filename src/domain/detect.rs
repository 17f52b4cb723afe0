use std::collections::VecDeque;

use ndarray::Array2;

use crate::domain::image_prep;
use crate::domain::stats::sigma_clipped_stats;
use crate::error::{Error, Result};
use crate::model::Star;

/// Parameters for the star detector; defaults reproduce the reference
/// implementation's tuning.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DetectorConfig {
    /// Peak significance threshold, in units of the background sigma.
    pub plim: f64,
    /// Assumed PSF sigma, in pixels.
    pub dpsf: f64,
    /// Minimum separation between two accepted peaks, in pixels.
    pub dlim: f64,
    /// Saddle-point rejection threshold, in units of sigma.
    pub saddle: f64,
    /// Half-size of the window used for the background median filter.
    pub halfbox: usize,
    /// Maximum peaks kept per connected above-threshold region.
    pub maxper: usize,
    /// Maximum peaks kept across the whole image.
    pub maxnpeaks: usize,
    /// Maximum pixel count for one connected region (larger ones are
    /// treated as saturated blobs / extended sources and skipped).
    pub maxsize: usize,
    /// Downsample factor applied before detection, {1,2,3,4}.
    pub downsample: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            plim: 8.0,
            dpsf: 1.0,
            dlim: 1.0,
            saddle: 5.0,
            halfbox: 100,
            maxper: 5_000,
            maxnpeaks: 100_000,
            maxsize: 5_000,
            downsample: 1,
        }
    }
}

struct Peak {
    x: usize,
    y: usize,
    value: f64,
}

/// Locate stars in a float image.
///
/// Returns a [`Star`] list in the original (pre-downsample) image frame.
/// An image with zero peaks above threshold is [`Error::DetectionEmpty`],
/// not a crash — callers that want to treat "no stars" as fatal should map
/// that variant themselves; this is a normal, unremarkable outcome for an
/// empty field. If more than `maxnpeaks` peaks survive, the list is
/// truncated to the brightest `maxnpeaks` and the overflow is logged
/// rather than treated as a distinct error kind (see DESIGN.md).
pub fn detect(image: &Array2<f32>, config: &DetectorConfig) -> Result<Vec<Star>> {
    let (orig_h, orig_w) = image.dim();
    if orig_w == 0 || orig_h == 0 {
        return Err(Error::InvalidInput("empty image".into()));
    }

    let working = if config.downsample > 1 {
        image_prep::downsample(image, config.downsample)?
    } else {
        image.clone()
    };
    let d = config.downsample.max(1) as f64;

    let background = tiled_background(&working, config.halfbox);
    let mut subtracted = working.clone();
    for ((r, c), v) in subtracted.indexed_iter_mut() {
        *v -= background[[r, c]];
    }

    let sigma = robust_sigma(&subtracted);
    let kernel = gaussian_kernel(config.dpsf);
    let convolved = convolve_separable(&subtracted, &kernel);

    let threshold = config.plim * sigma;
    let (h, w) = convolved.dim();
    let mut visited = Array2::<bool>::from_elem((h, w), false);

    let mut stars: Vec<Star> = Vec::new();

    for r in 0..h {
        for c in 0..w {
            if visited[[r, c]] || convolved[[r, c]] < threshold as f32 {
                continue;
            }

            let component = flood_fill(&convolved, &mut visited, r, c, threshold as f32);
            if component.len() < 1 || component.len() > config.maxsize {
                continue;
            }

            let maxima = local_maxima(
                &convolved,
                &component,
                config.dlim,
                config.saddle * sigma as f32,
                config.maxper,
            );

            for peak in maxima {
                if let Some((cx, cy)) = refine_subpixel(&convolved, peak.x, peak.y) {
                    let (flux, bg) =
                        measure_flux(&subtracted, &background, cx, cy, config.dpsf);
                    if flux <= 0.0 {
                        continue;
                    }
                    stars.push(Star::new(cx * d, cy * d, flux, bg));
                }
            }
        }
    }

    if stars.is_empty() {
        return Err(Error::DetectionEmpty);
    }

    if stars.len() > config.maxnpeaks {
        log::warn!(
            "detect: {} peaks exceeds maxnpeaks {}, truncating to brightest",
            stars.len(),
            config.maxnpeaks
        );
        stars.sort_by(|a, b| b.flux.partial_cmp(&a.flux).unwrap());
        stars.truncate(config.maxnpeaks);
    }

    Ok(stars)
}

/// Block-constant approximation of a sliding-median background: the image
/// is tiled into `~2*halfbox` windows and each tile's
/// sigma-clipped median is broadcast back over its pixels, giving a full
/// per-pixel background map instead of one global scalar.
fn tiled_background(image: &Array2<f32>, halfbox: usize) -> Array2<f32> {
    let (h, w) = image.dim();
    let tile = (2 * halfbox).clamp(8, h.max(w).max(8));
    let mut out = Array2::<f32>::zeros((h, w));

    let mut y = 0;
    while y < h {
        let ye = (y + tile).min(h);
        let mut x = 0;
        while x < w {
            let xe = (x + tile).min(w);

            let mut vals: Vec<f32> = Vec::with_capacity((ye - y) * (xe - x));
            for r in y..ye {
                for c in x..xe {
                    let v = image[[r, c]];
                    if v.is_finite() {
                        vals.push(v);
                    }
                }
            }
            let median = if vals.is_empty() {
                0.0
            } else {
                let (med, _sig) = sigma_clipped_stats(&mut vals, 3.0, 2);
                med as f32
            };

            for r in y..ye {
                for c in x..xe {
                    out[[r, c]] = median;
                }
            }
            x += tile;
        }
        y += tile;
    }

    out
}

/// Robust per-pixel noise sigma via MAD, matching `stats::sigma_clipped_stats`'s
/// conversion factor.
fn robust_sigma(subtracted: &Array2<f32>) -> f64 {
    let mut vals: Vec<f32> = subtracted.iter().copied().filter(|v| v.is_finite()).collect();
    let (_med, sigma) = sigma_clipped_stats(&mut vals, 3.0, 3);
    sigma.max(1e-10)
}

fn gaussian_kernel(sigma: f64) -> Vec<f32> {
    let radius = (sigma * 3.0).ceil().max(1.0) as i32;
    let mut kernel = Vec::with_capacity((2 * radius + 1) as usize);
    let mut sum = 0.0f64;
    for i in -radius..=radius {
        let v = (-(i as f64 * i as f64) / (2.0 * sigma * sigma)).exp();
        kernel.push(v);
        sum += v;
    }
    kernel.iter().map(|&v| (v / sum) as f32).collect()
}

/// Separable 2-D Gaussian convolution, reflecting at borders.
fn convolve_separable(image: &Array2<f32>, kernel: &[f32]) -> Array2<f32> {
    let (h, w) = image.dim();
    let radius = (kernel.len() / 2) as i32;

    let mut horiz = Array2::<f32>::zeros((h, w));
    for r in 0..h {
        for c in 0..w {
            let mut acc = 0.0f32;
            for (k, &kv) in kernel.iter().enumerate() {
                let off = k as i32 - radius;
                let cc = reflect(c as i32 + off, w as i32) as usize;
                acc += image[[r, cc]] * kv;
            }
            horiz[[r, c]] = acc;
        }
    }

    let mut out = Array2::<f32>::zeros((h, w));
    for r in 0..h {
        for c in 0..w {
            let mut acc = 0.0f32;
            for (k, &kv) in kernel.iter().enumerate() {
                let off = k as i32 - radius;
                let rr = reflect(r as i32 + off, h as i32) as usize;
                acc += horiz[[rr, c]] * kv;
            }
            out[[r, c]] = acc;
        }
    }
    out
}

fn reflect(i: i32, n: i32) -> i32 {
    if n <= 1 {
        return 0;
    }
    let mut v = i;
    if v < 0 {
        v = -v;
    }
    if v >= n {
        v = 2 * (n - 1) - v;
    }
    v.clamp(0, n - 1)
}

fn flood_fill(
    image: &Array2<f32>,
    visited: &mut Array2<bool>,
    r0: usize,
    c0: usize,
    threshold: f32,
) -> Vec<(usize, usize)> {
    let (h, w) = image.dim();
    let mut component = Vec::new();
    let mut queue = VecDeque::new();
    queue.push_back((r0, c0));
    visited[[r0, c0]] = true;

    while let Some((r, c)) = queue.pop_front() {
        component.push((r, c));
        for (dr, dc) in [(-1i32, -1i32), (-1, 0), (-1, 1), (0, -1), (0, 1), (1, -1), (1, 0), (1, 1)] {
            let nr = r as i32 + dr;
            let nc = c as i32 + dc;
            if nr < 0 || nc < 0 || nr >= h as i32 || nc >= w as i32 {
                continue;
            }
            let (nr, nc) = (nr as usize, nc as usize);
            if visited[[nr, nc]] {
                continue;
            }
            if image[[nr, nc]] >= threshold {
                visited[[nr, nc]] = true;
                queue.push_back((nr, nc));
            }
        }
    }

    component
}

/// Within one connected region, find local maxima separated by at least
/// `dlim` pixels, rejecting any whose saddle to a brighter neighbour falls
/// below `saddle_abs`.
fn local_maxima(
    image: &Array2<f32>,
    component: &[(usize, usize)],
    dlim: f64,
    saddle_abs: f32,
    maxper: usize,
) -> Vec<Peak> {
    let (h, w) = image.dim();
    let in_component: std::collections::HashSet<(usize, usize)> = component.iter().copied().collect();

    let mut candidates: Vec<Peak> = Vec::new();
    for &(r, c) in component {
        let v = image[[r, c]];
        let mut is_max = true;
        for dr in -1i32..=1 {
            for dc in -1i32..=1 {
                if dr == 0 && dc == 0 {
                    continue;
                }
                let nr = r as i32 + dr;
                let nc = c as i32 + dc;
                if nr < 0 || nc < 0 || nr >= h as i32 || nc >= w as i32 {
                    continue;
                }
                if image[[nr as usize, nc as usize]] > v {
                    is_max = false;
                }
            }
        }
        if is_max {
            candidates.push(Peak { x: c, y: r, value: v as f64 });
        }
    }

    candidates.sort_by(|a, b| b.value.partial_cmp(&a.value).unwrap());

    let mut kept: Vec<Peak> = Vec::new();
    'outer: for cand in candidates {
        for k in &kept {
            let dx = cand.x as f64 - k.x as f64;
            let dy = cand.y as f64 - k.y as f64;
            if (dx * dx + dy * dy).sqrt() < dlim {
                continue 'outer;
            }
            if saddle_value(image, (k.x, k.y), (cand.x, cand.y), &in_component) < saddle_abs {
                continue 'outer;
            }
        }
        kept.push(cand);
        if kept.len() >= maxper {
            break;
        }
    }

    kept
}

/// Minimum convolved value sampled along the straight line between two
/// peaks, used to decide whether a fainter peak is a genuine second source
/// or a noise bump on the shoulder of the brighter one.
fn saddle_value(
    image: &Array2<f32>,
    a: (usize, usize),
    b: (usize, usize),
    in_component: &std::collections::HashSet<(usize, usize)>,
) -> f32 {
    let steps = 8;
    let mut min_val = f32::MAX;
    for i in 0..=steps {
        let t = i as f64 / steps as f64;
        let x = a.0 as f64 + t * (b.0 as f64 - a.0 as f64);
        let y = a.1 as f64 + t * (b.1 as f64 - a.1 as f64);
        let (xi, yi) = (x.round() as usize, y.round() as usize);
        if !in_component.contains(&(xi, yi)) {
            continue;
        }
        min_val = min_val.min(image[[yi, xi]]);
    }
    let peak_min = image[[a.1, a.0]].min(image[[b.1, b.0]]);
    peak_min - min_val
}

/// Refine a peak to subpixel precision via a 2-D quadratic fit over its 3x3
/// neighbourhood.
fn refine_subpixel(image: &Array2<f32>, x: usize, y: usize) -> Option<(f64, f64)> {
    let (h, w) = image.dim();
    if x == 0 || y == 0 || x + 1 >= w || y + 1 >= h {
        return Some((x as f64, y as f64));
    }

    let f = |dx: i32, dy: i32| image[[(y as i32 + dy) as usize, (x as i32 + dx) as usize]] as f64;

    let fxm = f(-1, 0);
    let f0 = f(0, 0);
    let fxp = f(1, 0);
    let fym = f(0, -1);
    let fyp = f(0, 1);

    let denom_x = fxm - 2.0 * f0 + fxp;
    let denom_y = fym - 2.0 * f0 + fyp;

    let dx = if denom_x.abs() > 1e-9 {
        (0.5 * (fxm - fxp) / denom_x).clamp(-1.0, 1.0)
    } else {
        0.0
    };
    let dy = if denom_y.abs() > 1e-9 {
        (0.5 * (fym - fyp) / denom_y).clamp(-1.0, 1.0)
    } else {
        0.0
    };

    Some((x as f64 + dx, y as f64 + dy))
}

/// Integrate background-subtracted flux in an aperture proportional to the
/// assumed PSF width, and sample the background map at the peak.
fn measure_flux(
    subtracted: &Array2<f32>,
    background: &Array2<f32>,
    cx: f64,
    cy: f64,
    dpsf: f64,
) -> (f64, f64) {
    let radius = (3.0 * dpsf).max(1.0);
    let (h, w) = subtracted.dim();
    let x0 = (cx - radius).floor().max(0.0) as usize;
    let x1 = ((cx + radius).ceil() as usize).min(w.saturating_sub(1));
    let y0 = (cy - radius).floor().max(0.0) as usize;
    let y1 = ((cy + radius).ceil() as usize).min(h.saturating_sub(1));

    let mut flux = 0.0f64;
    for r in y0..=y1 {
        for c in x0..=x1 {
            let dx = c as f64 - cx;
            let dy = r as f64 - cy;
            if dx * dx + dy * dy <= radius * radius {
                flux += subtracted[[r, c]] as f64;
            }
        }
    }

    let bx = cx.round().clamp(0.0, (w - 1) as f64) as usize;
    let by = cy.round().clamp(0.0, (h - 1) as f64) as usize;
    let bg = background[[by, bx]] as f64;

    (flux, bg)
}
