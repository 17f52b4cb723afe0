//! Frame accumulator: owns the running stack, aligns each new frame
//! against the first ("reference") frame, and inverse-warps it into the
//! reference frame before adding it to a per-pixel sum/count buffer.

use std::time::{SystemTime, UNIX_EPOCH};

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;

use crate::domain::align::{self, AlignerConfig};
use crate::error::{Error, Result};
use crate::model::{Affine, Star};

/// Parameters for an [`Accumulator`], defaults reproducing the reference
/// implementation's tuning.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AccumulatorConfig {
    pub aligner: AlignerConfig,
}

impl Default for AccumulatorConfig {
    fn default() -> Self {
        Self { aligner: AlignerConfig::default() }
    }
}

/// Fit quality from a successful [`Accumulator::add_frame`] call, surfaced
/// at the stacking handle's public surface as `(ok, inlier_count, rms_px,
/// frame_count)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AddFrameOutcome {
    pub inliers: usize,
    pub rms_px: f64,
}

/// Per-pixel running sum/count accumulator with inverse-warp resampling.
/// The first frame registered becomes the reference frame: its
/// stars are the alignment target for every subsequent frame, and its
/// dimensions fix the output canvas size.
pub struct Accumulator {
    width: usize,
    height: usize,
    sum: Array2<f64>,
    count: Array2<u32>,
    ref_stars: Option<Vec<Star>>,
    frame_count: u64,
    config: AccumulatorConfig,
    rng: StdRng,
}

impl Accumulator {
    /// Create an empty accumulator for frames of the given pixel dimensions.
    /// The RNG is seeded from wall-clock time mixed with the process id and
    /// scoped to this handle rather than shared globally, so RANSAC across
    /// interleaved accumulators never shares or deterministically
    /// correlates state.
    pub fn new(width: usize, height: usize, config: AccumulatorConfig) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidInput(format!(
                "accumulator dimensions must be positive, got {}x{}",
                width, height
            )));
        }
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
            ^ (std::process::id() as u64).wrapping_mul(0x9E3779B97F4A7C15);

        Ok(Self {
            width,
            height,
            sum: Array2::zeros((height, width)),
            count: Array2::zeros((height, width)),
            ref_stars: None,
            frame_count: 0,
            config,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Add one frame to the stack.
    ///
    /// `image` must match this accumulator's dimensions. `stars` should be
    /// the Star Orderer's canonical ordering of the frame's detected stars.
    /// The first call establishes the reference frame (identity transform,
    /// no alignment performed) and always succeeds given valid input; every
    /// later call aligns against the reference and is rejected — without
    /// mutating any accumulator state — if alignment fails, leaving the
    /// accumulator exactly as it was. Returns
    /// the RANSAC fit quality so the public surface can
    /// report `inlier_count`/`rms_px`; the reference frame itself reports
    /// zero inliers and zero RMS since no alignment was performed for it.
    pub fn add_frame(&mut self, image: &Array2<f32>, stars: &[Star]) -> Result<AddFrameOutcome> {
        let (h, w) = image.dim();
        if w != self.width || h != self.height {
            return Err(Error::InvalidInput(format!(
                "frame {}x{} does not match accumulator {}x{}",
                w, h, self.width, self.height
            )));
        }

        let (inverse, outcome) = match &self.ref_stars {
            None => (Affine::IDENTITY, AddFrameOutcome { inliers: 0, rms_px: 0.0 }),
            Some(ref_stars) => {
                let result = match align::align(ref_stars, stars, &self.config.aligner, &mut self.rng) {
                    Ok(result) => result,
                    Err(e) => {
                        log::warn!("add_frame: alignment rejected: {}", e);
                        return Err(Error::AlignFailed(e.to_string()));
                    }
                };
                // `result.affine` maps new -> ref; invert so it maps a
                // reference pixel to its sample location in this frame.
                let outcome = AddFrameOutcome { inliers: result.inliers, rms_px: result.rms_px };
                (result.affine.invert(), outcome)
            }
        };

        self.warp_and_accumulate(image, &inverse);

        if self.ref_stars.is_none() {
            self.ref_stars = Some(stars.to_vec());
        }
        self.frame_count += 1;
        Ok(outcome)
    }

    /// Inverse-warp `image` into the reference frame and add it to the
    /// running sum/count: for every reference pixel, apply
    /// `inverse_affine` (already `new -> ref` inverted to `ref -> new`) to
    /// find where to bilinearly sample this frame; pixels that land outside
    /// the source frame are skipped (neither sum nor count incremented).
    /// Rows are independent, so the warp is computed row-by-row in
    /// parallel and folded into the running buffers afterwards.
    fn warp_and_accumulate(&mut self, image: &Array2<f32>, inverse_affine: &Affine) {
        let (src_h, src_w) = image.dim();
        let width = self.width;

        let rows: Vec<Vec<Option<f64>>> = (0..self.height)
            .into_par_iter()
            .map(|ry| {
                (0..width)
                    .map(|rx| {
                        let (sx, sy) = inverse_affine.apply(rx as f64, ry as f64);
                        bilinear_sample(image, sx, sy, src_w, src_h)
                    })
                    .collect()
            })
            .collect();

        for (ry, row) in rows.into_iter().enumerate() {
            for (rx, sample) in row.into_iter().enumerate() {
                if let Some(v) = sample {
                    self.sum[[ry, rx]] += v;
                    self.count[[ry, rx]] += 1;
                }
            }
        }
    }

    /// Produce the current mean-combined stack. Pixels with
    /// zero contributing frames are `0.0`, not `NaN` — a fully-rejected
    /// stack (only the reference frame ever registered) is still a valid,
    /// if noisy, single-frame result.
    pub fn finish(&self) -> Array2<f32> {
        let mut out = Array2::<f32>::zeros((self.height, self.width));
        for ((r, c), v) in out.indexed_iter_mut() {
            let n = self.count[[r, c]];
            *v = if n > 0 { (self.sum[[r, c]] / n as f64) as f32 } else { 0.0 };
        }
        out
    }

    /// Reset to an empty accumulator with no reference frame, discarding
    /// all accumulated state.
    pub fn release(&mut self) {
        self.sum.fill(0.0);
        self.count.fill(0);
        self.ref_stars = None;
        self.frame_count = 0;
    }
}

/// Bilinear-sample `image` at floating-point coordinates `(x, y)`. Returns
/// `None` if the full 2x2 neighbourhood isn't within bounds.
fn bilinear_sample(image: &Array2<f32>, x: f64, y: f64, w: usize, h: usize) -> Option<f64> {
    if !x.is_finite() || !y.is_finite() || x < 0.0 || y < 0.0 {
        return None;
    }
    let x0 = x.floor() as usize;
    let y0 = y.floor() as usize;
    if x0 + 1 >= w || y0 + 1 >= h {
        return None;
    }
    let fx = x - x0 as f64;
    let fy = y - y0 as f64;

    let v00 = image[[y0, x0]] as f64;
    let v10 = image[[y0, x0 + 1]] as f64;
    let v01 = image[[y0 + 1, x0]] as f64;
    let v11 = image[[y0 + 1, x0 + 1]] as f64;

    let top = v00 * (1.0 - fx) + v10 * fx;
    let bottom = v01 * (1.0 - fx) + v11 * fx;
    Some(top * (1.0 - fy) + bottom * fy)
}
