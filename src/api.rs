//! The three public entry points: detect, solve, and a stacking
//! handle. These are plain `pub fn`s rather than `#[tauri::command]`s or
//! JNI exports — a host integrating this crate via JNI, a C ABI, or direct
//! Rust linkage gets the same four functions either way. Every failure
//! that isn't a normal outcome (empty
//! detection, unsolved field, rejected frame) is routed through
//! [`crate::error::Error`] internally and only surfaces at this boundary as
//! the flat shapes each entry point returns.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

use ndarray::Array2;

use crate::domain::accumulate::{Accumulator, AccumulatorConfig};
use crate::domain::index::{MmapSkyIndex, SkyIndex};
use crate::domain::{detect, image_prep, order, solve};
use crate::error::{Error, Result};
use crate::model::Star;

/// One detected star at the public boundary: background-subtracted flux,
/// no separate background field (the flat triple shape callers expect).
pub type StarTriple = (f64, f64, f64);

/// Detect stars: widen, detect, and canonically
/// order a raw 8-bit grayscale buffer. An image with no peaks above
/// threshold is a normal outcome — an empty `Vec`, not an `Err` — the
/// detector never throws for ordinary "no stars"; only malformed input
/// (bad dimensions, mismatched buffer length) is an error here.
pub fn detect_stars(
    pixels: &[u8],
    width: usize,
    height: usize,
    config: &detect::DetectorConfig,
) -> Result<Vec<StarTriple>> {
    let image = image_prep::widen_u8(pixels, width, height)?;
    let stars = match detect::detect(&image, config) {
        Ok(stars) => stars,
        Err(Error::DetectionEmpty) => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let ordered = order::order_stars(&stars);
    Ok(ordered.iter().map(|s| (s.x, s.y, s.flux)).collect())
}

/// The 12-value tuple the plate solver returns:
/// `(solved, ra, dec, crpix_x, crpix_y, cd11, cd12, cd21, cd22,
/// pixel_scale_arcsec, rotation_deg, log_odds)`. `solved` is `0` or `1`; the
/// remaining eleven fields are `0.0` when `solved == 0`.
pub type WcsTuple = (u8, f64, f64, f64, f64, f64, f64, f64, f64, f64, f64, f64);

const UNSOLVED: WcsTuple = (0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0);

/// Solve a field. `index_paths` are opened as
/// [`MmapSkyIndex`]es; a path that fails to open is [`Error::IndexLoadFailure`]
/// — logged and skipped, not propagated, so one corrupt or missing
/// index file never blocks solving against the others. Solver failure
/// (`SolveFailed`) is reported as `solved == 0`, also not an `Err` — an
/// unsolved field is a normal outcome, not an error condition.
pub fn solve_field(
    stars: &[StarTriple],
    width: usize,
    height: usize,
    index_paths: &[impl AsRef<Path>],
    scale_low: f64,
    scale_high: f64,
    config: &solve::SolverConfig,
) -> Result<WcsTuple> {
    if width == 0 || height == 0 {
        return Err(Error::InvalidInput("image dimensions must be positive".into()));
    }

    let mut opened: Vec<MmapSkyIndex> = Vec::with_capacity(index_paths.len());
    for path in index_paths {
        let path = path.as_ref();
        match MmapSkyIndex::open(path) {
            Ok(idx) => opened.push(idx),
            Err(source) => {
                let failure = Error::IndexLoadFailure { path: path.display().to_string(), source };
                log::warn!("{}", failure);
            }
        }
    }
    let indices: Vec<&dyn SkyIndex> = opened.iter().map(|i| i as &dyn SkyIndex).collect();

    let star_objs: Vec<Star> = stars.iter().map(|&(x, y, flux)| Star::new(x, y, flux, 0.0)).collect();

    let wcs = match solve::solve(&star_objs, width, height, &indices, scale_low, scale_high, config) {
        Ok(wcs) => wcs,
        Err(Error::SolveFailed) => return Ok(UNSOLVED),
        Err(e) => return Err(e),
    };

    Ok((
        1,
        wcs.crval_ra,
        wcs.crval_dec,
        wcs.crpix_x,
        wcs.crpix_y,
        wcs.cd[0][0],
        wcs.cd[0][1],
        wcs.cd[1][0],
        wcs.cd[1][1],
        wcs.pixel_scale_arcsec(),
        wcs.rotation_deg(),
        wcs.log_odds,
    ))
}

/// Process-wide stacking handle registry: a lazily-initialized global
/// table keyed by handle id. Each handle's [`Accumulator`] is individually
/// `Mutex`-guarded so distinct handles stay independently usable from a
/// dispatch layer that may service several stacks concurrently; a
/// single handle's own `add_frame` calls are still serialized by that
/// handle's mutex — the handle is exclusively owned by one caller at
/// a time, so concurrent `add_frame` on *one* handle is undefined, not
/// something this registry tries to make safe.
static HANDLES: OnceLock<Mutex<HashMap<u64, Mutex<Accumulator>>>> = OnceLock::new();
static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

fn registry() -> &'static Mutex<HashMap<u64, Mutex<Accumulator>>> {
    HANDLES.get_or_init(|| Mutex::new(HashMap::new()))
}

/// `init(W, H, is_color) -> handle`. `is_color` is
/// accepted for ABI parity with the source's signature but has no effect:
/// this crate's Accumulator is always single-channel (color processing
/// beyond grayscale accumulation is out of scope) — a caller
/// passing `is_color = true` still gets a grayscale stack.
pub fn stacking_init(width: usize, height: usize, _is_color: bool) -> Result<u64> {
    let acc = Accumulator::new(width, height, AccumulatorConfig::default())?;
    let handle = NEXT_HANDLE.fetch_add(1, Ordering::Relaxed);
    registry().lock().unwrap().insert(handle, Mutex::new(acc));
    Ok(handle)
}

/// `add_frame(handle, pixels, stars) -> (ok, inlier_count, rms_px, frame_count)`.
/// `ok == 0` on a rejected frame (dimension mismatch or alignment failure)
/// leaves the accumulator's state untouched; the
/// three numeric fields are `0` in that case.
pub fn stacking_add_frame(
    handle: u64,
    pixels: &[u8],
    width: usize,
    height: usize,
    stars: &[StarTriple],
) -> Result<(u8, u32, f64, u64)> {
    let image = image_prep::widen_u8(pixels, width, height)?;
    let star_objs: Vec<Star> = stars.iter().map(|&(x, y, flux)| Star::new(x, y, flux, 0.0)).collect();

    with_handle(handle, |acc| match acc.add_frame(&image, &star_objs) {
        Ok(outcome) => Ok((1, outcome.inliers as u32, outcome.rms_px, acc.frame_count())),
        Err(_) => Ok((0, 0, 0.0, acc.frame_count())),
    })
}

/// `get_stacked(handle) -> byte array`. Narrows the running mean back
/// down to 8-bit, rounding and clamping to `[0, 255]`.
pub fn stacking_get_stacked(handle: u64) -> Result<Vec<u8>> {
    with_handle(handle, |acc| {
        let stacked: Array2<f32> = acc.finish();
        Ok(stacked
            .iter()
            .map(|&v| v.round().clamp(0.0, 255.0) as u8)
            .collect())
    })
}

pub fn stacking_frame_count(handle: u64) -> Result<u64> {
    with_handle(handle, |acc| Ok(acc.frame_count()))
}

/// `release(handle)`. Removing the handle from the registry drops its
/// `Accumulator`, releasing its buffers; a double-release or release of an
/// unknown handle is a no-op, not an error — the host's JNI layer has no
/// reliable way to guarantee it calls this exactly once per handle.
pub fn stacking_release(handle: u64) {
    registry().lock().unwrap().remove(&handle);
}

fn with_handle<T>(handle: u64, f: impl FnOnce(&mut Accumulator) -> Result<T>) -> Result<T> {
    let registry = registry().lock().unwrap();
    let slot = registry
        .get(&handle)
        .ok_or_else(|| Error::InvalidInput(format!("unknown stacking handle {}", handle)))?;
    let mut acc = slot.lock().unwrap();
    f(&mut acc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::detect::DetectorConfig;

    fn gaussian_buf(w: usize, h: usize, stars: &[(f64, f64, f64)], bg: u8) -> Vec<u8> {
        let mut buf = vec![bg; w * h];
        for &(sx, sy, peak) in stars {
            for r in 0..h {
                for c in 0..w {
                    let dx = c as f64 - sx;
                    let dy = r as f64 - sy;
                    let v = peak * (-(dx * dx + dy * dy) / (2.0 * 1.2 * 1.2)).exp();
                    let idx = r * w + c;
                    buf[idx] = (buf[idx] as f64 + v).round().clamp(0.0, 255.0) as u8;
                }
            }
        }
        buf
    }

    #[test]
    fn detect_stars_returns_canonical_triples() {
        let stars = [(20.0, 20.0, 200.0), (80.0, 60.0, 180.0), (40.0, 90.0, 150.0)];
        let buf = gaussian_buf(128, 128, &stars, 10);
        let config = DetectorConfig { halfbox: 32, ..Default::default() };

        let out = detect_stars(&buf, 128, 128, &config).unwrap();
        assert_eq!(out.len(), stars.len());
    }

    #[test]
    fn detect_stars_on_blank_image_is_empty_not_error() {
        let buf = vec![50u8; 64 * 64];
        let config = DetectorConfig { halfbox: 16, ..Default::default() };
        let out = detect_stars(&buf, 64, 64, &config).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn solve_field_with_no_indices_is_unsolved() {
        let stars: Vec<StarTriple> = (0..5).map(|i| (i as f64, i as f64, 100.0)).collect();
        let paths: [&str; 0] = [];
        let config = solve::SolverConfig::default();
        let out = solve_field(&stars, 100, 100, &paths, 1.0, 2.0, &config).unwrap();
        assert_eq!(out.0, 0);
    }

    #[test]
    fn stacking_lifecycle() {
        let stars = [(20.0, 20.0, 200.0), (80.0, 60.0, 180.0), (40.0, 90.0, 150.0), (60.0, 30.0, 160.0)];
        let buf = gaussian_buf(128, 128, &stars, 10);
        let config = DetectorConfig { halfbox: 32, ..Default::default() };
        let detected = detect_stars(&buf, 128, 128, &config).unwrap();

        let handle = stacking_init(128, 128, false).unwrap();
        assert_eq!(stacking_frame_count(handle).unwrap(), 0);

        let (ok, _inliers, _rms, count) =
            stacking_add_frame(handle, &buf, 128, 128, &detected).unwrap();
        assert_eq!(ok, 1);
        assert_eq!(count, 1);

        let stacked = stacking_get_stacked(handle).unwrap();
        assert_eq!(stacked.len(), 128 * 128);

        stacking_release(handle);
        assert!(stacking_frame_count(handle).is_err());
    }

    #[test]
    fn unknown_handle_is_invalid_input() {
        assert!(matches!(stacking_frame_count(999_999), Err(Error::InvalidInput(_))));
    }
}
