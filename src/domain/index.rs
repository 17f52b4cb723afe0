use std::fs::File;
use std::io::Write as _;
use std::path::Path;

use anyhow::{bail, Context, Result as AnyResult};
use memmap2::Mmap;

use crate::domain::kdtree::KdTree4;
use crate::utils::mmap::create_mmap_random;

const MAGIC: &[u8; 4] = b"ASKI";
const VERSION: u32 = 1;

/// One catalogue quad, as stored in a [`SkyIndex`].
/// `star_ids` index into the same index's star catalogue, not into any
/// field star list — the solver is the one that correlates the two.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexedQuad {
    pub code: [f64; 4],
    pub diameter_arcsec: f64,
    pub star_ids: [u32; 4],
}

/// Contract a catalogue of precomputed sky quads must expose to the solver.
/// The solver treats several active `SkyIndex`
/// implementors as the union of their quad sets, filtered by scale range.
pub trait SkyIndex {
    fn quads_in_scale_range(&self, min_arcsec: f64, max_arcsec: f64) -> Vec<IndexedQuad>;
    fn codes_within(&self, code: &[f64; 4], radius: f64) -> Vec<IndexedQuad>;
    fn star_radec(&self, star_id: u32) -> Option<(f64, f64)>;
    fn scale_range(&self) -> (f64, f64);
    /// Number of catalogue stars, so a caller can iterate `0..star_count()`
    /// against [`SkyIndex::star_radec`] (used by the solver's verification
    /// pass, which projects every catalogue star, not just quad members).
    fn star_count(&self) -> usize;
}

/// Read-only `memmap2`-backed reader over this crate's own minimal binary
/// quad-index layout (header + quad-code table + star catalogue), a
/// read-only adapter standing in for the real on-disk catalogue format.
/// Opened via [`crate::utils::mmap::create_mmap_random`], whose
/// `Advice::Random` hint matches this type's access pattern — k-d tree
/// lookups jump around the file rather than reading it front to back.
///
/// On-disk layout (little-endian):
/// ```text
/// [0..4)   magic "ASKI"
/// [4..8)   version (u32)
/// [8..12)  quad count (u32)
/// [12..16) star count (u32)
/// [16..24) scale_min_arcsec (f64)
/// [24..32) scale_max_arcsec (f64)
/// quad table: quad_count * (4*f64 code + f64 diameter + 4*u32 star_ids) = 68 bytes/quad
/// star table: star_count * (f64 ra_deg + f64 dec_deg) = 16 bytes/star
/// ```
pub struct MmapSkyIndex {
    _mmap: Mmap,
    quads: Vec<IndexedQuad>,
    stars: Vec<(f64, f64)>,
    tree: KdTree4,
    scale_min: f64,
    scale_max: f64,
}

const HEADER_LEN: usize = 32;
const QUAD_REC_LEN: usize = 4 * 8 + 8 + 4 * 4;
const STAR_REC_LEN: usize = 16;

impl MmapSkyIndex {
    pub fn open(path: &Path) -> AnyResult<Self> {
        let file = File::open(path).with_context(|| format!("opening index {:?}", path))?;
        let mmap = create_mmap_random(&file)?;

        if mmap.len() < HEADER_LEN || &mmap[0..4] != MAGIC {
            bail!("{:?}: not a valid sky index file", path);
        }
        let version = u32::from_le_bytes(mmap[4..8].try_into().unwrap());
        if version != VERSION {
            bail!("{:?}: unsupported index version {}", path, version);
        }
        let quad_count = u32::from_le_bytes(mmap[8..12].try_into().unwrap()) as usize;
        let star_count = u32::from_le_bytes(mmap[12..16].try_into().unwrap()) as usize;
        let scale_min = f64::from_le_bytes(mmap[16..24].try_into().unwrap());
        let scale_max = f64::from_le_bytes(mmap[24..32].try_into().unwrap());

        let quads_end = HEADER_LEN + quad_count * QUAD_REC_LEN;
        let stars_end = quads_end + star_count * STAR_REC_LEN;
        if mmap.len() < stars_end {
            bail!("{:?}: truncated index file", path);
        }

        let mut quads = Vec::with_capacity(quad_count);
        for i in 0..quad_count {
            let off = HEADER_LEN + i * QUAD_REC_LEN;
            let rec = &mmap[off..off + QUAD_REC_LEN];
            let mut code = [0.0f64; 4];
            for k in 0..4 {
                code[k] = f64::from_le_bytes(rec[k * 8..k * 8 + 8].try_into().unwrap());
            }
            let diameter_arcsec = f64::from_le_bytes(rec[32..40].try_into().unwrap());
            let mut star_ids = [0u32; 4];
            for k in 0..4 {
                let so = 40 + k * 4;
                star_ids[k] = u32::from_le_bytes(rec[so..so + 4].try_into().unwrap());
            }
            quads.push(IndexedQuad { code, diameter_arcsec, star_ids });
        }

        let mut stars = Vec::with_capacity(star_count);
        for i in 0..star_count {
            let off = quads_end + i * STAR_REC_LEN;
            let rec = &mmap[off..off + STAR_REC_LEN];
            let ra = f64::from_le_bytes(rec[0..8].try_into().unwrap());
            let dec = f64::from_le_bytes(rec[8..16].try_into().unwrap());
            stars.push((ra, dec));
        }

        let tree = KdTree4::build(quads.iter().map(|q| q.code).collect());

        Ok(Self { _mmap: mmap, quads, stars, tree, scale_min, scale_max })
    }

    /// Serialize a catalogue to this crate's binary layout; used to build
    /// synthetic fixtures in tests (no real astrometry.net index ships with
    /// this crate).
    pub fn write(
        path: &Path,
        quads: &[IndexedQuad],
        stars: &[(f64, f64)],
        scale_min: f64,
        scale_max: f64,
    ) -> AnyResult<()> {
        let mut buf = Vec::with_capacity(HEADER_LEN + quads.len() * QUAD_REC_LEN + stars.len() * STAR_REC_LEN);
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&VERSION.to_le_bytes());
        buf.extend_from_slice(&(quads.len() as u32).to_le_bytes());
        buf.extend_from_slice(&(stars.len() as u32).to_le_bytes());
        buf.extend_from_slice(&scale_min.to_le_bytes());
        buf.extend_from_slice(&scale_max.to_le_bytes());

        for q in quads {
            for c in q.code {
                buf.extend_from_slice(&c.to_le_bytes());
            }
            buf.extend_from_slice(&q.diameter_arcsec.to_le_bytes());
            for id in q.star_ids {
                buf.extend_from_slice(&id.to_le_bytes());
            }
        }
        for &(ra, dec) in stars {
            buf.extend_from_slice(&ra.to_le_bytes());
            buf.extend_from_slice(&dec.to_le_bytes());
        }

        let mut file = File::create(path).with_context(|| format!("creating {:?}", path))?;
        file.write_all(&buf)?;
        Ok(())
    }
}

impl SkyIndex for MmapSkyIndex {
    fn quads_in_scale_range(&self, min_arcsec: f64, max_arcsec: f64) -> Vec<IndexedQuad> {
        self.quads
            .iter()
            .filter(|q| q.diameter_arcsec >= min_arcsec && q.diameter_arcsec <= max_arcsec)
            .copied()
            .collect()
    }

    fn codes_within(&self, code: &[f64; 4], radius: f64) -> Vec<IndexedQuad> {
        self.tree
            .query_radius(code, radius)
            .into_iter()
            .map(|i| self.quads[i])
            .collect()
    }

    fn star_radec(&self, star_id: u32) -> Option<(f64, f64)> {
        self.stars.get(star_id as usize).copied()
    }

    fn scale_range(&self) -> (f64, f64) {
        (self.scale_min, self.scale_max)
    }

    fn star_count(&self) -> usize {
        self.stars.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn round_trips_through_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.idx");

        let quads = vec![
            IndexedQuad { code: [0.1, 0.2, 0.3, 0.4], diameter_arcsec: 500.0, star_ids: [0, 1, 2, 3] },
            IndexedQuad { code: [0.5, 0.6, 0.7, 0.8], diameter_arcsec: 1200.0, star_ids: [1, 2, 3, 4] },
        ];
        let stars = vec![
            (10.0, 20.0), (10.1, 20.1), (10.2, 19.9), (9.9, 20.2), (10.05, 19.95),
        ];

        MmapSkyIndex::write(&path, &quads, &stars, 100.0, 2000.0).unwrap();
        let index = MmapSkyIndex::open(&path).unwrap();

        assert_eq!(index.scale_range(), (100.0, 2000.0));
        assert_eq!(index.star_radec(2), Some((10.2, 19.9)));

        let in_range = index.quads_in_scale_range(400.0, 600.0);
        assert_eq!(in_range.len(), 1);
        assert_eq!(in_range[0].star_ids, [0, 1, 2, 3]);

        let hits = index.codes_within(&[0.1, 0.2, 0.3, 0.4], 0.01);
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn rejects_bad_magic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.idx");
        std::fs::write(&path, b"not an index at all, but long enough").unwrap();
        assert!(MmapSkyIndex::open(&path).is_err());
    }
}
