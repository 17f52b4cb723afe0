use std::fs::File;

use anyhow::{Context, Result};
use memmap2::{Mmap, MmapOptions};

/// Map `file` read-only with a random-access hint, for readers like
/// [`crate::domain::index::MmapSkyIndex`] whose k-d tree lookups jump
/// around the file rather than scanning it linearly.
pub fn create_mmap_random(file: &File) -> Result<Mmap> {
    let mmap = unsafe { MmapOptions::new().map(file).context("mmap random failed")? };
    #[cfg(unix)]
    {
        let _ = mmap.advise(memmap2::Advice::Random);
    }
    Ok(mmap)
}
