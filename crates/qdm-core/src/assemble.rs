//! Final assembly: concatenate part-files in offset order into the artifact.

use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

/// Concatenates `parts` (offset, part-file path) into `final_path`, fsyncs,
/// and removes the scratch directory.
///
/// On any I/O failure the scratch directory is left intact so a later retry
/// can pick the existing bytes back up. Runs blocking; call from
/// `spawn_blocking`.
pub(crate) fn assemble(
    mut parts: Vec<(u64, PathBuf)>,
    final_path: &Path,
    scratch_dir: &Path,
) -> Result<()> {
    parts.sort_by_key(|(offset, _)| *offset);

    // Overwrites any existing artifact at the destination.
    let mut out = File::create(final_path)
        .with_context(|| format!("create final file {}", final_path.display()))?;

    for (_, part) in &parts {
        let mut input =
            File::open(part).with_context(|| format!("open part {}", part.display()))?;
        io::copy(&mut input, &mut out)
            .with_context(|| format!("append part {}", part.display()))?;
    }

    out.sync_all().context("sync final file")?;
    drop(out);

    fs::remove_dir_all(scratch_dir)
        .with_context(|| format!("remove scratch dir {}", scratch_dir.display()))?;
    Ok(())
}
