//! Atomic whole-file replacement.
//!
//! An index file must never be observed half-written: concurrent
//! readers may open and map it at any moment. Replacement therefore
//! stages the complete image in a uniquely named sibling of the target,
//! gives it its final mode, and renames it into place in one step.

use std::io::Write;
use std::path::{Path, PathBuf};

use crate::{Result, UtilError};

/// An in-progress replacement of one file.
///
/// Bytes accumulate in a staging file beside the target and stay
/// invisible to readers until [`commit`](StagedWrite::commit) renames
/// them into place. An abandoned staging file is deleted on drop.
pub struct StagedWrite {
    staging: tempfile::NamedTempFile,
    target: PathBuf,
}

impl StagedWrite {
    /// Start a replacement of `target`.
    ///
    /// The staging file lives in the target's directory, so the final
    /// rename never crosses a filesystem boundary.
    pub fn begin(target: impl AsRef<Path>) -> Result<Self> {
        let target = target.as_ref();
        if target.file_name().is_none() {
            return Err(UtilError::Path(format!(
                "invalid write target '{}'",
                target.display()
            )));
        }
        let dir = match target.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let staging = tempfile::NamedTempFile::new_in(dir)?;
        Ok(Self {
            staging,
            target: target.to_path_buf(),
        })
    }

    /// Path of the staging file.
    pub fn path(&self) -> &Path {
        self.staging.path()
    }

    /// Append image bytes to the staging file.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.staging.write_all(data)?;
        Ok(())
    }

    /// Set the mode the file will carry once renamed into place.
    #[cfg(unix)]
    pub fn set_mode(&mut self, mode: u32) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let perms = std::fs::Permissions::from_mode(mode);
        self.staging.as_file_mut().set_permissions(perms)?;
        Ok(())
    }

    /// Mode bits are not portable; elsewhere this does nothing.
    #[cfg(not(unix))]
    pub fn set_mode(&mut self, _mode: u32) -> Result<()> {
        Ok(())
    }

    /// Rename the staged bytes over the target.
    pub fn commit(mut self) -> Result<()> {
        self.staging.flush()?;
        let Self { staging, target } = self;
        staging.persist(target).map_err(|e| UtilError::Io(e.error))?;
        Ok(())
    }
}

/// Replace `target` with `data` in one atomic step, carrying `mode`.
pub fn write_buffer_atomic(target: impl AsRef<Path>, data: &[u8], mode: u32) -> Result<()> {
    let mut staged = StagedWrite::begin(target)?;
    staged.write(data)?;
    staged.set_mode(mode)?;
    staged.commit()
}
