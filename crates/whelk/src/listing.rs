//! Directory listings for tracked shells.

use std::path::Path;

use crate::executor::{CommandExecutor, ExecError};
use crate::limits::ResourceLimits;

/// Long-format listing of `dir`, one entry per line.
///
/// Runs `ls -alh` in the directory and drops the first line, the aggregate
/// size header long listings lead with. A directory that cannot be listed
/// (gone, unreadable) yields an empty vec rather than an error; timeouts
/// still propagate.
pub(crate) async fn long_listing(
    executor: &CommandExecutor,
    dir: &Path,
    limits: &ResourceLimits,
) -> Result<Vec<String>, ExecError> {
    let output = match executor.run("ls -alh", dir, limits).await {
        Ok(output) => output,
        Err(ExecError::Spawn(e)) => {
            tracing::debug!(dir = %dir.display(), error = %e, "directory not listable");
            return Ok(Vec::new());
        }
        Err(e) => return Err(e),
    };

    Ok(output
        .stdout
        .lines()
        .skip(1)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect())
}
