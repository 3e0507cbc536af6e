//! Crash artifacts on disk: where they go, and the process snapshot.

use std::fs::File;
use std::path::{Path, PathBuf};

use chrono::{DateTime, FixedOffset};

use crate::config::Config;
use crate::error::Error;
use crate::platform::{DumpKind, Platform};
use crate::types::FaultEvent;

/// The pair of files written for an accepted fault.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ArtifactPaths {
    /// The textual crash report.
    pub log: PathBuf,
    /// The process snapshot.
    pub dump: PathBuf,
}

impl ArtifactPaths {
    /// Places the configured artifacts next to `image`, the file this crash handler was loaded
    /// from.
    ///
    /// With `unique_artifacts`, the file stems get a `-<timestamp>-<thread>` suffix so that
    /// a later crash does not replace the artifacts of an earlier one.
    pub fn beside(
        image: &Path,
        config: &Config,
        timestamp: DateTime<FixedOffset>,
        thread_id: u32,
    ) -> Self {
        let name = |file: &str| {
            if config.unique_artifacts {
                unique_name(file, &format!("{}-{thread_id}", timestamp.format("%Y%m%d%H%M%S")))
            } else {
                file.to_owned()
            }
        };

        Self {
            log: image.with_file_name(name(&config.log_file)),
            dump: image.with_file_name(name(&config.dump_file)),
        }
    }
}

fn unique_name(file: &str, suffix: &str) -> String {
    match file.rsplit_once('.') {
        Some((stem, extension)) if !stem.is_empty() => format!("{stem}-{suffix}.{extension}"),
        _ => format!("{file}-{suffix}"),
    }
}

/// Writes a process snapshot for `event` to `path`.
///
/// The file is created or truncated first. This is a single best-effort write: if the platform
/// fails halfway, whatever it managed to write stays on disk.
pub fn write_dump<P>(
    platform: &P,
    path: &Path,
    event: &FaultEvent<P::Context>,
    kind: DumpKind,
) -> Result<(), Error>
where
    P: Platform + ?Sized,
{
    let file = File::create(path).map_err(Error::Dump)?;
    platform.write_snapshot(&file, event, kind)?;
    file.sync_all().map_err(Error::Dump)
}
