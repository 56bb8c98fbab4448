//! Staging area cleanup.
//!
//! Uploads abandoned mid-flight (client disconnects, crashes) leave files or
//! private directories in the staging area. They are cleared at startup and
//! by a periodic sweep of entries older than the configured age.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::config::StagingConfig;
use crate::error::AppResult;

pub async fn start_janitor_task(staging_dir: PathBuf, config: StagingConfig) {
    let period = Duration::from_secs(config.sweep_interval_secs.max(1));
    let max_age = Duration::from_secs(config.max_age_secs);
    let mut interval = interval(period);
    // The first tick completes immediately; startup already swept
    interval.tick().await;

    info!(
        interval_secs = period.as_secs(),
        max_age_secs = max_age.as_secs(),
        "Staging janitor running"
    );

    loop {
        interval.tick().await;

        match sweep_staging(&staging_dir, Some(max_age)).await {
            Ok(0) => debug!("Staging sweep found nothing to remove"),
            Ok(removed) => info!(removed, "Staging sweep removed abandoned entries"),
            Err(e) => error!(error = %e, "Staging sweep failed"),
        }
    }
}

/// Remove staging entries older than `max_age`, or every entry when `None`.
/// Returns how many entries were removed.
pub async fn sweep_staging(staging_dir: &Path, max_age: Option<Duration>) -> AppResult<usize> {
    let mut entries = match fs::read_dir(staging_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let now = SystemTime::now();
    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        if sweep_entry(&entry.path(), now, max_age).await? {
            removed += 1;
        }
    }
    Ok(removed)
}

/// Remove one staging entry if it is old enough. An entry that vanished
/// during the scan is skipped.
async fn sweep_entry(path: &Path, now: SystemTime, max_age: Option<Duration>) -> AppResult<bool> {
    let metadata = match fs::symlink_metadata(path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    if let Some(max_age) = max_age {
        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if age < max_age {
            return Ok(false);
        }
    }

    let result = if metadata.is_dir() {
        fs::remove_dir_all(path).await
    } else {
        fs::remove_file(path).await
    };
    match result {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to remove staging entry");
            Ok(false)
        }
    }
}
