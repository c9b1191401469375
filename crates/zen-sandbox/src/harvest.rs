//! Artifact harvesting
//!
//! After a run - succeeded, failed or timed out alike - every file the
//! snippet wrote into its scratch directory is copied out for the caller,
//! and the whole scratch tree is archived for post-hoc inspection.
//! Harvesting is best-effort: an unreadable file becomes a warning on the
//! report, never an execution failure.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::session::ExecutionSession;

/// What harvesting produced.
#[derive(Debug, Default)]
pub struct HarvestReport {
    /// Copies of snippet-created files, under `<output_dir>/<session id>/`.
    pub artifacts: Vec<PathBuf>,
    /// Compressed archive of the full scratch tree, when archiving worked.
    pub archive: Option<PathBuf>,
    /// Non-fatal problems hit along the way.
    pub warnings: Vec<String>,
}

/// Copy snippet-created files out of the scratch directory and archive the
/// whole tree. Input files staged from the request are not treated as
/// artifacts, but they do appear in the archive - debugging a failed run
/// requires seeing everything the code had and wrote.
pub async fn harvest(
    session: &ExecutionSession,
    output_dir: &Path,
    archive_dir: &Path,
) -> HarvestReport {
    let mut report = HarvestReport::default();

    let mut files = Vec::new();
    collect_files(&session.scratch, Path::new(""), &mut files, &mut report.warnings);

    let session_out = output_dir.join(&session.id);
    for rel in files {
        if session.inputs().contains(&rel) {
            continue;
        }
        match copy_artifact(&session.scratch, &rel, &session_out) {
            Ok(dest) => report.artifacts.push(dest),
            Err(e) => report
                .warnings
                .push(format!("failed to copy artifact {}: {e}", rel.display())),
        }
    }

    match archive_scratch(&session.scratch, &session.id, archive_dir).await {
        Ok(path) => report.archive = Some(path),
        Err(e) => report.warnings.push(format!("workspace archive failed: {e}")),
    }

    debug!(
        session = %session.id,
        artifacts = report.artifacts.len(),
        warnings = report.warnings.len(),
        "harvest complete"
    );
    report
}

/// Recursive scratch walk, collecting scratch-relative file paths.
fn collect_files(base: &Path, rel: &Path, out: &mut Vec<PathBuf>, warnings: &mut Vec<String>) {
    let dir = base.join(rel);
    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) => {
            warnings.push(format!("failed to read {}: {e}", dir.display()));
            return;
        }
    };
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warnings.push(format!("failed to read entry in {}: {e}", dir.display()));
                continue;
            }
        };
        let child_rel = rel.join(entry.file_name());
        match entry.file_type() {
            Ok(ft) if ft.is_dir() => collect_files(base, &child_rel, out, warnings),
            Ok(ft) if ft.is_file() => out.push(child_rel),
            // Symlinks and specials stay out of the artifact set; they still
            // end up in the archive.
            Ok(_) => {}
            Err(e) => warnings.push(format!("failed to stat {}: {e}", child_rel.display())),
        }
    }
}

/// Copy one artifact, preserving its relative path and renaming on
/// collision instead of overwriting.
fn copy_artifact(scratch: &Path, rel: &Path, session_out: &Path) -> std::io::Result<PathBuf> {
    let src = scratch.join(rel);
    let dest = session_out.join(rel);
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let dest = dedup_path(dest);
    std::fs::copy(&src, &dest)?;
    Ok(dest)
}

/// First free variant of `path`: `name.ext`, `name-1.ext`, `name-2.ext`, ...
fn dedup_path(path: PathBuf) -> PathBuf {
    if !path.exists() {
        return path;
    }
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path.extension().map(|e| e.to_string_lossy().into_owned());
    let parent = path.parent().map(Path::to_path_buf).unwrap_or_default();
    for n in 1.. {
        let name = match &ext {
            Some(ext) => format!("{stem}-{n}.{ext}"),
            None => format!("{stem}-{n}"),
        };
        let candidate = parent.join(name);
        if !candidate.exists() {
            return candidate;
        }
    }
    unreachable!()
}

/// Archive the scratch tree as `<archive_dir>/<session id>.tar.gz` by
/// driving the `tar` binary, same external-CLI discipline as the container
/// backend.
async fn archive_scratch(
    scratch: &Path,
    session_id: &str,
    archive_dir: &Path,
) -> Result<PathBuf, String> {
    std::fs::create_dir_all(archive_dir).map_err(|e| e.to_string())?;
    let archive = archive_dir.join(format!("{session_id}.tar.gz"));
    let output = Command::new("tar")
        .arg("-czf")
        .arg(&archive)
        .arg("-C")
        .arg(scratch)
        .arg(".")
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| format!("tar did not run: {e}"))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!(session = %session_id, stderr = %stderr.trim(), "tar failed");
        return Err(format!("tar exited with {}: {}", output.status, stderr.trim()));
    }
    Ok(archive)
}
