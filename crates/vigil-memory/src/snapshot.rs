//! Best-effort point-in-time backups.
//!
//! [`SnapshotService::create`] copies a set of files and directories into a
//! uniquely named snapshot directory and writes an immutable
//! [`SnapshotManifest`] next to it.  Individual copy failures are logged and
//! skipped; the manifest's `copied_files` / `total_files` make a partial
//! snapshot auditable.  Only an uncreatable target directory (or an
//! unwritable manifest) aborts the snapshot.
//!
//! # Storage layout
//!
//! ```text
//! <root>/
//! ├── latest_snapshot.json           pointer to the newest snapshot
//! ├── metadata/<snapshot_id>.json    manifest, written once
//! └── snapshots/<snapshot_id>/files/ copied files, original paths mirrored
//! ```
//!
//! # Example
//!
//! ```rust
//! use vigil_memory::snapshot::{SnapshotRequest, SnapshotService};
//! use vigil_types::CapabilityTier;
//!
//! let work = tempfile::tempdir().unwrap();
//! std::fs::write(work.path().join("notes.txt"), "hello").unwrap();
//!
//! let service = SnapshotService::new(work.path().join("backups"), vec![], 10);
//! let outcome = service
//!     .create(SnapshotRequest {
//!         description: "before change".into(),
//!         tier: CapabilityTier::Tier3,
//!         operation_id: Some("op-1".into()),
//!         trust_score_before: 50.0,
//!         include_paths: Some(vec![work.path().join("notes.txt")]),
//!     })
//!     .unwrap();
//!
//! assert_eq!(outcome.manifest.copied_files, 1);
//! assert!(service.verify(&outcome.snapshot_id).unwrap().valid);
//! ```

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vigil_types::CapabilityTier;

use crate::atomic::{read_json, write_json_atomic};

const METADATA_DIR: &str = "metadata";
const SNAPSHOTS_DIR: &str = "snapshots";
const FILES_DIR: &str = "files";
const LATEST_FILE: &str = "latest_snapshot.json";

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that abort a snapshot operation.
#[derive(Error, Debug)]
pub enum SnapshotError {
    /// The snapshot target could not be created; nothing was captured.
    #[error("Snapshot target {path} could not be created: {source}")]
    Fatal {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Snapshot not found: {0}")]
    NotFound(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

// ─────────────────────────────────────────────────────────────────────────────
// Data types
// ─────────────────────────────────────────────────────────────────────────────

/// Parameters for [`SnapshotService::create`].
#[derive(Debug, Clone)]
pub struct SnapshotRequest {
    pub description: String,
    pub tier: CapabilityTier,
    pub operation_id: Option<String>,
    pub trust_score_before: f64,
    /// `None` uses the service's configured default paths.
    pub include_paths: Option<Vec<PathBuf>>,
}

/// Immutable description of one snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub snapshot_id: String,
    pub timestamp: DateTime<Utc>,
    pub description: String,
    pub tier: CapabilityTier,
    pub operation_id: Option<String>,
    pub trust_score_before: f64,
    pub included_paths: Vec<String>,
    pub total_files: usize,
    pub copied_files: usize,
    #[serde(default)]
    pub total_size_bytes: u64,
    /// Snapshot-relative file path → sha256 hex of the copied bytes.
    #[serde(default)]
    pub checksums: BTreeMap<String, String>,
}

/// A file that was discovered but not captured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub reason: String,
}

/// Result of a successful (possibly partial) [`SnapshotService::create`].
#[derive(Debug, Clone)]
pub struct SnapshotOutcome {
    pub snapshot_id: String,
    pub manifest: SnapshotManifest,
    pub skipped: Vec<SkippedFile>,
}

impl SnapshotOutcome {
    /// `true` when some discovered files could not be copied.
    pub fn is_partial(&self) -> bool {
        self.manifest.copied_files < self.manifest.total_files
    }
}

/// Details gathered by [`SnapshotService::verify`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerificationDetails {
    pub expected_files: usize,
    pub found_files: usize,
    pub missing_files: Vec<String>,
    pub checksum_mismatch: Vec<String>,
    pub total_size_bytes: u64,
}

/// Result of [`SnapshotService::verify`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotVerification {
    pub valid: bool,
    pub message: String,
    pub details: VerificationDetails,
}

/// Contents of `latest_snapshot.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatestSnapshot {
    pub snapshot_id: String,
    pub timestamp: DateTime<Utc>,
    pub description: String,
    pub tier: CapabilityTier,
    pub metadata_file: String,
    pub snapshot_path: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// SnapshotService
// ─────────────────────────────────────────────────────────────────────────────

/// Creates, verifies, lists and prunes snapshots under a root directory.
#[derive(Debug, Clone)]
pub struct SnapshotService {
    root: PathBuf,
    default_paths: Vec<PathBuf>,
    max_snapshots: usize,
}

impl SnapshotService {
    /// `max_snapshots == 0` disables pruning.
    pub fn new(root: impl Into<PathBuf>, default_paths: Vec<PathBuf>, max_snapshots: usize) -> Self {
        Self {
            root: root.into(),
            default_paths,
            max_snapshots,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn metadata_path(&self, snapshot_id: &str) -> PathBuf {
        self.root
            .join(METADATA_DIR)
            .join(format!("{snapshot_id}.json"))
    }

    fn data_dir(&self, snapshot_id: &str) -> PathBuf {
        self.root.join(SNAPSHOTS_DIR).join(snapshot_id)
    }

    /// Capture the requested paths.
    ///
    /// # Errors
    ///
    /// [`SnapshotError::Fatal`] when the snapshot directory or its manifest
    /// cannot be written.  Per-file failures are reported in
    /// [`SnapshotOutcome::skipped`] instead.
    pub fn create(&self, request: SnapshotRequest) -> Result<SnapshotOutcome, SnapshotError> {
        let snapshot_id = generate_snapshot_id(&request.description);
        let files_root = self.data_dir(&snapshot_id).join(FILES_DIR);
        fs::create_dir_all(&files_root).map_err(|source| SnapshotError::Fatal {
            path: files_root.clone(),
            source,
        })?;
        let own_root = fs::canonicalize(&self.root).unwrap_or_else(|_| self.root.clone());

        let include_paths = request
            .include_paths
            .clone()
            .unwrap_or_else(|| self.default_paths.clone());

        let mut walk = FileWalk::new(&own_root);
        for path in &include_paths {
            walk.visit(path);
        }
        let FileWalk {
            files: sources,
            mut skipped,
            ..
        } = walk;

        let mut checksums = BTreeMap::new();
        let mut total_size_bytes = 0u64;
        for source in &sources {
            let relative = mirrored_path(source);
            // Manifest keys are JSON strings; a lossy key would not round-trip.
            let Some(key) = relative_key(&relative) else {
                warn!(file = %source.display(), "snapshot path is not valid UTF-8; skipping file");
                skipped.push(SkippedFile {
                    path: source.clone(),
                    reason: "file name is not valid UTF-8".into(),
                });
                continue;
            };
            let dest = files_root.join(&relative);
            match copy_with_checksum(source, &dest) {
                Ok((size, digest)) => {
                    total_size_bytes += size;
                    checksums.insert(key, digest);
                }
                Err(e) => {
                    warn!(file = %source.display(), error = %e, "snapshot copy failed; skipping file");
                    skipped.push(SkippedFile {
                        path: source.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        let manifest = SnapshotManifest {
            snapshot_id: snapshot_id.clone(),
            timestamp: Utc::now(),
            description: request.description,
            tier: request.tier,
            operation_id: request.operation_id,
            trust_score_before: request.trust_score_before,
            included_paths: include_paths
                .iter()
                .map(|p| p.display().to_string())
                .collect(),
            total_files: checksums.len() + skipped.len(),
            copied_files: checksums.len(),
            total_size_bytes,
            checksums,
        };

        let metadata_path = self.metadata_path(&snapshot_id);
        write_json_atomic(&metadata_path, &manifest).map_err(|source| SnapshotError::Fatal {
            path: metadata_path.clone(),
            source,
        })?;

        if let Err(e) = self.write_latest(&manifest) {
            warn!(snapshot_id = %snapshot_id, error = %e, "failed to update latest snapshot pointer");
        }

        if skipped.is_empty() {
            info!(snapshot_id = %snapshot_id, files = manifest.copied_files, "snapshot created");
        } else {
            warn!(
                snapshot_id = %snapshot_id,
                copied = manifest.copied_files,
                total = manifest.total_files,
                "snapshot created with skipped files"
            );
        }

        self.prune();

        Ok(SnapshotOutcome {
            snapshot_id,
            manifest,
            skipped,
        })
    }

    /// Recompute file counts and checksums against the manifest.
    pub fn verify(&self, snapshot_id: &str) -> Result<SnapshotVerification, SnapshotError> {
        let manifest = self
            .manifest(snapshot_id)?
            .ok_or_else(|| SnapshotError::NotFound(snapshot_id.to_string()))?;

        let files_root = self.data_dir(snapshot_id).join(FILES_DIR);
        let mut details = VerificationDetails {
            expected_files: manifest.copied_files,
            total_size_bytes: manifest.total_size_bytes,
            ..Default::default()
        };

        if !files_root.is_dir() {
            details.missing_files = manifest.checksums.keys().cloned().collect();
            return Ok(SnapshotVerification {
                valid: false,
                message: "snapshot data directory is missing".to_string(),
                details,
            });
        }

        for (relative, expected) in &manifest.checksums {
            let file = files_root.join(relative);
            match sha256_file(&file) {
                Ok(actual) => {
                    details.found_files += 1;
                    if &actual != expected {
                        details.checksum_mismatch.push(relative.clone());
                    }
                }
                Err(_) => details.missing_files.push(relative.clone()),
            }
        }

        let valid = details.missing_files.is_empty()
            && details.checksum_mismatch.is_empty()
            && details.found_files == manifest.copied_files;
        let message = if valid {
            format!("snapshot intact ({} files)", details.found_files)
        } else {
            format!(
                "snapshot incomplete: {} missing, {} modified",
                details.missing_files.len(),
                details.checksum_mismatch.len()
            )
        };
        Ok(SnapshotVerification {
            valid,
            message,
            details,
        })
    }

    /// Load the manifest for `snapshot_id`, or `None` when it does not exist.
    pub fn manifest(&self, snapshot_id: &str) -> Result<Option<SnapshotManifest>, SnapshotError> {
        Ok(read_json(&self.metadata_path(snapshot_id))?)
    }

    /// The current `latest_snapshot.json` pointer, if any.
    pub fn latest(&self) -> Result<Option<LatestSnapshot>, SnapshotError> {
        Ok(read_json(&self.root.join(LATEST_FILE))?)
    }

    /// All readable manifests, newest first.
    pub fn list(&self) -> Result<Vec<SnapshotManifest>, SnapshotError> {
        let dir = self.root.join(METADATA_DIR);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut manifests = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_json::<SnapshotManifest>(&path) {
                Ok(Some(m)) => manifests.push(m),
                Ok(None) => {}
                Err(e) => warn!(file = %path.display(), error = %e, "unreadable snapshot manifest"),
            }
        }
        manifests.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| b.snapshot_id.cmp(&a.snapshot_id))
        });
        Ok(manifests)
    }

    /// Remove a snapshot's data and manifest.  The latest pointer is moved to
    /// the newest remaining snapshot (or removed).
    pub fn delete(&self, snapshot_id: &str) -> Result<(), SnapshotError> {
        let metadata = self.metadata_path(snapshot_id);
        let data = self.data_dir(snapshot_id);
        if !metadata.exists() && !data.exists() {
            return Err(SnapshotError::NotFound(snapshot_id.to_string()));
        }
        if metadata.exists() {
            fs::remove_file(&metadata)?;
        }
        if data.exists() {
            fs::remove_dir_all(&data)?;
        }

        let pointed_here = self
            .latest()
            .ok()
            .flatten()
            .is_some_and(|l| l.snapshot_id == snapshot_id);
        if pointed_here {
            match self.list()?.first() {
                Some(newest) => self.write_latest(newest)?,
                None => {
                    let _ = fs::remove_file(self.root.join(LATEST_FILE));
                }
            }
        }
        info!(snapshot_id = %snapshot_id, "snapshot deleted");
        Ok(())
    }

    /// Copy a snapshot's files into `target`, preserving the mirrored layout.
    /// Returns the number of files restored.
    pub fn restore_to(&self, snapshot_id: &str, target: &Path) -> Result<usize, SnapshotError> {
        let manifest = self
            .manifest(snapshot_id)?
            .ok_or_else(|| SnapshotError::NotFound(snapshot_id.to_string()))?;
        let files_root = self.data_dir(snapshot_id).join(FILES_DIR);
        let mut restored = 0;
        for relative in manifest.checksums.keys() {
            let dest = target.join(relative);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(files_root.join(relative), &dest)?;
            restored += 1;
        }
        info!(snapshot_id = %snapshot_id, target = %target.display(), restored, "snapshot restored");
        Ok(restored)
    }

    fn write_latest(&self, manifest: &SnapshotManifest) -> io::Result<()> {
        let latest = LatestSnapshot {
            snapshot_id: manifest.snapshot_id.clone(),
            timestamp: manifest.timestamp,
            description: manifest.description.clone(),
            tier: manifest.tier,
            metadata_file: format!("{METADATA_DIR}/{}.json", manifest.snapshot_id),
            snapshot_path: format!("{SNAPSHOTS_DIR}/{}", manifest.snapshot_id),
        };
        write_json_atomic(&self.root.join(LATEST_FILE), &latest)
    }

    fn prune(&self) {
        if self.max_snapshots == 0 {
            return;
        }
        let manifests = match self.list() {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "could not list snapshots for pruning");
                return;
            }
        };
        for old in manifests.iter().skip(self.max_snapshots) {
            if let Err(e) = self.delete(&old.snapshot_id) {
                warn!(snapshot_id = %old.snapshot_id, error = %e, "failed to prune old snapshot");
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn generate_snapshot_id(description: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(description.as_bytes());
    hasher.update(Uuid::new_v4().as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!(
        "snapshot_{}_{}",
        Utc::now().format("%Y%m%d_%H%M%S"),
        &digest[..8]
    )
}

/// Collects regular files under the include paths.  Anything unreadable is
/// recorded as skipped.  Files inside the snapshot root itself are ignored,
/// and each directory is entered at most once so symlink cycles terminate.
struct FileWalk<'a> {
    own_root: &'a Path,
    visited_dirs: HashSet<PathBuf>,
    files: Vec<PathBuf>,
    skipped: Vec<SkippedFile>,
}

impl<'a> FileWalk<'a> {
    fn new(own_root: &'a Path) -> Self {
        Self {
            own_root,
            visited_dirs: HashSet::new(),
            files: Vec::new(),
            skipped: Vec::new(),
        }
    }

    fn skip(&mut self, path: &Path, reason: String) {
        self.skipped.push(SkippedFile {
            path: path.to_path_buf(),
            reason,
        });
    }

    fn visit(&mut self, path: &Path) {
        let canonical = match fs::canonicalize(path) {
            Ok(c) => c,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "snapshot path unavailable; skipping");
                self.skip(path, e.to_string());
                return;
            }
        };
        if canonical.starts_with(self.own_root) {
            return;
        }
        if canonical.is_file() {
            self.files.push(path.to_path_buf());
            return;
        }
        if !self.visited_dirs.insert(canonical) {
            debug!(path = %path.display(), "directory already walked; not following again");
            return;
        }
        let entries = match fs::read_dir(path) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read directory; skipping");
                self.skip(path, e.to_string());
                return;
            }
        };
        let mut children: Vec<PathBuf> = entries.filter_map(|e| e.ok().map(|e| e.path())).collect();
        children.sort();
        for child in children {
            self.visit(&child);
        }
    }
}

/// Map an arbitrary source path to a relative path inside the snapshot by
/// dropping root/prefix components and neutralising `..`.
fn mirrored_path(source: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in source.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::ParentDir => out.push("__up"),
            Component::RootDir | Component::Prefix(_) | Component::CurDir => {}
        }
    }
    out
}

/// `None` when any component is not valid UTF-8.
fn relative_key(relative: &Path) -> Option<String> {
    let parts = relative
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<Vec<_>>>()?;
    Some(parts.join("/"))
}

fn copy_with_checksum(source: &Path, dest: &Path) -> io::Result<(u64, String)> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let size = fs::copy(source, dest)?;
    Ok((size, sha256_file(dest)?))
}

fn sha256_file(path: &Path) -> io::Result<String> {
    let bytes = fs::read(path)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}
