//! Mod manifest planning
//!
//! Compares a content-addressed manifest against the local mod directory
//! and produces a download plan for the `native`, `managed`, or `hybrid`
//! strategy. The planner is pure apart from reading local files to stat
//! and hash them.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModSyncError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Sync strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// The game's own downloader fetches everything
    Native,
    /// LANlink fetches everything
    Managed,
    /// Native dependencies first, LANlink for the rest
    Hybrid,
}

impl std::str::FromStr for SyncMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "native" => Ok(SyncMode::Native),
            "managed" => Ok(SyncMode::Managed),
            "hybrid" => Ok(SyncMode::Hybrid),
            other => Err(format!("unknown sync mode: {other}")),
        }
    }
}

/// Single artifact in a manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModArtifact {
    pub artifact_id: String,
    pub relative_path: String,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default)]
    pub source_urls: Vec<String>,
}

impl ModArtifact {
    /// Artifact IDs match case-insensitively.
    pub fn normalized_id(&self) -> String {
        self.artifact_id.trim().to_lowercase()
    }
}

/// Mod manifest shared by host and peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModManifest {
    pub game_id: String,
    pub version: String,
    pub artifacts: Vec<ModArtifact>,
}

impl ModManifest {
    /// Stable fingerprint: SHA-256 over the canonical JSON encoding.
    /// Going through `serde_json::Value` sorts object keys, so two
    /// manifests that are semantically identical fingerprint identically.
    pub fn fingerprint(&self) -> Result<String, ModSyncError> {
        let canonical = serde_json::to_string(&serde_json::to_value(self)?)?;
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        Ok(hex::encode(hasher.finalize()))
    }
}

/// Local artifact states, grouped
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalState {
    pub present: Vec<String>,
    pub missing: Vec<String>,
    pub corrupt: Vec<String>,
}

/// One artifact to download, with source URLs in priority order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadItem {
    pub artifact_id: String,
    pub relative_path: String,
    pub sha256: Option<String>,
    pub sources: Vec<String>,
}

/// Sync plan for one manifest against one mod root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPlan {
    pub mode: SyncMode,
    pub manifest_fingerprint: String,
    pub needed_artifacts: Vec<String>,
    pub native_provider: Option<String>,
    pub download_enabled: bool,
    pub ready: bool,
    pub next_step: String,
    pub downloads: Vec<DownloadItem>,
}

/// Streaming SHA-256 of a file.
pub fn compute_sha256(path: &Path) -> Result<String, ModSyncError> {
    let map_err = |source| ModSyncError::Io {
        path: path.display().to_string(),
        source,
    };
    let mut file = std::fs::File::open(path).map_err(map_err)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let read = file.read(&mut buf).map_err(map_err)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Plans mod synchronization.
pub struct SyncPlanner;

impl SyncPlanner {
    /// Classify each manifest artifact against the local tree.
    pub fn inspect_local_state(
        manifest: &ModManifest,
        mods_root: &Path,
    ) -> Result<LocalState, ModSyncError> {
        let mut state = LocalState::default();

        for artifact in &manifest.artifacts {
            let path = mods_root.join(&artifact.relative_path);
            let id = artifact.normalized_id();

            if !path.exists() {
                state.missing.push(id);
                continue;
            }

            if let Some(expected) = &artifact.sha256 {
                let local = compute_sha256(&path)?;
                if !local.eq_ignore_ascii_case(expected) {
                    state.corrupt.push(id);
                    continue;
                }
            }

            state.present.push(id);
        }

        Ok(state)
    }

    /// Build the sync plan for `mode`.
    pub fn build_plan(
        mode: SyncMode,
        manifest: &ModManifest,
        mods_root: &Path,
        native_provider: Option<&str>,
        peer_sources: &[String],
    ) -> Result<SyncPlan, ModSyncError> {
        let state = Self::inspect_local_state(manifest, mods_root)?;
        let mut needed: Vec<String> = state
            .missing
            .iter()
            .chain(state.corrupt.iter())
            .cloned()
            .collect();
        needed.sort();
        needed.dedup();

        let fingerprint = manifest.fingerprint()?;
        let ready = needed.is_empty();

        if mode == SyncMode::Native {
            return Ok(SyncPlan {
                mode,
                manifest_fingerprint: fingerprint,
                native_provider: native_provider.map(String::from),
                download_enabled: false,
                ready,
                next_step: if ready {
                    "No sync required.".to_string()
                } else {
                    "Use game-native mod downloader.".to_string()
                },
                needed_artifacts: needed,
                downloads: Vec::new(),
            });
        }

        let mut downloads = Vec::new();
        for artifact_id in &needed {
            let Some(artifact) = manifest
                .artifacts
                .iter()
                .find(|a| a.normalized_id() == *artifact_id)
            else {
                continue;
            };

            let mut sources = artifact.source_urls.clone();
            for base in peer_sources {
                let base = base.trim_end_matches('/');
                sources.push(format!("{base}/{}", artifact.relative_path));
            }

            downloads.push(DownloadItem {
                artifact_id: artifact_id.clone(),
                relative_path: artifact.relative_path.clone(),
                sha256: artifact.sha256.clone(),
                sources,
            });
        }

        let next_step = if ready {
            "No sync required.".to_string()
        } else if mode == SyncMode::Hybrid {
            "Resolve native dependencies, then download the rest.".to_string()
        } else {
            "Download missing and corrupt artifacts.".to_string()
        };

        Ok(SyncPlan {
            mode,
            manifest_fingerprint: fingerprint,
            native_provider: native_provider.map(String::from),
            download_enabled: true,
            ready,
            next_step,
            needed_artifacts: needed,
            downloads,
        })
    }
}
