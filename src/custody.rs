//! # Chain of Custody
//!
//! After a pipeline run, records which files went in and came out, with their
//! SHA-256 digests and sizes, who ran it and where. Manifests are written to
//! `<data_dir>/custody/manifest_<YYYYmmdd_HHMMSS_micros>.json` and never
//! modified; a name that is already taken gets a numeric suffix.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use crate::LoganomResult;

/// Digest of one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDigest {
    pub path: PathBuf,
    pub sha256: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunEnvironment {
    pub hostname: String,
    pub platform: String,
    pub app_env: String,
    pub tz: String,
}

impl RunEnvironment {
    /// Describe the current host from the process environment.
    pub fn detect() -> Self {
        Self {
            hostname: hostname_string(),
            platform: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
            app_env: std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
            tz: std::env::var("TZ").unwrap_or_else(|_| "UTC".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub created_at: DateTime<Utc>,
    pub operator: String,
    pub env: RunEnvironment,
    pub inputs: Vec<FileDigest>,
    pub outputs: Vec<FileDigest>,
}

/// SHA-256 and size of a file, streamed in 64 KiB chunks.
pub fn digest_file(path: &Path) -> LoganomResult<FileDigest> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 65536];
    let mut size = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok(FileDigest {
        path: path.to_path_buf(),
        sha256: hex::encode(hasher.finalize()),
        size,
    })
}

/// Digest the files in `paths` that exist. Missing files are skipped with a
/// debug note.
fn digest_existing(paths: &[PathBuf]) -> LoganomResult<Vec<FileDigest>> {
    let mut digests = Vec::with_capacity(paths.len());
    for path in paths {
        if path.is_file() {
            digests.push(digest_file(path)?);
        } else {
            log::debug!("[CUSTODY] Not present, skipped: {}", path.display());
        }
    }
    Ok(digests)
}

impl Manifest {
    /// Build a manifest for the given input and output files.
    pub fn build(inputs: &[PathBuf], outputs: &[PathBuf]) -> LoganomResult<Self> {
        Ok(Self {
            created_at: Utc::now(),
            operator: std::env::var("OPERATOR_ID").unwrap_or_else(|_| "unknown".to_string()),
            env: RunEnvironment::detect(),
            inputs: digest_existing(inputs)?,
            outputs: digest_existing(outputs)?,
        })
    }

    /// Write the manifest under `<data_dir>/custody/` and return its path.
    /// An existing manifest is never overwritten.
    pub fn write(&self, data_dir: &Path) -> LoganomResult<PathBuf> {
        let dir = data_dir.join("custody");
        std::fs::create_dir_all(&dir)?;
        let stem = format!("manifest_{}", self.created_at.format("%Y%m%d_%H%M%S_%6f"));
        let body = serde_json::to_string_pretty(self)?;

        let mut attempt = 0u32;
        let (path, mut file) = loop {
            let name = if attempt == 0 {
                format!("{}.json", stem)
            } else {
                format!("{}_{}.json", stem, attempt)
            };
            let path = dir.join(name);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => break (path, file),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => attempt += 1,
                Err(e) => return Err(e.into()),
            }
        };
        file.write_all(body.as_bytes())?;
        file.flush()?;

        log::info!(
            "[CUSTODY] Manifest with {} inputs and {} outputs written to {}",
            self.inputs.len(),
            self.outputs.len(),
            path.display()
        );
        Ok(path)
    }
}

/// Get the system hostname as a string.
///
/// Uses environment variables for portability. Falls back to "unknown".
pub fn hostname_string() -> String {
    std::env::var("COMPUTERNAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .or_else(|_| std::env::var("HOST"))
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_known_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abc.txt");
        std::fs::write(&path, "abc").unwrap();
        let d = digest_file(&path).unwrap();
        assert_eq!(d.size, 3);
        assert_eq!(
            d.sha256,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_manifest_skips_missing_and_writes() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("in.jsonl");
        std::fs::write(&present, "{}\n").unwrap();

        let manifest = Manifest::build(&[present.clone(), dir.path().join("absent")], &[]).unwrap();
        assert_eq!(manifest.inputs.len(), 1);
        assert_eq!(manifest.inputs[0].path, present);
        assert!(manifest.outputs.is_empty());

        let path = manifest.write(dir.path()).unwrap();
        assert!(path.starts_with(dir.path().join("custody")));
        let loaded: Manifest = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded, manifest);
    }

    #[test]
    fn test_same_instant_manifests_do_not_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = Manifest::build(&[], &[]).unwrap();
        let first = manifest.write(dir.path()).unwrap();
        let second = manifest.write(dir.path()).unwrap();

        assert_ne!(first, second);
        assert!(first.exists() && second.exists());
        let names = std::fs::read_dir(dir.path().join("custody")).unwrap().count();
        assert_eq!(names, 2);
    }
}
