use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::runtime::normalize_for_display;

const HASH_BUFFER_BYTES: usize = 64 * 1024;

/// Append-only `<sha256> *<relative path>` list of downloaded files.
#[derive(Debug, Clone)]
pub struct ChecksumManifest {
    path: PathBuf,
    download_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub hash: String,
    pub relative_path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyReport {
    pub ok: usize,
    pub mismatched: Vec<String>,
    pub missing: Vec<String>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.mismatched.is_empty() && self.missing.is_empty()
    }
}

impl ChecksumManifest {
    pub fn new(path: &Path, download_dir: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            download_dir: download_dir.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Hash `file` and append it to the manifest.
    pub fn record(&self, file: &Path) -> Result<ManifestEntry> {
        let relative = file.strip_prefix(&self.download_dir).with_context(|| {
            format!(
                "{} is outside the download directory {}",
                file.display(),
                self.download_dir.display()
            )
        })?;
        let entry = ManifestEntry {
            hash: hash_file(file)?,
            relative_path: normalize_for_display(relative),
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut manifest = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        writeln!(manifest, "{} *{}", entry.hash, entry.relative_path)
            .with_context(|| format!("failed to append to {}", self.path.display()))?;
        debug!("checksum {} {}", entry.hash, entry.relative_path);
        Ok(entry)
    }
}

pub fn hash_file(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER_BYTES];
    loop {
        let read = file
            .read(&mut buffer)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    let digest = hasher.finalize();
    let mut output = String::with_capacity(64);
    for byte in digest.iter() {
        output.push_str(&format!("{byte:02x}"));
    }
    Ok(output)
}

pub fn read_manifest(path: &Path) -> Result<Vec<ManifestEntry>> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut entries = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("failed to read {}", path.display()))?;
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        let Some((hash, relative_path)) = line.split_once(" *") else {
            bail!("malformed checksum line {} in {}", index + 1, path.display());
        };
        entries.push(ManifestEntry {
            hash: hash.to_ascii_lowercase(),
            relative_path: relative_path.replace('\\', "/"),
        });
    }
    Ok(entries)
}

/// Re-hash every file listed in the manifest.
///
/// When a file was recorded more than once, its last entry wins.
pub fn verify_manifest(download_dir: &Path, manifest_path: &Path) -> Result<VerifyReport> {
    let mut latest: Vec<ManifestEntry> = Vec::new();
    for entry in read_manifest(manifest_path)? {
        latest.retain(|existing| existing.relative_path != entry.relative_path);
        latest.push(entry);
    }

    let mut report = VerifyReport::default();
    for entry in latest {
        let file = download_dir.join(&entry.relative_path);
        if !file.is_file() {
            warn!("missing archived file {}", entry.relative_path);
            report.missing.push(entry.relative_path);
            continue;
        }
        if hash_file(&file)? == entry.hash {
            report.ok += 1;
        } else {
            warn!("checksum mismatch for {}", entry.relative_path);
            report.mismatched.push(entry.relative_path);
        }
    }
    Ok(report)
}
