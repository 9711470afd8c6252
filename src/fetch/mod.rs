// src/fetch/mod.rs

//! Fetch and verify formula sources
//!
//! The install transaction only needs "a local source tree or an error".
//! [`ArchiveFetcher`] is the default: it downloads over HTTP(S) or reads
//! `file://` URLs and bare paths, checks the SHA-256 declared by the
//! formula, and unpacks the result into the transaction's work directory.
//! Downloads are cached under the state directory, keyed by formula and
//! file name, and reused only while their checksum still matches.

mod archive;

pub use archive::ArchiveFormat;

use crate::error::{Error, Result};
use crate::formula::{Formula, Source};
use reqwest::blocking::Client;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default timeout for HTTP requests
const HTTP_TIMEOUT: Duration = Duration::from_secs(300);

/// Maximum attempts for a failed download
const MAX_RETRIES: u32 = 3;

/// Base delay between download attempts
const RETRY_DELAY_MS: u64 = 1000;

/// Supplies the source tree for a formula
pub trait SourceFetcher: Send + Sync {
    /// Produce the unpacked sources of `formula` somewhere under `work_dir`
    /// and return the directory the build should run in
    fn fetch(&self, formula: &Formula, work_dir: &Path) -> Result<PathBuf>;
}

/// Fetches tarballs and single files, with a download cache
pub struct ArchiveFetcher {
    client: Client,
    cache_dir: PathBuf,
    max_retries: u32,
}

impl ArchiveFetcher {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Result<Self> {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .user_agent(concat!("brewer/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::InitError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            cache_dir: cache_dir.into(),
            max_retries: MAX_RETRIES,
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Local file holding the source bytes, downloading into the cache when needed
    fn obtain(&self, formula: &Formula, source: &Source) -> Result<PathBuf> {
        if let Some(path) = local_path(&source.url) {
            if !path.is_file() {
                return Err(fetch_error(
                    formula,
                    format!("{} does not exist", path.display()),
                ));
            }
            return Ok(path);
        }

        let file_name = file_name(&source.url);
        fs::create_dir_all(&self.cache_dir)?;
        let cached = self
            .cache_dir
            .join(format!("{}-{}-{}", formula.name(), formula.version(), file_name));

        if cached.is_file() {
            match &source.sha256 {
                Some(expected) if &sha256_file(&cached)? == expected => {
                    debug!("Using cached source {}", cached.display());
                    return Ok(cached);
                }
                Some(_) => {
                    warn!("Cached {} has a stale checksum, re-downloading", cached.display());
                    fs::remove_file(&cached)?;
                }
                // Without a checksum a cached copy cannot be trusted
                None => fs::remove_file(&cached)?,
            }
        }

        self.download(formula, &source.url, &cached)?;
        Ok(cached)
    }

    fn download(&self, formula: &Formula, url: &str, dest: &Path) -> Result<()> {
        info!("Downloading {}", url);
        let temp_path = dest.with_extension("part");

        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self
                .client
                .get(url)
                .send()
                .and_then(|response| response.error_for_status());

            match result {
                Ok(mut response) => {
                    let mut file = File::create(&temp_path)?;
                    if let Err(e) = io::copy(&mut response, &mut file) {
                        let _ = fs::remove_file(&temp_path);
                        return Err(fetch_error(formula, format!("reading {}: {}", url, e)));
                    }
                    fs::rename(&temp_path, dest)?;
                    debug!("Downloaded {} to {}", url, dest.display());
                    return Ok(());
                }
                Err(e) if e.status().is_some_and(|s| s.is_client_error()) => {
                    return Err(fetch_error(formula, format!("{}: {}", url, e)));
                }
                Err(e) => {
                    if attempt >= self.max_retries {
                        return Err(fetch_error(
                            formula,
                            format!("giving up after {} attempts: {}", attempt, e),
                        ));
                    }
                    warn!("Download attempt {} failed: {}, retrying...", attempt, e);
                    std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS * attempt as u64));
                }
            }
        }
    }
}

impl SourceFetcher for ArchiveFetcher {
    fn fetch(&self, formula: &Formula, work_dir: &Path) -> Result<PathBuf> {
        let source_dir = work_dir.join("source");

        let Some(source) = formula.source() else {
            debug!("{} has no source; building in an empty directory", formula);
            fs::create_dir_all(&source_dir)?;
            return Ok(source_dir);
        };

        let path = self.obtain(formula, source)?;

        match &source.sha256 {
            Some(expected) => verify_checksum(formula, &path, expected)?,
            None => warn!("{} declares no sha256; skipping verification", formula),
        }

        archive::unpack(&path, &file_name(&source.url), &source_dir)
            .map_err(|e| fetch_error(formula, format!("unpacking {}: {}", path.display(), e)))
    }
}

/// Reject `path` unless its SHA-256 equals `expected`
pub fn verify_checksum(formula: &Formula, path: &Path, expected: &str) -> Result<()> {
    let actual = sha256_file(path)?;
    if !actual.eq_ignore_ascii_case(expected) {
        return Err(Error::ChecksumMismatch {
            formula: formula.name().to_string(),
            expected: expected.to_string(),
            actual,
        });
    }
    debug!("Checksum verified for {}: {}", formula, actual);
    Ok(())
}

/// Hex SHA-256 of a file's contents
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// `file://` URLs and scheme-less strings name local files
fn local_path(url: &str) -> Option<PathBuf> {
    if let Some(path) = url.strip_prefix("file://") {
        return Some(PathBuf::from(path));
    }
    if url.contains("://") {
        None
    } else {
        Some(PathBuf::from(url))
    }
}

/// Last path segment of a URL, without query or fragment
fn file_name(url: &str) -> String {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    without_query
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .unwrap_or("source")
        .to_string()
}

fn fetch_error(formula: &Formula, reason: impl Into<String>) -> Error {
    Error::Fetch {
        formula: formula.name().to_string(),
        reason: reason.into(),
    }
}
