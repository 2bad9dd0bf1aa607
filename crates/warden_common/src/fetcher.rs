//! Step definition fetcher
//!
//! Step bodies live at a remote locator and are cached under
//! `<state_dir>/cache/<step>.toml`. A cached body is only replaced when its
//! SHA-256 fingerprint differs from the remote one. There is no fallback to a
//! cached copy when the remote cannot be reached: running a possibly
//! superseded body is worse than stopping.

use crate::fs_util::atomic_write;
use crate::paths::StatePaths;
use crate::step::StepSpec;
use sha2::{Digest, Sha256};
use std::cell::RefCell;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Hex SHA-256 of a step body
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(bytes: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(bytes)))
    }

    /// Parse a published fingerprint (`sha256sum` output is accepted)
    pub fn parse(text: &str) -> Option<Self> {
        let token = text.split_whitespace().next()?.to_ascii_lowercase();
        if token.len() == 64 && token.chars().all(|c| c.is_ascii_hexdigit()) {
            Some(Self(token))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("could not reach {locator}: {message}")]
    Remote { locator: String, message: String },

    #[error("{locator} returned HTTP {status}")]
    Status { locator: String, status: u16 },

    #[error("unsupported step locator {0:?}")]
    UnsupportedLocator(String),

    #[error("{locator} advertised fingerprint {expected} but served {actual}")]
    FingerprintMismatch {
        locator: String,
        expected: Fingerprint,
        actual: Fingerprint,
    },

    #[error("step body from {0} is not UTF-8")]
    NotUtf8(String),

    #[error("step cache {}: {source}", .path.display())]
    Cache {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Where step bodies come from
pub trait StepSource {
    /// Fingerprint of the current remote body
    fn fingerprint(&self, locator: &str) -> Result<Fingerprint, FetchError>;

    /// Full remote body
    fn download(&self, locator: &str) -> Result<Vec<u8>, FetchError>;
}

/// HTTP(S) source; fingerprints come from a `<locator>.sha256` sidecar
///
/// When no sidecar is published the body itself is downloaded and hashed,
/// and that download is reused by the following `download` call.
pub struct HttpStepSource {
    client: reqwest::blocking::Client,
    memo: RefCell<Option<(String, Vec<u8>)>>,
}

impl HttpStepSource {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("warden/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::Remote {
                locator: String::new(),
                message: e.to_string(),
            })?;
        Ok(Self {
            client,
            memo: RefCell::new(None),
        })
    }

    fn get(&self, url: &str) -> Result<reqwest::blocking::Response, FetchError> {
        self.client.get(url).send().map_err(|e| FetchError::Remote {
            locator: url.to_string(),
            message: e.to_string(),
        })
    }

    fn get_body(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self.get(url)?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                locator: url.to_string(),
                status: status.as_u16(),
            });
        }
        response
            .bytes()
            .map(|b| b.to_vec())
            .map_err(|e| FetchError::Remote {
                locator: url.to_string(),
                message: e.to_string(),
            })
    }
}

impl StepSource for HttpStepSource {
    fn fingerprint(&self, locator: &str) -> Result<Fingerprint, FetchError> {
        self.memo.borrow_mut().take();
        let sidecar = format!("{}.sha256", locator);
        let response = self.get(&sidecar)?;
        if response.status().is_success() {
            let text = response.text().map_err(|e| FetchError::Remote {
                locator: sidecar.clone(),
                message: e.to_string(),
            })?;
            if let Some(fp) = Fingerprint::parse(&text) {
                return Ok(fp);
            }
            debug!(locator = %sidecar, "sidecar is not a fingerprint, hashing body");
        }

        let body = self.get_body(locator)?;
        let fp = Fingerprint::of(&body);
        *self.memo.borrow_mut() = Some((locator.to_string(), body));
        Ok(fp)
    }

    fn download(&self, locator: &str) -> Result<Vec<u8>, FetchError> {
        let memo = self.memo.borrow_mut().take();
        if let Some((memo_locator, body)) = memo {
            if memo_locator == locator {
                return Ok(body);
            }
        }
        self.get_body(locator)
    }
}

/// Local files: `file://` URLs or absolute paths (offline installs)
#[derive(Debug, Default, Clone)]
pub struct FileStepSource;

impl FileStepSource {
    fn path(locator: &str) -> PathBuf {
        PathBuf::from(locator.strip_prefix("file://").unwrap_or(locator))
    }
}

impl StepSource for FileStepSource {
    fn fingerprint(&self, locator: &str) -> Result<Fingerprint, FetchError> {
        self.download(locator).map(|body| Fingerprint::of(&body))
    }

    fn download(&self, locator: &str) -> Result<Vec<u8>, FetchError> {
        fs::read(Self::path(locator)).map_err(|e| FetchError::Remote {
            locator: locator.to_string(),
            message: e.to_string(),
        })
    }
}

/// Dispatches on locator scheme
pub struct DefaultStepSource {
    http: HttpStepSource,
    file: FileStepSource,
}

impl DefaultStepSource {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        Ok(Self {
            http: HttpStepSource::new(timeout)?,
            file: FileStepSource,
        })
    }

    fn route(&self, locator: &str) -> Result<&dyn StepSource, FetchError> {
        if locator.starts_with("http://") || locator.starts_with("https://") {
            Ok(&self.http)
        } else if locator.starts_with("file://") || Path::new(locator).is_absolute() {
            Ok(&self.file)
        } else {
            Err(FetchError::UnsupportedLocator(locator.to_string()))
        }
    }
}

impl StepSource for DefaultStepSource {
    fn fingerprint(&self, locator: &str) -> Result<Fingerprint, FetchError> {
        self.route(locator)?.fingerprint(locator)
    }

    fn download(&self, locator: &str) -> Result<Vec<u8>, FetchError> {
        self.route(locator)?.download(locator)
    }
}

/// A body ready to parse
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedBody {
    pub text: String,
    pub fingerprint: Fingerprint,
    /// True when the cache was (re)written by this fetch
    pub refreshed: bool,
}

pub struct StepFetcher<S> {
    source: S,
    paths: StatePaths,
}

impl<S: StepSource> StepFetcher<S> {
    pub fn new(source: S, paths: StatePaths) -> Self {
        Self { source, paths }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Return the current body for `step`, refreshing the cache on change
    pub fn fetch(&self, step: &StepSpec) -> Result<FetchedBody, FetchError> {
        let cache_path = self.paths.cached_body(&step.name);

        if let Some(cached) = read_cache(&cache_path)? {
            let local = Fingerprint::of(&cached);
            let remote = self.source.fingerprint(&step.locator)?;
            if local == remote {
                debug!(step = %step.name, fingerprint = local.short(), "cached body is current");
                return Ok(FetchedBody {
                    text: into_text(cached, &step.locator)?,
                    fingerprint: local,
                    refreshed: false,
                });
            }
            info!(
                step = %step.name,
                cached = local.short(),
                remote = remote.short(),
                "step body changed, refreshing cache"
            );
            return self.download_into_cache(step, &cache_path, Some(remote));
        }

        info!(step = %step.name, locator = %step.locator, "fetching step body");
        self.download_into_cache(step, &cache_path, None)
    }

    fn download_into_cache(
        &self,
        step: &StepSpec,
        cache_path: &Path,
        expected: Option<Fingerprint>,
    ) -> Result<FetchedBody, FetchError> {
        let body = self.source.download(&step.locator)?;
        let actual = Fingerprint::of(&body);
        if let Some(expected) = expected {
            if expected != actual {
                return Err(FetchError::FingerprintMismatch {
                    locator: step.locator.clone(),
                    expected,
                    actual,
                });
            }
        }

        atomic_write(cache_path, &body).map_err(|source| FetchError::Cache {
            path: cache_path.to_path_buf(),
            source,
        })?;

        Ok(FetchedBody {
            text: into_text(body, &step.locator)?,
            fingerprint: actual,
            refreshed: true,
        })
    }
}

fn read_cache(path: &Path) -> Result<Option<Vec<u8>>, FetchError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(FetchError::Cache {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn into_text(bytes: Vec<u8>, locator: &str) -> Result<String, FetchError> {
    String::from_utf8(bytes).map_err(|_| FetchError::NotUtf8(locator.to_string()))
}
