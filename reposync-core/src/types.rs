//! Domain types for the reposync registry.
//!
//! All path fields use `PathBuf`; never `&str` or `String` for filesystem paths.
//! Everything that reaches the registry file is serializable via serde + serde_json.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use url::Url;

use crate::error::ValidationError;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// A strongly-typed name for a tracked directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DirectoryName(pub String);

impl fmt::Display for DirectoryName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for DirectoryName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for DirectoryName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Version
// ---------------------------------------------------------------------------

/// Registry format version, `MAJOR.MINOR.PATCH`.
///
/// Ordering is numeric field by field (`1.10.0 > 1.9.3`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Version {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

/// Format version written by this build.
pub const CURRENT_VERSION: Version = Version::new(1, 0, 0);

impl Default for Version {
    fn default() -> Self {
        CURRENT_VERSION
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ValidationError::InvalidVersion(s.to_owned());
        let mut parts = s.split('.');
        let mut next = || -> Result<u64, ValidationError> {
            let part = parts.next().ok_or_else(invalid)?;
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            part.parse().map_err(|_| invalid())
        };
        let version = Version::new(next()?, next()?, next()?);
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(version)
    }
}

impl TryFrom<String> for Version {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Version> for String {
    fn from(v: Version) -> Self {
        v.to_string()
    }
}

// ---------------------------------------------------------------------------
// TrackedDirectory
// ---------------------------------------------------------------------------

/// A directory under daemon management.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedDirectory {
    pub name: DirectoryName,
    /// Canonical absolute path.
    pub path: PathBuf,
    /// Time of the last successful sync.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_timestamp"
    )]
    pub last_save_time: Option<DateTime<Utc>>,
}

impl TrackedDirectory {
    /// Validate and build a directory entry.
    ///
    /// `path` must exist and be a directory; it is canonicalized before
    /// storage. When `name` is `None` it is derived from the final segment of
    /// the canonical path.
    pub fn create(name: Option<&str>, path: impl AsRef<Path>) -> Result<Self, ValidationError> {
        let path = path.as_ref();
        let meta = std::fs::metadata(path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                ValidationError::PathMissing {
                    path: path.to_path_buf(),
                }
            } else {
                ValidationError::Canonicalize {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;
        if !meta.is_dir() {
            return Err(ValidationError::NotADirectory {
                path: path.to_path_buf(),
            });
        }
        let canonical =
            std::fs::canonicalize(path).map_err(|source| ValidationError::Canonicalize {
                path: path.to_path_buf(),
                source,
            })?;

        let name = match name {
            Some(name) => {
                let trimmed = name.trim();
                if trimmed.is_empty() {
                    return Err(ValidationError::EmptyName);
                }
                trimmed.to_owned()
            }
            None => canonical
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| ValidationError::NoDerivableName {
                    path: canonical.clone(),
                })?,
        };

        Ok(Self {
            name: DirectoryName(name),
            path: canonical,
            last_save_time: None,
        })
    }
}

/// Parse a stored `last_save_time`.
///
/// Only RFC 3339 timestamps carry an offset; anything else (a naive
/// `2024-05-01T10:00:00`, garbage) is reported and treated as absent.
pub fn parse_save_time(raw: &str) -> Option<DateTime<Utc>> {
    match DateTime::parse_from_rfc3339(raw) {
        Ok(ts) => Some(ts.with_timezone(&Utc)),
        Err(err) => {
            tracing::warn!("ignoring last_save_time '{raw}' (not timezone-aware RFC 3339): {err}");
            None
        }
    }
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match raw {
        Some(serde_json::Value::String(s)) => parse_save_time(&s),
        Some(serde_json::Value::Null) | None => None,
        Some(other) => {
            tracing::warn!("ignoring non-string last_save_time: {other}");
            None
        }
    })
}

// ---------------------------------------------------------------------------
// GitRemote
// ---------------------------------------------------------------------------

/// The remote repository every tracked directory reconciles against.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitRemote {
    #[serde(deserialize_with = "http_url")]
    pub url: Url,
    pub access_token: String,
}

impl GitRemote {
    /// Build a remote binding; `url` must be `http` or `https`.
    pub fn new(url: &str, access_token: impl Into<String>) -> Result<Self, ValidationError> {
        Ok(Self {
            url: parse_http_url(url)?,
            access_token: access_token.into(),
        })
    }
}

impl fmt::Debug for GitRemote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GitRemote")
            .field("url", &self.url.as_str())
            .field("access_token", &"<redacted>")
            .finish()
    }
}

fn parse_http_url(raw: &str) -> Result<Url, ValidationError> {
    let url = Url::parse(raw).map_err(|e| ValidationError::InvalidRemoteUrl {
        url: raw.to_owned(),
        reason: e.to_string(),
    })?;
    match url.scheme() {
        "http" | "https" if url.host().is_some() => Ok(url),
        "http" | "https" => Err(ValidationError::InvalidRemoteUrl {
            url: raw.to_owned(),
            reason: "missing host".to_owned(),
        }),
        other => Err(ValidationError::InvalidRemoteUrl {
            url: raw.to_owned(),
            reason: format!("unsupported scheme '{other}'"),
        }),
    }
}

fn http_url<'de, D>(deserializer: D) -> Result<Url, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_http_url(&raw).map_err(serde::de::Error::custom)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
