//! Application version parsing and compatibility checks
//!
//! Versions are exchanged as strings during the handshake and gate which
//! handshake generation a peer speaks.

use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum VersionError {
    #[error("invalid version format: {0}")]
    Format(String),
    #[error("different application: ours {0}, theirs {1}")]
    DifferentApp(String, String),
    #[error("incompatible major version: ours {0}, theirs {1}")]
    IncompatibleMajor(u32, u32),
}

/// Semantic application version, rendered as `app/major.minor.patch`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppVersion {
    pub app: String,
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl AppVersion {
    pub fn new(app: &str, major: u32, minor: u32, patch: u32) -> Self {
        Self {
            app: app.to_string(),
            major,
            minor,
            patch,
        }
    }

    pub fn parse(s: &str) -> Result<Self, VersionError> {
        let (app, rest) = s
            .split_once('/')
            .ok_or_else(|| VersionError::Format(s.to_string()))?;
        let mut parts = rest.split('.');
        let mut next = || {
            parts
                .next()
                .and_then(|p| p.parse::<u32>().ok())
                .ok_or_else(|| VersionError::Format(s.to_string()))
        };
        let major = next()?;
        let minor = next()?;
        let patch = next()?;
        if parts.next().is_some() || app.is_empty() {
            return Err(VersionError::Format(s.to_string()));
        }
        Ok(Self::new(app, major, minor, patch))
    }

    fn numeric(&self) -> (u32, u32, u32) {
        (self.major, self.minor, self.patch)
    }

    /// True if `self` predates `other`. App names are not compared.
    pub fn before(&self, other: &AppVersion) -> bool {
        self.numeric().cmp(&other.numeric()) == Ordering::Less
    }

    /// A peer is compatible when it runs the same application with the same
    /// major version. Minor/patch drift is allowed.
    pub fn compatible(&self, peer: &AppVersion) -> Result<(), VersionError> {
        if self.app != peer.app {
            return Err(VersionError::DifferentApp(
                self.app.clone(),
                peer.app.clone(),
            ));
        }
        if self.major != peer.major {
            return Err(VersionError::IncompatibleMajor(self.major, peer.major));
        }
        Ok(())
    }
}

impl fmt::Display for AppVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}.{}.{}", self.app, self.major, self.minor, self.patch)
    }
}
