//! Release gate: decide from the staged version whether an apply may run.

use serde::Deserialize;
use tidal_drive::{Drive, DriveError};

use crate::error::{MirrorError, MirrorResult};

/// Key of the version file inside a drive.
pub const VERSION_FILE: &str = "/package.json";

#[derive(Deserialize)]
struct VersionFile {
    version: String,
}

/// Outcome of the release gate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReleaseDecision {
    /// Apply after the grace period.
    Proceed { version: String },
    /// Dry run requested; stop after reporting.
    SkipDryRun { version: String },
    /// Version is not `MAJOR.MINOR.PATCH`; stop after reporting.
    SkipNotRelease { version: String },
}

impl ReleaseDecision {
    pub fn version(&self) -> &str {
        match self {
            Self::Proceed { version }
            | Self::SkipDryRun { version }
            | Self::SkipNotRelease { version } => version,
        }
    }

    pub fn proceeds(&self) -> bool {
        matches!(self, Self::Proceed { .. })
    }
}

/// Read the `version` field of the drive's version file.
pub async fn read_version(drive: &Drive) -> MirrorResult<String> {
    let raw = drive.get(VERSION_FILE).await.map_err(|e| match e {
        DriveError::NotFound(_) => MirrorError::VersionFile(format!("{VERSION_FILE} not found")),
        other => MirrorError::Drive(other),
    })?;
    let parsed: VersionFile = serde_json::from_slice(&raw)
        .map_err(|e| MirrorError::VersionFile(format!("{VERSION_FILE}: {e}")))?;
    Ok(parsed.version)
}

/// Whether `version` is exactly three dot-separated decimal numbers.
pub fn is_release_version(version: &str) -> bool {
    let parts: Vec<&str> = version.split('.').collect();
    parts.len() == 3
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()))
}

/// Apply the gate. A dry run always skips, whatever the version.
pub fn decide(version: &str, dry_run: bool) -> ReleaseDecision {
    let version = version.to_string();
    if dry_run {
        ReleaseDecision::SkipDryRun { version }
    } else if !is_release_version(&version) {
        ReleaseDecision::SkipNotRelease { version }
    } else {
        ReleaseDecision::Proceed { version }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidal_core::CoreStore;

    #[test]
    fn release_versions() {
        assert!(is_release_version("1.2.3"));
        assert!(is_release_version("10.0.12"));
        assert!(!is_release_version("1.2.3-beta"));
        assert!(!is_release_version("dev"));
        assert!(!is_release_version("1.2"));
        assert!(!is_release_version("1..3"));
        assert!(!is_release_version("v1.2.3"));
    }

    #[test]
    fn gate_decisions() {
        assert!(decide("1.2.3", false).proceeds());
        assert_eq!(
            decide("1.2.3", true),
            ReleaseDecision::SkipDryRun {
                version: "1.2.3".into()
            }
        );
        assert_eq!(
            decide("1.2.3-beta", false),
            ReleaseDecision::SkipNotRelease {
                version: "1.2.3-beta".into()
            }
        );
        assert_eq!(decide("dev", false).version(), "dev");
    }

    #[tokio::test]
    async fn reads_version_from_drive() {
        let drive = Drive::open_writable(&CoreStore::memory()).await.unwrap();
        assert!(matches!(
            read_version(&drive).await,
            Err(MirrorError::VersionFile(_))
        ));
        drive
            .put(VERSION_FILE, &br#"{"name":"app","version":"2.4.1"}"#[..])
            .await
            .unwrap();
        assert_eq!(read_version(&drive).await.unwrap(), "2.4.1");

        drive.put(VERSION_FILE, &b"not json"[..]).await.unwrap();
        assert!(matches!(
            read_version(&drive).await,
            Err(MirrorError::VersionFile(_))
        ));
    }
}
