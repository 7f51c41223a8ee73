//! Signed JSON artifacts for audit and external tooling.
//!
//! Migration results, fix reports, gap lists and backups are written as
//! [`Artifact`] envelopes. Each envelope carries an HMAC-SHA256 signature keyed
//! by the configuration hash, so a tampered file or one produced under a
//! different configuration is rejected on load.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, warn};

use crate::core::memory::write_atomic;
use crate::error::{MigrateError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Envelope around an audited payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact<T> {
    /// Artifact kind, e.g. `migration_result` or `fix_report`.
    pub kind: String,

    /// When the artifact was created.
    pub created_at: DateTime<Utc>,

    pub payload: T,

    /// HMAC-SHA256 signature over kind, creation time and payload.
    /// Computed on save using the configuration hash as key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hmac: Option<String>,
}

#[derive(Serialize)]
struct Signed<'a, T> {
    kind: &'a str,
    created_at: &'a DateTime<Utc>,
    payload: &'a T,
}

impl<T: Serialize + DeserializeOwned> Artifact<T> {
    pub fn new(kind: impl Into<String>, payload: T) -> Self {
        Self {
            kind: kind.into(),
            created_at: Utc::now(),
            payload,
            hmac: None,
        }
    }

    /// Compute the HMAC-SHA256 signature of the envelope.
    fn compute_hmac(&self, key: &str) -> Result<String> {
        let signed = Signed {
            kind: &self.kind,
            created_at: &self.created_at,
            payload: &self.payload,
        };
        let content = serde_json::to_string(&signed)
            .map_err(|e| MigrateError::Artifact(format!("Failed to serialize artifact for HMAC: {}", e)))?;

        let mut mac = HmacSha256::new_from_slice(key.as_bytes())
            .map_err(|e| MigrateError::Artifact(format!("Failed to create HMAC: {}", e)))?;

        mac.update(content.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Sign and save the artifact (atomic write).
    pub fn save<P: AsRef<Path>>(&mut self, path: P, key: &str) -> Result<()> {
        let path = path.as_ref();
        self.hmac = Some(self.compute_hmac(key)?);

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| MigrateError::Artifact(format!("Failed to serialize artifact: {}", e)))?;
        write_atomic(path, &content)?;

        debug!("Wrote {} artifact to {}", self.kind, path.display());
        Ok(())
    }

    /// Load an artifact and verify its signature.
    ///
    /// Unsigned artifacts are accepted with a warning; a signature that does
    /// not match is rejected.
    pub fn load<P: AsRef<Path>>(path: P, key: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let artifact: Self = serde_json::from_str(&content)?;

        match &artifact.hmac {
            Some(stored) => {
                if *stored != artifact.compute_hmac(key)? {
                    return Err(MigrateError::Artifact(format!(
                        "{} artifact integrity check failed: HMAC mismatch (tampered or signed under another configuration)",
                        artifact.kind
                    )));
                }
            }
            None => {
                warn!("{} artifact has no HMAC signature, integrity cannot be verified", artifact.kind);
            }
        }

        Ok(artifact)
    }
}

/// Write a signed artifact named `<kind>-<id>.json` into `dir`.
pub fn write_artifact<T: Serialize + DeserializeOwned>(
    dir: &Path,
    kind: &str,
    id: &str,
    payload: T,
    key: &str,
) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("{}-{}.json", kind, id));
    Artifact::new(kind, payload).save(&path, key)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tempfile::tempdir;

    #[test]
    fn test_save_and_load_verifies() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("report.json");
        let mut artifact = Artifact::new("fix_report", json!({"fixed": 3}));
        artifact.save(&path, "cfg-hash").unwrap();

        let loaded: Artifact<Value> = Artifact::load(&path, "cfg-hash").unwrap();
        assert_eq!(loaded.payload["fixed"], 3);
        assert!(loaded.hmac.is_some());
        assert!(!dir.path().join("report.tmp").exists());
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("report.json");
        Artifact::new("fix_report", json!({"fixed": 3}))
            .save(&path, "cfg-hash")
            .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, content.replace("\"fixed\": 3", "\"fixed\": 30")).unwrap();

        let err = Artifact::<Value>::load(&path, "cfg-hash").unwrap_err();
        assert!(matches!(err, MigrateError::Artifact(_)));
    }

    #[test]
    fn test_other_key_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gaps.json");
        Artifact::new("gaps", json!([])).save(&path, "key-a").unwrap();
        assert!(Artifact::<Value>::load(&path, "key-b").is_err());
    }

    #[test]
    fn test_unsigned_artifact_accepted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("legacy.json");
        let unsigned = Artifact::new("gaps", json!([]));
        std::fs::write(&path, serde_json::to_string(&unsigned).unwrap()).unwrap();
        assert!(Artifact::<Value>::load(&path, "any").is_ok());
    }

    #[test]
    fn test_write_artifact_names_file() {
        let dir = tempdir().unwrap();
        let path = write_artifact(dir.path(), "migration_result", "run-1", json!({}), "k").unwrap();
        assert_eq!(path.file_name().unwrap(), "migration_result-run-1.json");
    }
}
