use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::Result;

/// How long SBOM blobs stay valid.
pub const SBOM_TTL: Duration = Duration::from_secs(24 * 60 * 60);
/// How long scan results stay valid.
pub const SCAN_TTL: Duration = Duration::from_secs(6 * 60 * 60);

#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    key: String,
    data: serde_json::Value,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

/// Filesystem-backed TTL store for scan and SBOM results, keyed by
/// `(operation, image digest, config hash)` and partitioned on disk by
/// operation name. Writes go through a temp file plus rename, so readers
/// never observe a torn entry; the latest writer wins.
#[derive(Debug, Clone)]
pub struct Cache {
    root: PathBuf,
}

impl Cache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn put(
        &self,
        operation: &str,
        image_identity: &str,
        config_hash: &str,
        data: &serde_json::Value,
        ttl: Duration,
    ) -> Result<()> {
        let key = entry_key(operation, image_identity, config_hash);
        let path = self.entry_path(operation, &key);
        let dir = path.parent().expect("entry path always has a parent");
        fs::create_dir_all(dir)?;
        restrict_dir_mode(dir)?;

        let now = Utc::now();
        let entry = CacheEntry {
            key: key.clone(),
            data: data.clone(),
            created_at: now,
            expires_at: now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero()),
        };

        let tmp = path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&entry)?)?;
        restrict_file_mode(&tmp)?;
        fs::rename(&tmp, &path)?;
        debug!(operation, key = %key, "cached entry");
        Ok(())
    }

    /// Returns the cached payload if present and unexpired. Expired and
    /// malformed entries are deleted and reported as a miss.
    pub fn get(
        &self,
        operation: &str,
        image_identity: &str,
        config_hash: &str,
    ) -> Result<Option<serde_json::Value>> {
        let key = entry_key(operation, image_identity, config_hash);
        let path = self.entry_path(operation, &key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let entry: CacheEntry = match serde_json::from_slice(&bytes) {
            Ok(entry) => entry,
            Err(_) => {
                let _ = fs::remove_file(&path);
                return Ok(None);
            }
        };

        if entry.expires_at <= Utc::now() {
            let _ = fs::remove_file(&path);
            debug!(operation, key = %key, "cache entry expired");
            return Ok(None);
        }

        Ok(Some(entry.data))
    }

    fn entry_path(&self, operation: &str, key: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        let file_name = format!("{:x}.json", hasher.finalize());
        self.root.join(operation).join(file_name)
    }

    #[cfg(test)]
    pub(crate) fn raw_entry_path(&self, operation: &str, image: &str, hash: &str) -> PathBuf {
        self.entry_path(operation, &entry_key(operation, image, hash))
    }
}

fn entry_key(operation: &str, image_identity: &str, config_hash: &str) -> String {
    format!("{operation}/{image_identity}/{config_hash}")
}

/// Stable hash of a serializable config, for cache-key composition.
pub fn config_hash<T: Serialize>(value: &T) -> Result<String> {
    let canonical = serde_json::to_vec(value)?;
    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(unix)]
fn restrict_file_mode(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_file_mode(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn restrict_dir_mode(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_dir_mode(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn round_trip_within_ttl() {
        let dir = tempdir().expect("temp dir");
        let cache = Cache::new(dir.path());
        let payload = json!({"vulnerabilities": [], "summary": {"total": 0}});
        cache
            .put("scan", "sha256:abc", "cfg1", &payload, SCAN_TTL)
            .expect("put");
        let got = cache.get("scan", "sha256:abc", "cfg1").expect("get");
        assert_eq!(got, Some(payload));
    }

    #[test]
    fn different_config_hash_is_a_miss() {
        let dir = tempdir().expect("temp dir");
        let cache = Cache::new(dir.path());
        cache
            .put("scan", "sha256:abc", "cfg1", &json!(1), SCAN_TTL)
            .expect("put");
        assert_eq!(cache.get("scan", "sha256:abc", "cfg2").expect("get"), None);
    }

    #[test]
    fn expired_entry_is_removed_on_read() {
        let dir = tempdir().expect("temp dir");
        let cache = Cache::new(dir.path());
        cache
            .put("scan", "sha256:abc", "cfg1", &json!(1), SCAN_TTL)
            .expect("put");

        // Rewrite the entry with an expiry one hour in the past.
        let path = cache.raw_entry_path("scan", "sha256:abc", "cfg1");
        let mut entry: serde_json::Value =
            serde_json::from_slice(&fs::read(&path).expect("entry exists")).expect("entry parses");
        entry["expires_at"] = json!(Utc::now() - chrono::Duration::hours(1));
        fs::write(&path, serde_json::to_vec(&entry).expect("serialize")).expect("rewrite");

        assert_eq!(cache.get("scan", "sha256:abc", "cfg1").expect("get"), None);
        assert!(!path.exists(), "expired entry file should be deleted");
    }

    #[test]
    fn malformed_entry_is_a_miss() {
        let dir = tempdir().expect("temp dir");
        let cache = Cache::new(dir.path());
        cache
            .put("sbom", "sha256:abc", "cfg1", &json!(1), SBOM_TTL)
            .expect("put");
        let path = cache.raw_entry_path("sbom", "sha256:abc", "cfg1");
        fs::write(&path, b"{ not json").expect("corrupt");
        assert_eq!(cache.get("sbom", "sha256:abc", "cfg1").expect("get"), None);
    }

    #[cfg(unix)]
    #[test]
    fn entry_files_are_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().expect("temp dir");
        let cache = Cache::new(dir.path());
        cache
            .put("scan", "sha256:abc", "cfg1", &json!(1), SCAN_TTL)
            .expect("put");
        let path = cache.raw_entry_path("scan", "sha256:abc", "cfg1");
        let mode = fs::metadata(&path).expect("metadata").permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
