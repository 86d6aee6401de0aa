//! File-backed secret storage
//!
//! A JSON object mapping secret keys to string values. All writes use an
//! atomic temp-file + rename so a crash mid-write leaves the previous file
//! intact, and the in-memory map only changes once the rename succeeded. A
//! tokio Mutex serializes writers.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use spotify_session::{Error, Result, SecretStorage};
use tokio::sync::Mutex;
use tracing::{debug, info};

pub struct FileSecretStorage {
    path: PathBuf,
    state: Mutex<BTreeMap<String, String>>,
}

impl FileSecretStorage {
    /// Open the secret file at `path`.
    ///
    /// A missing file is created as `{}` so later loads skip the cold-start path.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Storage(format!("reading secret file: {e}")))?;
            let values: BTreeMap<String, String> = serde_json::from_str(&contents)
                .map_err(|e| Error::Storage(format!("parsing secret file: {e}")))?;
            info!(path = %path.display(), keys = values.len(), "loaded secret file");
            values
        } else {
            info!(path = %path.display(), "secret file not found, starting empty");
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(dir)
                    .await
                    .map_err(|e| Error::Storage(format!("creating secret directory: {e}")))?;
            }
            let values = BTreeMap::new();
            write_atomic(&path, &values).await?;
            values
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }
}

impl SecretStorage for FileSecretStorage {
    fn get<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<String>>> + Send + 'a>> {
        Box::pin(async move { Ok(self.state.lock().await.get(key).cloned()) })
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let mut next = state.clone();
            next.insert(key.to_string(), value);
            write_atomic(&self.path, &next).await?;
            *state = next;
            debug!(key, "stored secret");
            Ok(())
        })
    }
}

/// Write the secret map atomically with owner-only permissions.
async fn write_atomic(path: &Path, data: &BTreeMap<String, String>) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::Storage(format!("serializing secrets: {e}")))?;

    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let tmp_path = dir.join(format!(".secrets.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Storage(format!("writing temp secret file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Storage(format!("setting secret file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Storage(format!("renaming temp secret file: {e}")))?;

    debug!(path = %path.display(), "persisted secrets");
    Ok(())
}
