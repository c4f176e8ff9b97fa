use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use relay_core::Snapshot;
use tracing::{debug, info, instrument};

use crate::error::StoreError;
use crate::PersistentStore;

/// Single JSON document on disk: `{comments, items, voteTallies}`.
///
/// Commits write a sibling temp file, fsync it, and rename it over the
/// document, so a reader only ever sees a complete document.
pub struct JsonFileStore {
    path: PathBuf,
    tmp_path: PathBuf,
    // Serializes writers sharing one temp path.
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut tmp_name = path
            .file_name()
            .map(|n| n.to_os_string())
            .ok_or_else(|| StoreError::Io(format!("not a file path: {}", path.display())))?;
        tmp_name.push(".tmp");

        info!(path = %path.display(), "json store opened");
        Ok(Self {
            path: path.to_owned(),
            tmp_path: path.with_file_name(tmp_name),
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PersistentStore for JsonFileStore {
    #[instrument(skip(self), fields(path = %self.path.display()))]
    fn load_all(&self) -> Result<Snapshot, StoreError> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no state document yet, starting empty");
                return Ok(Snapshot::default());
            }
            Err(e) => return Err(e.into()),
        };
        if data.iter().all(u8::is_ascii_whitespace) {
            return Ok(Snapshot::default());
        }
        serde_json::from_slice(&data).map_err(|e| {
            StoreError::Corrupted(format!("{}: {e}", self.path.display()))
        })
    }

    #[instrument(skip_all, fields(path = %self.path.display()))]
    fn commit(&self, state: &Snapshot) -> Result<(), StoreError> {
        let data = serde_json::to_vec_pretty(state)?;
        let _guard = self.write_lock.lock();

        let mut file = File::create(&self.tmp_path)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&self.tmp_path, &self.path)?;

        // fsync the directory so the rename itself is durable
        #[cfg(unix)]
        {
            if let Some(dir) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                if let Ok(dir) = File::open(dir) {
                    let _ = dir.sync_all();
                }
            }
        }

        debug!(bytes = data.len(), "state document committed");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "json"
    }
}
