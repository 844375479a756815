//! Durable credential material for the single paired session.
//!
//! One opaque bundle per session. It is written atomically (temp file +
//! rename) and wiped as a whole directory, so no partial credential state is
//! ever left behind.

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Mutex,
};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    audit::iso_timestamp_utc,
    domain::{CredentialBundle, CredentialHandle},
    errors::Error,
    Result,
};

const CREDENTIALS_FILE: &str = "credentials.json";
const FORMAT_VERSION: u32 = 1;

/// Storage port for the session's credential bundle.
///
/// Only the connection state machine calls this.
pub trait SessionStore: Send + Sync {
    fn load(&self) -> Result<Option<CredentialBundle>>;
    fn save(&self, bundle: &CredentialBundle) -> Result<CredentialHandle>;
    fn wipe(&self) -> Result<()>;
    fn handle(&self) -> Result<Option<CredentialHandle>>;
}

/// Hex SHA-256 of `bytes`, truncated to `len` characters.
pub fn fingerprint(bytes: &[u8], len: usize) -> String {
    use std::fmt::Write;

    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(len);
    for b in digest.iter() {
        let _ = write!(&mut out, "{:02x}", b);
        if out.len() >= len {
            out.truncate(len);
            break;
        }
    }
    out
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct StoredCredentials {
    version: u32,
    saved_at: String,
    fingerprint: String,
    material: String,
}

impl StoredCredentials {
    fn handle(&self) -> CredentialHandle {
        CredentialHandle {
            fingerprint: self.fingerprint.clone(),
            saved_at: self.saved_at.clone(),
        }
    }
}

/// Directory-backed store (`<dir>/credentials.json`).
#[derive(Debug)]
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file(&self) -> PathBuf {
        self.dir.join(CREDENTIALS_FILE)
    }

    fn read(&self) -> Result<Option<StoredCredentials>> {
        let txt = match fs::read_to_string(self.file()) {
            Ok(t) => t,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if txt.trim().is_empty() {
            return Ok(None);
        }
        let stored: StoredCredentials = serde_json::from_str(&txt)?;
        if stored.version != FORMAT_VERSION {
            return Err(Error::Store(format!(
                "unsupported credential format version {}",
                stored.version
            )));
        }
        Ok(Some(stored))
    }
}

impl SessionStore for FileSessionStore {
    fn load(&self) -> Result<Option<CredentialBundle>> {
        let Some(stored) = self.read()? else {
            return Ok(None);
        };
        let material = STANDARD
            .decode(stored.material.as_bytes())
            .map_err(|e| Error::Store(format!("credential material is not valid base64: {e}")))?;
        if fingerprint(&material, 64) != stored.fingerprint {
            return Err(Error::Store(
                "credential fingerprint mismatch (bundle is corrupt)".to_string(),
            ));
        }
        Ok(Some(CredentialBundle(material)))
    }

    fn save(&self, bundle: &CredentialBundle) -> Result<CredentialHandle> {
        fs::create_dir_all(&self.dir)?;

        let stored = StoredCredentials {
            version: FORMAT_VERSION,
            saved_at: iso_timestamp_utc(),
            fingerprint: fingerprint(&bundle.0, 64),
            material: STANDARD.encode(&bundle.0),
        };
        let tmp = self.dir.join(format!("{CREDENTIALS_FILE}.tmp"));
        fs::write(&tmp, serde_json::to_vec(&stored)?)?;
        fs::rename(&tmp, self.file())?;
        Ok(stored.handle())
    }

    fn wipe(&self) -> Result<()> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn handle(&self) -> Result<Option<CredentialHandle>> {
        Ok(self.read()?.map(|s| s.handle()))
    }
}

/// In-memory store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    inner: Mutex<Option<(CredentialBundle, CredentialHandle)>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bundle(bundle: CredentialBundle) -> Self {
        let handle = CredentialHandle {
            fingerprint: fingerprint(&bundle.0, 64),
            saved_at: iso_timestamp_utc(),
        };
        Self {
            inner: Mutex::new(Some((bundle, handle))),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Option<(CredentialBundle, CredentialHandle)>>> {
        self.inner
            .lock()
            .map_err(|_| Error::Store("memory store lock poisoned".to_string()))
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self) -> Result<Option<CredentialBundle>> {
        Ok(self.lock()?.as_ref().map(|(b, _)| b.clone()))
    }

    fn save(&self, bundle: &CredentialBundle) -> Result<CredentialHandle> {
        let handle = CredentialHandle {
            fingerprint: fingerprint(&bundle.0, 64),
            saved_at: iso_timestamp_utc(),
        };
        *self.lock()? = Some((bundle.clone(), handle.clone()));
        Ok(handle)
    }

    fn wipe(&self) -> Result<()> {
        *self.lock()? = None;
        Ok(())
    }

    fn handle(&self) -> Result<Option<CredentialHandle>> {
        Ok(self.lock()?.as_ref().map(|(_, h)| h.clone()))
    }
}
