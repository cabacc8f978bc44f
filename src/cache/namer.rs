//! Keyed cache-directory names for library identities
//!
//! Directory names are HMAC-SHA256 digests of the identity fields under a
//! secret key. Someone who controls a library name or sub-path can neither
//! predict another library's directory nor smuggle path components into
//! the cache root.

use crate::error::{PipelibError, PipelibResult};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

type HmacSha256 = Hmac<Sha256>;

/// Joins identity fields; no field may contain it
pub const FIELD_SEPARATOR: char = '\0';

/// Secret key length in bytes
pub const KEY_LEN: usize = 32;

/// Length of a directory name: hex of one SHA-256 digest
pub const NAME_LEN: usize = 64;

/// Whether `name` has the shape of a name this module derives
pub fn is_directory_name(name: &str) -> bool {
    name.len() == NAME_LEN && name.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Derives directory names from library identities
#[derive(Clone)]
pub struct DirectoryNamer {
    key: [u8; KEY_LEN],
}

impl DirectoryNamer {
    pub fn new(key: [u8; KEY_LEN]) -> Self {
        Self { key }
    }

    /// A namer with a fresh random key, valid for this process only
    pub fn ephemeral() -> Self {
        let mut key = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        Self::new(key)
    }

    /// Load the hex-encoded key at `path`, creating it on first use.
    ///
    /// Persisting the key keeps directory names stable across restarts so
    /// existing cache entries stay addressable.
    pub fn load_or_create(path: &Path) -> PipelibResult<Self> {
        if path.exists() {
            let content = fs::read_to_string(path)
                .map_err(|e| PipelibError::io(format!("reading key {}", path.display()), e))?;
            let bytes = hex::decode(content.trim()).map_err(|e| {
                PipelibError::IntegrityError(format!("key {} is not hex: {}", path.display(), e))
            })?;
            let key: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
                PipelibError::IntegrityError(format!(
                    "key {} must be {} bytes",
                    path.display(),
                    KEY_LEN
                ))
            })?;
            debug!("Loaded directory name key from {}", path.display());
            return Ok(Self::new(key));
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| PipelibError::io(format!("creating {}", parent.display()), e))?;
        }

        let namer = Self::ephemeral();
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        fs::write(&tmp, hex::encode(namer.key))
            .map_err(|e| PipelibError::io(format!("writing key {}", tmp.display()), e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(&tmp, perms)
                .map_err(|e| PipelibError::io("setting key file permissions", e))?;
        }

        // Another process may have won the race; keep whichever key landed first
        match fs::hard_link(&tmp, path) {
            Ok(()) => {
                let _ = fs::remove_file(&tmp);
                info!("Created directory name key at {}", path.display());
                Ok(namer)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&tmp);
                Self::load_or_create(path)
            }
            Err(e) => {
                let _ = fs::remove_file(&tmp);
                Err(PipelibError::io(format!("installing key {}", path.display()), e))
            }
        }
    }

    /// Hash `fields` into a 64-character hex directory name
    pub fn name(&self, fields: &[&str]) -> PipelibResult<String> {
        if let Some(field) = fields.iter().find(|f| f.contains(FIELD_SEPARATOR)) {
            return Err(PipelibError::IntegrityError(format!(
                "identity field {:?} contains a reserved character",
                field.replace(FIELD_SEPARATOR, "\\0")
            )));
        }

        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| PipelibError::Internal(format!("initializing HMAC: {}", e)))?;
        let mut separator = [0u8; 4];
        let separator = FIELD_SEPARATOR.encode_utf8(&mut separator).as_bytes();
        for (i, field) in fields.iter().enumerate() {
            if i > 0 {
                mac.update(separator);
            }
            mac.update(field.as_bytes());
        }

        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Directory name of a library identity
    pub fn for_library(
        &self,
        name: &str,
        version: &str,
        trusted: bool,
        source: &str,
        sub_path: Option<&str>,
    ) -> PipelibResult<String> {
        let trusted = if trusted { "true" } else { "false" };
        match sub_path {
            Some(sub) => self.name(&[name, version, trusted, source, sub]),
            None => self.name(&[name, version, trusted, source]),
        }
    }
}

impl fmt::Debug for DirectoryNamer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectoryNamer").finish_non_exhaustive()
    }
}
