//! Key pair and certificate file layout.
//!
//! Each identity has its own key directory holding `id_rsa`, `id_rsa.pub`
//! and the issued certificate `id_rsa.pub-aadcert.pub`.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use super::error::CertError;

/// Public key file name inside a key directory.
pub const PUBLIC_KEY_FILENAME: &str = "id_rsa.pub";
/// Appended to the public key file name to get the certificate file name.
pub const CERT_SUFFIX: &str = "-aadcert.pub";

/// Resolved paths for one identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertPaths {
    pub key_dir: PathBuf,
    pub private_key: PathBuf,
    pub public_key: PathBuf,
    pub cert: PathBuf,
}

impl CertPaths {
    /// Default layout inside `key_dir`.
    pub fn in_key_dir(key_dir: PathBuf) -> Self {
        let public_key = key_dir.join(PUBLIC_KEY_FILENAME);
        Self::with_public_key(key_dir, public_key)
    }

    /// Layout around an explicit public key path.
    pub fn with_public_key(key_dir: PathBuf, public_key: PathBuf) -> Self {
        let private_key = if public_key.extension().is_some_and(|e| e == "pub") {
            public_key.with_extension("")
        } else {
            public_key.clone()
        };
        let mut cert = OsString::from(public_key.as_os_str());
        cert.push(CERT_SUFFIX);
        Self {
            key_dir,
            private_key,
            public_key,
            cert: PathBuf::from(cert),
        }
    }
}

/// Expand a leading `~` against `home`. Other paths are returned as is.
pub fn expand_home_in(path: &str, home: &Path) -> PathBuf {
    if path == "~" {
        return home.to_path_buf();
    }
    match path.strip_prefix("~/") {
        Some(rest) => home.join(rest),
        None => PathBuf::from(path),
    }
}

/// Expand a leading `~` against the caller's home directory.
pub fn expand_home(path: &str) -> Result<PathBuf, CertError> {
    if path != "~" && !path.starts_with("~/") {
        return Ok(PathBuf::from(path));
    }
    let home = dirs::home_dir().ok_or(CertError::HomeDirUnavailable)?;
    Ok(expand_home_in(path, &home))
}
