//! The agent's end-entity directory.
//!
//! The directory is owned by a single agent. It must exist, grant no access
//! to group or other, and contain none of the files below when the agent
//! starts:
//!
//! | File      | Contents               | Mode   | Written          |
//! |-----------|------------------------|--------|------------------|
//! | `key`     | PKCS#8 DER private key | `0400` | once, at startup |
//! | `csr`     | DER CSR                | `0400` | once, at startup |
//! | `crt.pem` | PEM leaf certificate   | `0600` | every renewal    |

use crate::certificate::Certificate;
use crate::{Error, Result};
use std::fs::Permissions;
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

pub const KEY_FILE: &str = "key";
pub const CSR_FILE: &str = "csr";
pub const CRT_FILE: &str = "crt.pem";

const READ_ONLY_MODE: u32 = 0o400;
const CRT_MODE: u32 = 0o600;
/// Permission bits the directory must not grant.
const GROUP_OTHER_MASK: u32 = 0o077;

/// A validated end-entity directory.
#[derive(Debug, Clone)]
pub struct EndEntityDir {
    path: PathBuf,
}

impl EndEntityDir {
    /// Validates `path` for exclusive use by this agent.
    pub fn check(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let invalid = |reason: String| Error::EndEntityDir {
            path: path.clone(),
            reason,
        };

        let meta = std::fs::metadata(&path).map_err(|e| invalid(e.to_string()))?;
        if !meta.is_dir() {
            return Err(invalid("not a directory".to_string()));
        }
        let mode = meta.permissions().mode() & 0o777;
        if mode & GROUP_OTHER_MASK != 0 {
            return Err(invalid(format!(
                "mode {mode:04o} grants group or other access"
            )));
        }

        for name in [KEY_FILE, CSR_FILE, CRT_FILE] {
            let file = path.join(name);
            if std::fs::symlink_metadata(&file).is_ok() {
                return Err(Error::EndEntityConflict(file));
            }
        }

        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn key_path(&self) -> PathBuf {
        self.path.join(KEY_FILE)
    }

    pub fn csr_path(&self) -> PathBuf {
        self.path.join(CSR_FILE)
    }

    pub fn crt_path(&self) -> PathBuf {
        self.path.join(CRT_FILE)
    }

    /// Writes the private key. Fails if it already exists.
    pub fn write_key(&self, der: &[u8]) -> Result<()> {
        write_new(&self.key_path(), der)
    }

    /// Writes the CSR. Fails if it already exists.
    pub fn write_csr(&self, der: &[u8]) -> Result<()> {
        write_new(&self.csr_path(), der)
    }

    /// Replaces `crt.pem` with `cert`.
    ///
    /// The certificate is written to a temporary file and renamed into place
    /// so readers never observe a partial certificate.
    pub async fn write_certificate(&self, cert: &Certificate) -> Result<()> {
        let tmp = self.path.join(format!(".{CRT_FILE}.tmp"));
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(CRT_MODE)
            .open(&tmp)
            .await?;
        file.write_all(cert.to_pem().as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::set_permissions(&tmp, Permissions::from_mode(CRT_MODE)).await?;
        tokio::fs::rename(&tmp, self.crt_path()).await?;
        Ok(())
    }
}

fn write_new(path: &Path, contents: &[u8]) -> Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(READ_ONLY_MODE)
        .open(path)
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::AlreadyExists => Error::EndEntityConflict(path.to_path_buf()),
            _ => Error::Io(e),
        })?;
    file.write_all(contents)?;
    file.sync_all()?;
    Ok(())
}
