// SPDX-License-Identifier: Apache-2.0

//! The on-disk container registry.
//!
//! Containers are sealed-object files of fixed size; the broker never
//! looks inside them beyond the framing header. The one structured read
//! is [`Registry::service_blob`], which assembles the authenticated blob
//! handed to the secure world on OpenSession:
//!
//! ```text
//! +---------------------------+-----------+---------+---------+
//! | Trustlet binary           | Root cont | SP cont | TL cont |
//! +---------------------------+-----------+---------+---------+
//! ```

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Error, McResult};
use crate::proto::Uuid;

pub const ENV_REGISTRY_PATH: &str = "MC_REGISTRY_PATH";
pub const ENV_REGISTRY_FALLBACK_PATH: &str = "MC_REGISTRY_FALLBACK_PATH";
pub const ENV_AUTH_TOKEN_PATH: &str = "MC_AUTH_TOKEN_PATH";

/// Compiled-in default when neither environment variable points at an
/// existing directory.
pub const DEFAULT_REGISTRY_PATH: &str = "/data/app/mcRegistry";

const AUTH_TOKEN_FILE_NAME: &str = "00000000.authtokcont";
const ROOT_FILE_NAME: &str = "00000000.rootcont";
const SP_CONT_EXT: &str = "spcont";
const TL_CONT_EXT: &str = "tlcont";
const TL_BIN_EXT: &str = "tlbin";

/// Sealed-object framing: magic, type, version, parent.
pub const SO_MAGIC: &[u8; 4] = b"MCSO";
pub const SO_HEADER_SIZE: usize = 16;
pub const SO_PARENT_OFFSET: usize = 12;

/// Trustlet binaries start with this.
pub const MCLF_MAGIC: &[u8; 4] = b"MCLF";

pub const SO_AUTH_TOKEN_SIZE: usize = 172;
pub const SO_ROOT_CONT_SIZE: usize = 484;
pub const SO_SP_CONT_SIZE: usize = 668;
pub const SO_TLT_CONT_SIZE: usize = 588;

/// Largest Trustlet binary the broker will hand to the secure world.
pub const MAX_TL_SIZE: usize = 0x0010_0000;

/// Resolved registry location plus the (possibly overridden) auth-token
/// location.
#[derive(Clone, Debug)]
pub struct Registry {
    path: PathBuf,
    auth_token_path: PathBuf,
}

impl Registry {
    /// Resolution order: `MC_REGISTRY_PATH` if it names an existing
    /// directory, else `MC_REGISTRY_FALLBACK_PATH`, else the compiled-in
    /// default. The auth token lives in `MC_AUTH_TOKEN_PATH` if set.
    pub fn from_env() -> Self {
        let path = env::var_os(ENV_REGISTRY_PATH)
            .map(PathBuf::from)
            .filter(|p| p.is_dir())
            .or_else(|| env::var_os(ENV_REGISTRY_FALLBACK_PATH).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_REGISTRY_PATH));

        let auth_token_path = env::var_os(ENV_AUTH_TOKEN_PATH)
            .map(PathBuf::from)
            .unwrap_or_else(|| path.clone());

        debug!(path = %path.display(), "registry resolved");
        Self {
            path,
            auth_token_path,
        }
    }

    /// Use a fixed directory; auth token colocated.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            auth_token_path: path.clone(),
            path,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn auth_token_file(&self) -> PathBuf {
        self.auth_token_path.join(AUTH_TOKEN_FILE_NAME)
    }

    pub fn read_auth_token(&self) -> McResult<Vec<u8>> {
        self.container(&self.auth_token_file(), SO_AUTH_TOKEN_SIZE)
    }

    pub fn store_auth_token(&self, data: &[u8]) -> McResult<()> {
        if data.len() != SO_AUTH_TOKEN_SIZE {
            return Err(Error::InvalidParameter);
        }
        fs::write(self.auth_token_file(), data).map_err(|err| {
            warn!(%err, "auth token store failed");
            Error::InvalidParameter
        })
    }

    pub fn delete_auth_token(&self) -> McResult<()> {
        fs::remove_file(self.auth_token_file()).map_err(|err| {
            warn!(%err, "auth token delete failed");
            Error::InvalidParameter
        })
    }

    pub fn read_root(&self) -> McResult<Vec<u8>> {
        self.container(&self.path.join(ROOT_FILE_NAME), SO_ROOT_CONT_SIZE)
    }

    pub fn read_sp(&self, spid: u32) -> McResult<Vec<u8>> {
        let name = format!("{spid:08x}.{SP_CONT_EXT}");
        self.container(&self.path.join(name), SO_SP_CONT_SIZE)
    }

    pub fn read_trustlet_container(&self, uuid: &Uuid) -> McResult<Vec<u8>> {
        let name = format!("{}.{TL_CONT_EXT}", uuid.hex());
        self.container(&self.path.join(name), SO_TLT_CONT_SIZE)
    }

    pub fn read_trustlet_binary(&self, uuid: &Uuid) -> McResult<Vec<u8>> {
        let name = format!("{}.{TL_BIN_EXT}", uuid.hex());
        let path = self.path.join(name);
        let data = fs::read(&path).map_err(|err| {
            warn!(path = %path.display(), %err, "trustlet binary unreadable");
            Error::InvalidParameter
        })?;

        if data.len() > MAX_TL_SIZE || data.len() < SO_HEADER_SIZE {
            warn!(path = %path.display(), len = data.len(), "trustlet binary size out of range");
            return Err(Error::InvalidParameter);
        }
        if &data[..4] != MCLF_MAGIC {
            warn!(path = %path.display(), "trustlet binary has no MCLF header");
            return Err(Error::InvalidParameter);
        }

        Ok(data)
    }

    /// Assemble the combined authenticated blob for OpenSession:
    /// `[ trustlet binary | root container | SP container | TL container ]`.
    /// The SP identity comes from the TL container's parent field.
    pub fn service_blob(&self, uuid: &Uuid) -> McResult<Vec<u8>> {
        let binary = self.read_trustlet_binary(uuid)?;
        let tlt = self.read_trustlet_container(uuid)?;

        let spid = u32::from_le_bytes(
            tlt[SO_PARENT_OFFSET..SO_PARENT_OFFSET + 4]
                .try_into()
                .map_err(|_| Error::InvalidParameter)?,
        );
        let sp = self.read_sp(spid)?;
        let root = self.read_root()?;

        let mut blob = Vec::with_capacity(binary.len() + root.len() + sp.len() + tlt.len());
        blob.extend_from_slice(&binary);
        blob.extend_from_slice(&root);
        blob.extend_from_slice(&sp);
        blob.extend_from_slice(&tlt);
        Ok(blob)
    }

    fn container(&self, path: &Path, expected_len: usize) -> McResult<Vec<u8>> {
        let data = fs::read(path).map_err(|err| {
            warn!(path = %path.display(), %err, "container unreadable");
            Error::InvalidParameter
        })?;

        if data.len() != expected_len {
            warn!(
                path = %path.display(),
                len = data.len(),
                expected_len,
                "container has the wrong size"
            );
            return Err(Error::InvalidParameter);
        }
        if &data[..4] != SO_MAGIC {
            warn!(path = %path.display(), "container has no sealed-object header");
            return Err(Error::InvalidParameter);
        }

        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn container_bytes(len: usize, parent: u32) -> Vec<u8> {
        let mut data = vec![0u8; len];
        data[..4].copy_from_slice(SO_MAGIC);
        data[SO_PARENT_OFFSET..SO_PARENT_OFFSET + 4].copy_from_slice(&parent.to_le_bytes());
        data
    }

    fn populate(dir: &Path, uuid: &Uuid, spid: u32) {
        fs::write(dir.join(ROOT_FILE_NAME), container_bytes(SO_ROOT_CONT_SIZE, 0)).unwrap();
        fs::write(
            dir.join(format!("{spid:08x}.spcont")),
            container_bytes(SO_SP_CONT_SIZE, 0),
        )
        .unwrap();
        fs::write(
            dir.join(format!("{}.tlcont", uuid.hex())),
            container_bytes(SO_TLT_CONT_SIZE, spid),
        )
        .unwrap();

        let mut binary = b"MCLF".to_vec();
        binary.extend_from_slice(&[0x5A; 60]);
        fs::write(dir.join(format!("{}.tlbin", uuid.hex())), binary).unwrap();
    }

    #[test]
    fn service_blob_is_binary_root_sp_tlt() {
        let dir = tempfile::tempdir().unwrap();
        let uuid = Uuid([0xAB; 16]);
        populate(dir.path(), &uuid, 0x1234);

        let registry = Registry::with_path(dir.path());
        let blob = registry.service_blob(&uuid).unwrap();

        assert_eq!(
            blob.len(),
            64 + SO_ROOT_CONT_SIZE + SO_SP_CONT_SIZE + SO_TLT_CONT_SIZE
        );
        assert_eq!(&blob[..4], MCLF_MAGIC);
        assert_eq!(&blob[64..68], SO_MAGIC);
    }

    #[test]
    fn missing_trustlet_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::with_path(dir.path());

        let err = registry.service_blob(&Uuid([1; 16])).unwrap_err();
        assert_eq!(err, Error::InvalidParameter);
    }

    #[test]
    fn wrong_container_size_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let uuid = Uuid([2; 16]);
        populate(dir.path(), &uuid, 7);
        fs::write(
            dir.path().join(ROOT_FILE_NAME),
            container_bytes(SO_ROOT_CONT_SIZE - 1, 0),
        )
        .unwrap();

        let registry = Registry::with_path(dir.path());
        assert!(registry.service_blob(&uuid).is_err());
    }

    #[test]
    fn bad_magic_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let uuid = Uuid([3; 16]);
        populate(dir.path(), &uuid, 7);

        let mut bogus = container_bytes(SO_TLT_CONT_SIZE, 7);
        bogus[..4].copy_from_slice(b"XXXX");
        fs::write(dir.path().join(format!("{}.tlcont", uuid.hex())), bogus).unwrap();

        let registry = Registry::with_path(dir.path());
        assert!(registry.service_blob(&uuid).is_err());
    }

    #[test]
    fn auth_token_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::with_path(dir.path());

        let token = container_bytes(SO_AUTH_TOKEN_SIZE, 0);
        registry.store_auth_token(&token).unwrap();
        assert_eq!(registry.read_auth_token().unwrap(), token);

        registry.delete_auth_token().unwrap();
        assert!(registry.read_auth_token().is_err());
    }

    #[test]
    fn env_override_wins_when_it_exists() {
        let dir = tempfile::tempdir().unwrap();
        env::set_var(ENV_REGISTRY_PATH, dir.path());
        let registry = Registry::from_env();
        assert_eq!(registry.path(), dir.path());
        env::remove_var(ENV_REGISTRY_PATH);
    }
}
