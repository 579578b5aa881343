//! Capped blob content loading

use std::io::Read;

use crate::config::OversizePolicy;
use crate::model::{ObjectHash, ObjectKind};

pub struct LoadedContent {
    pub bytes: Option<Vec<u8>>,
    pub truncated: bool,
}

/// Reads object headers and blob bodies through libgit2's object database
pub struct BlobLoader<'r> {
    odb: git2::Odb<'r>,
    max_bytes: u64,
    policy: OversizePolicy,
}

impl<'r> BlobLoader<'r> {
    pub fn new(repo: &'r git2::Repository, max_bytes: u64, policy: OversizePolicy) -> Result<Self, git2::Error> {
        Ok(Self {
            odb: repo.odb()?,
            max_bytes,
            policy,
        })
    }

    /// Size and kind without inflating the object body
    pub fn header(&self, hash: ObjectHash) -> Result<(u64, Option<ObjectKind>), String> {
        let oid = hash.to_git2().map_err(|e| e.message().to_string())?;
        self.odb
            .read_header(oid)
            .map(|(size, kind)| (size as u64, ObjectKind::from_git2(kind)))
            .map_err(|e| e.message().to_string())
    }

    /// Load at most `max_bytes` of a blob. Oversized blobs are truncated or
    /// skipped according to the policy; they are never returned in full.
    pub fn load(&self, hash: ObjectHash, size: u64) -> Result<LoadedContent, String> {
        let oversized = size > self.max_bytes;
        if oversized && self.policy == OversizePolicy::Skip {
            return Ok(LoadedContent {
                bytes: None,
                truncated: false,
            });
        }

        let oid = hash.to_git2().map_err(|e| e.message().to_string())?;
        let mut bytes = if oversized {
            self.read_prefix(oid)?
        } else {
            let object = self.odb.read(oid).map_err(|e| e.message().to_string())?;
            if object.kind() != git2::ObjectType::Blob {
                return Err(format!("expected blob, found {}", object.kind()));
            }
            object.data().to_vec()
        };

        let truncated = bytes.len() as u64 > self.max_bytes || oversized;
        bytes.truncate(self.max_bytes as usize);
        Ok(LoadedContent {
            bytes: Some(bytes),
            truncated,
        })
    }

    /// Streams the first `max_bytes` where the backend supports it (loose
    /// objects); packed objects fall back to a full read.
    fn read_prefix(&self, oid: git2::Oid) -> Result<Vec<u8>, String> {
        if let Ok((reader, _, _)) = self.odb.reader(oid) {
            let mut bytes = Vec::with_capacity(self.max_bytes as usize);
            if reader.take(self.max_bytes).read_to_end(&mut bytes).is_ok() {
                return Ok(bytes);
            }
        }
        let object = self.odb.read(oid).map_err(|e| e.message().to_string())?;
        let end = object.len().min(self.max_bytes as usize);
        Ok(object.data()[..end].to_vec())
    }
}
