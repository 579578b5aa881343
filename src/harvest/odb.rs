//! Object store inventory
//!
//! Lists every object id physically present in a store (pack indexes and
//! loose objects) without consulting refs.

use gix_hash::Kind as HashKind;
use gix_pack::index;
use std::path::Path;
use tracing::warn;

use crate::model::ObjectHash;

/// Every object id found on disk, sorted and deduplicated
#[derive(Debug, Default)]
pub struct ObjectInventory {
    pub objects: Vec<ObjectHash>,
    pub packs: usize,
    pub loose: usize,
    /// Pack indexes that could not be opened
    pub unreadable: Vec<String>,
}

impl ObjectInventory {
    /// Scan `objects_dir` (the `objects/` directory of a repository)
    pub fn load(objects_dir: &Path) -> Self {
        let mut inventory = Self::default();
        inventory.load_packs(objects_dir);
        inventory.load_loose(objects_dir);
        inventory.objects.sort_unstable();
        inventory.objects.dedup();
        inventory
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    fn load_packs(&mut self, objects_dir: &Path) {
        let pack_dir = objects_dir.join("pack");
        let Ok(entries) = std::fs::read_dir(&pack_dir) else {
            return;
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if !path.extension().is_some_and(|e| e == "idx") {
                continue;
            }
            match index::File::at(&path, HashKind::Sha1) {
                Ok(idx) => {
                    self.packs += 1;
                    self.objects.reserve(idx.num_objects() as usize);
                    for entry in idx.iter() {
                        self.objects.push(ObjectHash::from(entry.oid));
                    }
                }
                Err(e) => {
                    warn!(index = %path.display(), error = %e, "unreadable pack index");
                    self.unreadable.push(format!("{}: {}", path.display(), e));
                }
            }
        }
    }

    fn load_loose(&mut self, objects_dir: &Path) {
        let Ok(fanout) = std::fs::read_dir(objects_dir) else {
            return;
        };

        for dir in fanout.flatten() {
            let dir_name = dir.file_name();
            let Some(prefix) = dir_name.to_str() else {
                continue;
            };
            if prefix.len() != 2 || !prefix.bytes().all(|b| b.is_ascii_hexdigit()) {
                continue;
            }
            let Ok(files) = std::fs::read_dir(dir.path()) else {
                continue;
            };
            for file in files.flatten() {
                let file_name = file.file_name();
                let Some(rest) = file_name.to_str() else {
                    continue;
                };
                if rest.len() != 38 {
                    continue;
                }
                if let Ok(hash) = ObjectHash::from_hex(&format!("{prefix}{rest}")) {
                    self.objects.push(hash);
                    self.loose += 1;
                }
            }
        }
    }
}
