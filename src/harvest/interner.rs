//! Path arena for provenance gathered outside the ref walk
//!
//! Dangling provenance is held until the whole store has been walked. Every
//! distinct path is copied once into a shared byte buffer and referred to
//! by id.

use rustc_hash::FxHashMap;
use std::borrow::Cow;
use std::ops::Range;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct PathId(u32);

#[derive(Default)]
pub struct PathInterner {
    buf: Vec<u8>,
    spans: Vec<Range<usize>>,
    ids: FxHashMap<Box<[u8]>, PathId>,
}

impl PathInterner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, path: &[u8]) -> PathId {
        if let Some(&id) = self.ids.get(path) {
            return id;
        }
        let id = PathId(self.spans.len() as u32);
        let start = self.buf.len();
        self.buf.extend_from_slice(path);
        self.spans.push(start..self.buf.len());
        self.ids.insert(path.into(), id);
        id
    }

    pub fn bytes(&self, id: PathId) -> &[u8] {
        &self.buf[self.spans[id.0 as usize].clone()]
    }

    /// Lossy UTF-8 view; non-UTF-8 bytes become U+FFFD
    pub fn resolve(&self, id: PathId) -> Cow<'_, str> {
        String::from_utf8_lossy(self.bytes(id))
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_path_same_id() {
        let mut interner = PathInterner::new();
        let env = interner.intern(b"config/.env");
        let key = interner.intern(b"keys/id_rsa");
        assert_eq!(interner.intern(b"config/.env"), env);
        assert_ne!(env, key);
        assert_eq!(interner.len(), 2);
        assert_eq!(interner.bytes(key), b"keys/id_rsa");
    }

    #[test]
    fn test_resolve_is_lossy() {
        let mut interner = PathInterner::new();
        let id = interner.intern(b"bad\xffname");
        assert_eq!(interner.resolve(id), "bad\u{fffd}name");
    }
}
