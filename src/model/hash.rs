use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// SHA-1 object identity shared by every stage of the pipeline.
///
/// Everything downstream of the harvester (scan cache, output paths, the
/// resume ledger) is keyed by this value, never by path or job.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectHash([u8; 20]);

impl ObjectHash {
    pub const fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; 20]>::try_from(bytes).ok().map(Self)
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, hex::FromHexError> {
        let mut out = [0u8; 20];
        hex::decode_to_slice(hex_str, &mut out)?;
        Ok(Self(out))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Abbreviated form for log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }

    pub fn to_object_id(&self) -> gix::ObjectId {
        gix::ObjectId::from(self.0)
    }

    pub fn to_git2(&self) -> Result<git2::Oid, git2::Error> {
        git2::Oid::from_bytes(&self.0)
    }
}

impl From<gix::ObjectId> for ObjectHash {
    fn from(oid: gix::ObjectId) -> Self {
        let mut out = [0u8; 20];
        let bytes = oid.as_bytes();
        let n = bytes.len().min(20);
        out[..n].copy_from_slice(&bytes[..n]);
        Self(out)
    }
}

impl From<git2::Oid> for ObjectHash {
    fn from(oid: git2::Oid) -> Self {
        let mut out = [0u8; 20];
        let bytes = oid.as_bytes();
        let n = bytes.len().min(20);
        out[..n].copy_from_slice(&bytes[..n]);
        Self(out)
    }
}

impl fmt::Display for ObjectHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ObjectHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectHash({})", self.to_hex())
    }
}

impl Serialize for ObjectHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ObjectHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip() {
        let hex_str = "0123456789abcdef0123456789abcdef01234567";
        let hash = ObjectHash::from_hex(hex_str).unwrap();
        assert_eq!(hash.to_hex(), hex_str);
        assert_eq!(hash.short(), "01234567");
    }

    #[test]
    fn test_rejects_bad_hex() {
        assert!(ObjectHash::from_hex("xyz").is_err());
        assert!(ObjectHash::from_slice(&[0u8; 19]).is_none());
    }

    #[test]
    fn test_git2_conversion() {
        let oid = git2::Oid::from_str("0123456789abcdef0123456789abcdef01234567").unwrap();
        let hash = ObjectHash::from(oid);
        assert_eq!(hash.to_git2().unwrap(), oid);
    }

    #[test]
    fn test_serde_as_hex_string() {
        let hash = ObjectHash::from_bytes([0xab; 20]);
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{}\"", "ab".repeat(20)));
        let back: ObjectHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
    }
}
