//! Peer-supplied file metadata.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Attribute kinds carried in search results and transfer records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FileAttribute {
    /// Bitrate in kbps.
    Bitrate,
    /// Duration in seconds.
    Duration,
    /// 1 when the bitrate is variable.
    Vbr,
    /// Encoder identifier.
    Encoder,
    /// Sample rate in Hz.
    SampleRate,
    /// Bits per sample.
    BitDepth,
}

impl FileAttribute {
    /// Numeric code used on the wire and on disk.
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::Bitrate => 0,
            Self::Duration => 1,
            Self::Vbr => 2,
            Self::Encoder => 3,
            Self::SampleRate => 4,
            Self::BitDepth => 5,
        }
    }
}

/// Mapping of attribute code to value.
///
/// Unknown codes are kept so records written by newer clients survive a
/// load/save cycle untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileAttributes(BTreeMap<u32, u32>);

impl FileAttributes {
    /// Empty mapping.
    #[must_use]
    pub const fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Value for a known attribute.
    #[must_use]
    pub fn get(&self, attribute: FileAttribute) -> Option<u32> {
        self.0.get(&attribute.code()).copied()
    }

    /// Set a known attribute.
    pub fn set(&mut self, attribute: FileAttribute, value: u32) {
        self.0.insert(attribute.code(), value);
    }

    /// Set an attribute by raw code.
    pub fn insert_code(&mut self, code: u32, value: u32) {
        self.0.insert(code, value);
    }

    /// Whether no attribute is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Borrow the raw mapping.
    #[must_use]
    pub const fn as_map(&self) -> &BTreeMap<u32, u32> {
        &self.0
    }

    /// `true` when the VBR flag is set.
    #[must_use]
    pub fn is_vbr(&self) -> bool {
        self.get(FileAttribute::Vbr).is_some_and(|flag| flag > 0)
    }
}

impl From<BTreeMap<u32, u32>> for FileAttributes {
    fn from(map: BTreeMap<u32, u32>) -> Self {
        Self(map)
    }
}

impl FromIterator<(FileAttribute, u32)> for FileAttributes {
    fn from_iter<I: IntoIterator<Item = (FileAttribute, u32)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(attribute, value)| (attribute.code(), value))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_string_codes() {
        let attributes: FileAttributes = [(FileAttribute::Bitrate, 320), (FileAttribute::Duration, 252)]
            .into_iter()
            .collect();
        let json = serde_json::to_string(&attributes).unwrap();
        assert_eq!(json, r#"{"0":320,"1":252}"#);

        let parsed: FileAttributes = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, attributes);
        assert!(!parsed.is_vbr());
    }

    #[test]
    fn unknown_codes_survive() {
        let mut attributes = FileAttributes::new();
        attributes.insert_code(42, 7);
        attributes.set(FileAttribute::Vbr, 1);
        assert_eq!(attributes.as_map().get(&42), Some(&7));
        assert!(attributes.is_vbr());
    }
}
