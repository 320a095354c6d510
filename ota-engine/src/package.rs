// Copyright 2024 The Fuchsia Authors
//
// Licensed under a BSD-style license <LICENSE-BSD>, Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0>, or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to
// those terms.

use crate::common::{PackageId, PackageKind};
use hex::{FromHex, FromHexError};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// The size of a checksum in bytes.
pub const CHECKSUM_SIZE: usize = 32;

/// SHA-256 digest of a package payload.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Checksum([u8; CHECKSUM_SIZE]);

impl Checksum {
    pub fn of(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0[..]
    }

    pub const fn from_array(arr: [u8; CHECKSUM_SIZE]) -> Self {
        Self(arr)
    }
}

impl std::str::FromStr for Checksum {
    type Err = ParseChecksumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(FromHex::from_hex(s)?))
    }
}

impl From<[u8; CHECKSUM_SIZE]> for Checksum {
    fn from(bytes: [u8; CHECKSUM_SIZE]) -> Self {
        Self(bytes)
    }
}

impl TryFrom<&[u8]> for Checksum {
    type Error = std::array::TryFromSliceError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        Ok(Self(bytes.try_into()?))
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Checksum").field(&self.to_string()).finish()
    }
}

impl Serialize for Checksum {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Checksum {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// An error encountered while parsing a [`Checksum`].
#[derive(Copy, Clone, Debug, Error, PartialEq)]
pub struct ParseChecksumError(FromHexError);

impl fmt::Display for ParseChecksumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            FromHexError::InvalidStringLength => {
                write!(f, "{}, expected {} hex encoded bytes", self.0, CHECKSUM_SIZE)
            }
            _ => write!(f, "{}", self.0),
        }
    }
}

impl From<FromHexError> for ParseChecksumError {
    fn from(e: FromHexError) -> Self {
        ParseChecksumError(e)
    }
}

/// An uploaded OTA package. Never mutated after creation; sessions share it through an `Arc`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Package {
    id: PackageId,
    kind: PackageKind,
    name: String,
    version: String,
    size: usize,
    checksum: Checksum,
    content: Arc<[u8]>,
}

impl Package {
    pub fn new(
        kind: PackageKind,
        name: impl Into<String>,
        version: impl Into<String>,
        content: impl Into<Arc<[u8]>>,
    ) -> Self {
        let content = content.into();
        Self {
            id: PackageId::new(),
            kind,
            name: name.into(),
            version: version.into(),
            size: content.len(),
            checksum: Checksum::of(&content),
            content,
        }
    }

    pub fn id(&self) -> PackageId {
        self.id
    }

    pub fn kind(&self) -> PackageKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn checksum(&self) -> &Checksum {
        &self.checksum
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    /// Number of blocks the payload splits into. An empty payload still takes one (empty) block.
    pub fn block_count(&self, block_size: usize) -> u32 {
        let block_size = block_size.max(1);
        (self.size.div_ceil(block_size)).max(1) as u32
    }

    pub fn block(&self, index: u32, block_size: usize) -> Option<&[u8]> {
        let block_size = block_size.max(1);
        if index >= self.block_count(block_size) {
            return None;
        }
        let start = index as usize * block_size;
        let end = (start + block_size).min(self.size);
        Some(&self.content[start..end])
    }

    pub fn verify(&self, bytes: &[u8]) -> bool {
        bytes.len() == self.size && Checksum::of(bytes) == self.checksum
    }
}

/// Holds every uploaded package. Filled before it is shared, then read-only.
#[derive(Debug, Default)]
pub struct PackageStore {
    packages: HashMap<PackageId, Arc<Package>>,
}

impl PackageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, package: Package) -> PackageId {
        let id = package.id();
        tracing::debug!(
            "Stored {} package {} {} ({} bytes, checksum {})",
            package.kind(),
            package.name(),
            package.version(),
            package.size(),
            package.checksum()
        );
        self.packages.insert(id, Arc::new(package));
        id
    }

    pub fn get(&self, id: &PackageId) -> Option<Arc<Package>> {
        self.packages.get(id).cloned()
    }

    pub fn find(&self, kind: PackageKind, name: &str, version: &str) -> Option<Arc<Package>> {
        self.packages
            .values()
            .find(|p| p.kind() == kind && p.name() == name && p.version() == version)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}
