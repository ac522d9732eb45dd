//! Registered provider names, both directions.
//!
//! Built from a `PROVIDER_ENUMERATION_INFO` blob:
//!   NumberOfProviders u32 │ Reserved u32 │ TRACE_PROVIDER_INFO × n │ names
//! where each `TRACE_PROVIDER_INFO` is GUID (16) + SchemaSource (4) +
//! ProviderNameOffset (4), the offset counted from the start of the blob.

use std::collections::{BTreeMap, HashMap};

use super::error::{DecodeError, Result, TraceError};
use super::guid::Guid;
use super::native::from_wide;

const HEADER_SIZE: usize = 8;
const ENTRY_SIZE: usize = 24;

#[derive(Debug, Clone, Default)]
pub struct ProviderList {
    by_name: HashMap<String, Guid>,
    by_guid: BTreeMap<Guid, String>,
}

impl ProviderList {
    pub fn from_enumeration(blob: &[u8]) -> Result<Self, DecodeError> {
        let count = blob
            .get(0..4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize)
            .ok_or(DecodeError::MalformedSchema("provider blob shorter than its header"))?;

        let mut list = Self::default();
        for i in 0..count {
            let at = HEADER_SIZE + i * ENTRY_SIZE;
            let entry = blob
                .get(at..at + ENTRY_SIZE)
                .ok_or(DecodeError::MalformedSchema("provider entry exceeds buffer"))?;

            let mut guid = [0u8; 16];
            guid.copy_from_slice(&entry[..16]);
            let offset = u32::from_le_bytes([entry[20], entry[21], entry[22], entry[23]]) as usize;
            let name = read_name(blob, offset)?;
            list.insert(name, Guid::from_bytes_le(guid));
        }
        Ok(list)
    }

    /// Ask the OS for every registered provider.
    #[cfg(windows)]
    pub fn enumerate() -> Result<Self> {
        let blob = super::native::enumerate_providers()?;
        Ok(Self::from_enumeration(&blob)?)
    }

    fn insert(&mut self, name: String, guid: Guid) {
        self.by_guid.insert(guid, name.clone());
        self.by_name.insert(name, guid);
    }

    pub fn guid(&self, name: &str) -> Result<Guid> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| TraceError::ProviderNotFound(name.into()))
    }

    pub fn name(&self, guid: &Guid) -> Result<&str> {
        self.by_guid
            .get(guid)
            .map(String::as_str)
            .ok_or_else(|| TraceError::ProviderNotFound(guid.to_string()))
    }

    pub fn has_name(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn has_guid(&self, guid: &Guid) -> bool {
        self.by_guid.contains_key(guid)
    }

    pub fn len(&self) -> usize {
        self.by_guid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_guid.is_empty()
    }

    /// Providers ordered by GUID.
    pub fn iter(&self) -> impl Iterator<Item = (&Guid, &str)> {
        self.by_guid.iter().map(|(g, n)| (g, n.as_str()))
    }
}

fn read_name(blob: &[u8], offset: usize) -> Result<String, DecodeError> {
    let tail = blob
        .get(offset..)
        .ok_or(DecodeError::MalformedSchema("provider name outside buffer"))?;
    let units: Vec<u16> = tail
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|&u| u != 0)
        .collect();
    Ok(from_wide(&units))
}
