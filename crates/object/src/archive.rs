//! The `.ba` static library format: a small member index followed by concatenated
//! [`ObjectFile`](crate::ObjectFile) images, the same shape the assembler's `-makelib` flag and
//! the linker's `-l`/`-L` flags expect.

use snafu::prelude::*;

use crate::serialize;
use crate::ObjectFile;

pub const MAGIC: [u8; 4] = *b"BSMA";

#[derive(Debug, Snafu, PartialEq, Eq, Clone)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("Bad archive magic: expected {MAGIC:?}, found {found:?}"))]
    BadMagic { found: [u8; 4] },
    #[snafu(display("Archive is truncated"))]
    Truncated,
    #[snafu(display("Member {index} failed to parse: {source}"))]
    BadMember { index: usize, source: serialize::Error },
}
pub type Result<T> = core::result::Result<T, Error>;

/// A `.ba` static library: an ordered collection of relocatable object members.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StaticLibrary {
    pub members: Vec<ObjectFile>,
}

impl StaticLibrary {
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let bodies: Vec<Vec<u8>> = self.members.iter().map(ObjectFile::to_bytes).collect();

        let mut out = Vec::new();
        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(&(bodies.len() as u32).to_le_bytes());
        for body in &bodies {
            out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        }
        for body in &bodies {
            out.extend_from_slice(body);
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ensure!(bytes.len() >= 8, TruncatedSnafu);
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[..4]);
        ensure!(magic == MAGIC, BadMagicSnafu { found: magic });

        let count = u32::from_le_bytes(bytes[4..8].try_into().unwrap()) as usize;
        let mut cursor = 8usize;
        ensure!(bytes.len() >= cursor + count * 4, TruncatedSnafu);
        let mut sizes = Vec::with_capacity(count);
        for i in 0..count {
            let start = cursor + i * 4;
            sizes.push(u32::from_le_bytes(bytes[start..start + 4].try_into().unwrap()) as usize);
        }
        cursor += count * 4;

        let mut members = Vec::with_capacity(count);
        for (index, size) in sizes.into_iter().enumerate() {
            ensure!(bytes.len() >= cursor + size, TruncatedSnafu);
            let member = ObjectFile::from_bytes(&bytes[cursor..cursor + size])
                .map_err(|source| Error::BadMember { index, source })?;
            members.push(member);
            cursor += size;
        }
        Ok(Self { members })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ObjectHeader;

    fn empty_object() -> ObjectFile {
        ObjectFile { header: ObjectHeader::default(), sections: vec![], symbols: vec![], rel_text: vec![], rel_data: vec![] }
    }

    #[test]
    fn round_trips_multiple_members() {
        let lib = StaticLibrary { members: vec![empty_object(), empty_object()] };
        let bytes = lib.to_bytes();
        let parsed = StaticLibrary::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, lib);
    }

    #[test]
    fn rejects_bad_magic() {
        let bytes = vec![0u8; 16];
        assert!(matches!(StaticLibrary::from_bytes(&bytes), Err(Error::BadMagic { .. })));
    }
}
