//! PE image walking: headers, section table, RVA translation.
//!
//! Only the slice of the format needed to reach the CLI metadata root:
//! DOS stub, COFF header, PE32/PE32+ optional header data directories,
//! and the section table for RVA-to-file-offset mapping.

use super::{read_u16, read_u32, CilError};

const DOS_MAGIC: &[u8] = b"MZ";
const PE_SIGNATURE: &[u8] = b"PE\0\0";
const METADATA_SIGNATURE: u32 = 0x424A_5342;

const PE32_MAGIC: u16 = 0x10B;
const PE32_PLUS_MAGIC: u16 = 0x20B;

const RESOURCE_DIRECTORY: usize = 2;
const CLR_DIRECTORY: usize = 14;

#[derive(Debug)]
pub(crate) struct Section {
    virtual_address: u32,
    virtual_size: u32,
    raw_offset: u32,
    raw_size: u32,
}

#[derive(Debug)]
pub(crate) struct PeImage {
    sections: Vec<Section>,
    pub metadata_offset: usize,
    pub has_resource_dir: bool,
}

impl PeImage {
    pub fn rva_to_offset(&self, rva: u32) -> Result<usize, CilError> {
        for section in &self.sections {
            let span = section.virtual_size.max(section.raw_size);
            if rva >= section.virtual_address && rva < section.virtual_address + span {
                return Ok((rva - section.virtual_address + section.raw_offset) as usize);
            }
        }
        Err(CilError::Malformed("RVA outside any section"))
    }
}

pub(crate) fn parse(data: &[u8]) -> Result<PeImage, CilError> {
    if data.len() < 64 || &data[0..2] != DOS_MAGIC {
        return Err(CilError::Malformed("missing MZ header"));
    }

    let pe_offset = read_u32(data, 0x3C)? as usize;
    if data.get(pe_offset..pe_offset + 4) != Some(PE_SIGNATURE) {
        return Err(CilError::Malformed("missing PE signature"));
    }

    let coff = pe_offset + 4;
    let section_count = read_u16(data, coff + 2)? as usize;
    let optional_size = read_u16(data, coff + 16)? as usize;
    let optional = coff + 20;

    let (dir_count_offset, dirs_offset) = match read_u16(data, optional)? {
        PE32_MAGIC => (optional + 92, optional + 96),
        PE32_PLUS_MAGIC => (optional + 108, optional + 112),
        _ => return Err(CilError::Malformed("unknown optional header magic")),
    };
    let dir_count = read_u32(data, dir_count_offset)? as usize;

    let has_resource_dir = dir_count > RESOURCE_DIRECTORY && {
        let rva = read_u32(data, dirs_offset + RESOURCE_DIRECTORY * 8)?;
        let size = read_u32(data, dirs_offset + RESOURCE_DIRECTORY * 8 + 4)?;
        rva != 0 && size != 0
    };

    if dir_count <= CLR_DIRECTORY {
        return Err(CilError::Malformed("no CLR data directory"));
    }
    let clr_rva = read_u32(data, dirs_offset + CLR_DIRECTORY * 8)?;
    if clr_rva == 0 {
        return Err(CilError::Malformed("not a managed binary"));
    }

    let section_table = optional + optional_size;
    let mut sections = Vec::with_capacity(section_count);
    for index in 0..section_count {
        let base = section_table + index * 40;
        sections.push(Section {
            virtual_size: read_u32(data, base + 8)?,
            virtual_address: read_u32(data, base + 12)?,
            raw_size: read_u32(data, base + 16)?,
            raw_offset: read_u32(data, base + 20)?,
        });
    }

    let mut image = PeImage {
        sections,
        metadata_offset: 0,
        has_resource_dir,
    };

    let clr_offset = image.rva_to_offset(clr_rva)?;
    let metadata_rva = read_u32(data, clr_offset + 8)?;
    image.metadata_offset = image.rva_to_offset(metadata_rva)?;

    if read_u32(data, image.metadata_offset)? != METADATA_SIGNATURE {
        return Err(CilError::Malformed("bad metadata signature"));
    }

    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::AssemblyBuilder;

    #[test]
    fn test_rejects_non_pe_input() {
        let err = parse(b"definitely not an executable").unwrap_err();
        assert!(matches!(err, CilError::Malformed(_)));
    }

    #[test]
    fn test_locates_metadata_root() {
        let image = AssemblyBuilder::new("Couchbase.Lite")
            .informational_version("1.3.0-build0100")
            .build();
        let pe = parse(&image).unwrap();
        assert!(pe.metadata_offset > 0);
        assert!(!pe.has_resource_dir);
    }

    #[test]
    fn test_detects_resource_directory() {
        let image = AssemblyBuilder::new("Couchbase.Lite")
            .informational_version("1.3.0-build0100")
            .native_version_resource(true)
            .build();
        let pe = parse(&image).unwrap();
        assert!(pe.has_resource_dir);
    }
}
