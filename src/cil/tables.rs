//! ECMA-335 metadata: stream directory, `#~` table layout, heap access.
//!
//! The layout pass computes row counts and row sizes for every physical
//! table so the handful of tables this tool reads (TypeRef, MemberRef,
//! CustomAttribute, AssemblyRef) can be addressed directly in the raw
//! image. Nothing here materializes rows; all access is offset-based so
//! the informational-version blob can be rewritten in place.

use super::pe::PeImage;
use super::{read_u16, read_u32, read_u64, read_u8, CilError};

const TABLE_COUNT: usize = 64;

/// Highest table number this walker can size; anything beyond it would
/// make the computed table offsets wrong.
const MAX_SUPPORTED_TABLE: u64 = 0x2C;

const MODULE: usize = 0x00;
const TYPE_REF: usize = 0x01;
const TYPE_DEF: usize = 0x02;
const FIELD: usize = 0x04;
const METHOD_DEF: usize = 0x06;
const PARAM: usize = 0x08;
const INTERFACE_IMPL: usize = 0x09;
const MEMBER_REF: usize = 0x0A;
const CUSTOM_ATTRIBUTE: usize = 0x0C;
const DECL_SECURITY: usize = 0x0E;
const EVENT: usize = 0x14;
const PROPERTY: usize = 0x17;
const MODULE_REF: usize = 0x1A;
const TYPE_SPEC: usize = 0x1B;
const ASSEMBLY: usize = 0x20;
const ASSEMBLY_REF: usize = 0x23;
const FILE: usize = 0x26;
const EXPORTED_TYPE: usize = 0x27;
const MANIFEST_RESOURCE: usize = 0x28;
const GENERIC_PARAM: usize = 0x2A;
const METHOD_SPEC: usize = 0x2B;
const GENERIC_PARAM_CONSTRAINT: usize = 0x2C;

const TYPE_DEF_OR_REF: &[usize] = &[TYPE_DEF, TYPE_REF, TYPE_SPEC];
const HAS_CONSTANT: &[usize] = &[FIELD, PARAM, PROPERTY];
const HAS_CUSTOM_ATTRIBUTE: &[usize] = &[
    METHOD_DEF,
    FIELD,
    TYPE_REF,
    TYPE_DEF,
    PARAM,
    INTERFACE_IMPL,
    MEMBER_REF,
    MODULE,
    DECL_SECURITY,
    PROPERTY,
    EVENT,
    0x11, // StandAloneSig
    MODULE_REF,
    TYPE_SPEC,
    ASSEMBLY,
    ASSEMBLY_REF,
    FILE,
    EXPORTED_TYPE,
    MANIFEST_RESOURCE,
    GENERIC_PARAM,
    GENERIC_PARAM_CONSTRAINT,
    METHOD_SPEC,
];
const HAS_FIELD_MARSHAL: &[usize] = &[FIELD, PARAM];
const HAS_DECL_SECURITY: &[usize] = &[TYPE_DEF, METHOD_DEF, ASSEMBLY];
const MEMBER_REF_PARENT: &[usize] = &[TYPE_DEF, TYPE_REF, MODULE_REF, METHOD_DEF, TYPE_SPEC];
const HAS_SEMANTICS: &[usize] = &[EVENT, PROPERTY];
const METHOD_DEF_OR_REF: &[usize] = &[METHOD_DEF, MEMBER_REF];
const MEMBER_FORWARDED: &[usize] = &[FIELD, METHOD_DEF];
const IMPLEMENTATION: &[usize] = &[FILE, ASSEMBLY_REF, EXPORTED_TYPE];
const CUSTOM_ATTRIBUTE_TYPE: &[usize] = &[METHOD_DEF, MEMBER_REF];
const RESOLUTION_SCOPE: &[usize] = &[MODULE, MODULE_REF, ASSEMBLY_REF, TYPE_REF];
const TYPE_OR_METHOD_DEF: &[usize] = &[TYPE_DEF, METHOD_DEF];

/// MemberRef tag within `CustomAttributeType`.
const TAG_MEMBER_REF_CTOR: u32 = 3;
/// TypeRef tag within `MemberRefParent`.
const TAG_TYPE_REF_PARENT: u32 = 1;

const INFORMATIONAL_VERSION_ATTRIBUTE: &str = "AssemblyInformationalVersionAttribute";

/// Attribute value blob location: `content` is the file offset just past
/// the blob's length prefix, `len` the declared content length.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BlobSpan {
    content: usize,
    len: usize,
}

#[derive(Debug)]
pub(crate) struct Metadata {
    strings_offset: usize,
    strings_size: usize,
    blob_offset: usize,
    rows: [u32; TABLE_COUNT],
    row_sizes: [u32; TABLE_COUNT],
    table_offsets: [usize; TABLE_COUNT],
    str_width: u32,
    blob_width: u32,
    width_resolution_scope: u32,
    width_member_ref_parent: u32,
    width_has_custom_attribute: u32,
    width_custom_attribute_type: u32,
}

fn table_index_size(rows: &[u32; TABLE_COUNT], table: usize) -> u32 {
    if rows[table] > 0xFFFF {
        4
    } else {
        2
    }
}

fn coded_index_size(rows: &[u32; TABLE_COUNT], tag_bits: u32, members: &[usize]) -> u32 {
    let max_rows = members.iter().map(|&t| rows[t]).max().unwrap_or(0);
    if max_rows < (1u32 << (16 - tag_bits)) {
        2
    } else {
        4
    }
}

/// Physical row size of `table` per ECMA-335 II.22, given the row counts
/// and heap index widths of this image.
fn row_size(table: usize, rows: &[u32; TABLE_COUNT], s: u32, g: u32, b: u32) -> u32 {
    let idx = |t: usize| table_index_size(rows, t);
    let coded = |bits: u32, members: &[usize]| coded_index_size(rows, bits, members);

    match table {
        0x00 => 2 + s + 3 * g,                                       // Module
        0x01 => coded(2, RESOLUTION_SCOPE) + 2 * s,                  // TypeRef
        0x02 => 4 + 2 * s + coded(2, TYPE_DEF_OR_REF) + idx(FIELD) + idx(METHOD_DEF),
        0x03 => idx(FIELD),                                          // FieldPtr
        0x04 => 2 + s + b,                                           // Field
        0x05 => idx(METHOD_DEF),                                     // MethodPtr
        0x06 => 8 + s + b + idx(PARAM),                              // MethodDef
        0x07 => idx(PARAM),                                          // ParamPtr
        0x08 => 4 + s,                                               // Param
        0x09 => idx(TYPE_DEF) + coded(2, TYPE_DEF_OR_REF),           // InterfaceImpl
        0x0A => coded(3, MEMBER_REF_PARENT) + s + b,                 // MemberRef
        0x0B => 2 + coded(2, HAS_CONSTANT) + b,                      // Constant
        0x0C => coded(5, HAS_CUSTOM_ATTRIBUTE) + coded(3, CUSTOM_ATTRIBUTE_TYPE) + b,
        0x0D => coded(1, HAS_FIELD_MARSHAL) + b,                     // FieldMarshal
        0x0E => 2 + coded(2, HAS_DECL_SECURITY) + b,                 // DeclSecurity
        0x0F => 6 + idx(TYPE_DEF),                                   // ClassLayout
        0x10 => 4 + idx(FIELD),                                      // FieldLayout
        0x11 => b,                                                   // StandAloneSig
        0x12 => idx(TYPE_DEF) + idx(EVENT),                          // EventMap
        0x13 => idx(EVENT),                                          // EventPtr
        0x14 => 2 + s + coded(2, TYPE_DEF_OR_REF),                   // Event
        0x15 => idx(TYPE_DEF) + idx(PROPERTY),                       // PropertyMap
        0x16 => idx(PROPERTY),                                       // PropertyPtr
        0x17 => 2 + s + b,                                           // Property
        0x18 => 2 + idx(METHOD_DEF) + coded(1, HAS_SEMANTICS),       // MethodSemantics
        0x19 => idx(TYPE_DEF) + 2 * coded(1, METHOD_DEF_OR_REF),     // MethodImpl
        0x1A => s,                                                   // ModuleRef
        0x1B => b,                                                   // TypeSpec
        0x1C => 2 + coded(1, MEMBER_FORWARDED) + s + idx(MODULE_REF),
        0x1D => 4 + idx(FIELD),                                      // FieldRVA
        0x1E => 8,                                                   // EncLog
        0x1F => 4,                                                   // EncMap
        0x20 => 16 + b + 2 * s,                                      // Assembly
        0x21 => 4,                                                   // AssemblyProcessor
        0x22 => 12,                                                  // AssemblyOS
        0x23 => 12 + 2 * b + 2 * s,                                  // AssemblyRef
        0x24 => 4 + idx(ASSEMBLY_REF),                               // AssemblyRefProcessor
        0x25 => 12 + idx(ASSEMBLY_REF),                              // AssemblyRefOS
        0x26 => 4 + s + b,                                           // File
        0x27 => 8 + 2 * s + coded(2, IMPLEMENTATION),                // ExportedType
        0x28 => 8 + s + coded(2, IMPLEMENTATION),                    // ManifestResource
        0x29 => 2 * idx(TYPE_DEF),                                   // NestedClass
        0x2A => 4 + coded(1, TYPE_OR_METHOD_DEF) + s,                // GenericParam
        0x2B => coded(1, METHOD_DEF_OR_REF) + b,                     // MethodSpec
        0x2C => idx(GENERIC_PARAM) + coded(2, TYPE_DEF_OR_REF),      // GenericParamConstraint
        _ => 0,
    }
}

pub(crate) fn parse(data: &[u8], pe: &PeImage) -> Result<Metadata, CilError> {
    let root = pe.metadata_offset;
    let version_len = read_u32(data, root + 12)? as usize;
    let stream_count = read_u16(data, root + 16 + version_len + 2)? as usize;

    let mut tables_offset = None;
    let mut strings = None;
    let mut blob_offset = None;

    let mut cursor = root + 16 + version_len + 4;
    for _ in 0..stream_count {
        let offset = read_u32(data, cursor)? as usize;
        let size = read_u32(data, cursor + 4)? as usize;

        let name_start = cursor + 8;
        let mut name_end = name_start;
        while read_u8(data, name_end)? != 0 {
            name_end += 1;
        }
        let name = std::str::from_utf8(&data[name_start..name_end])
            .map_err(|_| CilError::Malformed("stream name is not UTF-8"))?;

        match name {
            "#~" | "#-" => tables_offset = Some(root + offset),
            "#Strings" => strings = Some((root + offset, size)),
            "#Blob" => blob_offset = Some(root + offset),
            _ => {}
        }

        let name_len = name_end - name_start + 1;
        cursor = name_start + name_len.div_ceil(4) * 4;
    }

    let tables_offset = tables_offset.ok_or(CilError::Malformed("no table stream"))?;
    let (strings_offset, strings_size) =
        strings.ok_or(CilError::Malformed("no #Strings stream"))?;
    let blob_offset = blob_offset.ok_or(CilError::Malformed("no #Blob stream"))?;

    let heap_sizes = read_u8(data, tables_offset + 6)?;
    let str_width: u32 = if heap_sizes & 0x01 != 0 { 4 } else { 2 };
    let guid_width: u32 = if heap_sizes & 0x02 != 0 { 4 } else { 2 };
    let blob_width: u32 = if heap_sizes & 0x04 != 0 { 4 } else { 2 };

    let valid = read_u64(data, tables_offset + 8)?;
    if valid >> (MAX_SUPPORTED_TABLE + 1) != 0 {
        return Err(CilError::Malformed("unsupported metadata table present"));
    }

    let mut rows = [0u32; TABLE_COUNT];
    let mut cursor = tables_offset + 24;
    for (table, count) in rows.iter_mut().enumerate() {
        if valid & (1u64 << table) != 0 {
            *count = read_u32(data, cursor)?;
            cursor += 4;
        }
    }

    let mut row_sizes = [0u32; TABLE_COUNT];
    for (table, size) in row_sizes.iter_mut().enumerate() {
        *size = row_size(table, &rows, str_width, guid_width, blob_width);
    }

    let mut table_offsets = [0usize; TABLE_COUNT];
    for table in 0..TABLE_COUNT {
        table_offsets[table] = cursor;
        cursor += rows[table] as usize * row_sizes[table] as usize;
    }

    Ok(Metadata {
        strings_offset,
        strings_size,
        blob_offset,
        rows,
        row_sizes,
        table_offsets,
        str_width,
        blob_width,
        width_resolution_scope: coded_index_size(&rows, 2, RESOLUTION_SCOPE),
        width_member_ref_parent: coded_index_size(&rows, 3, MEMBER_REF_PARENT),
        width_has_custom_attribute: coded_index_size(&rows, 5, HAS_CUSTOM_ATTRIBUTE),
        width_custom_attribute_type: coded_index_size(&rows, 3, CUSTOM_ATTRIBUTE_TYPE),
    })
}

impl Metadata {
    fn index_at(&self, data: &[u8], offset: usize, width: u32) -> Result<u32, CilError> {
        if width == 4 {
            read_u32(data, offset)
        } else {
            Ok(u32::from(read_u16(data, offset)?))
        }
    }

    fn row_offset(&self, table: usize, row: u32) -> usize {
        self.table_offsets[table] + row as usize * self.row_sizes[table] as usize
    }

    fn string_at<'a>(&self, data: &'a [u8], index: u32) -> Result<&'a str, CilError> {
        let index = index as usize;
        if index >= self.strings_size {
            return Err(CilError::Malformed("string index outside heap"));
        }

        let start = self.strings_offset + index;
        let limit = (self.strings_offset + self.strings_size).min(data.len());
        let mut end = start;
        while end < limit && data[end] != 0 {
            end += 1;
        }

        std::str::from_utf8(
            data.get(start..end)
                .ok_or(CilError::Malformed("truncated string heap"))?,
        )
        .map_err(|_| CilError::Malformed("string heap entry is not UTF-8"))
    }

    /// Locate the informational-version attribute's value blob.
    ///
    /// The attribute's constructor is a MemberRef whose class is a TypeRef
    /// named `AssemblyInformationalVersionAttribute`; a MethodDef
    /// constructor would mean the attribute type lives in the module
    /// itself, which never happens for the SDK attribute.
    pub fn informational_version_blob(&self, data: &[u8]) -> Result<usize, CilError> {
        for row in 0..self.rows[CUSTOM_ATTRIBUTE] {
            let base = self.row_offset(CUSTOM_ATTRIBUTE, row);
            let type_offset = base + self.width_has_custom_attribute as usize;
            let value_offset = type_offset + self.width_custom_attribute_type as usize;

            let type_coded = self.index_at(data, type_offset, self.width_custom_attribute_type)?;
            if type_coded & 0x7 != TAG_MEMBER_REF_CTOR {
                continue;
            }
            let member_row = type_coded >> 3;
            if member_row == 0 || member_row > self.rows[MEMBER_REF] {
                continue;
            }

            let member_base = self.row_offset(MEMBER_REF, member_row - 1);
            let class_coded = self.index_at(data, member_base, self.width_member_ref_parent)?;
            if class_coded & 0x7 != TAG_TYPE_REF_PARENT {
                continue;
            }
            let type_row = class_coded >> 3;
            if type_row == 0 || type_row > self.rows[TYPE_REF] {
                continue;
            }

            let type_base = self.row_offset(TYPE_REF, type_row - 1);
            let name_index = self.index_at(
                data,
                type_base + self.width_resolution_scope as usize,
                self.str_width,
            )?;
            if self.string_at(data, name_index)? == INFORMATIONAL_VERSION_ATTRIBUTE {
                let value_index = self.index_at(data, value_offset, self.blob_width)?;
                return Ok(self.blob_offset + value_index as usize);
            }
        }

        Err(CilError::MissingVersionAttribute)
    }

    /// Decode the version string and its blob span from a custom-attribute
    /// value blob (prolog, SerString fixed argument, named-argument count).
    pub fn read_version_blob(
        &self,
        data: &[u8],
        entry: usize,
    ) -> Result<(String, BlobSpan), CilError> {
        let (blob_len, len_width) = read_compressed_u32(data, entry)?;
        let content = entry + len_width;

        if read_u16(data, content)? != 0x0001 {
            return Err(CilError::Malformed("bad custom attribute prolog"));
        }
        let (str_len, str_len_width) = read_compressed_u32(data, content + 2)?;
        let start = content + 2 + str_len_width;
        let bytes = data
            .get(start..start + str_len as usize)
            .ok_or(CilError::Malformed("truncated attribute value"))?;
        let value = std::str::from_utf8(bytes)
            .map_err(|_| CilError::Malformed("version string is not UTF-8"))?
            .to_string();

        Ok((
            value,
            BlobSpan {
                content,
                len: blob_len as usize,
            },
        ))
    }

    /// Rewrite the attribute value blob in place. The blob's declared
    /// length stays untouched, so the heap layout and every other blob
    /// index remain valid; the shorter payload is zero-padded to the
    /// original size.
    pub fn write_version_blob(
        &self,
        data: &mut [u8],
        span: BlobSpan,
        new_version: &str,
    ) -> Result<(), CilError> {
        let mut payload = Vec::with_capacity(new_version.len() + 8);
        payload.extend_from_slice(&0x0001u16.to_le_bytes());
        payload.extend_from_slice(&encode_compressed_u32(new_version.len() as u32)?);
        payload.extend_from_slice(new_version.as_bytes());
        payload.extend_from_slice(&0u16.to_le_bytes());

        if payload.len() > span.len {
            return Err(CilError::VersionTooLong {
                version: new_version.to_string(),
            });
        }
        let region = data
            .get_mut(span.content..span.content + span.len)
            .ok_or(CilError::Malformed("truncated blob heap"))?;
        region[..payload.len()].copy_from_slice(&payload);
        region[payload.len()..].fill(0);

        Ok(())
    }

    /// Names of every AssemblyRef row.
    pub fn assembly_ref_names(&self, data: &[u8]) -> Result<Vec<String>, CilError> {
        let mut names = Vec::with_capacity(self.rows[ASSEMBLY_REF] as usize);
        for row in 0..self.rows[ASSEMBLY_REF] {
            let base = self.row_offset(ASSEMBLY_REF, row);
            // version (8) + flags (4) + public key token, then the name
            let name_offset = base + 12 + self.blob_width as usize;
            let name_index = self.index_at(data, name_offset, self.str_width)?;
            names.push(self.string_at(data, name_index)?.to_string());
        }
        Ok(names)
    }
}

/// Decode an ECMA-335 compressed unsigned integer, returning the value
/// and its encoded width.
fn read_compressed_u32(data: &[u8], offset: usize) -> Result<(u32, usize), CilError> {
    let first = u32::from(read_u8(data, offset)?);
    if first & 0x80 == 0 {
        Ok((first, 1))
    } else if first & 0xC0 == 0x80 {
        let second = u32::from(read_u8(data, offset + 1)?);
        Ok((((first & 0x3F) << 8) | second, 2))
    } else if first & 0xE0 == 0xC0 {
        let b1 = u32::from(read_u8(data, offset + 1)?);
        let b2 = u32::from(read_u8(data, offset + 2)?);
        let b3 = u32::from(read_u8(data, offset + 3)?);
        Ok((((first & 0x1F) << 24) | (b1 << 16) | (b2 << 8) | b3, 4))
    } else {
        Err(CilError::Malformed("invalid compressed integer"))
    }
}

fn encode_compressed_u32(value: u32) -> Result<Vec<u8>, CilError> {
    if value < 0x80 {
        Ok(vec![value as u8])
    } else if value < 0x4000 {
        Ok(vec![(0x80 | (value >> 8)) as u8, value as u8])
    } else if value < 0x2000_0000 {
        Ok(vec![
            (0xC0 | (value >> 24)) as u8,
            (value >> 16) as u8,
            (value >> 8) as u8,
            value as u8,
        ])
    } else {
        Err(CilError::Malformed("value too large for compressed integer"))
    }
}
