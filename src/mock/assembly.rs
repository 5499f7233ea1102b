//! Minimal managed-binary image synthesis.
//!
//! Emits a valid-enough PE32 image: one `.text` section holding a CLR
//! header and a metadata root with `#~`, `#Strings`, `#GUID` and `#Blob`
//! streams. The table stream carries a Module row, the
//! `AssemblyInformationalVersionAttribute` TypeRef/MemberRef pair, an
//! Assembly row with the custom attribute, and one AssemblyRef row per
//! configured reference (plus mscorlib). All heap and table indexes are
//! narrow; the images stay well under the wide-index thresholds.

use std::io;
use std::path::Path;

const SECTION_RVA: u32 = 0x2000;
const FILE_ALIGNMENT: u32 = 0x200;
const CLR_HEADER_SIZE: u32 = 72;

/// Builder for synthetic managed binaries
pub struct AssemblyBuilder {
    name: String,
    informational_version: Option<String>,
    version_blob_padding: usize,
    assembly_refs: Vec<String>,
    native_version_resource: bool,
}

impl AssemblyBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            informational_version: None,
            version_blob_padding: 0,
            assembly_refs: Vec::new(),
            native_version_resource: false,
        }
    }

    /// Record an informational version attribute.
    pub fn informational_version(mut self, version: &str) -> Self {
        self.informational_version = Some(version.to_string());
        self
    }

    /// Reserve extra zero bytes in the attribute value blob, leaving room
    /// for a later rewrite to a longer version string.
    pub fn version_blob_padding(mut self, bytes: usize) -> Self {
        self.version_blob_padding = bytes;
        self
    }

    /// Add an assembly reference by name.
    pub fn assembly_ref(mut self, name: &str) -> Self {
        self.assembly_refs.push(name.to_string());
        self
    }

    /// Mark the image as carrying a native resource directory.
    pub fn native_version_resource(mut self, present: bool) -> Self {
        self.native_version_resource = present;
        self
    }

    pub fn write_to(&self, path: &Path) -> io::Result<()> {
        std::fs::write(path, self.build())
    }

    pub fn build(&self) -> Vec<u8> {
        let metadata = self.build_metadata();
        self.wrap_pe(&metadata)
    }

    fn build_metadata(&self) -> Vec<u8> {
        let mut strings = StringsHeap::new();
        let module_name = strings.add(&format!("{}.dll", self.name));
        let attr_name = strings.add("AssemblyInformationalVersionAttribute");
        let attr_namespace = strings.add("System.Reflection");
        let ctor_name = strings.add(".ctor");
        let assembly_name = strings.add(&self.name);
        let corlib_name = strings.add("mscorlib");
        let ref_names: Vec<u16> = self.assembly_refs.iter().map(|r| strings.add(r)).collect();

        let mut blobs = BlobHeap::new();
        // instance void .ctor(string)
        let ctor_sig = blobs.add(&[0x20, 0x01, 0x01, 0x0E]);
        let attr_value = self.informational_version.as_ref().map(|version| {
            let mut value = vec![0x01, 0x00];
            value.push(version.len() as u8); // versions stay short
            value.extend_from_slice(version.as_bytes());
            value.extend_from_slice(&[0x00, 0x00]);
            value.extend(std::iter::repeat(0u8).take(self.version_blob_padding));
            blobs.add(&value)
        });

        let mut tables = Vec::new();
        // Module: Generation, Name, Mvid, EncId, EncBaseId
        push_u16(&mut tables, 0);
        push_u16(&mut tables, module_name);
        push_u16(&mut tables, 1);
        push_u16(&mut tables, 0);
        push_u16(&mut tables, 0);
        // TypeRef: scope = AssemblyRef row 1 (mscorlib)
        push_u16(&mut tables, (1 << 2) | 2);
        push_u16(&mut tables, attr_name);
        push_u16(&mut tables, attr_namespace);
        // MemberRef: class = TypeRef row 1
        push_u16(&mut tables, (1 << 3) | 1);
        push_u16(&mut tables, ctor_name);
        push_u16(&mut tables, ctor_sig);
        // CustomAttribute: parent = Assembly row 1, type = MemberRef row 1
        if let Some(value) = attr_value {
            push_u16(&mut tables, (1 << 5) | 14);
            push_u16(&mut tables, (1 << 3) | 3);
            push_u16(&mut tables, value);
        }
        // Assembly: HashAlgId, version, Flags, PublicKey, Name, Culture
        push_u32(&mut tables, 0x8004);
        for part in [1u16, 0, 0, 0] {
            push_u16(&mut tables, part);
        }
        push_u32(&mut tables, 0);
        push_u16(&mut tables, 0);
        push_u16(&mut tables, assembly_name);
        push_u16(&mut tables, 0);
        // AssemblyRef: mscorlib first, then the configured references
        for name in std::iter::once(corlib_name).chain(ref_names) {
            for part in [4u16, 0, 0, 0] {
                push_u16(&mut tables, part);
            }
            push_u32(&mut tables, 0); // Flags
            push_u16(&mut tables, 0); // PublicKeyOrToken
            push_u16(&mut tables, name);
            push_u16(&mut tables, 0); // Culture
            push_u16(&mut tables, 0); // HashValue
        }

        let has_attribute = self.informational_version.is_some();
        let mut valid: u64 = (1 << 0x00) | (1 << 0x01) | (1 << 0x0A) | (1 << 0x20) | (1 << 0x23);
        if has_attribute {
            valid |= 1 << 0x0C;
        }

        let mut stream = Vec::new();
        push_u32(&mut stream, 0); // Reserved
        stream.push(2); // MajorVersion
        stream.push(0);
        stream.push(0); // HeapSizes: every index narrow
        stream.push(1); // Reserved
        push_u64(&mut stream, valid);
        push_u64(&mut stream, 0); // Sorted
        push_u32(&mut stream, 1); // Module
        push_u32(&mut stream, 1); // TypeRef
        push_u32(&mut stream, 1); // MemberRef
        if has_attribute {
            push_u32(&mut stream, 1); // CustomAttribute
        }
        push_u32(&mut stream, 1); // Assembly
        push_u32(&mut stream, 1 + self.assembly_refs.len() as u32);
        stream.extend_from_slice(&tables);

        assemble_root(&[
            ("#~", stream),
            ("#Strings", strings.into_bytes()),
            ("#GUID", vec![0u8; 16]),
            ("#Blob", blobs.into_bytes()),
        ])
    }

    fn wrap_pe(&self, metadata: &[u8]) -> Vec<u8> {
        let section_len = CLR_HEADER_SIZE as usize + metadata.len();
        let raw_size = align(section_len as u32, FILE_ALIGNMENT);

        let mut image = Vec::new();
        // DOS stub: just the magic and the PE header offset
        image.extend_from_slice(b"MZ");
        image.resize(0x3C, 0);
        push_u32(&mut image, 0x80);
        image.resize(0x80, 0);

        // PE signature and COFF header
        image.extend_from_slice(b"PE\0\0");
        push_u16(&mut image, 0x014C); // i386
        push_u16(&mut image, 1); // one section
        push_u32(&mut image, 0); // TimeDateStamp
        push_u32(&mut image, 0); // PointerToSymbolTable
        push_u32(&mut image, 0); // NumberOfSymbols
        push_u16(&mut image, 224); // SizeOfOptionalHeader (PE32)
        push_u16(&mut image, 0x2102); // DLL | 32-bit | executable

        // Optional header
        push_u16(&mut image, 0x10B); // PE32
        image.push(8); // linker version
        image.push(0);
        push_u32(&mut image, 0); // SizeOfCode
        push_u32(&mut image, 0); // SizeOfInitializedData
        push_u32(&mut image, 0); // SizeOfUninitializedData
        push_u32(&mut image, 0); // AddressOfEntryPoint
        push_u32(&mut image, SECTION_RVA); // BaseOfCode
        push_u32(&mut image, 0); // BaseOfData
        push_u32(&mut image, 0x0040_0000); // ImageBase
        push_u32(&mut image, 0x2000); // SectionAlignment
        push_u32(&mut image, FILE_ALIGNMENT);
        push_u16(&mut image, 4); // OS version
        push_u16(&mut image, 0);
        push_u16(&mut image, 0); // image version
        push_u16(&mut image, 0);
        push_u16(&mut image, 4); // subsystem version
        push_u16(&mut image, 0);
        push_u32(&mut image, 0); // Win32VersionValue
        push_u32(&mut image, SECTION_RVA + align(section_len as u32, 0x2000)); // SizeOfImage
        push_u32(&mut image, FILE_ALIGNMENT); // SizeOfHeaders
        push_u32(&mut image, 0); // Checksum
        push_u16(&mut image, 3); // console subsystem
        push_u16(&mut image, 0); // DllCharacteristics
        push_u32(&mut image, 0x0010_0000); // stack reserve
        push_u32(&mut image, 0x1000);
        push_u32(&mut image, 0x0010_0000); // heap reserve
        push_u32(&mut image, 0x1000);
        push_u32(&mut image, 0); // LoaderFlags
        push_u32(&mut image, 16); // NumberOfRvaAndSizes
        for index in 0..16usize {
            match index {
                // Only presence matters to the codec; the directory is
                // never dereferenced.
                2 if self.native_version_resource => {
                    push_u32(&mut image, SECTION_RVA);
                    push_u32(&mut image, 16);
                }
                14 => {
                    push_u32(&mut image, SECTION_RVA);
                    push_u32(&mut image, CLR_HEADER_SIZE);
                }
                _ => {
                    push_u32(&mut image, 0);
                    push_u32(&mut image, 0);
                }
            }
        }

        // Section header
        image.extend_from_slice(b".text\0\0\0");
        push_u32(&mut image, section_len as u32); // VirtualSize
        push_u32(&mut image, SECTION_RVA);
        push_u32(&mut image, raw_size);
        push_u32(&mut image, FILE_ALIGNMENT); // PointerToRawData
        image.resize(image.len() + 12, 0); // relocations, line numbers
        push_u32(&mut image, 0x6000_0020); // code | read | execute

        // Section content
        image.resize(FILE_ALIGNMENT as usize, 0);
        push_u32(&mut image, CLR_HEADER_SIZE);
        push_u16(&mut image, 2); // runtime version
        push_u16(&mut image, 5);
        push_u32(&mut image, SECTION_RVA + CLR_HEADER_SIZE); // MetaData RVA
        push_u32(&mut image, metadata.len() as u32);
        push_u32(&mut image, 1); // ILONLY
        push_u32(&mut image, 0); // EntryPointToken
        image.resize(image.len() + 48, 0); // remaining CLR header fields
        image.extend_from_slice(metadata);
        image.resize((FILE_ALIGNMENT + raw_size) as usize, 0);

        image
    }
}

/// `#Strings` heap under construction; offsets stay narrow.
struct StringsHeap {
    bytes: Vec<u8>,
}

impl StringsHeap {
    fn new() -> Self {
        Self { bytes: vec![0] }
    }

    fn add(&mut self, value: &str) -> u16 {
        let offset = self.bytes.len() as u16;
        self.bytes.extend_from_slice(value.as_bytes());
        self.bytes.push(0);
        offset
    }

    fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// `#Blob` heap under construction.
struct BlobHeap {
    bytes: Vec<u8>,
}

impl BlobHeap {
    fn new() -> Self {
        Self { bytes: vec![0] }
    }

    fn add(&mut self, value: &[u8]) -> u16 {
        let offset = self.bytes.len() as u16;
        self.bytes.push(value.len() as u8); // blobs stay under 128 bytes
        self.bytes.extend_from_slice(value);
        offset
    }

    fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Lay out the metadata root: signature, version string, stream headers,
/// then the 4-byte-aligned streams themselves.
fn assemble_root(streams: &[(&str, Vec<u8>)]) -> Vec<u8> {
    let version = b"v4.0.30319\0\0";

    let mut header_size = 16 + version.len() + 4;
    for (name, _) in streams {
        header_size += 8 + (name.len() + 1).div_ceil(4) * 4;
    }

    let mut offsets = Vec::new();
    let mut aligned = Vec::new();
    let mut cursor = header_size;
    for (_, bytes) in streams {
        let mut padded = bytes.clone();
        while padded.len() % 4 != 0 {
            padded.push(0);
        }
        offsets.push((cursor, padded.len()));
        cursor += padded.len();
        aligned.push(padded);
    }

    let mut root = Vec::new();
    push_u32(&mut root, 0x424A_5342); // BSJB
    push_u16(&mut root, 1);
    push_u16(&mut root, 1);
    push_u32(&mut root, 0); // Reserved
    push_u32(&mut root, version.len() as u32);
    root.extend_from_slice(version);
    push_u16(&mut root, 0); // Flags
    push_u16(&mut root, streams.len() as u16);
    for ((name, _), (offset, size)) in streams.iter().zip(&offsets) {
        push_u32(&mut root, *offset as u32);
        push_u32(&mut root, *size as u32);
        root.extend_from_slice(name.as_bytes());
        root.push(0);
        while root.len() % 4 != 0 {
            root.push(0);
        }
    }
    debug_assert_eq!(root.len(), header_size);

    for padded in aligned {
        root.extend_from_slice(&padded);
    }
    root
}

fn align(value: u32, to: u32) -> u32 {
    value.div_ceil(to) * to
}

fn push_u16(buffer: &mut Vec<u8>, value: u16) {
    buffer.extend_from_slice(&value.to_le_bytes());
}

fn push_u32(buffer: &mut Vec<u8>, value: u32) {
    buffer.extend_from_slice(&value.to_le_bytes());
}

fn push_u64(buffer: &mut Vec<u8>, value: u64) {
    buffer.extend_from_slice(&value.to_le_bytes());
}
