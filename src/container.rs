//! The ELF-like container format that the assembler emits and the linker consumes.
//!
//! Layout: identification (16 bytes) + header (36 bytes) + one program header (32
//! bytes) + section data + `.shstrtab` bytes + section header table (40 bytes per
//! entry). Every fixed field value below is part of the wire contract; the linker
//! rejects any file whose fields diverge from these constants.

use thiserror::Error;

pub const MAGIC: [u8; 4] = [0x7F, 0x45, 0x4C, 0x46];
pub const CLASS_32: u8 = 0x01;
pub const DATA_LITTLE_ENDIAN: u8 = 0x01;
pub const VERSION: u8 = 0x01;
pub const ABI_KR32: u8 = 0x6B;
pub const TYPE_EXECUTABLE: u16 = 0x02;
pub const MACHINE_KR32: u16 = 0x726B;
pub const PH_OFFSET: u32 = 0x34;
pub const HEADER_SIZE: u16 = 0x34;
pub const PH_ENTRY_SIZE: u16 = 0x20;
pub const PH_COUNT: u16 = 1;
pub const SH_ENTRY_SIZE: u16 = 0x28;
pub const SH_NAME_INDEX: u16 = 1;
pub const PH_TYPE_LOAD: u32 = 1;
pub const PH_FLAGS_RX: u32 = 5;
pub const PH_ALIGN: u32 = 4;
pub const PH_VADDR: u32 = 0;
pub const SH_OFFSET_PLACEHOLDER: usize = 0x34 + 0x20; // right after ident+header+one phdr

pub const SECTION_TYPE_NULL: u32 = 0;
pub const SECTION_TYPE_PROGBITS: u32 = 1;
pub const SECTION_TYPE_STRTAB: u32 = 3;
pub const SECTION_TYPE_NOBITS: u32 = 8;

pub const SHSTRTAB_NAME: &str = ".shstrtab";
pub const TEXT_NAME: &str = ".text";
pub const DATA_NAME: &str = ".data";
pub const BSS_NAME: &str = ".bss";

/// A single loadable section: a name and its bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    pub data: Vec<u8>,
}

impl Section {
    fn sh_type(&self) -> u32 {
        match self.name.as_str() {
            TEXT_NAME => SECTION_TYPE_PROGBITS,
            DATA_NAME => SECTION_TYPE_PROGBITS,
            BSS_NAME => SECTION_TYPE_NOBITS,
            _ => SECTION_TYPE_NULL,
        }
    }

    fn sh_flags(&self) -> u32 {
        match self.name.as_str() {
            TEXT_NAME => 6,
            DATA_NAME | BSS_NAME => 3,
            _ => 0,
        }
    }
}

/// A fully parsed container: its sections in declaration order (`.text` first by
/// the assembler's own convention) and the total image size recorded by the
/// program header.
#[derive(Debug, Clone)]
pub struct Container {
    pub sections: Vec<Section>,
    pub memory_size: u32,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContainerError {
    #[error("file too short to contain a valid KR32 container")]
    Truncated,
    #[error("bad magic bytes {0:02X?}, expected {MAGIC:02X?}")]
    BadMagic([u8; 4]),
    #[error("unsupported class {0:#04x}, expected {CLASS_32:#04x}")]
    BadClass(u8),
    #[error("unsupported data encoding {0:#04x}, expected {DATA_LITTLE_ENDIAN:#04x}")]
    BadDataEncoding(u8),
    #[error("unsupported ident version {0:#04x}, expected {VERSION:#04x}")]
    BadIdentVersion(u8),
    #[error("unsupported ABI {0:#04x}, expected {ABI_KR32:#04x}")]
    BadAbi(u8),
    #[error("unsupported machine {0:#06x}, expected {MACHINE_KR32:#06x}")]
    BadMachine(u16),
    #[error("unexpected object type {0:#06x}, expected {TYPE_EXECUTABLE:#06x}")]
    BadType(u16),
    #[error("unexpected header version {0}, expected 1")]
    BadHeaderVersion(u32),
    #[error("program header offset {0:#x} does not match the fixed layout {PH_OFFSET:#x}")]
    BadPhOffset(u32),
    #[error("header size {0:#x} does not match the fixed layout {HEADER_SIZE:#x}")]
    BadHeaderSize(u16),
    #[error("program header entry size {0:#x} does not match {PH_ENTRY_SIZE:#x}")]
    BadPhEntrySize(u16),
    #[error("program header count {0} does not match {PH_COUNT}")]
    BadPhCount(u16),
    #[error("section header entry size {0:#x} does not match {SH_ENTRY_SIZE:#x}")]
    BadShEntrySize(u16),
    #[error("program header type {0} does not match the required LOAD type ({PH_TYPE_LOAD})")]
    BadPhType(u32),
    #[error("program header vaddr {0:#x} does not match the required {PH_VADDR:#x}")]
    BadPhVaddr(u32),
    #[error("section header index {0} out of range")]
    SectionIndexOutOfRange(u16),
    #[error("section name offset {0} out of range in .shstrtab")]
    BadSectionNameOffset(u32),
    #[error(".shstrtab section missing or not a string table")]
    MissingShstrtab,
}

/// Reads a little-endian `u16`/`u32` out of a byte slice, for parsing headers.
fn read_u16(buf: &[u8], offset: usize) -> Option<u16> {
    buf.get(offset..offset + 2).map(|b| u16::from_le_bytes([b[0], b[1]]))
}

fn read_u32(buf: &[u8], offset: usize) -> Option<u32> {
    buf.get(offset..offset + 4).map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// Builds a container from an ordered list of (name, bytes) sections and emits the
/// full byte image per §4.3: ident+header+phdr placeholders, section bytes,
/// `.shstrtab` bytes, rewritten header, section header table.
pub fn emit(sections: &[Section]) -> Vec<u8> {
    let mut out = Vec::new();

    // Identification.
    out.extend_from_slice(&MAGIC);
    out.push(CLASS_32);
    out.push(DATA_LITTLE_ENDIAN);
    out.push(VERSION);
    out.push(ABI_KR32);
    out.push(0); // abiversion
    out.extend_from_slice(&[0u8; 7]);
    debug_assert_eq!(out.len(), 16);

    // Header, with shoffset left as a placeholder to be rewritten below.
    out.extend_from_slice(&(TYPE_EXECUTABLE).to_le_bytes());
    out.extend_from_slice(&(MACHINE_KR32).to_le_bytes());
    out.extend_from_slice(&1u32.to_le_bytes()); // version
    out.extend_from_slice(&0u32.to_le_bytes()); // entry
    out.extend_from_slice(&PH_OFFSET.to_le_bytes());
    let shoffset_field_pos = out.len();
    out.extend_from_slice(&0u32.to_le_bytes()); // shoffset placeholder
    out.extend_from_slice(&0u32.to_le_bytes()); // flags
    out.extend_from_slice(&HEADER_SIZE.to_le_bytes());
    out.extend_from_slice(&PH_ENTRY_SIZE.to_le_bytes());
    out.extend_from_slice(&PH_COUNT.to_le_bytes());
    out.extend_from_slice(&SH_ENTRY_SIZE.to_le_bytes());
    let section_count = sections.len() as u16 + 2; // null + .shstrtab + user sections
    out.extend_from_slice(&section_count.to_le_bytes());
    out.extend_from_slice(&SH_NAME_INDEX.to_le_bytes());
    debug_assert_eq!(out.len(), 0x34);

    // The assembler's `current_address` after the last emitted byte equals
    // `total_size`; the contract records `current_address + 1`.
    let total_size: u32 = sections.iter().map(|s| s.data.len() as u32).sum();
    let memory_size = total_size + 1;

    // Program header.
    out.extend_from_slice(&PH_TYPE_LOAD.to_le_bytes());
    out.extend_from_slice(&0x54u32.to_le_bytes()); // offset of section data
    out.extend_from_slice(&PH_VADDR.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes()); // paddr
    out.extend_from_slice(&memory_size.to_le_bytes()); // file_size
    out.extend_from_slice(&memory_size.to_le_bytes()); // memory_size
    out.extend_from_slice(&PH_FLAGS_RX.to_le_bytes());
    out.extend_from_slice(&PH_ALIGN.to_le_bytes());
    debug_assert_eq!(out.len(), 0x54);

    // Section bytes, in declaration order.
    let mut section_offsets = Vec::with_capacity(sections.len());
    for section in sections {
        section_offsets.push(out.len() as u32);
        out.extend_from_slice(&section.data);
    }

    // .shstrtab: a leading NUL, then each section name NUL-terminated.
    let shstrtab_offset = out.len() as u32;
    let mut shstrtab = vec![0u8];
    let mut name_offsets = Vec::with_capacity(sections.len());
    for section in sections {
        name_offsets.push(shstrtab.len() as u32);
        shstrtab.extend_from_slice(section.name.as_bytes());
        shstrtab.push(0);
    }
    let shstrtab_self_name_offset = shstrtab.len() as u32;
    shstrtab.extend_from_slice(SHSTRTAB_NAME.as_bytes());
    shstrtab.push(0);
    out.extend_from_slice(&shstrtab);

    // Rewrite shoffset now that it is known.
    let shoffset = out.len() as u32;
    out[shoffset_field_pos..shoffset_field_pos + 4].copy_from_slice(&shoffset.to_le_bytes());

    // Section header table: null, .shstrtab, then user sections.
    out.extend_from_slice(&[0u8; 40]); // null section header

    out.extend_from_slice(&shstrtab_self_name_offset.to_le_bytes());
    out.extend_from_slice(&SECTION_TYPE_STRTAB.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes()); // flags
    out.extend_from_slice(&shstrtab_offset.to_le_bytes());
    out.extend_from_slice(&(shstrtab.len() as u32).to_le_bytes());
    out.extend_from_slice(&[0u8; 16]); // link, info, addralign, entsize

    for ((section, &offset), &name_offset) in sections.iter().zip(&section_offsets).zip(&name_offsets) {
        out.extend_from_slice(&name_offset.to_le_bytes());
        out.extend_from_slice(&section.sh_type().to_le_bytes());
        out.extend_from_slice(&section.sh_flags().to_le_bytes());
        out.extend_from_slice(&offset.to_le_bytes());
        out.extend_from_slice(&(section.data.len() as u32).to_le_bytes());
        out.extend_from_slice(&[0u8; 16]); // link, info, addralign, entsize
    }

    out
}

/// Parses and validates a container, returning its sections in header order
/// (excluding the synthetic null and `.shstrtab` entries) plus the recorded
/// memory size.
pub fn parse(buf: &[u8]) -> Result<Container, ContainerError> {
    if buf.len() < 0x54 {
        return Err(ContainerError::Truncated);
    }

    let magic = [buf[0], buf[1], buf[2], buf[3]];
    if magic != MAGIC {
        return Err(ContainerError::BadMagic(magic));
    }
    if buf[4] != CLASS_32 {
        return Err(ContainerError::BadClass(buf[4]));
    }
    if buf[5] != DATA_LITTLE_ENDIAN {
        return Err(ContainerError::BadDataEncoding(buf[5]));
    }
    if buf[6] != VERSION {
        return Err(ContainerError::BadIdentVersion(buf[6]));
    }
    if buf[7] != ABI_KR32 {
        return Err(ContainerError::BadAbi(buf[7]));
    }

    let header = &buf[16..];
    let ty = read_u16(header, 0).ok_or(ContainerError::Truncated)?;
    if ty != TYPE_EXECUTABLE {
        return Err(ContainerError::BadType(ty));
    }
    let machine = read_u16(header, 2).ok_or(ContainerError::Truncated)?;
    if machine != MACHINE_KR32 {
        return Err(ContainerError::BadMachine(machine));
    }
    let version = read_u32(header, 4).ok_or(ContainerError::Truncated)?;
    if version != 1 {
        return Err(ContainerError::BadHeaderVersion(version));
    }
    let phoffset = read_u32(header, 12).ok_or(ContainerError::Truncated)?;
    if phoffset != PH_OFFSET {
        return Err(ContainerError::BadPhOffset(phoffset));
    }
    let shoffset = read_u32(header, 16).ok_or(ContainerError::Truncated)?;
    let size = read_u16(header, 24).ok_or(ContainerError::Truncated)?;
    if size != HEADER_SIZE {
        return Err(ContainerError::BadHeaderSize(size));
    }
    let phentry_size = read_u16(header, 26).ok_or(ContainerError::Truncated)?;
    if phentry_size != PH_ENTRY_SIZE {
        return Err(ContainerError::BadPhEntrySize(phentry_size));
    }
    let phcount = read_u16(header, 28).ok_or(ContainerError::Truncated)?;
    if phcount != PH_COUNT {
        return Err(ContainerError::BadPhCount(phcount));
    }
    let shentry_size = read_u16(header, 30).ok_or(ContainerError::Truncated)?;
    if shentry_size != SH_ENTRY_SIZE {
        return Err(ContainerError::BadShEntrySize(shentry_size));
    }
    let shcount = read_u16(header, 32).ok_or(ContainerError::Truncated)?;
    let shname_index = read_u16(header, 34).ok_or(ContainerError::Truncated)?;

    let phdr = &buf[PH_OFFSET as usize..];
    let ph_type = read_u32(phdr, 0).ok_or(ContainerError::Truncated)?;
    if ph_type != PH_TYPE_LOAD {
        return Err(ContainerError::BadPhType(ph_type));
    }
    let ph_vaddr = read_u32(phdr, 4).ok_or(ContainerError::Truncated)?;
    if ph_vaddr != PH_VADDR {
        return Err(ContainerError::BadPhVaddr(ph_vaddr));
    }
    let memory_size = read_u32(phdr, 16).ok_or(ContainerError::Truncated)?;

    // Section headers: null at 0, each entry 40 bytes starting at shoffset.
    let sh_table = buf.get(shoffset as usize..).ok_or(ContainerError::Truncated)?;
    if (shname_index as usize) >= shcount as usize {
        return Err(ContainerError::SectionIndexOutOfRange(shname_index));
    }

    let entry_at = |index: usize| -> Option<&[u8]> {
        let start = index * 40;
        sh_table.get(start..start + 40)
    };

    let shstrtab_entry = entry_at(shname_index as usize).ok_or(ContainerError::Truncated)?;
    let shstrtab_sh_type = read_u32(shstrtab_entry, 4).ok_or(ContainerError::Truncated)?;
    if shstrtab_sh_type != SECTION_TYPE_STRTAB {
        return Err(ContainerError::MissingShstrtab);
    }
    let shstrtab_offset = read_u32(shstrtab_entry, 16).ok_or(ContainerError::Truncated)?;
    let shstrtab_size = read_u32(shstrtab_entry, 20).ok_or(ContainerError::Truncated)?;
    let shstrtab = buf
        .get(shstrtab_offset as usize..(shstrtab_offset + shstrtab_size) as usize)
        .ok_or(ContainerError::Truncated)?;

    let name_at = |name_offset: u32| -> Result<String, ContainerError> {
        let start = name_offset as usize;
        let bytes = shstrtab.get(start..).ok_or(ContainerError::BadSectionNameOffset(name_offset))?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
    };

    let mut sections = Vec::new();
    for index in 0..shcount as usize {
        if index == 0 || index == shname_index as usize {
            continue;
        }
        let entry = entry_at(index).ok_or(ContainerError::Truncated)?;
        let name_offset = read_u32(entry, 0).ok_or(ContainerError::Truncated)?;
        let offset = read_u32(entry, 16).ok_or(ContainerError::Truncated)?;
        let size = read_u32(entry, 20).ok_or(ContainerError::Truncated)?;
        let name = name_at(name_offset)?;
        let data = buf
            .get(offset as usize..(offset + size) as usize)
            .ok_or(ContainerError::Truncated)?
            .to_vec();
        sections.push(Section { name, data });
    }

    Ok(Container { sections, memory_size })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_then_parse_roundtrips_sections() {
        let sections = vec![
            Section { name: TEXT_NAME.to_string(), data: vec![0x01, 0x00, 0x2A, 0, 0, 0, 0x60] },
            Section { name: DATA_NAME.to_string(), data: vec![1, 2, 3, 4] },
        ];
        let bytes = emit(&sections);
        let parsed = parse(&bytes).unwrap();
        assert_eq!(parsed.sections, sections);
    }

    #[test]
    fn parse_rejects_bad_magic() {
        let mut bytes = emit(&[Section { name: TEXT_NAME.to_string(), data: vec![0x60] }]);
        bytes[0] = 0;
        assert_eq!(parse(&bytes), Err(ContainerError::BadMagic([0, 0x45, 0x4C, 0x46])));
    }

    #[test]
    fn parse_rejects_truncated_input() {
        assert_eq!(parse(&[0, 1, 2]), Err(ContainerError::Truncated));
    }
}
