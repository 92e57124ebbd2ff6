//! Flattens a parsed container into a raw boot image: `.text` first, then every
//! other loadable section in header order.

use thiserror::Error;

use crate::container::{self, Container, ContainerError, TEXT_NAME};

#[derive(Debug, Error)]
pub enum LinkError {
    #[error(transparent)]
    Container(#[from] ContainerError),
    #[error("object has no .text section")]
    MissingText,
}

/// Names that never appear in a flattened boot image, even when present in the
/// container (debug/metadata sections with no runtime representation).
const NEVER_EMITTED_PREFIXES: &[&str] = &[
    ".shstrtab", ".symtab", ".strtab", ".rel", ".debug", ".note", ".comment",
];

fn is_loadable(name: &str) -> bool {
    name != TEXT_NAME && !NEVER_EMITTED_PREFIXES.iter().any(|p| name.starts_with(p))
}

/// Parses `object_bytes`, validates it, and returns the flattened boot image.
/// `base` is accepted and recorded for future relocation support but does not
/// currently change any emitted byte (see the design notes on the `--base` flag).
pub fn link(object_bytes: &[u8], base: Option<u32>) -> Result<Vec<u8>, LinkError> {
    let container = container::parse(object_bytes)?;
    if let Some(base) = base {
        log::debug!("--base {base:#x} recorded but not applied to the flattened image");
    }
    flatten(&container)
}

fn flatten(container: &Container) -> Result<Vec<u8>, LinkError> {
    let text = container
        .sections
        .iter()
        .find(|s| s.name == TEXT_NAME)
        .ok_or(LinkError::MissingText)?;

    let mut image = text.data.clone();
    for section in &container.sections {
        if is_loadable(&section.name) && !section.data.is_empty() {
            image.extend_from_slice(&section.data);
        }
    }
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{emit, Section};

    #[test]
    fn flattens_text_then_data() {
        let sections = vec![
            Section { name: ".text".to_string(), data: vec![0x60] },
            Section { name: ".data".to_string(), data: vec![1, 2, 3] },
        ];
        let bytes = emit(&sections);
        let image = link(&bytes, None).unwrap();
        assert_eq!(image, vec![0x60, 1, 2, 3]);
    }

    #[test]
    fn skips_debug_and_strtab_sections() {
        let sections = vec![
            Section { name: ".text".to_string(), data: vec![0x60] },
            Section { name: ".debug_info".to_string(), data: vec![9, 9] },
            Section { name: ".data".to_string(), data: vec![7] },
        ];
        let bytes = emit(&sections);
        let image = link(&bytes, None).unwrap();
        assert_eq!(image, vec![0x60, 7]);
    }

    #[test]
    fn missing_text_section_errors() {
        let sections = vec![Section { name: ".data".to_string(), data: vec![1] }];
        let bytes = emit(&sections);
        assert!(matches!(link(&bytes, None), Err(LinkError::MissingText)));
    }

    #[test]
    fn rejects_corrupt_container() {
        assert!(link(&[0, 1, 2], None).is_err());
    }
}
