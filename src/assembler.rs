//! The KR32 text assembler: tokenizer, two-pass label resolution, and container
//! emission.
//!
//! The whole source file is one flat token stream (comments stripped, trailing
//! commas dropped); there is no notion of "line" beyond where a label happens to
//! land. Pass 1 walks the stream once, emitting bytes into per-section buffers and
//! recording every label's address at the moment it is defined; any operand that
//! refers to a label is left as a zero placeholder and recorded as a fixup. Pass 2
//! walks the fixups and patches in the resolved absolute addresses.

use std::collections::HashMap;

use log::warn;
use thiserror::Error;

use crate::container::{self, Section, TEXT_NAME};
use crate::isa::{self, Opcode, OperandShape};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AssembleError {
    #[error("unterminated block comment")]
    UnterminatedComment,
    #[error("empty label name")]
    InvalidLabel,
    #[error("section name '.shstrtab' is reserved")]
    ReservedSection,
    #[error("section '{0}' is already defined; split sections are not supported")]
    DuplicateSection(String),
    #[error("unknown mnemonic '{0}'")]
    UnknownMnemonic(String),
    #[error("unknown register '{0}'")]
    UnknownRegister(String),
    #[error("invalid immediate '{0}'")]
    InvalidImmediate(String),
    #[error("undefined label '{0}'")]
    UndefinedLabel(String),
    #[error("unexpected end of input, expected an operand")]
    UnexpectedEof,
}

/// Assembles `source` into a KR32 container image.
pub fn assemble(source: &str) -> Result<Vec<u8>, AssembleError> {
    let tokens = tokenize(source)?;
    assemble_tokens(&tokens)
}

fn strip_comments(source: &str) -> Result<String, AssembleError> {
    let chars: Vec<char> = source.chars().collect();
    let mut out = String::with_capacity(source.len());
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '/' && chars.get(i + 1) == Some(&'/') {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
        } else if chars[i] == '/' && chars.get(i + 1) == Some(&'*') {
            i += 2;
            let mut terminated = false;
            while i + 1 < chars.len() {
                if chars[i] == '*' && chars[i + 1] == '/' {
                    i += 2;
                    terminated = true;
                    break;
                }
                i += 1;
            }
            if !terminated {
                return Err(AssembleError::UnterminatedComment);
            }
        } else {
            out.push(chars[i]);
            i += 1;
        }
    }
    Ok(out)
}

fn tokenize(source: &str) -> Result<Vec<String>, AssembleError> {
    let cleaned = strip_comments(source)?;
    Ok(cleaned
        .split_whitespace()
        .map(|tok| tok.strip_suffix(',').unwrap_or(tok).to_string())
        .filter(|t| !t.is_empty())
        .collect())
}

fn next_token(tokens: &[String], i: &mut usize) -> Result<String, AssembleError> {
    let tok = tokens.get(*i).ok_or(AssembleError::UnexpectedEof)?.clone();
    *i += 1;
    Ok(tok)
}

fn parse_register(
    tokens: &[String],
    i: &mut usize,
    table: &HashMap<String, u8>,
) -> Result<u8, AssembleError> {
    let tok = next_token(tokens, i)?;
    table.get(&tok).copied().ok_or(AssembleError::UnknownRegister(tok))
}

fn is_label_reference(tok: &str) -> bool {
    tok.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
}

/// Parses a decimal integer, `0x…` hex integer, or `'c'` character literal.
/// Values that overflow 64 bits wrap, matching the data-define truncation rule.
fn parse_immediate(tok: &str) -> Result<u64, AssembleError> {
    if let Some(rest) = tok.strip_prefix("0x").or_else(|| tok.strip_prefix("0X")) {
        if rest.is_empty() || !rest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(AssembleError::InvalidImmediate(tok.to_string()));
        }
        Ok(rest.chars().fold(0u64, |acc, c| {
            acc.wrapping_mul(16).wrapping_add(c.to_digit(16).unwrap() as u64)
        }))
    } else if let Some(stripped) = tok.strip_prefix('\'') {
        let chars: Vec<char> = stripped.chars().collect();
        if chars.len() == 2 && chars[1] == '\'' {
            Ok(chars[0] as u64)
        } else {
            Err(AssembleError::InvalidImmediate(tok.to_string()))
        }
    } else {
        if tok.is_empty() || !tok.chars().all(|c| c.is_ascii_digit()) {
            return Err(AssembleError::InvalidImmediate(tok.to_string()));
        }
        Ok(tok.chars().fold(0u64, |acc, c| {
            acc.wrapping_mul(10).wrapping_add(c.to_digit(10).unwrap() as u64)
        }))
    }
}

fn parse_u8_immediate(tok: &str) -> Result<u8, AssembleError> {
    Ok(parse_immediate(tok)? as u8)
}

fn parse_u32_immediate(tok: &str) -> Result<u32, AssembleError> {
    Ok(parse_immediate(tok)? as u32)
}

/// Sizes and encodes a `=value` data define per the auto-sizing thresholds.
fn parse_define(value_tok: &str) -> Result<Vec<u8>, AssembleError> {
    let (digit_count, is_hex) = if let Some(rest) =
        value_tok.strip_prefix("0x").or_else(|| value_tok.strip_prefix("0X"))
    {
        (rest.len(), true)
    } else {
        (value_tok.len(), false)
    };

    let bits: u32 = if is_hex {
        match digit_count {
            0..=2 => 8,
            3..=4 => 16,
            5..=8 => 32,
            _ => 64,
        }
    } else {
        match digit_count {
            0..=3 => 8,
            4..=5 => 16,
            6..=10 => 32,
            _ => 64,
        }
    };

    let value = parse_immediate(value_tok)?;
    let bytes_len = (bits / 8) as usize;
    let truncated = match bits {
        8 => (value as u8) as u64,
        16 => (value as u16) as u64,
        32 => (value as u32) as u64,
        _ => value,
    };
    if truncated != value {
        warn!("data define '{value_tok}' truncated to {bits} bits");
    }
    Ok(truncated.to_le_bytes()[..bytes_len].to_vec())
}

fn emit_immediate_operand(
    tok: &str,
    bytes: &mut Vec<u8>,
    fixups: &mut Vec<(usize, usize, String)>,
    section_index: usize,
) -> Result<(), AssembleError> {
    if is_label_reference(tok) {
        fixups.push((section_index, bytes.len(), tok.to_string()));
        bytes.extend_from_slice(&[0u8; 4]);
    } else {
        let value = parse_u32_immediate(tok)?;
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    Ok(())
}

/// Returns the index of `name`'s section buffer, creating it on first use. Used
/// for the implicit default `.text` section, which only becomes "defined" (and
/// thus conflicts with an explicit directive) once something is actually emitted
/// into it.
fn section_for(
    name: &str,
    sections: &mut Vec<(String, Vec<u8>)>,
    section_index: &mut HashMap<String, usize>,
) -> usize {
    if let Some(&idx) = section_index.get(name) {
        idx
    } else {
        sections.push((name.to_string(), Vec::new()));
        let idx = sections.len() - 1;
        section_index.insert(name.to_string(), idx);
        idx
    }
}

fn assemble_tokens(tokens: &[String]) -> Result<Vec<u8>, AssembleError> {
    let register_table: HashMap<String, u8> = isa::register_names().into_iter().collect();
    let mnemonic_table: HashMap<&str, Opcode> =
        Opcode::ALL.iter().map(|&op| (op.mnemonic(), op)).collect();

    let mut sections: Vec<(String, Vec<u8>)> = Vec::new();
    let mut section_index: HashMap<String, usize> = HashMap::new();
    let mut current_section = TEXT_NAME.to_string();

    let mut labels: HashMap<String, u32> = HashMap::new();
    let mut fixups: Vec<(usize, usize, String)> = Vec::new();
    let mut current_address: u32 = 0;

    let mut i = 0;
    while i < tokens.len() {
        let tok = tokens[i].clone();

        if let Some(name) = tok.strip_suffix(':') {
            if name.is_empty() {
                return Err(AssembleError::InvalidLabel);
            }
            labels.insert(name.to_string(), current_address);
            i += 1;
            continue;
        }

        if let Some(suffix) = tok.strip_prefix('.') {
            if suffix == "shstrtab" {
                return Err(AssembleError::ReservedSection);
            }
            if section_index.contains_key(&tok) {
                return Err(AssembleError::DuplicateSection(tok));
            }
            sections.push((tok.clone(), Vec::new()));
            section_index.insert(tok.clone(), sections.len() - 1);
            current_section = tok.clone();
            i += 1;
            continue;
        }

        if let Some(value_tok) = tok.strip_prefix('=') {
            let bytes = parse_define(value_tok)?;
            current_address += bytes.len() as u32;
            let sec_idx = section_for(&current_section, &mut sections, &mut section_index);
            sections[sec_idx].1.extend_from_slice(&bytes);
            i += 1;
            continue;
        }

        let opcode = *mnemonic_table
            .get(tok.as_str())
            .ok_or_else(|| AssembleError::UnknownMnemonic(tok.clone()))?;
        i += 1;

        let sec_idx = section_for(&current_section, &mut sections, &mut section_index);
        sections[sec_idx].1.push(opcode as u8);
        current_address += 1;

        match opcode.shape() {
            OperandShape::NoOperand => {}
            OperandShape::System => {
                let tok = next_token(tokens, &mut i)?;
                let value = parse_u8_immediate(&tok)?;
                sections[sec_idx].1.push(value);
                current_address += 1;
            }
            OperandShape::OneRegister => {
                let r = parse_register(tokens, &mut i, &register_table)?;
                sections[sec_idx].1.push(r);
                current_address += 1;
            }
            OperandShape::TwoRegister => {
                let a = parse_register(tokens, &mut i, &register_table)?;
                let b = parse_register(tokens, &mut i, &register_table)?;
                sections[sec_idx].1.push(a);
                sections[sec_idx].1.push(b);
                current_address += 2;
            }
            OperandShape::ThreeRegister => {
                let a = parse_register(tokens, &mut i, &register_table)?;
                let b = parse_register(tokens, &mut i, &register_table)?;
                let c = parse_register(tokens, &mut i, &register_table)?;
                sections[sec_idx].1.extend_from_slice(&[a, b, c]);
                current_address += 3;
            }
            OperandShape::OneRegisterOneImmediate => {
                let r = parse_register(tokens, &mut i, &register_table)?;
                sections[sec_idx].1.push(r);
                current_address += 1;
                let tok = next_token(tokens, &mut i)?;
                emit_immediate_operand(&tok, &mut sections[sec_idx].1, &mut fixups, sec_idx)?;
                current_address += 4;
            }
            OperandShape::OneImmediate => {
                let tok = next_token(tokens, &mut i)?;
                emit_immediate_operand(&tok, &mut sections[sec_idx].1, &mut fixups, sec_idx)?;
                current_address += 4;
            }
        }
    }

    for (sec_idx, offset, label) in &fixups {
        let addr = labels
            .get(label)
            .ok_or_else(|| AssembleError::UndefinedLabel(label.clone()))?;
        sections[*sec_idx].1[*offset..*offset + 4].copy_from_slice(&addr.to_le_bytes());
    }

    let container_sections: Vec<Section> = sections
        .into_iter()
        .map(|(name, data)| Section { name, data })
        .collect();
    Ok(container::emit(&container_sections))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linker;

    fn assemble_and_link(source: &str) -> Vec<u8> {
        let object = assemble(source).unwrap();
        linker::link(&object, None).unwrap()
    }

    #[test]
    fn identity_scenario_emits_exact_bytes() {
        let image = assemble_and_link("ldi r0, 0x2A\nhlt");
        assert_eq!(image, vec![0x01, 0x00, 0x2A, 0x00, 0x00, 0x00, 0x60]);
    }

    #[test]
    fn labels_resolve_forward_and_backward() {
        let source = "
            ldi r0, 0
            loop: ldi r1, 1
                  add r0, r0, r1
                  ldi r2, 3
                  sub r2, r2, r0
                  jnzi r2, loop
                  hlt
        ";
        let image = assemble_and_link(source);
        // loop: starts right after the first ldi (6 bytes).
        assert_eq!(image[0..6], [0x01, 0x00, 0, 0, 0, 0]);
        let loop_addr_bytes = &image[image.len() - 5..image.len() - 1];
        let loop_addr = u32::from_le_bytes(loop_addr_bytes.try_into().unwrap());
        assert_eq!(loop_addr, 6);
    }

    #[test]
    fn undefined_label_is_fatal() {
        let err = assemble("jmpi missing\nhlt").unwrap_err();
        assert_eq!(err, AssembleError::UndefinedLabel("missing".to_string()));
    }

    #[test]
    fn unknown_mnemonic_is_fatal() {
        let err = assemble("frobnicate r0").unwrap_err();
        assert_eq!(err, AssembleError::UnknownMnemonic("frobnicate".to_string()));
    }

    #[test]
    fn reserved_section_is_rejected() {
        let err = assemble(".shstrtab\nhlt").unwrap_err();
        assert_eq!(err, AssembleError::ReservedSection);
    }

    #[test]
    fn duplicate_section_is_rejected() {
        let err = assemble(".data\n=1\n.text\nhlt\n.data\n=2").unwrap_err();
        assert_eq!(err, AssembleError::DuplicateSection(".data".to_string()));
    }

    #[test]
    fn data_define_auto_sizing() {
        // 3 decimal digits -> 8 bits, 5 -> 16 bits, 10 -> 32 bits.
        let object = assemble(".data\n=255\n=12345\n=1000000000").unwrap();
        let container = container::parse(&object).unwrap();
        let data = &container.sections.iter().find(|s| s.name == ".data").unwrap().data;
        assert_eq!(data.len(), 1 + 2 + 4);
    }

    #[test]
    fn char_literal_immediate() {
        let image = assemble_and_link("ldi r0, 'A'\nhlt");
        assert_eq!(&image[0..6], &[0x01, 0x00, b'A', 0, 0, 0]);
    }

    #[test]
    fn block_comments_are_skipped() {
        let image = assemble_and_link("/* setup */ ldi r0, 1 // trailing\nhlt");
        assert_eq!(&image[0..6], &[0x01, 0x00, 1, 0, 0, 0]);
    }

    #[test]
    fn unterminated_block_comment_errors() {
        let err = assemble("/* never closes").unwrap_err();
        assert_eq!(err, AssembleError::UnterminatedComment);
    }
}
