//! KR32 assembler command-line front-end.
//!
//! Usage: `assembler <source> [-o|/Fo <output>]`
//!
//! Default output: the source path with its extension replaced by `.elf`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

fn default_output(source: &Path) -> PathBuf {
    source.with_extension("elf")
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<(PathBuf, PathBuf)> {
    let exec = args.next().unwrap_or_else(|| "assembler".to_string());
    let source = match args.next() {
        Some(s) => PathBuf::from(s),
        None => bail!("usage: {exec} <source> [-o|/Fo <output>]"),
    };

    let mut output = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-o" | "/Fo" => {
                let value = args.next().context("expected output path after -o/-Fo")?;
                output = Some(PathBuf::from(value));
            }
            other => bail!("unknown argument '{other}'"),
        }
    }

    let output = output.unwrap_or_else(|| default_output(&source));
    Ok((source, output))
}

fn run() -> Result<()> {
    let (source_path, output_path) = parse_args(std::env::args())?;

    let source = fs::read_to_string(&source_path)
        .with_context(|| format!("failed to read source file '{}'", source_path.display()))?;

    let object = kr32::assembler::assemble(&source)
        .with_context(|| format!("failed to assemble '{}'", source_path.display()))?;

    fs::write(&output_path, &object)
        .with_context(|| format!("failed to write output file '{}'", output_path.display()))?;

    log::info!(
        "assembled '{}' -> '{}' ({} bytes)",
        source_path.display(),
        output_path.display(),
        object.len()
    );
    Ok(())
}

fn main() {
    env_logger::init();
    if let Err(err) = run() {
        eprintln!("assembler: {err:#}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_output_replaces_extension() {
        assert_eq!(default_output(Path::new("boot.asm")), PathBuf::from("boot.elf"));
    }

    #[test]
    fn parse_args_accepts_explicit_output() {
        let args = ["assembler", "boot.asm", "-o", "out.elf"].map(String::from);
        let (source, output) = parse_args(args.into_iter()).unwrap();
        assert_eq!(source, PathBuf::from("boot.asm"));
        assert_eq!(output, PathBuf::from("out.elf"));
    }

    #[test]
    fn parse_args_defaults_output() {
        let args = ["assembler", "boot.asm"].map(String::from);
        let (_, output) = parse_args(args.into_iter()).unwrap();
        assert_eq!(output, PathBuf::from("boot.elf"));
    }

    #[test]
    fn parse_args_requires_source() {
        let args = ["assembler"].map(String::from);
        assert!(parse_args(args.into_iter()).is_err());
    }
}
