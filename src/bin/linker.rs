//! KR32 linker command-line front-end.
//!
//! Usage: `linker <object> [-o|/Fo <output>] [--base|/B <address>]`
//!
//! Default output: the object path with its extension replaced by `.bin`.
//! `--base`/`/B` accepts a decimal or `0x…` hex address; it is recorded but
//! does not currently change the emitted bytes (see the design notes on
//! relocation support).

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

fn default_output(object: &Path) -> PathBuf {
    object.with_extension("bin")
}

fn parse_address(text: &str) -> Result<u32> {
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).with_context(|| format!("invalid hex address '{text}'"))
    } else {
        text.parse().with_context(|| format!("invalid address '{text}'"))
    }
}

struct Args {
    object: PathBuf,
    output: PathBuf,
    base: Option<u32>,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Args> {
    let exec = args.next().unwrap_or_else(|| "linker".to_string());
    let object = match args.next() {
        Some(s) => PathBuf::from(s),
        None => bail!("usage: {exec} <object> [-o|/Fo <output>] [--base|/B <address>]"),
    };

    let mut output = None;
    let mut base = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-o" | "/Fo" => {
                let value = args.next().context("expected output path after -o/-Fo")?;
                output = Some(PathBuf::from(value));
            }
            "--base" | "/B" => {
                let value = args.next().context("expected address after --base/-B")?;
                base = Some(parse_address(&value)?);
            }
            other => bail!("unknown argument '{other}'"),
        }
    }

    let output = output.unwrap_or_else(|| default_output(&object));
    Ok(Args { object, output, base })
}

fn run() -> Result<()> {
    let args = parse_args(std::env::args())?;

    let object_bytes = fs::read(&args.object)
        .with_context(|| format!("failed to read object file '{}'", args.object.display()))?;

    let image = kr32::linker::link(&object_bytes, args.base)
        .with_context(|| format!("failed to link '{}'", args.object.display()))?;

    fs::write(&args.output, &image)
        .with_context(|| format!("failed to write output file '{}'", args.output.display()))?;

    log::info!(
        "linked '{}' -> '{}' ({} bytes)",
        args.object.display(),
        args.output.display(),
        image.len()
    );
    Ok(())
}

fn main() {
    env_logger::init();
    if let Err(err) = run() {
        eprintln!("linker: {err:#}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_output_replaces_extension() {
        assert_eq!(default_output(Path::new("boot.elf")), PathBuf::from("boot.bin"));
    }

    #[test]
    fn parse_address_accepts_decimal_and_hex() {
        assert_eq!(parse_address("4096").unwrap(), 4096);
        assert_eq!(parse_address("0x1000").unwrap(), 0x1000);
    }

    #[test]
    fn parse_args_accepts_base_flag() {
        let args = ["linker", "boot.elf", "--base", "0x2000"].map(String::from);
        let parsed = parse_args(args.into_iter()).unwrap();
        assert_eq!(parsed.base, Some(0x2000));
    }

    #[test]
    fn parse_args_requires_object() {
        let args = ["linker"].map(String::from);
        assert!(parse_args(args.into_iter()).is_err());
    }
}
