//! KR32 emulator command-line front-end.
//!
//! Usage: `emulator <image> [-p|--print-status|/Ps] [-m|--memory|/M <N{K|M|G}>]
//! [-g|--graphical|/G]`
//!
//! Memory size uses base-10 multipliers (`K`=1000, `M`=1e6, `G`=1e9) and has a
//! floor of 256 bytes. `-g`/`--graphical`/`/G` enables the MMIO framebuffer and
//! keyboard overlay; this binary drives it headlessly (no window is opened),
//! since the windowing backend is an external collaborator per the MMIO
//! contract.

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use kr32::cpu::{Cpu, NullInput};

const DEFAULT_MEMORY_SIZE: usize = 0x1000;
const MIN_MEMORY_SIZE: usize = 256;

fn parse_memory_size(text: &str) -> Result<usize> {
    let (digits, multiplier) = match text.chars().last() {
        Some('K') | Some('k') => (&text[..text.len() - 1], 1_000),
        Some('M') | Some('m') => (&text[..text.len() - 1], 1_000_000),
        Some('G') | Some('g') => (&text[..text.len() - 1], 1_000_000_000),
        _ => (text, 1),
    };
    let base: usize = digits
        .parse()
        .with_context(|| format!("invalid memory size '{text}'"))?;
    let size = base.saturating_mul(multiplier);
    if size < MIN_MEMORY_SIZE {
        bail!("memory size {size} is below the minimum of {MIN_MEMORY_SIZE} bytes");
    }
    Ok(size)
}

struct Args {
    image: PathBuf,
    print_status: bool,
    memory_size: usize,
    graphical: bool,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Args> {
    let exec = args.next().unwrap_or_else(|| "emulator".to_string());
    let image = match args.next() {
        Some(s) => PathBuf::from(s),
        None => bail!(
            "usage: {exec} <image> [-p|--print-status|/Ps] [-m|--memory|/M <N{{K|M|G}}>] [-g|--graphical|/G]"
        ),
    };

    let mut print_status = false;
    let mut memory_size = DEFAULT_MEMORY_SIZE;
    let mut graphical = false;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-p" | "--print-status" | "/Ps" => print_status = true,
            "-g" | "--graphical" | "/G" => graphical = true,
            "-m" | "--memory" | "/M" => {
                let value = args.next().context("expected memory size after -m/--memory")?;
                memory_size = parse_memory_size(&value)?;
            }
            other => bail!("unknown argument '{other}'"),
        }
    }

    Ok(Args { image, print_status, memory_size, graphical })
}

fn run() -> Result<()> {
    let args = parse_args(std::env::args())?;

    let image = fs::read(&args.image)
        .with_context(|| format!("failed to read boot image '{}'", args.image.display()))?;

    if args.graphical {
        log::warn!("graphical mode enabled without a windowing backend attached; MMIO is live but nothing renders it");
    }

    let mut cpu = Cpu::new(args.memory_size, args.graphical);
    cpu.memory.load_image(&image);

    let mut input = NullInput;
    cpu.run(&mut input);

    if args.print_status {
        print!("{}", cpu.status());
    }

    Ok(())
}

fn main() {
    env_logger::init();
    if let Err(err) = run() {
        eprintln!("emulator: {err:#}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_memory_size_applies_multipliers() {
        assert_eq!(parse_memory_size("256").unwrap(), 256);
        assert_eq!(parse_memory_size("4K").unwrap(), 4_000);
        assert_eq!(parse_memory_size("1M").unwrap(), 1_000_000);
        assert_eq!(parse_memory_size("1G").unwrap(), 1_000_000_000);
    }

    #[test]
    fn parse_memory_size_rejects_below_floor() {
        assert!(parse_memory_size("255").is_err());
    }

    #[test]
    fn parse_args_defaults() {
        let args = ["emulator", "boot.bin"].map(String::from);
        let parsed = parse_args(args.into_iter()).unwrap();
        assert_eq!(parsed.memory_size, DEFAULT_MEMORY_SIZE);
        assert!(!parsed.print_status);
        assert!(!parsed.graphical);
    }

    #[test]
    fn parse_args_accepts_all_flags() {
        let args = ["emulator", "boot.bin", "-p", "-m", "2K", "-g"].map(String::from);
        let parsed = parse_args(args.into_iter()).unwrap();
        assert!(parsed.print_status);
        assert!(parsed.graphical);
        assert_eq!(parsed.memory_size, 2_000);
    }

    #[test]
    fn parse_args_requires_image() {
        let args = ["emulator"].map(String::from);
        assert!(parse_args(args.into_iter()).is_err());
    }
}
