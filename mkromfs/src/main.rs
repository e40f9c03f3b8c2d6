use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use ctrfs::prelude::*;

#[derive(Debug, Parser)]
#[command(
    name = "mkromfs",
    about = "Pack a directory into a 3DS RomFS Level-3 image"
)]
struct Args {
    /// Directory to pack
    input_dir: PathBuf,
    /// Output image file
    output_file: PathBuf,
    /// Treat unreadable directories and files as fatal
    #[arg(long)]
    strict: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level3 = Level3::build(&args.input_dir)
        .with_context(|| format!("Failed to build RomFS image from {}", args.input_dir.display()))?;
    if !level3.warnings().is_empty() {
        eprintln!("warning: build degraded: {:?}", level3.warnings());
        if args.strict {
            bail!("Aborting because of --strict");
        }
    }

    let out = File::create(&args.output_file)
        .with_context(|| format!("Failed to create {}", args.output_file.display()))?;
    let mut out = BufWriter::new(out);

    out.write_all(level3.blob())?;
    let mut cursor = level3.blob().len() as u64;
    let file_count = level3.file_map().count();
    for (offset, path) in level3.file_map() {
        let Some(gap) = offset.checked_sub(cursor) else {
            bail!("{} grew while packing", path.display());
        };
        write_zeros(&mut out, gap)?;
        let mut data = File::open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let copied = std::io::copy(&mut data, &mut out)?;
        cursor = offset + copied;
    }
    let Some(tail) = level3.image_size().checked_sub(cursor) else {
        bail!("Input files grew while packing");
    };
    write_zeros(&mut out, tail)?;
    out.flush()?;

    println!(
        "{}: {} files, {} bytes of metadata, {} byte image",
        args.output_file.display(),
        file_count,
        level3.blob().len(),
        level3.image_size(),
    );
    Ok(())
}

fn write_zeros(out: &mut impl Write, mut count: u64) -> Result<()> {
    let zeros = [0u8; 4096];
    while count > 0 {
        let chunk = count.min(zeros.len() as u64) as usize;
        out.write_all(&zeros[..chunk])?;
        count -= chunk as u64;
    }
    Ok(())
}

