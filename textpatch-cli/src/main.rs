use clap::Parser;
use std::path::PathBuf;

use textpatch_core::{container, run, EntryOutcome, PatchSettings, Strategy, DEFAULT_BASE_ADDRESS};

fn parse_hex(s: &str) -> Result<u32, String> {
    let digits = s
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    u32::from_str_radix(digits, 16).map_err(|e| format!("bad hex value {s:?}: {e}"))
}

#[derive(Debug, Parser)]
#[command(name = "textpatch", version, about = "String-table relocation and injection tool")]
struct Args {
    /// Executable segment to patch.
    #[arg(long, required_unless_present_any = ["decompress_container", "recompress_container"])]
    image: Option<PathBuf>,

    #[arg(long, required_unless_present_any = ["decompress_container", "recompress_container"])]
    output: Option<PathBuf>,

    /// Virtual address of byte offset 0 in the image. Defaults to the
    /// loader's usual code segment base.
    #[arg(long, value_parser = parse_hex)]
    base_addr: Option<u32>,

    /// Virtual start of the string region (hex).
    #[arg(long, value_parser = parse_hex, required_unless_present_any = ["decompress_container", "recompress_container"])]
    region_start: Option<u32>,

    /// Virtual end of the string region, exclusive (hex).
    #[arg(long, value_parser = parse_hex, required_unless_present_any = ["decompress_container", "recompress_container"])]
    region_end: Option<u32>,

    /// Pre-scanned pointer list (location;target per line, hex). When
    /// omitted the image is scanned for pointers into the region.
    #[arg(long)]
    pointers: Option<PathBuf>,

    /// Replacement entries (pointer_offsets;separators;text per line).
    #[arg(long, required_unless_present_any = ["decompress_container", "recompress_container"])]
    replacements: Option<PathBuf>,

    /// "relocate" (grow the image, repoint) or "in-place" (pad/truncate).
    #[arg(long, default_value = "relocate")]
    strategy: String,

    /// Companion extended header to repatch when the image grows.
    #[arg(long)]
    exheader: Option<PathBuf>,

    #[arg(long, requires = "exheader")]
    exheader_out: Option<PathBuf>,

    /// Declared data + uninitialized-data size backing the header patch (hex).
    #[arg(long, value_parser = parse_hex, default_value = "0x0")]
    base_data_size: u32,

    #[arg(long, value_parser = parse_hex, default_value = "0x1000")]
    page_size: u32,

    /// Write the per-entry report as JSON.
    #[arg(long)]
    report: Option<PathBuf>,

    /// Debug-only: decompress a single asset container (size-prefixed gzip)
    /// to a sibling .bin file and exit.
    #[arg(long, value_name = "FILE", hide = true)]
    decompress_container: Option<PathBuf>,

    /// Debug-only: compress a raw file into an asset container and exit.
    #[arg(long, value_name = "FILE", hide = true)]
    recompress_container: Option<PathBuf>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    // Debug paths: single-file container transforms, then exit.
    if let Some(path) = args.decompress_container.as_ref() {
        let out = path.with_extension("bin");
        let result = std::fs::read(path)
            .map_err(textpatch_core::PatchError::from)
            .and_then(|bytes| container::decompress_container(&bytes))
            .and_then(|raw| Ok(std::fs::write(&out, raw)?));
        if let Err(e) = result {
            eprintln!("Failed to decompress {:?}: {}", path, e);
            std::process::exit(1);
        }
        println!("{} -> {}", path.display(), out.display());
        return;
    }
    if let Some(path) = args.recompress_container.as_ref() {
        let out = path.with_extension("rtz");
        let result = std::fs::read(path)
            .map_err(textpatch_core::PatchError::from)
            .and_then(|raw| container::compress_container(&raw))
            .and_then(|bytes| Ok(std::fs::write(&out, bytes)?));
        if let Err(e) = result {
            eprintln!("Failed to compress {:?}: {}", path, e);
            std::process::exit(1);
        }
        println!("{} -> {}", path.display(), out.display());
        return;
    }

    let strategy: Strategy = match args.strategy.parse() {
        Ok(strategy) => strategy,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    let settings = PatchSettings {
        // These unwraps are safe here because clap enforces that the patch
        // arguments are present unless a container debug flag was provided,
        // and we have already early-returned in those cases.
        base_address: args.base_addr.unwrap_or(DEFAULT_BASE_ADDRESS),
        region_start: args.region_start.expect("region-start is required"),
        region_end: args.region_end.expect("region-end is required"),
        strategy,
        page_size: args.page_size,
        base_data_size: args.base_data_size,
        image_path: args.image.expect("image is required"),
        output_path: args.output.expect("output is required"),
        pointer_list_path: args.pointers,
        replacements_path: args.replacements.expect("replacements is required"),
        exheader_path: args.exheader,
        exheader_out_path: args.exheader_out,
        report_path: args.report,
    };

    match run(&settings) {
        Ok(summary) => {
            for entry in &summary.report.entries {
                match &entry.outcome {
                    EntryOutcome::Applied {
                        new_address: Some(address),
                        ..
                    } => println!("#{}: relocated to {:#010X}", entry.index, address),
                    EntryOutcome::Applied { truncated, .. } => println!(
                        "#{}: replaced in place{}",
                        entry.index,
                        if *truncated { " (truncated)" } else { "" }
                    ),
                    EntryOutcome::Failed { reason } => {
                        println!("#{}: FAILED: {}", entry.index, reason)
                    }
                }
            }
            println!(
                "{} applied, {} failed, image {} -> {} bytes",
                summary.report.applied,
                summary.report.failed,
                summary.original_len,
                summary.patched_len
            );
            if let Some(ex) = &summary.exheader {
                println!(
                    "exheader: code {:#010X}, data {:#010X}, {} pages",
                    ex.code_size, ex.data_size, ex.physical_pages
                );
            }
        }
        Err(err) => {
            eprintln!("Error: {err}");
            std::process::exit(1);
        }
    }
}
