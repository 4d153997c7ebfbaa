use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{info, warn};

pub mod codec;
pub mod container;
pub mod entries;
pub mod exheader;
pub mod image;
pub mod patch;
pub mod pointers;
pub mod translate;

pub use entries::ReplacementEntry;
pub use exheader::ExheaderSizes;
pub use image::Image;
pub use patch::{EntryOutcome, EntryReport, PatchReport, Strategy};
pub use pointers::{PointerRecord, StringExtent};
pub use translate::Translator;

/// Virtual address of byte offset 0 in the code segment, as the loader maps
/// it.
pub const DEFAULT_BASE_ADDRESS: u32 = 0x0010_0000;

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("malformed pointer table: {0}")]
    MalformedPointer(String),
    #[error("pointer slot at {address:#010X} is outside the image")]
    OutOfBoundsPointer { address: u32 },
    #[error("size accounting mismatch: arena appended {expected} bytes, image grew by {actual}")]
    SizeAccounting { expected: i64, actual: i64 },
    #[error("report serialization error: {0}")]
    Report(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PatchError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchSettings {
    pub base_address: u32,
    /// Virtual bounds of the string region being patched.
    pub region_start: u32,
    pub region_end: u32,
    pub strategy: Strategy,
    pub page_size: u32,
    /// Data plus uninitialized-data size the loader originally declared,
    /// needed to repatch the companion header after growth.
    pub base_data_size: u32,
    pub image_path: PathBuf,
    pub output_path: PathBuf,
    /// Pre-scanned pointer list; when absent the image itself is scanned for
    /// pointers into the region.
    pub pointer_list_path: Option<PathBuf>,
    pub replacements_path: PathBuf,
    pub exheader_path: Option<PathBuf>,
    pub exheader_out_path: Option<PathBuf>,
    pub report_path: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub original_len: usize,
    pub patched_len: usize,
    pub exheader: Option<ExheaderSizes>,
    pub report: PatchReport,
}

/// One batch patch run: build the pointer table from the original image,
/// apply every replacement entry with the configured strategy, then patch
/// the companion header if the image grew.
///
/// Table construction and header accounting failures abort before any output
/// file is written. Per-entry failures are recorded in the returned summary
/// and do not stop the run.
pub fn run(settings: &PatchSettings) -> Result<RunSummary> {
    let raw = fs::read(&settings.image_path)?;
    let mut image = Image::new(raw, settings.base_address);
    let original_len = image.len();
    info!(len = original_len, path = %settings.image_path.display(), "image loaded");

    let records = match &settings.pointer_list_path {
        Some(path) => {
            pointers::parse_pointer_list(&fs::read_to_string(path)?, settings.base_address)?
        }
        None => {
            pointers::scan_pointers(image.as_bytes(), settings.region_start, settings.region_end)
        }
    };
    info!(pointers = records.len(), "pointer records loaded");

    let table = pointers::build_string_table(
        &records,
        settings.base_address,
        settings.region_start,
        settings.region_end,
        image.len(),
    )?;
    info!(strings = table.len(), "string table built");

    let replacement_rows = fs::read_to_string(&settings.replacements_path)?;
    let replacement_entries = entries::parse_replacement_entries(&replacement_rows)?;

    let report = patch::apply_entries(&mut image, &table, &replacement_entries, settings.strategy);

    let delta = image.len() - original_len;
    if delta != report.bytes_appended {
        return Err(PatchError::SizeAccounting {
            expected: report.bytes_appended as i64,
            actual: delta as i64,
        });
    }

    // Patch the header in memory before writing anything, so a failure here
    // leaves no output artifact at all.
    let mut patched_exheader = None;
    if delta > 0 {
        match (&settings.exheader_path, &settings.exheader_out_path) {
            (Some(input), Some(output)) => {
                let mut ex = fs::read(input)?;
                let sizes = exheader::patch_exheader(
                    &mut ex,
                    original_len,
                    settings.base_data_size,
                    delta as i64,
                    settings.page_size,
                )?;
                patched_exheader = Some((output.clone(), ex, sizes));
            }
            _ => {
                warn!(delta, "image grew but no exheader in/out paths were configured");
            }
        }
    }

    fs::write(&settings.output_path, image.as_bytes())?;
    if let Some((path, bytes, _)) = &patched_exheader {
        fs::write(path, bytes)?;
    }

    let summary = RunSummary {
        original_len,
        patched_len: image.len(),
        exheader: patched_exheader.map(|(_, _, sizes)| sizes),
        report,
    };

    if let Some(report_path) = &settings.report_path {
        fs::write(report_path, serde_json::to_string_pretty(&summary)?)?;
    }

    info!(
        applied = summary.report.applied,
        failed = summary.report.failed,
        grown = delta,
        "patch run finished"
    );
    Ok(summary)
}
