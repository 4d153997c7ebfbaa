use tracing::warn;

use crate::codec;
use crate::image::Image;
use crate::pointers::StringExtent;
use crate::translate::Translator;
use crate::{PatchError, Result};

/// Marker used in the separator column when a string had no separator run.
pub const NO_SEPARATOR_MARKER: &str = "(none)";

/// Escape used for line breaks inside the text column, so a row stays on one
/// physical line.
pub const LINE_BREAK_ESCAPE: char = '†';

/// One replacement driven by an external text-preparation step. Immutable
/// during patching; consumed exactly once per run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplacementEntry {
    /// Virtual addresses of every pointer slot referencing the string
    /// (several when the string is aliased).
    pub pointer_addresses: Vec<u32>,
    /// Separator bytes captured after the original string, re-appended
    /// verbatim when the replacement is relocated.
    pub separator: Vec<u8>,
    pub text: String,
}

/// Parses `pointer_offsets;separators;text` rows: pointer addresses
/// comma-joined hex, separator bytes space-joined hex octets (or `(none)`),
/// text with `†` standing in for line breaks. A header row is tolerated as
/// the first line.
pub fn parse_replacement_entries(text: &str) -> Result<Vec<ReplacementEntry>> {
    let mut entries = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let mut fields = line.splitn(3, ';');
        let pointers_field = fields.next().unwrap_or("").trim();
        let separator_field = fields.next().unwrap_or("").trim();
        let text_field = fields.next().unwrap_or("");

        let mut pointer_addresses = Vec::new();
        let mut bad_pointer = false;
        for part in pointers_field.split(',') {
            let part = part.trim().trim_start_matches("0x").trim_start_matches("0X");
            match u32::from_str_radix(part, 16) {
                Ok(addr) => pointer_addresses.push(addr),
                Err(_) => {
                    bad_pointer = true;
                    break;
                }
            }
        }
        if bad_pointer || pointer_addresses.is_empty() {
            if line_no == 0 {
                continue; // header row
            }
            return Err(PatchError::Config(format!(
                "replacement entries line {}: bad pointer list {:?}",
                line_no + 1,
                pointers_field
            )));
        }

        let separator = parse_separator_field(separator_field).ok_or_else(|| {
            PatchError::Config(format!(
                "replacement entries line {}: bad separator field {:?}",
                line_no + 1,
                separator_field
            ))
        })?;

        entries.push(ReplacementEntry {
            pointer_addresses,
            separator,
            text: text_field.replace(LINE_BREAK_ESCAPE, "\n"),
        });
    }
    Ok(entries)
}

fn parse_separator_field(field: &str) -> Option<Vec<u8>> {
    if field == NO_SEPARATOR_MARKER || field.is_empty() {
        return Some(Vec::new());
    }
    field
        .split_whitespace()
        .map(|octet| u8::from_str_radix(octet, 16).ok())
        .collect()
}

/// Inverse of [`parse_replacement_entries`], including the header row.
pub fn format_replacement_entries(entries: &[ReplacementEntry]) -> String {
    let mut out = String::from("pointer_offsets;separators;text\n");
    for entry in entries {
        let pointers = entry
            .pointer_addresses
            .iter()
            .map(|a| format!("{:08X}", a))
            .collect::<Vec<_>>()
            .join(",");
        let separator = if entry.separator.is_empty() {
            NO_SEPARATOR_MARKER.to_string()
        } else {
            entry
                .separator
                .iter()
                .map(|b| format!("{:02X}", b))
                .collect::<Vec<_>>()
                .join(" ")
        };
        out.push_str(&pointers);
        out.push(';');
        out.push_str(&separator);
        out.push(';');
        out.push_str(&entry.text.replace('\n', &LINE_BREAK_ESCAPE.to_string()));
        out.push('\n');
    }
    out
}

/// Extracts every string in the table, runs it through the translator, and
/// produces one replacement entry per extent. A translator failure keeps the
/// source text for that entry rather than dropping it.
pub fn build_entries(
    image: &Image,
    table: &[StringExtent],
    translator: &dyn Translator,
    source_lang: &str,
    target_lang: &str,
) -> Vec<ReplacementEntry> {
    let mut entries = Vec::with_capacity(table.len());
    for extent in table {
        let extracted = codec::extract(image.as_bytes(), extent.start, extent.end);
        let text = match translator.translate(&extracted.text, source_lang, target_lang) {
            Ok(translated) => translated,
            Err(err) => {
                warn!(
                    target_address = extent.target,
                    error = %err,
                    "translation failed, keeping source text"
                );
                extracted.text
            }
        };
        entries.push(ReplacementEntry {
            pointer_addresses: extent
                .pointers
                .iter()
                .map(|&offset| image.address_of(offset))
                .collect(),
            separator: extracted.separator,
            text,
        });
    }
    entries
}
