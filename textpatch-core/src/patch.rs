use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::{debug, warn};

use crate::codec;
use crate::entries::ReplacementEntry;
use crate::image::Image;
use crate::pointers::{find_extent, StringExtent};
use crate::{PatchError, Result};

/// How replacement text is written back into the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Append the replacement past the original image end and repoint every
    /// owning pointer at it. Any length fits; the image grows and the
    /// companion header must be repatched.
    Relocate,
    /// Overwrite the string where it is, padded or truncated to the original
    /// content length. Nothing moves and no header changes, at the cost of
    /// forced truncation for longer text.
    InPlace,
}

impl FromStr for Strategy {
    type Err = PatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "relocate" => Ok(Strategy::Relocate),
            "in-place" | "inplace" => Ok(Strategy::InPlace),
            other => Err(PatchError::Config(format!(
                "unknown strategy {:?} (expected \"relocate\" or \"in-place\")",
                other
            ))),
        }
    }
}

/// Hands out storage past the original image end. Addresses are unique and
/// strictly increasing within a run; no alignment is imposed beyond what the
/// payload itself carries.
#[derive(Debug, Default)]
pub struct RelocationArena {
    appended: usize,
}

impl RelocationArena {
    pub fn new() -> Self {
        RelocationArena::default()
    }

    /// Writes `payload` at the current end of the buffer and returns the
    /// virtual address it now lives at.
    pub fn append(&mut self, image: &mut Image, payload: &[u8]) -> u32 {
        let address = image.address_of(image.len());
        image.extend(payload);
        self.appended += payload.len();
        address
    }

    /// Total bytes appended so far, cross-checked against the observed image
    /// growth before the companion header is patched.
    pub fn bytes_appended(&self) -> usize {
        self.appended
    }
}

/// Overwrites the 4-byte slot at each location with `new_address`,
/// little-endian. All locations are bounds-checked before the first write, so
/// a bad slot leaves the image untouched. Idempotent.
pub fn rewrite_pointers(image: &mut Image, locations: &[usize], new_address: u32) -> Result<()> {
    for &location in locations {
        if location + 4 > image.len() {
            return Err(PatchError::OutOfBoundsPointer {
                address: image.address_of(location),
            });
        }
    }
    for &location in locations {
        image.write_u32(location, new_address);
    }
    Ok(())
}

/// Writes `new_text` over `content_len` bytes at `start`, padding with
/// UTF-16LE spaces or truncating to fit. Never changes the image length and
/// never touches bytes outside the range. Returns whether truncation
/// happened.
pub fn replace_in_place(
    image: &mut Image,
    start: usize,
    content_len: usize,
    new_text: &str,
) -> bool {
    let mut encoded = codec::encode_utf16le(new_text);
    let truncated = encoded.len() > content_len;
    if truncated {
        warn!(
            offset = start,
            fitted = content_len,
            encoded = encoded.len(),
            "replacement text truncated to the original length"
        );
    }
    if encoded.len() < content_len {
        debug!(
            offset = start,
            padding = content_len - encoded.len(),
            "replacement text padded to the original length"
        );
        while encoded.len() < content_len {
            encoded.extend_from_slice(&codec::PAD_UNIT);
        }
    }
    encoded.truncate(content_len);
    image.splice(start, &encoded);
    truncated
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EntryOutcome {
    Applied {
        /// Where the string now lives; `None` for in-place replacements.
        new_address: Option<u32>,
        truncated: bool,
    },
    Failed {
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct EntryReport {
    pub index: usize,
    pub pointer_addresses: Vec<u32>,
    pub original_text: Option<String>,
    pub outcome: EntryOutcome,
}

#[derive(Debug, Default, Serialize)]
pub struct PatchReport {
    pub entries: Vec<EntryReport>,
    pub applied: usize,
    pub failed: usize,
    pub bytes_appended: usize,
}

struct EntryPlan {
    pointer_offsets: Vec<usize>,
    /// Content range for in-place replacement; unused when relocating.
    content_start: usize,
    content_len: usize,
    original_text: Option<String>,
}

fn plan_entry(
    image: &Image,
    table: &[StringExtent],
    entry: &ReplacementEntry,
    strategy: Strategy,
) -> std::result::Result<EntryPlan, String> {
    let mut offsets = Vec::with_capacity(entry.pointer_addresses.len());
    for &address in &entry.pointer_addresses {
        let offset = image
            .offset_of(address)
            .filter(|o| o + 4 <= image.len())
            .ok_or_else(|| PatchError::OutOfBoundsPointer { address }.to_string())?;
        offsets.push(offset);
    }

    let mut stored = None;
    for &offset in &offsets {
        let value = image
            .read_u32(offset)
            .ok_or_else(|| PatchError::OutOfBoundsPointer {
                address: image.address_of(offset),
            }
            .to_string())?;
        match stored {
            None => stored = Some(value),
            Some(previous) if previous != value => {
                return Err(format!(
                    "aliased pointers disagree on their target ({:#010X} vs {:#010X})",
                    previous, value
                ));
            }
            Some(_) => {}
        }
    }
    let target = stored.ok_or("entry names no pointers")?;

    let extent = find_extent(table, target);
    if let Some(extent) = extent {
        for &offset in &offsets {
            if offset >= extent.start && offset < extent.end {
                return Err(format!(
                    "pointer slot {:#010X} lies inside the extent it references",
                    image.address_of(offset)
                ));
            }
        }
    }

    match strategy {
        Strategy::InPlace => {
            let extent = extent.ok_or_else(|| {
                format!("target {:#010X} is not in the pointer table", target)
            })?;
            let extracted = codec::extract(image.as_bytes(), extent.start, extent.end);
            Ok(EntryPlan {
                pointer_offsets: offsets,
                content_start: extent.start,
                content_len: extracted.content_end - extent.start,
                original_text: Some(extracted.text),
            })
        }
        Strategy::Relocate => Ok(EntryPlan {
            pointer_offsets: offsets,
            content_start: 0,
            content_len: 0,
            original_text: extent
                .map(|e| codec::extract(image.as_bytes(), e.start, e.end).text),
        }),
    }
}

/// Applies every entry with the chosen strategy.
///
/// Planning runs first, against the original image and the original pointer
/// table, so extent inference never sees partially patched data. Mutation
/// then runs in entry order; an entry either applies fully or is recorded as
/// failed without touching the image.
pub fn apply_entries(
    image: &mut Image,
    table: &[StringExtent],
    entries: &[ReplacementEntry],
    strategy: Strategy,
) -> PatchReport {
    let plans: Vec<_> = entries
        .iter()
        .map(|entry| plan_entry(image, table, entry, strategy))
        .collect();

    let mut arena = RelocationArena::new();
    let mut report = PatchReport::default();

    for (index, (entry, plan)) in entries.iter().zip(plans).enumerate() {
        let plan = match plan {
            Ok(plan) => plan,
            Err(reason) => {
                warn!(entry = index, reason = reason.as_str(), "entry skipped");
                report.entries.push(EntryReport {
                    index,
                    pointer_addresses: entry.pointer_addresses.clone(),
                    original_text: None,
                    outcome: EntryOutcome::Failed { reason },
                });
                report.failed += 1;
                continue;
            }
        };

        let outcome = match strategy {
            Strategy::Relocate => {
                let mut payload = codec::encode_utf16le(&entry.text);
                payload.extend_from_slice(&entry.separator);
                let new_address = arena.append(image, &payload);
                match rewrite_pointers(image, &plan.pointer_offsets, new_address) {
                    Ok(()) => {
                        debug!(entry = index, new_address, bytes = payload.len(), "relocated");
                        EntryOutcome::Applied {
                            new_address: Some(new_address),
                            truncated: false,
                        }
                    }
                    Err(err) => EntryOutcome::Failed {
                        reason: err.to_string(),
                    },
                }
            }
            Strategy::InPlace => {
                let truncated =
                    replace_in_place(image, plan.content_start, plan.content_len, &entry.text);
                debug!(entry = index, offset = plan.content_start, truncated, "replaced in place");
                EntryOutcome::Applied {
                    new_address: None,
                    truncated,
                }
            }
        };

        match &outcome {
            EntryOutcome::Applied { .. } => report.applied += 1,
            EntryOutcome::Failed { .. } => report.failed += 1,
        }
        report.entries.push(EntryReport {
            index,
            pointer_addresses: entry.pointer_addresses.clone(),
            original_text: plan.original_text,
            outcome,
        });
    }

    report.bytes_appended = arena.bytes_appended();
    report
}

#[cfg(test)]
mod tests {
    use super::{
        apply_entries, replace_in_place, rewrite_pointers, EntryOutcome, RelocationArena, Strategy,
    };
    use crate::codec;
    use crate::entries::ReplacementEntry;
    use crate::image::Image;
    use crate::pointers::{build_string_table, scan_pointers};

    const BASE: u32 = 0x0010_0000;

    // Image of length 100 with two pointers at 0x10 and 0x20, both targeting
    // 0x100050 where "Hi" sits, terminated by 00 00 and followed by filler.
    fn aliased_image() -> Image {
        let mut data = vec![0u8; 100];
        data[0x10..0x14].copy_from_slice(&0x0010_0050u32.to_le_bytes());
        data[0x20..0x24].copy_from_slice(&0x0010_0050u32.to_le_bytes());
        data[0x50..0x54].copy_from_slice(&[0x48, 0x00, 0x69, 0x00]);
        for chunk in data[0x56..0x64].chunks_exact_mut(2) {
            chunk.copy_from_slice(&[0x41, 0x00]);
        }
        Image::new(data, BASE)
    }

    #[test]
    fn relocates_aliased_string_and_rewrites_both_pointers() {
        let mut image = aliased_image();
        let records = scan_pointers(image.as_bytes(), 0x0010_0050, 0x0010_0064);
        let table =
            build_string_table(&records, BASE, 0x0010_0050, 0x0010_0064, image.len()).unwrap();

        let extracted = codec::extract(image.as_bytes(), table[0].start, table[0].end);
        assert_eq!(extracted.text, "Hi");
        assert_eq!(extracted.content_end, 0x54);
        assert_eq!(extracted.separator, vec![0x00, 0x00]);

        let entry = ReplacementEntry {
            pointer_addresses: vec![0x0010_0010, 0x0010_0020],
            separator: vec![0x00, 0x00],
            text: "Hello".to_string(),
        };
        let report = apply_entries(&mut image, &table, &[entry], Strategy::Relocate);

        assert_eq!(report.applied, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(report.bytes_appended, 12);
        assert_eq!(image.len(), 112);
        assert_eq!(image.as_bytes()[0x10..0x14], [0x64, 0x00, 0x10, 0x00]);
        assert_eq!(image.as_bytes()[0x20..0x24], [0x64, 0x00, 0x10, 0x00]);
        assert_eq!(
            &image.as_bytes()[100..112],
            &[0x48, 0x00, 0x65, 0x00, 0x6C, 0x00, 0x6C, 0x00, 0x6F, 0x00, 0x00, 0x00][..]
        );
        match &report.entries[0].outcome {
            EntryOutcome::Applied { new_address, truncated } => {
                assert_eq!(*new_address, Some(0x0010_0064));
                assert!(!truncated);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(report.entries[0].original_text.as_deref(), Some("Hi"));
    }

    #[test]
    fn in_place_truncates_and_preserves_length() {
        // 10 bytes of content ("ABCDE") then a separator.
        let mut data = vec![0u8; 0x20];
        data[0x00..0x04].copy_from_slice(&0x0010_0008u32.to_le_bytes());
        for (i, c) in [0x41u8, 0x42, 0x43, 0x44, 0x45].iter().enumerate() {
            data[0x08 + i * 2] = *c;
        }
        data[0x12..0x14].copy_from_slice(&[0xFF, 0xFF]);
        let mut image = Image::new(data, BASE);
        let before_len = image.len();
        let records = scan_pointers(image.as_bytes(), 0x0010_0008, 0x0010_0020);
        let table =
            build_string_table(&records, BASE, 0x0010_0008, 0x0010_0020, image.len()).unwrap();

        let entry = ReplacementEntry {
            pointer_addresses: vec![0x0010_0000],
            separator: Vec::new(),
            // 14 encoded bytes into a 10-byte extent.
            text: "Greeting".to_string(),
        };
        let report = apply_entries(&mut image, &table, &[entry], Strategy::InPlace);

        assert_eq!(report.applied, 1);
        assert_eq!(image.len(), before_len);
        assert_eq!(report.bytes_appended, 0);
        // Truncated to the first five units.
        assert_eq!(codec::decode_utf16le(&image.as_bytes()[0x08..0x12]), "Greet");
        // Separator and pointer untouched.
        assert_eq!(image.as_bytes()[0x12..0x14], [0xFF, 0xFF]);
        assert_eq!(image.read_u32(0x00), Some(0x0010_0008));
        match &report.entries[0].outcome {
            EntryOutcome::Applied { new_address, truncated } => {
                assert_eq!(*new_address, None);
                assert!(truncated);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn in_place_pads_short_text_with_spaces() {
        let mut image = Image::new(vec![0x41u8; 0x10], BASE);
        let truncated = replace_in_place(&mut image, 0x04, 8, "Hi");
        assert!(!truncated);
        assert_eq!(codec::decode_utf16le(&image.as_bytes()[0x04..0x0C]), "Hi  ");
        // Bytes outside the range keep their old value.
        assert_eq!(image.as_bytes()[0x03], 0x41);
        assert_eq!(image.as_bytes()[0x0C], 0x41);
    }

    #[test]
    fn rewrite_is_idempotent() {
        let mut image = Image::new(vec![0u8; 0x10], BASE);
        rewrite_pointers(&mut image, &[0x04, 0x08], 0x0010_0234).unwrap();
        let once = image.as_bytes().to_vec();
        rewrite_pointers(&mut image, &[0x04, 0x08], 0x0010_0234).unwrap();
        assert_eq!(image.as_bytes(), &once[..]);
    }

    #[test]
    fn rewrite_rejects_out_of_bounds_slot_without_writing() {
        let mut image = Image::new(vec![0u8; 0x10], BASE);
        let before = image.as_bytes().to_vec();
        assert!(rewrite_pointers(&mut image, &[0x04, 0x0E], 0x0010_0234).is_err());
        assert_eq!(image.as_bytes(), &before[..]);
    }

    #[test]
    fn arena_addresses_are_monotonic_and_growth_is_exact() {
        let mut image = Image::new(vec![0u8; 10], BASE);
        let mut arena = RelocationArena::new();
        let first = arena.append(&mut image, b"abcd");
        let second = arena.append(&mut image, b"ef");
        assert_eq!(first, BASE + 10);
        assert_eq!(second, BASE + 14);
        assert_eq!(image.len(), 16);
        assert_eq!(arena.bytes_appended(), 6);
    }

    #[test]
    fn bad_entry_is_isolated_and_the_run_continues() {
        let mut image = aliased_image();
        let records = scan_pointers(image.as_bytes(), 0x0010_0050, 0x0010_0064);
        let table =
            build_string_table(&records, BASE, 0x0010_0050, 0x0010_0064, image.len()).unwrap();

        let entries = [
            ReplacementEntry {
                pointer_addresses: vec![0x0011_0000], // outside the image
                separator: Vec::new(),
                text: "nope".to_string(),
            },
            ReplacementEntry {
                pointer_addresses: vec![0x0010_0010, 0x0010_0020],
                separator: vec![0x00, 0x00],
                text: "Hello".to_string(),
            },
        ];
        let report = apply_entries(&mut image, &table, &entries, Strategy::Relocate);

        assert_eq!(report.failed, 1);
        assert_eq!(report.applied, 1);
        assert!(matches!(report.entries[0].outcome, EntryOutcome::Failed { .. }));
        // The good entry still landed.
        assert_eq!(image.read_u32(0x10), Some(0x0010_0064));
        assert_eq!(report.bytes_appended, 12);
    }

    #[test]
    fn disagreeing_aliases_fail_the_entry() {
        let mut image = aliased_image();
        // Second slot points somewhere else.
        image.write_u32(0x20, 0x0010_0058);
        let records = scan_pointers(image.as_bytes(), 0x0010_0050, 0x0010_0064);
        let table =
            build_string_table(&records, BASE, 0x0010_0050, 0x0010_0064, image.len()).unwrap();

        let entry = ReplacementEntry {
            pointer_addresses: vec![0x0010_0010, 0x0010_0020],
            separator: Vec::new(),
            text: "Hello".to_string(),
        };
        let report = apply_entries(&mut image, &table, &[entry], Strategy::Relocate);
        assert_eq!(report.failed, 1);
        assert_eq!(image.len(), 100);
    }

    #[test]
    fn strategy_parses_from_str() {
        assert_eq!("relocate".parse::<Strategy>().unwrap(), Strategy::Relocate);
        assert_eq!("in-place".parse::<Strategy>().unwrap(), Strategy::InPlace);
        assert!("pad".parse::<Strategy>().is_err());
    }
}
