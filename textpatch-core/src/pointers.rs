use std::collections::BTreeMap;

use crate::{PatchError, Result};

/// A 4-byte little-endian pointer found in the image: the file offset of the
/// pointer slot itself, and the virtual address it stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointerRecord {
    pub location: usize,
    pub target: u32,
}

/// A string extent derived from the pointer table. The end of each string is
/// not stored in the format; it is inferred as the start of the next distinct
/// target address in sorted order, or the region end for the last one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringExtent {
    pub target: u32,
    /// Byte range `[start, end)` within the image.
    pub start: usize,
    pub end: usize,
    /// File offsets of every pointer slot referencing `target`, in the order
    /// the records were supplied.
    pub pointers: Vec<usize>,
}

impl StringExtent {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

/// Scans the image at a 4-byte stride for little-endian u32 values falling in
/// `[target_start, target_end)`.
pub fn scan_pointers(data: &[u8], target_start: u32, target_end: u32) -> Vec<PointerRecord> {
    let mut records = Vec::new();
    let mut offset = 0usize;
    while offset + 4 <= data.len() {
        let value = u32::from_le_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ]);
        if value >= target_start && value < target_end {
            records.push(PointerRecord {
                location: offset,
                target: value,
            });
        }
        offset += 4;
    }
    records
}

/// Parses a pre-scanned pointer list: one `location;target` pair per line,
/// hexadecimal, with an optional header row and an optional third size
/// column. Locations are virtual addresses and are resolved against `base`.
/// Hex values may carry a `0x` prefix or a trailing `L` (the disassembler
/// export writes Python-style longs).
pub fn parse_pointer_list(text: &str, base: u32) -> Result<Vec<PointerRecord>> {
    let mut records = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split(';');
        let loc_field = fields.next().unwrap_or("").trim();
        let target_field = fields.next().unwrap_or("").trim();

        let location_addr = match parse_hex(loc_field) {
            Some(v) => v,
            // Tolerate a header row, but only as the first line.
            None if line_no == 0 => continue,
            None => {
                return Err(PatchError::Config(format!(
                    "pointer list line {}: bad location {:?}",
                    line_no + 1,
                    loc_field
                )))
            }
        };
        let target = parse_hex(target_field).ok_or_else(|| {
            PatchError::Config(format!(
                "pointer list line {}: bad target {:?}",
                line_no + 1,
                target_field
            ))
        })?;

        let location = location_addr.checked_sub(base).ok_or_else(|| {
            PatchError::MalformedPointer(format!(
                "pointer location {:#010X} is below the base address {:#010X}",
                location_addr, base
            ))
        })? as usize;

        records.push(PointerRecord { location, target });
    }
    Ok(records)
}

fn parse_hex(field: &str) -> Option<u32> {
    let field = field
        .trim_start_matches("0x")
        .trim_start_matches("0X")
        .trim_end_matches(['L', 'l']);
    u32::from_str_radix(field, 16).ok()
}

/// Builds the ordered string table for `[region_start, region_end)`.
///
/// Pointers targeting addresses outside the region are ignored. Records are
/// grouped by target address and unique targets sorted ascending; extent `i`
/// ends where target `i + 1` begins, the last at the region end. The result
/// partitions the populated part of the region into contiguous,
/// non-overlapping ranges.
///
/// Pure over its inputs; the table must be rebuilt after any mutation run.
pub fn build_string_table(
    records: &[PointerRecord],
    base: u32,
    region_start: u32,
    region_end: u32,
    image_len: usize,
) -> Result<Vec<StringExtent>> {
    if region_end <= region_start {
        return Err(PatchError::Config(format!(
            "empty patch region {:#010X}..{:#010X}",
            region_start, region_end
        )));
    }
    if region_start < base {
        return Err(PatchError::MalformedPointer(format!(
            "region start {:#010X} is below the base address {:#010X}",
            region_start, base
        )));
    }

    let mut groups: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
    for record in records {
        if record.target >= region_start && record.target < region_end {
            groups.entry(record.target).or_default().push(record.location);
        }
    }

    let targets: Vec<u32> = groups.keys().copied().collect();
    let mut extents = Vec::with_capacity(targets.len());
    for (i, (&target, pointers)) in groups.iter().enumerate() {
        let start = (target - base) as usize;
        let end_addr = targets.get(i + 1).copied().unwrap_or(region_end);
        let end = (end_addr - base) as usize;
        if end <= start {
            return Err(PatchError::MalformedPointer(format!(
                "zero-length extent at {:#010X}",
                target
            )));
        }
        if end > image_len {
            return Err(PatchError::MalformedPointer(format!(
                "extent at {:#010X} ends past the image ({:#X} > {:#X})",
                target, end, image_len
            )));
        }
        extents.push(StringExtent {
            target,
            start,
            end,
            pointers: pointers.clone(),
        });
    }
    Ok(extents)
}

/// Looks up the extent covering exactly `target`.
pub fn find_extent(table: &[StringExtent], target: u32) -> Option<&StringExtent> {
    table
        .binary_search_by_key(&target, |e| e.target)
        .ok()
        .map(|i| &table[i])
}
