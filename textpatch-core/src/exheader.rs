use serde::Serialize;

use crate::{PatchError, Result};

// Fixed field offsets in the companion extended header.
const TEXT_SIZE_OFFSET: usize = 0x00;
const RO_SIZE_OFFSET: usize = 0x08;
const DATA_SIZE_OFFSET: usize = 0x0C;
const PHYSICAL_PAGES_OFFSET: usize = 0x34;

/// Smallest header that contains every field we patch.
pub const MIN_EXHEADER_LEN: usize = 0x38;

/// Loader page granularity.
pub const PAGE_SIZE: u32 = 0x1000;

/// Values written back by [`patch_exheader`], for reporting.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ExheaderSizes {
    pub code_size: u32,
    pub data_size: u32,
    pub physical_pages: u32,
}

/// Always rounds up, never down: the header must never declare less space
/// than is physically present.
pub fn round_up_page(value: u64, page_size: u32) -> u64 {
    let page = page_size as u64;
    value.div_ceil(page) * page
}

/// Recomputes the declared code size, data size and physical page count
/// after the image grew by `size_delta` bytes.
///
/// `original_code_len` is the image length before any relocation;
/// `base_data_size` is the segment's data plus uninitialized-data size as the
/// loader originally saw it. The read-only size field is zeroed, since the
/// grown image is declared as one flat code region.
///
/// Callers must have verified `size_delta` against the observed image growth
/// before getting here; an inconsistent header corrupts the loader's view of
/// the whole image.
pub fn patch_exheader(
    exheader: &mut [u8],
    original_code_len: usize,
    base_data_size: u32,
    size_delta: i64,
    page_size: u32,
) -> Result<ExheaderSizes> {
    if exheader.len() < MIN_EXHEADER_LEN {
        return Err(PatchError::Config(format!(
            "exheader of {} bytes is too small to patch (need at least {:#X})",
            exheader.len(),
            MIN_EXHEADER_LEN
        )));
    }

    let code_size = round_up_page(
        original_code_len as u64 + size_delta.max(0) as u64,
        page_size,
    );
    let data_raw = base_data_size as i64 + size_delta;
    if data_raw < 0 {
        return Err(PatchError::Config(format!(
            "size delta {} shrinks the data region below zero",
            size_delta
        )));
    }
    let data_size = round_up_page(data_raw as u64, page_size);
    let physical_pages = data_size / page_size as u64;

    let code_size = u32::try_from(code_size)
        .map_err(|_| PatchError::Config("patched code size overflows 32 bits".into()))?;
    let data_size = u32::try_from(data_size)
        .map_err(|_| PatchError::Config("patched data size overflows 32 bits".into()))?;
    let physical_pages = physical_pages as u32;

    exheader[TEXT_SIZE_OFFSET..TEXT_SIZE_OFFSET + 4].copy_from_slice(&code_size.to_le_bytes());
    exheader[RO_SIZE_OFFSET..RO_SIZE_OFFSET + 4].copy_from_slice(&0u32.to_le_bytes());
    exheader[DATA_SIZE_OFFSET..DATA_SIZE_OFFSET + 4].copy_from_slice(&data_size.to_le_bytes());
    exheader[PHYSICAL_PAGES_OFFSET..PHYSICAL_PAGES_OFFSET + 4]
        .copy_from_slice(&physical_pages.to_le_bytes());

    Ok(ExheaderSizes {
        code_size,
        data_size,
        physical_pages,
    })
}
