//! Metadata page layout
//!
//! ```text
//! +--------------------------------+  offset 0
//! |  Data chunk                    |  page_size - 64 bytes of file data
//! +--------------------------------+  offset page_size - 64
//! |  Control area (64 bytes)       |
//! |    magic      [u8; 8]          |
//! |    version    u32              |
//! |    lpn        u64              |
//! |    fd         u32              |
//! |    array_id   u32              |
//! |    sequence   u64              |
//! |    data_crc   u32  (crc32c)    |
//! |    reserved   [u8; 24]         |
//! +--------------------------------+
//! ```
//!
//! All integers are little-endian. A page whose magic is all zeroes has
//! never been written and reads back as zeroes.

use bytes::{Buf, BufMut};
use metaio_common::{ArrayId, FileDescriptor, Lpn, PAGE_CONTROL_INFO_SIZE};

/// Magic number identifying a stamped metadata page
pub const PAGE_MAGIC: [u8; 8] = *b"METAIOPG";

/// Current page format version
pub const PAGE_FORMAT_VERSION: u32 = 1;

/// Identity stamped into every written page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageControl {
    pub lpn: Lpn,
    pub fd: FileDescriptor,
    pub array_id: ArrayId,
    /// Incremented on every write of the page
    pub sequence: u64,
}

/// Outcome of the end-to-end check on a page read back from storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageCheck {
    /// Page was never written
    Blank,
    /// Page belongs to the expected file and its data is intact
    Valid { sequence: u64 },
    /// Page failed verification
    Corrupt(String),
}

/// Byte offset of the control area in a page
#[must_use]
pub const fn control_offset(page_size: usize) -> usize {
    page_size - PAGE_CONTROL_INFO_SIZE
}

/// Write the control area of `page`, checksumming its data chunk
pub fn stamp(page: &mut [u8], control: &PageControl) {
    let offset = control_offset(page.len());
    let data_crc = crc32c::crc32c(&page[..offset]);

    let mut area = &mut page[offset..];
    area.put_slice(&PAGE_MAGIC);
    area.put_u32_le(PAGE_FORMAT_VERSION);
    area.put_u64_le(control.lpn);
    area.put_u32_le(control.fd);
    area.put_u32_le(control.array_id);
    area.put_u64_le(control.sequence);
    area.put_u32_le(data_crc);
    let reserved = area.remaining_mut();
    area.put_bytes(0, reserved);
}

/// Decode the control area, if the page carries one
#[must_use]
pub fn read_control(page: &[u8]) -> Option<(PageControl, u32)> {
    let mut area = &page[control_offset(page.len())..];
    let mut magic = [0u8; 8];
    area.copy_to_slice(&mut magic);
    if magic != PAGE_MAGIC {
        return None;
    }
    let _version = area.get_u32_le();
    let control = PageControl {
        lpn: area.get_u64_le(),
        fd: area.get_u32_le(),
        array_id: area.get_u32_le(),
        sequence: area.get_u64_le(),
    };
    Some((control, area.get_u32_le()))
}

/// Verify a page read from `lpn` of file `fd` on `array_id`
#[must_use]
pub fn inspect(page: &[u8], lpn: Lpn, fd: FileDescriptor, array_id: ArrayId) -> PageCheck {
    let offset = control_offset(page.len());
    if page[offset..offset + PAGE_MAGIC.len()]
        .iter()
        .all(|&b| b == 0)
    {
        return PageCheck::Blank;
    }

    let Some((control, data_crc)) = read_control(page) else {
        return PageCheck::Corrupt("bad page signature".to_string());
    };
    if control.lpn != lpn {
        return PageCheck::Corrupt(format!("lpn mismatch: page says {}", control.lpn));
    }
    if control.fd != fd {
        return PageCheck::Corrupt(format!("fd mismatch: page says {}", control.fd));
    }
    if control.array_id != array_id {
        return PageCheck::Corrupt(format!(
            "array mismatch: page says {}",
            control.array_id
        ));
    }
    let actual = crc32c::crc32c(&page[..offset]);
    if actual != data_crc {
        return PageCheck::Corrupt(format!(
            "data checksum mismatch: expected {data_crc:08x}, got {actual:08x}"
        ));
    }
    PageCheck::Valid {
        sequence: control.sequence,
    }
}
