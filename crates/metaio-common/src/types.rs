//! Core identifiers and enums for MetaIO
//!
//! These types are shared by the pipeline, the storage interface and the
//! client API, so they live here rather than next to any one component.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Storage array identifier
pub type ArrayId = u32;

/// Logical page number within an array's metadata address space
pub type Lpn = u64;

/// Metadata file descriptor
pub type FileDescriptor = u32;

/// Descriptor value that never names an open metadata file
pub const INVALID_FD: FileDescriptor = u32::MAX;

/// Highest array id accepted by the pipeline (exclusive)
pub const MAX_ARRAY_COUNT: ArrayId = 8;

/// Default metadata page size (4KB)
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Bytes reserved at the tail of every page for the control area
pub const PAGE_CONTROL_INFO_SIZE: usize = 64;

/// Media tier a metadata region lives on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageTier {
    /// Regular SSD metadata region
    Ssd,
    /// Battery-backed NVRAM region
    Nvram,
    /// SSD region reserved for the metadata journal
    JournalSsd,
}

impl StorageTier {
    /// All tiers, in index order
    pub const ALL: [Self; 3] = [Self::Ssd, Self::Nvram, Self::JournalSsd];

    /// Dense index, usable for per-tier arrays
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ssd => "ssd",
            Self::Nvram => "nvram",
            Self::JournalSsd => "journal_ssd",
        }
    }

    /// Whether partial writes to this tier are coalesced in the reuse cache
    #[must_use]
    pub const fn supports_write_cache(self) -> bool {
        matches!(self, Self::Nvram)
    }
}

impl fmt::Display for StorageTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a metadata I/O
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoDirection {
    Read,
    Write,
}

impl IoDirection {
    pub const ALL: [Self; 2] = [Self::Read, Self::Write];

    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    #[must_use]
    pub const fn is_write(self) -> bool {
        matches!(self, Self::Write)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
        }
    }
}

impl fmt::Display for IoDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Class of metadata file a request belongs to
///
/// Requests are scheduled across classes by weighted round robin.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum FileClass {
    /// Special-purpose maps (allocator bitmaps, segment context)
    SpecialPurposeMap,
    /// Metadata journal
    Journal,
    /// Block and stripe maps
    Map,
    /// Everything else
    #[default]
    General,
}

impl FileClass {
    /// All classes, in index order
    pub const ALL: [Self; 4] = [
        Self::SpecialPurposeMap,
        Self::Journal,
        Self::Map,
        Self::General,
    ];

    /// Number of classes
    pub const COUNT: usize = Self::ALL.len();

    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SpecialPurposeMap => "special_purpose_map",
            Self::Journal => "journal",
            Self::Map => "map",
            Self::General => "general",
        }
    }
}

impl fmt::Display for FileClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Completion priority of a request
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Highest,
    #[default]
    Normal,
}

impl Priority {
    pub const ALL: [Self; 2] = [Self::Highest, Self::Normal];

    pub const COUNT: usize = Self::ALL.len();

    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Highest => "highest",
            Self::Normal => "normal",
        }
    }
}

/// How the client waits for a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IoMode {
    /// Caller blocks on a ticket until completion
    #[default]
    Sync,
    /// Caller registered a callback and does not wait
    Async,
}

/// A run of contiguous physical pages backing part of a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    /// First physical page of the run
    pub start_lpn: Lpn,
    /// Number of pages in the run
    pub count: u64,
}

impl Extent {
    #[must_use]
    pub const fn new(start_lpn: Lpn, count: u64) -> Self {
        Self { start_lpn, count }
    }

    /// One past the last page of the run
    #[must_use]
    pub const fn end_lpn(&self) -> Lpn {
        self.start_lpn + self.count
    }
}

/// Key of a cache-resident page: the page number is only unique per array
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageKey {
    pub array_id: ArrayId,
    pub lpn: Lpn,
}

impl PageKey {
    #[must_use]
    pub const fn new(array_id: ArrayId, lpn: Lpn) -> Self {
        Self { array_id, lpn }
    }
}

impl fmt::Display for PageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "array{}:lpn{}", self.array_id, self.lpn)
    }
}
