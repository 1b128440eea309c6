//! Health check for the platform settings store
//!
//! The radio stack keeps its calibration and settings in the flash `nvs`
//! partition. Nothing here reads or writes application data; the scan only
//! decides whether the partition can be used as-is or must be erased before
//! the radio starts.
//!
//! Every 4 KiB page starts with a 32-byte header: a little-endian state word
//! at offset 0 and a format version byte at offset 8.

pub const PAGE_SIZE: usize = 4096;
pub const PAGE_HEADER_LEN: usize = 32;

const STATE_UNINITIALIZED: u32 = 0xFFFF_FFFF;
const STATE_ACTIVE: u32 = 0xFFFF_FFFE;
const STATE_FULL: u32 = 0xFFFF_FFFC;
const STATE_FREEING: u32 = 0xFFFF_FFF8;

/// Format versions count down from 0xFF; a byte below this was written by
/// newer firmware than ours.
const CURRENT_VERSION: u8 = 0xFE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    Uninitialized,
    Active,
    Full,
    Freeing,
    Corrupt,
}

/// Why the store has to be erased before use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageFault {
    /// Every page holds data; the store cannot rotate
    NoFreePages,
    /// A page was written in a format newer than this firmware understands
    NewVersion,
    /// A page header carries an unknown state
    Corrupt,
}

/// Result of initializing the settings store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageStatus {
    Ready,
    NeedsErase(StorageFault),
}

/// Classifies one page header. Unknown state words count as corrupt.
pub fn page_state(header: &[u8; PAGE_HEADER_LEN]) -> PageState {
    let state = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    match state {
        STATE_UNINITIALIZED => PageState::Uninitialized,
        STATE_ACTIVE => PageState::Active,
        STATE_FULL => PageState::Full,
        STATE_FREEING => PageState::Freeing,
        _ => PageState::Corrupt,
    }
}

/// Accumulates page headers of a partition, in order.
#[derive(Debug, Default)]
pub struct StoreScan {
    pages: usize,
    free_pages: usize,
    fault: Option<StorageFault>,
}

impl StoreScan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_page(&mut self, header: &[u8; PAGE_HEADER_LEN]) {
        self.pages += 1;
        if self.fault.is_some() {
            return;
        }

        match page_state(header) {
            PageState::Uninitialized => self.free_pages += 1,
            PageState::Corrupt => self.fault = Some(StorageFault::Corrupt),
            PageState::Active | PageState::Full | PageState::Freeing => {
                if header[8] < CURRENT_VERSION {
                    self.fault = Some(StorageFault::NewVersion);
                }
            }
        }
    }

    pub fn pages(&self) -> usize {
        self.pages
    }

    pub fn finish(self) -> StorageStatus {
        match self.fault {
            Some(fault) => StorageStatus::NeedsErase(fault),
            None if self.free_pages == 0 => StorageStatus::NeedsErase(StorageFault::NoFreePages),
            None => StorageStatus::Ready,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(state: u32, version: u8) -> [u8; PAGE_HEADER_LEN] {
        let mut header = [0xFFu8; PAGE_HEADER_LEN];
        header[..4].copy_from_slice(&state.to_le_bytes());
        header[8] = version;
        header
    }

    #[test]
    fn test_blank_partition_is_ready() {
        let mut scan = StoreScan::new();
        for _ in 0..6 {
            scan.push_page(&[0xFF; PAGE_HEADER_LEN]);
        }
        assert_eq!(scan.pages(), 6);
        assert_eq!(scan.finish(), StorageStatus::Ready);
    }

    #[test]
    fn test_used_partition_with_spare_page() {
        let mut scan = StoreScan::new();
        scan.push_page(&header(STATE_FULL, 0xFE));
        scan.push_page(&header(STATE_ACTIVE, 0xFE));
        scan.push_page(&header(STATE_UNINITIALIZED, 0xFF));
        assert_eq!(scan.finish(), StorageStatus::Ready);
    }

    #[test]
    fn test_no_free_pages() {
        let mut scan = StoreScan::new();
        scan.push_page(&header(STATE_FULL, 0xFE));
        scan.push_page(&header(STATE_ACTIVE, 0xFE));
        assert_eq!(
            scan.finish(),
            StorageStatus::NeedsErase(StorageFault::NoFreePages)
        );
    }

    #[test]
    fn test_newer_format_version() {
        let mut scan = StoreScan::new();
        scan.push_page(&header(STATE_ACTIVE, 0xFD));
        scan.push_page(&header(STATE_UNINITIALIZED, 0xFF));
        assert_eq!(
            scan.finish(),
            StorageStatus::NeedsErase(StorageFault::NewVersion)
        );
    }

    #[test]
    fn test_garbage_header_is_corrupt() {
        let mut scan = StoreScan::new();
        scan.push_page(&header(0xFFFF_FFF0, 0xFE));
        scan.push_page(&header(0x1234_5678, 0xFE));
        scan.push_page(&header(STATE_UNINITIALIZED, 0xFF));
        assert_eq!(scan.finish(), StorageStatus::NeedsErase(StorageFault::Corrupt));
    }
}
