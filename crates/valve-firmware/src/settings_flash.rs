//! Flash access to the radio settings partition
//!
//! Locates the `nvs` data partition through the partition table and feeds
//! its page headers to [`StoreScan`]. Erasing is the only write this module
//! performs.

use embedded_storage::nor_flash::{NorFlash, ReadNorFlash};
use esp_bootloader_esp_idf::partitions::{
    self, DataPartitionSubType, PARTITION_TABLE_MAX_LEN, PartitionType,
};
use esp_storage::{FlashStorage, FlashStorageError};
use log::{debug, info};
use thiserror_no_std::Error;
use valve_core::settings::{PAGE_HEADER_LEN, PAGE_SIZE, StorageStatus, StoreScan};

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("flash access failed: {0:?}")]
    Flash(FlashStorageError),
    #[error("partition table unreadable: {0:?}")]
    PartitionTable(partitions::Error),
    #[error("no nvs partition in the partition table")]
    NotFound,
}

impl From<FlashStorageError> for SettingsError {
    fn from(err: FlashStorageError) -> Self {
        SettingsError::Flash(err)
    }
}

impl From<partitions::Error> for SettingsError {
    fn from(err: partitions::Error) -> Self {
        SettingsError::PartitionTable(err)
    }
}

/// The `nvs` partition and the flash it lives on
pub struct SettingsPartition {
    flash: FlashStorage<'static>,
    offset: u32,
    len: u32,
}

impl SettingsPartition {
    /// Reads the partition table and remembers where the `nvs` partition is.
    pub fn locate(mut flash: FlashStorage<'static>) -> Result<Self, SettingsError> {
        let mut table_buf = [0u8; PARTITION_TABLE_MAX_LEN];
        let table = partitions::read_partition_table(&mut flash, &mut table_buf)?;
        let entry = table
            .find_partition(PartitionType::Data(DataPartitionSubType::Nvs))?
            .ok_or(SettingsError::NotFound)?;

        let (offset, len) = (entry.offset(), entry.len());
        debug!("nvs partition at {:#x}, {} bytes", offset, len);

        Ok(Self { flash, offset, len })
    }

    fn page_count(&self) -> u32 {
        self.len / PAGE_SIZE as u32
    }

    /// Reads every page header and reports whether the store is usable.
    pub fn scan(&mut self) -> Result<StorageStatus, SettingsError> {
        let mut scan = StoreScan::new();
        let mut header = [0u8; PAGE_HEADER_LEN];

        for page in 0..self.page_count() {
            let address = self.offset + page * PAGE_SIZE as u32;
            self.flash.read(address, &mut header)?;
            scan.push_page(&header);
        }

        debug!("scanned {} settings pages", scan.pages());
        Ok(scan.finish())
    }

    /// Erases the whole partition back to blank pages.
    pub fn erase(&mut self) -> Result<(), SettingsError> {
        let end = self.offset + self.page_count() * PAGE_SIZE as u32;
        info!(
            "Erasing settings partition ({} pages)",
            self.page_count()
        );
        self.flash.erase(self.offset, end)?;
        Ok(())
    }
}
