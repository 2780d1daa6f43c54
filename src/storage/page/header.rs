use byteorder::{ByteOrder, LittleEndian};

use crate::common::types::{Page, PageId, PAGE_SIZE};
use crate::storage::page::error::PageError;

const RECORD_COUNT_OFFSET: usize = 0;
const RECORDS_OFFSET: usize = 4;

/// Fixed-width record: name length (2) + name bytes + root page id (4)
const MAX_NAME_LEN: usize = 32;
const RECORD_SIZE: usize = 2 + MAX_NAME_LEN + 4;

/// Codec for the reserved header page (page 0), which stores one
/// `(index_name -> root_page_id)` record per named index. The caller owns
/// the page latch; these functions only interpret the bytes.
pub struct HeaderPage;

impl HeaderPage {
    pub fn record_count(page: &Page) -> usize {
        LittleEndian::read_u32(&page.data[RECORD_COUNT_OFFSET..RECORD_COUNT_OFFSET + 4]) as usize
    }

    fn capacity() -> usize {
        (PAGE_SIZE - RECORDS_OFFSET) / RECORD_SIZE
    }

    fn record_slice(page: &Page, slot: usize) -> &[u8] {
        let start = RECORDS_OFFSET + slot * RECORD_SIZE;
        &page.data[start..start + RECORD_SIZE]
    }

    fn record_name(record: &[u8]) -> &str {
        let name_len = LittleEndian::read_u16(&record[0..2]) as usize;
        std::str::from_utf8(&record[2..2 + name_len]).unwrap_or("")
    }

    fn find_slot(page: &Page, name: &str) -> Option<usize> {
        (0..Self::record_count(page)).find(|&slot| Self::record_name(Self::record_slice(page, slot)) == name)
    }

    /// Look up the root page id registered under `name`
    pub fn get_record(page: &Page, name: &str) -> Option<PageId> {
        let slot = Self::find_slot(page, name)?;
        let record = Self::record_slice(page, slot);
        Some(LittleEndian::read_u32(&record[2 + MAX_NAME_LEN..2 + MAX_NAME_LEN + 4]))
    }

    /// Register a new index. Fails if the name already exists, is too long,
    /// or the directory page is full.
    pub fn insert_record(page: &mut Page, name: &str, root_page_id: PageId) -> Result<(), PageError> {
        if name.len() > MAX_NAME_LEN {
            return Err(PageError::NameTooLong(name.to_string()));
        }
        if Self::find_slot(page, name).is_some() {
            return Err(PageError::DuplicateRecord(name.to_string()));
        }
        let count = Self::record_count(page);
        if count >= Self::capacity() {
            return Err(PageError::DirectoryFull);
        }

        let start = RECORDS_OFFSET + count * RECORD_SIZE;
        let record = &mut page.data[start..start + RECORD_SIZE];
        record.fill(0);
        LittleEndian::write_u16(&mut record[0..2], name.len() as u16);
        record[2..2 + name.len()].copy_from_slice(name.as_bytes());
        LittleEndian::write_u32(&mut record[2 + MAX_NAME_LEN..2 + MAX_NAME_LEN + 4], root_page_id);

        LittleEndian::write_u32(
            &mut page.data[RECORD_COUNT_OFFSET..RECORD_COUNT_OFFSET + 4],
            (count + 1) as u32,
        );
        Ok(())
    }

    /// Update the root page id of an existing record
    pub fn update_record(page: &mut Page, name: &str, root_page_id: PageId) -> Result<(), PageError> {
        let slot = Self::find_slot(page, name).ok_or_else(|| PageError::RecordNotFound(name.to_string()))?;
        let start = RECORDS_OFFSET + slot * RECORD_SIZE;
        LittleEndian::write_u32(
            &mut page.data[start + 2 + MAX_NAME_LEN..start + 2 + MAX_NAME_LEN + 4],
            root_page_id,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::INVALID_PAGE_ID;

    #[test]
    fn test_insert_and_get() {
        let mut page = Page::new(0);
        HeaderPage::insert_record(&mut page, "orders_pk", 7).unwrap();
        HeaderPage::insert_record(&mut page, "users_pk", 12).unwrap();

        assert_eq!(HeaderPage::record_count(&page), 2);
        assert_eq!(HeaderPage::get_record(&page, "orders_pk"), Some(7));
        assert_eq!(HeaderPage::get_record(&page, "users_pk"), Some(12));
        assert_eq!(HeaderPage::get_record(&page, "missing"), None);
    }

    #[test]
    fn test_update() {
        let mut page = Page::new(0);
        HeaderPage::insert_record(&mut page, "idx", 3).unwrap();
        HeaderPage::update_record(&mut page, "idx", INVALID_PAGE_ID).unwrap();
        assert_eq!(HeaderPage::get_record(&page, "idx"), Some(INVALID_PAGE_ID));

        assert!(HeaderPage::update_record(&mut page, "nope", 1).is_err());
    }

    #[test]
    fn test_duplicate_and_overlong_names_rejected() {
        let mut page = Page::new(0);
        HeaderPage::insert_record(&mut page, "idx", 3).unwrap();
        assert!(HeaderPage::insert_record(&mut page, "idx", 4).is_err());

        let long_name = "x".repeat(64);
        assert!(HeaderPage::insert_record(&mut page, &long_name, 1).is_err());
    }
}
