// Page checksum utilities.
//
// The checksum is the CRC-64 of the page with the 8-byte checksum field
// excluded. The field is lazy: zero means "never computed" and the
// all-ones sentinel marks a deliberately invalidated page; both pass
// confirmation so that freshly extended or re-initialized pages are not
// rejected on read.

use crc::{Crc, CRC_64_XZ};

use crate::storage::page::{page_get_checksum, page_set_checksum};

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_XZ);

/// Checksum value meaning "never computed".
pub const CHECKSUM_UNSET: u64 = 0;

/// Explicit invalid sentinel.
pub const CHECKSUM_INVALID: u64 = u64::MAX;

#[inline]
pub fn page_checksum(page: &[u8]) -> u64 {
    let mut digest = CRC64.digest();
    digest.update(&page[8..]);
    let sum = digest.finalize();
    // steer clear of the two sentinel values
    match sum {
        CHECKSUM_UNSET => 1,
        CHECKSUM_INVALID => CHECKSUM_INVALID - 1,
        s => s,
    }
}

/// Compute and store the checksum. Returns the stored value.
pub fn page_insert_checksum(page: &mut [u8]) -> u64 {
    let sum = page_checksum(page);
    page_set_checksum(page, sum);
    sum
}

/// Mark the page checksum as deliberately invalid.
pub fn page_insert_invalid_checksum(page: &mut [u8]) {
    page_set_checksum(page, CHECKSUM_INVALID);
}

#[inline]
pub fn page_checksum_is_init(page: &[u8]) -> bool {
    let sum = page_get_checksum(page);
    sum != CHECKSUM_UNSET && sum != CHECKSUM_INVALID
}

/// Verify the stored checksum. Unset and sentinel values are accepted;
/// any other stored value must match the recomputed CRC.
pub fn page_confirm_checksum(page: &[u8]) -> bool {
    let stored = page_get_checksum(page);
    if stored == CHECKSUM_UNSET || stored == CHECKSUM_INVALID {
        return true;
    }
    stored == page_checksum(page)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::{page_add_item, page_init, BLCKSZ};

    fn sample_page() -> Vec<u8> {
        let mut p = vec![0u8; BLCKSZ];
        page_init(&mut p, 0);
        page_add_item(&mut p, b"checksummed content", None).unwrap();
        p
    }

    #[test]
    fn insert_then_confirm() {
        let mut p = sample_page();
        let sum = page_insert_checksum(&mut p);
        assert_ne!(sum, CHECKSUM_UNSET);
        assert!(page_checksum_is_init(&p));
        assert!(page_confirm_checksum(&p));
    }

    #[test]
    fn unset_checksum_is_accepted() {
        let p = sample_page();
        assert!(!page_checksum_is_init(&p));
        assert!(page_confirm_checksum(&p));
    }

    #[test]
    fn corruption_is_detected() {
        let mut p = sample_page();
        page_insert_checksum(&mut p);
        p[100] ^= 0xFF;
        assert!(!page_confirm_checksum(&p));
    }

    #[test]
    fn checksum_field_itself_is_excluded() {
        let mut p = sample_page();
        let a = page_checksum(&p);
        page_insert_checksum(&mut p);
        let b = page_checksum(&p);
        assert_eq!(a, b);
    }

    #[test]
    fn invalid_sentinel_passes_confirmation() {
        let mut p = sample_page();
        page_insert_invalid_checksum(&mut p);
        assert!(!page_checksum_is_init(&p));
        assert!(page_confirm_checksum(&p));
    }
}
