const ESPFS_MAGIC: &[u8; 4] = b"ESfs";

/// Filesystem images carry no further structure we could check up front
pub(super) fn is_espfs_header(header: &[u8]) -> bool {
    header.starts_with(ESPFS_MAGIC)
}
