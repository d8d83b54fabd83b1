pub const KB: usize = 1024;
pub const MB: usize = KB * KB;

// Every block device this kernel drives uses 512-byte sectors.
pub const SECTOR_SIZE: u32 = 512;
