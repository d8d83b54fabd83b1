pub mod mem_disk;
