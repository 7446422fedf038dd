pub mod package_chunks;
pub mod verify_chunks;
