//! File system access.
//!
//! Components take a `FileSystem` instead of calling `std::fs`
//! directly so tests can observe and fail file operations.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, Write};
use std::path::Path;

/// A file opened for writing.
pub trait FileWriter: Write + Seek + Send {}

/// A file opened for reading.
pub trait FileReader: Read + Seek + Send {}

impl<T: Write + Seek + Send> FileWriter for T {}
impl<T: Read + Seek + Send> FileReader for T {}

/// File system operations used by the installer.
pub trait FileSystem: Send + Sync + std::fmt::Debug {
    /// Creates (or truncates) a file for writing, creating parent directories.
    fn create_file_writer(&self, path: &Path) -> io::Result<Box<dyn FileWriter>>;

    /// Opens an existing file for reading.
    fn create_file_reader(&self, path: &Path) -> io::Result<Box<dyn FileReader>>;

    fn file_exists(&self, path: &Path) -> bool;

    fn file_size(&self, path: &Path) -> io::Result<u64>;

    fn delete_file(&self, path: &Path) -> io::Result<()>;
}

/// The local file system.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalFileSystem;

impl FileSystem for LocalFileSystem {
    fn create_file_writer(&self, path: &Path) -> io::Result<Box<dyn FileWriter>> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        Ok(Box::new(file))
    }

    fn create_file_reader(&self, path: &Path) -> io::Result<Box<dyn FileReader>> {
        Ok(Box::new(File::open(path)?))
    }

    fn file_exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn file_size(&self, path: &Path) -> io::Result<u64> {
        Ok(fs::metadata(path)?.len())
    }

    fn delete_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }
}
