use std::io::Read;
use std::path::{Path, PathBuf};

use md5::{Digest, Md5};
use tracebench_protocol::{Checksum, FileHeader};

use crate::TransferError;

/// A file queued for transfer, with the metadata sent in its header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub path: PathBuf,
    /// Base name as sent to the peer.
    pub name: String,
    pub size: u64,
    pub checksum: Checksum,
    /// Position of the file in the run, starting at 0.
    pub index: u32,
}

impl FileRecord {
    /// Wire header announcing this file.
    pub fn header(&self) -> FileHeader {
        FileHeader::new(&self.name, self.size, self.index, self.checksum)
    }
}

/// Computes MD5 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// Computes MD5 of an entire file and returns the hex-encoded digest.
pub fn calculate_file_checksum(path: &Path) -> Result<String, TransferError> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Md5::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Reads the size and checksum of `path` and assigns it run position `index`.
pub fn inspect_file(path: &Path, index: u32) -> Result<FileRecord, TransferError> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("not a file path: {}", path.display()),
            )
        })?;
    let size = std::fs::metadata(path)?.len();
    let checksum = Checksum::from_hex(&calculate_file_checksum(path)?)?;

    Ok(FileRecord {
        path: path.to_path_buf(),
        name,
        size,
        checksum,
        index,
    })
}

/// Lists the regular files directly inside `dir`, sorted by name.
///
/// Subdirectories are not descended into.
pub fn enumerate_files(dir: &Path) -> Result<Vec<PathBuf>, TransferError> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.metadata()?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn checksum_bytes_is_md5_hex() {
        assert_eq!(
            checksum_bytes(b"hello world"),
            "5eb63bbbe01eeed093cb22bb8f5acdc3"
        );
        assert_eq!(checksum_bytes(b""), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn file_checksum_matches_bytes() {
        let dir = TempDir::new().unwrap();
        let data = vec![0x5Au8; 20_000];
        let path = dir.path().join("large.bin");
        fs::write(&path, &data).unwrap();

        assert_eq!(calculate_file_checksum(&path).unwrap(), checksum_bytes(&data));
    }

    #[test]
    fn inspect_fills_record() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dog.jpg");
        fs::write(&path, b"hello world").unwrap();

        let record = inspect_file(&path, 4).unwrap();
        assert_eq!(record.name, "dog.jpg");
        assert_eq!(record.size, 11);
        assert_eq!(record.index, 4);
        assert_eq!(record.checksum.as_str(), "5eb63bbbe01eeed093cb22bb8f5acdc3");

        let header = record.header();
        assert_eq!(header.name, "dog.jpg");
        assert_eq!(header.file_size, 11);
        assert_eq!(header.file_index, 4);
    }

    #[test]
    fn inspect_missing_file_fails() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            inspect_file(&dir.path().join("nope.bin"), 0),
            Err(TransferError::Io(_))
        ));
    }

    #[test]
    fn enumerate_skips_directories_and_sorts() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("b.png"), b"B").unwrap();
        fs::write(dir.path().join("a.png"), b"A").unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("nested").join("c.png"), b"C").unwrap();

        let files = enumerate_files(dir.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["a.png", "b.png"]);
    }

    #[test]
    fn enumerate_nonexistent_dir_fails() {
        assert!(enumerate_files(Path::new("/nonexistent/tracebench/images")).is_err());
    }
}
