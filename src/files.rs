//! Local file persistence for attachment content.
//!
//! Files live directly in a caller-chosen directory under their attachment
//! file name. Existing files are never overwritten.

use crate::{Error, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Write `reader` to `dir/file_name`, creating `dir` if needed.
///
/// Fails with [`Error::InvalidInput`] if the file already exists or the name
/// is not a plain file name. A failed write leaves no file behind.
pub fn save_stream(dir: &Path, file_name: &str, reader: &mut impl Read) -> Result<PathBuf> {
    let path = dir.join(check_file_name(file_name)?);
    fs::create_dir_all(dir)?;

    let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            return Err(Error::InvalidInput(format!(
                "file already exists: {}",
                path.display()
            )));
        }
        Err(e) => return Err(e.into()),
    };

    match io::copy(reader, &mut file).and_then(|n| file.sync_all().map(|_| n)) {
        Ok(written) => {
            debug!(path = %path.display(), bytes = written, "Saved attachment content");
            Ok(path)
        }
        Err(e) => {
            drop(file);
            let _ = fs::remove_file(&path);
            Err(e.into())
        }
    }
}

/// Open `dir/file_name` for reading, or `None` if it does not exist.
pub fn open_file(dir: &Path, file_name: &str) -> Result<Option<File>> {
    let path = dir.join(check_file_name(file_name)?);
    match File::open(&path) {
        Ok(file) => Ok(Some(file)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Read all of `dir/file_name`, or `None` if it does not exist.
pub fn read_file(dir: &Path, file_name: &str) -> Result<Option<Vec<u8>>> {
    let Some(mut file) = open_file(dir, file_name)? else {
        return Ok(None);
    };
    let mut content = Vec::new();
    file.read_to_end(&mut content)?;
    Ok(Some(content))
}

fn check_file_name(file_name: &str) -> Result<&str> {
    let invalid = file_name.trim().is_empty()
        || file_name == "."
        || file_name == ".."
        || file_name.contains(['/', '\\'])
        || file_name.contains('\0');
    if invalid {
        return Err(Error::InvalidInput(format!(
            "not a plain file name: {:?}",
            file_name
        )));
    }
    Ok(file_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    #[test]
    fn test_save_and_read() {
        let dir = TempDir::new().unwrap();
        let path = save_stream(dir.path(), "Report1.pdf", &mut Cursor::new(b"%PDF-1.4")).unwrap();
        assert_eq!(path, dir.path().join("Report1.pdf"));
        assert_eq!(
            read_file(dir.path(), "Report1.pdf").unwrap().as_deref(),
            Some(&b"%PDF-1.4"[..])
        );
    }

    #[test]
    fn test_save_creates_directory() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("downloads").join("claims");
        save_stream(&nested, "a.txt", &mut Cursor::new(b"a")).unwrap();
        assert!(nested.join("a.txt").exists());
    }

    #[test]
    fn test_save_refuses_to_overwrite() {
        let dir = TempDir::new().unwrap();
        save_stream(dir.path(), "a.txt", &mut Cursor::new(b"first")).unwrap();
        let err = save_stream(dir.path(), "a.txt", &mut Cursor::new(b"second")).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert_eq!(
            read_file(dir.path(), "a.txt").unwrap().as_deref(),
            Some(&b"first"[..])
        );
    }

    #[test]
    fn test_missing_file_is_none() {
        let dir = TempDir::new().unwrap();
        assert!(open_file(dir.path(), "nope.txt").unwrap().is_none());
        assert!(read_file(dir.path(), "nope.txt").unwrap().is_none());
    }

    #[test]
    fn test_rejects_paths() {
        let dir = TempDir::new().unwrap();
        for bad in ["", " ", ".", "..", "../x", "a/b", "a\\b"] {
            assert!(
                save_stream(dir.path(), bad, &mut Cursor::new(b"x")).is_err(),
                "accepted {bad:?}"
            );
        }
    }

    struct FailingReader;

    impl Read for FailingReader {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::other("connection reset"))
        }
    }

    #[test]
    fn test_failed_write_leaves_no_file() {
        let dir = TempDir::new().unwrap();
        assert!(save_stream(dir.path(), "partial.bin", &mut FailingReader).is_err());
        assert!(!dir.path().join("partial.bin").exists());
    }
}
