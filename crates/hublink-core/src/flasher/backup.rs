//! Firmware backups: the raw bytes of a hub's firmware region, stored as is.

use std::io::Write;
use std::path::Path;

use tracing::info;

use super::FlashError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareBackup {
    data: Vec<u8>,
}

impl FirmwareBackup {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Write the backup to `path`, replacing any existing file only once the
    /// new contents are fully on disk.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), FlashError> {
        let path = path.as_ref();
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut file = tempfile::NamedTempFile::new_in(dir)?;
        file.write_all(&self.data)?;
        file.as_file().sync_all()?;
        file.persist(path).map_err(|e| e.error)?;
        info!(path = %path.display(), bytes = self.data.len(), "Backup saved");
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, FlashError> {
        let data = std::fs::read(path)?;
        Ok(Self { data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_load_preserve_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prime.bin");
        let backup = FirmwareBackup::new((0..=255u8).cycle().take(4096).collect());
        backup.save(&path).unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), backup.as_bytes());
        assert_eq!(FirmwareBackup::load(&path).unwrap(), backup);
    }

    #[test]
    fn test_save_overwrites_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hub.bin");
        std::fs::write(&path, b"old contents that are longer").unwrap();
        FirmwareBackup::new(b"new".to_vec()).save(&path).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"new");
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            FirmwareBackup::load(dir.path().join("absent.bin")),
            Err(FlashError::Io(_))
        ));
    }
}
