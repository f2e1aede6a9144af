//! Filesystem seam for transfers
//!
//! A transfer streams from one `FileSystem` to another. Uploads read
//! `LocalFs` and write the session's `SftpFs`, downloads the reverse.

use std::path::Path;

use async_trait::async_trait;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::OpenFlags;
use tokio::io::{AsyncRead, AsyncSeekExt, AsyncWrite};
use tracing::debug;

use super::error::TransferError;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    pub is_dir: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

#[async_trait]
pub trait FileSystem: Send + Sync {
    /// `None` when nothing exists at `path`
    async fn stat(&self, path: &str) -> Result<Option<FileStat>, TransferError>;

    /// Create `path`; succeeds if it already exists as a directory
    async fn create_dir(&self, path: &str) -> Result<(), TransferError>;

    /// Entries of `path`, without `.` and `..`
    async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, TransferError>;

    /// Open for reading starting at `offset`
    async fn open_read(&self, path: &str, offset: u64) -> Result<BoxedReader, TransferError>;

    /// Create or truncate for writing
    async fn open_write(&self, path: &str) -> Result<BoxedWriter, TransferError>;

    async fn remove_file(&self, path: &str) -> Result<(), TransferError>;

    /// Join a child name onto a directory path in this filesystem's syntax
    fn join(&self, dir: &str, name: &str) -> String {
        join_remote_path(dir, name)
    }
}

/// Join remote path components, always with `/`
pub fn join_remote_path(base: &str, name: &str) -> String {
    if base.is_empty() {
        name.to_string()
    } else if base.ends_with('/') {
        format!("{}{}", base, name)
    } else {
        format!("{}/{}", base, name)
    }
}

/// The machine the engine runs on
#[derive(Debug, Default, Clone)]
pub struct LocalFs;

#[async_trait]
impl FileSystem for LocalFs {
    async fn stat(&self, path: &str) -> Result<Option<FileStat>, TransferError> {
        match tokio::fs::metadata(path).await {
            Ok(meta) => Ok(Some(FileStat {
                size: meta.len(),
                is_dir: meta.is_dir(),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(TransferError::from_io(e, path)),
        }
    }

    async fn create_dir(&self, path: &str) -> Result<(), TransferError> {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| TransferError::from_io(e, path))
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, TransferError> {
        let mut dir = tokio::fs::read_dir(path)
            .await
            .map_err(|e| TransferError::from_io(e, path))?;
        let mut entries = Vec::new();

        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| TransferError::from_io(e, path))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| TransferError::from_io(e, path))?;

            let (is_dir, size) = if file_type.is_symlink() {
                // Follow links to files; linked directories could cycle
                match tokio::fs::metadata(entry.path()).await {
                    Ok(meta) if meta.is_file() => (false, meta.len()),
                    _ => {
                        debug!("Skipping link {}", entry.path().display());
                        continue;
                    }
                }
            } else if file_type.is_dir() {
                (true, 0)
            } else {
                let meta = entry
                    .metadata()
                    .await
                    .map_err(|e| TransferError::from_io(e, path))?;
                (false, meta.len())
            };

            entries.push(DirEntry { name, is_dir, size });
        }
        Ok(entries)
    }

    async fn open_read(&self, path: &str, offset: u64) -> Result<BoxedReader, TransferError> {
        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|e| TransferError::from_io(e, path))?;
        if offset > 0 {
            file.seek(std::io::SeekFrom::Start(offset))
                .await
                .map_err(|e| TransferError::from_io(e, path))?;
        }
        Ok(Box::new(file))
    }

    async fn open_write(&self, path: &str) -> Result<BoxedWriter, TransferError> {
        let file = tokio::fs::File::create(path)
            .await
            .map_err(|e| TransferError::from_io(e, path))?;
        Ok(Box::new(file))
    }

    async fn remove_file(&self, path: &str) -> Result<(), TransferError> {
        tokio::fs::remove_file(path)
            .await
            .map_err(|e| TransferError::from_io(e, path))
    }

    fn join(&self, dir: &str, name: &str) -> String {
        Path::new(dir).join(name).to_string_lossy().into_owned()
    }
}

/// Remote filesystem over one SFTP subsystem channel
pub struct SftpFs {
    sftp: SftpSession,
}

impl SftpFs {
    pub fn new(sftp: SftpSession) -> Self {
        Self { sftp }
    }
}

#[async_trait]
impl FileSystem for SftpFs {
    async fn stat(&self, path: &str) -> Result<Option<FileStat>, TransferError> {
        match self.sftp.metadata(path).await {
            Ok(meta) => Ok(Some(FileStat {
                size: meta.size.unwrap_or(0),
                is_dir: meta.is_dir(),
            })),
            Err(e) => match TransferError::from_sftp(e, path) {
                TransferError::NotFound(_) => Ok(None),
                other => Err(other),
            },
        }
    }

    async fn create_dir(&self, path: &str) -> Result<(), TransferError> {
        if let Err(e) = self.sftp.create_dir(path).await {
            // Servers report an existing directory as a generic failure
            match self.stat(path).await? {
                Some(stat) if stat.is_dir => return Ok(()),
                _ => return Err(TransferError::from_sftp(e, path)),
            }
        }
        Ok(())
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, TransferError> {
        let dir = self
            .sftp
            .read_dir(path)
            .await
            .map_err(|e| TransferError::from_sftp(e, path))?;

        Ok(dir
            .filter(|entry| {
                let name = entry.file_name();
                name != "." && name != ".."
            })
            .map(|entry| {
                let meta = entry.metadata();
                DirEntry {
                    name: entry.file_name(),
                    is_dir: entry.file_type().is_dir(),
                    size: meta.size.unwrap_or(0),
                }
            })
            .collect())
    }

    async fn open_read(&self, path: &str, offset: u64) -> Result<BoxedReader, TransferError> {
        let mut file = self
            .sftp
            .open(path)
            .await
            .map_err(|e| TransferError::from_sftp(e, path))?;
        if offset > 0 {
            file.seek(std::io::SeekFrom::Start(offset))
                .await
                .map_err(|e| TransferError::from_io(e, path))?;
        }
        Ok(Box::new(file))
    }

    async fn open_write(&self, path: &str) -> Result<BoxedWriter, TransferError> {
        let file = self
            .sftp
            .open_with_flags(
                path,
                OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE,
            )
            .await
            .map_err(|e| TransferError::from_sftp(e, path))?;
        Ok(Box::new(file))
    }

    async fn remove_file(&self, path: &str) -> Result<(), TransferError> {
        self.sftp
            .remove_file(path)
            .await
            .map_err(|e| TransferError::from_sftp(e, path))
    }
}
