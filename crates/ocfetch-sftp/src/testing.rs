//! In-memory SFTP mocks shared by the crate's tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use ocfetch_core::storage::ResourceStream;

use crate::error::SftpError;
use crate::session::{SftpConnector, SftpCredentials, SftpDirEntry, SftpFileStat, SftpSessionOps};

/// Session over a shared `path -> (mtime, bytes)` map. Directories are
/// implicit: any path that prefixes another entry is a directory.
pub(crate) struct MockSession {
    pub files: Arc<Mutex<HashMap<String, (u64, Vec<u8>)>>>,
    pub healthy: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl SftpSessionOps for MockSession {
    async fn list_dir(&self, path: &str) -> Result<Vec<SftpDirEntry>, SftpError> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let files = self.files.lock().unwrap_or_else(|e| e.into_inner());
        let mut entries: Vec<SftpDirEntry> = files
            .iter()
            .filter_map(|(full, (mtime, bytes))| {
                let rest = full.strip_prefix(&prefix)?;
                if rest.contains('/') {
                    return None;
                }
                Some(SftpDirEntry {
                    name: rest.to_owned(),
                    stat: SftpFileStat {
                        size: Some(bytes.len() as u64),
                        mtime: Some(*mtime),
                        is_dir: false,
                    },
                })
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn stat(&self, path: &str) -> Result<SftpFileStat, SftpError> {
        let files = self.files.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((mtime, bytes)) = files.get(path) {
            return Ok(SftpFileStat {
                size: Some(bytes.len() as u64),
                mtime: Some(*mtime),
                is_dir: false,
            });
        }
        let prefix = format!("{}/", path.trim_end_matches('/'));
        if files.keys().any(|k| k.starts_with(&prefix)) {
            return Ok(SftpFileStat {
                size: None,
                mtime: None,
                is_dir: true,
            });
        }
        Err(SftpError::operation(path, "no such file"))
    }

    async fn open_read(&self, path: &str) -> Result<ResourceStream, SftpError> {
        let files = self.files.lock().unwrap_or_else(|e| e.into_inner());
        let (_, bytes) = files
            .get(path)
            .ok_or_else(|| SftpError::operation(path, "no such file"))?;
        Ok(Box::new(std::io::Cursor::new(bytes.clone())))
    }

    async fn exists(&self, path: &str) -> Result<bool, SftpError> {
        Ok(self.stat(path).await.is_ok())
    }

    async fn canonicalize(&self, path: &str) -> Result<String, SftpError> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(path.to_owned())
        } else {
            Err(SftpError::operation(path, "connection lost"))
        }
    }

    async fn close(&self) {}
}

/// Connector producing [`MockSession`]s over one shared file map.
pub(crate) struct MockConnector {
    pub files: Arc<Mutex<HashMap<String, (u64, Vec<u8>)>>>,
    pub connections: AtomicU32,
}

impl MockConnector {
    pub(crate) fn with_files(files: &[(&str, u64, &[u8])]) -> Self {
        let map = files
            .iter()
            .map(|(path, mtime, bytes)| ((*path).to_owned(), (*mtime, bytes.to_vec())))
            .collect();
        Self {
            files: Arc::new(Mutex::new(map)),
            connections: AtomicU32::new(0),
        }
    }

    /// Add or replace a file after construction (S2-style resumption).
    pub(crate) fn upsert(&self, path: &str, mtime: u64, bytes: &[u8]) {
        self.files
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.to_owned(), (mtime, bytes.to_vec()));
    }
}

#[async_trait::async_trait]
impl SftpConnector for MockConnector {
    async fn connect(
        &self,
        _credentials: &SftpCredentials,
    ) -> Result<Box<dyn SftpSessionOps>, SftpError> {
        self.connections.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSession {
            files: Arc::clone(&self.files),
            healthy: Arc::new(AtomicBool::new(true)),
        }))
    }
}
