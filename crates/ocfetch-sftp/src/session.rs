//! SFTP session abstraction and the russh-backed implementation.
//!
//! Pools, loaders, and locators talk to [`SftpSessionOps`]; production
//! sessions come from [`RusshConnector`], tests plug in mock sessions.
//! Host-key verification is disabled — fetcher targets are configured
//! explicitly and the registries this tool pulls from rotate keys without
//! notice.

use std::sync::Arc;

use ocfetch_core::credentials::CredentialProvider;
use ocfetch_core::storage::ResourceStream;
use tracing::debug;

use crate::error::SftpError;

/// Stat record for a remote path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SftpFileStat {
    /// File size in bytes, when reported.
    pub size: Option<u64>,
    /// Modification time, seconds since the Unix epoch.
    pub mtime: Option<u64>,
    /// Whether the path is a directory.
    pub is_dir: bool,
}

impl SftpFileStat {
    /// Whether the path is a regular file.
    #[must_use]
    pub fn is_file(&self) -> bool {
        !self.is_dir
    }
}

/// One directory listing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SftpDirEntry {
    /// File name (no directory component).
    pub name: String,
    /// Entry attributes.
    pub stat: SftpFileStat,
}

/// Operations on one live SFTP session.
#[async_trait::async_trait]
pub trait SftpSessionOps: Send + Sync {
    /// List a directory (entries for `.` and `..` excluded).
    ///
    /// # Errors
    ///
    /// Returns [`SftpError::Operation`] on protocol failure.
    async fn list_dir(&self, path: &str) -> Result<Vec<SftpDirEntry>, SftpError>;

    /// Stat a path.
    ///
    /// # Errors
    ///
    /// Returns [`SftpError::Operation`] on protocol failure or a missing
    /// path.
    async fn stat(&self, path: &str) -> Result<SftpFileStat, SftpError>;

    /// Open a file for reading.
    ///
    /// # Errors
    ///
    /// Returns [`SftpError::Operation`] on protocol failure.
    async fn open_read(&self, path: &str) -> Result<ResourceStream, SftpError>;

    /// Whether a path exists.
    ///
    /// # Errors
    ///
    /// Returns [`SftpError::Operation`] on protocol failure.
    async fn exists(&self, path: &str) -> Result<bool, SftpError>;

    /// Resolve a path server-side. Doubles as the pool's health check —
    /// it is the cheapest round trip the protocol offers.
    ///
    /// # Errors
    ///
    /// Returns [`SftpError::Operation`] when the session is unusable.
    async fn canonicalize(&self, path: &str) -> Result<String, SftpError>;

    /// Close the session. Errors are swallowed — a session being discarded
    /// has nothing left to protect.
    async fn close(&self);
}

/// Login material resolved through the credential provider.
#[derive(Debug, Clone)]
pub struct SftpCredentials {
    /// Remote host.
    pub host: String,
    /// Remote port.
    pub port: u16,
    /// Login user.
    pub username: String,
    /// Login password.
    pub password: String,
}

impl SftpCredentials {
    /// Resolve `host`/`port`/`username`/`password` for a configuration
    /// name. A missing `port` defaults to 22.
    ///
    /// # Errors
    ///
    /// Returns [`SftpError::Credential`] when a required key is missing.
    pub async fn resolve(
        config_name: &str,
        provider: &Arc<dyn CredentialProvider>,
    ) -> Result<Self, SftpError> {
        let host = provider.get_credential(config_name, "host").await?;
        let username = provider.get_credential(config_name, "username").await?;
        let password = provider.get_credential(config_name, "password").await?;
        let port = match provider.get_credential(config_name, "port").await {
            Ok(port) => port.parse().unwrap_or(22),
            Err(_) => 22,
        };
        Ok(Self {
            host,
            port,
            username,
            password,
        })
    }
}

/// Creates sessions. Injectable so pools are testable with mocks.
#[async_trait::async_trait]
pub trait SftpConnector: Send + Sync {
    /// Establish an authenticated session.
    ///
    /// # Errors
    ///
    /// Returns [`SftpError::Connect`] when the transport or authentication
    /// fails.
    async fn connect(
        &self,
        credentials: &SftpCredentials,
    ) -> Result<Box<dyn SftpSessionOps>, SftpError>;
}

/// Production connector over russh.
#[derive(Debug, Clone)]
pub struct RusshConnector {
    connect_timeout: std::time::Duration,
}

impl RusshConnector {
    /// Create a connector with the given establishment timeout.
    #[must_use]
    pub fn new(connect_timeout: std::time::Duration) -> Self {
        Self { connect_timeout }
    }
}

struct AcceptAllHostKeys;

#[async_trait::async_trait]
impl russh::client::Handler for AcceptAllHostKeys {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

#[async_trait::async_trait]
impl SftpConnector for RusshConnector {
    async fn connect(
        &self,
        credentials: &SftpCredentials,
    ) -> Result<Box<dyn SftpSessionOps>, SftpError> {
        let connect_err = |reason: String| SftpError::Connect {
            host: credentials.host.clone(),
            reason,
        };

        let config = Arc::new(russh::client::Config {
            inactivity_timeout: Some(self.connect_timeout),
            ..russh::client::Config::default()
        });

        let mut handle = tokio::time::timeout(
            self.connect_timeout,
            russh::client::connect(
                config,
                (credentials.host.as_str(), credentials.port),
                AcceptAllHostKeys,
            ),
        )
        .await
        .map_err(|_| connect_err("connect timed out".to_owned()))?
        .map_err(|e| connect_err(e.to_string()))?;

        let authenticated = handle
            .authenticate_password(&credentials.username, &credentials.password)
            .await
            .map_err(|e| connect_err(e.to_string()))?;
        if !authenticated {
            return Err(connect_err(format!(
                "password authentication rejected for '{}'",
                credentials.username
            )));
        }

        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| connect_err(e.to_string()))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| connect_err(e.to_string()))?;
        let sftp = russh_sftp::client::SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| connect_err(e.to_string()))?;

        debug!(host = %credentials.host, port = credentials.port, "sftp session established");
        Ok(Box::new(RusshSession { sftp, handle }))
    }
}

struct RusshSession {
    sftp: russh_sftp::client::SftpSession,
    /// The SSH transport; kept for the lifetime of the session.
    handle: russh::client::Handle<AcceptAllHostKeys>,
}

fn stat_from(attrs: &russh_sftp::protocol::FileAttributes) -> SftpFileStat {
    SftpFileStat {
        size: attrs.size,
        mtime: attrs.mtime.map(u64::from),
        is_dir: attrs.is_dir(),
    }
}

#[async_trait::async_trait]
impl SftpSessionOps for RusshSession {
    async fn list_dir(&self, path: &str) -> Result<Vec<SftpDirEntry>, SftpError> {
        let entries = self
            .sftp
            .read_dir(path)
            .await
            .map_err(|e| SftpError::operation(path, e))?;
        Ok(entries
            .filter(|entry| entry.file_name() != "." && entry.file_name() != "..")
            .map(|entry| SftpDirEntry {
                name: entry.file_name(),
                stat: stat_from(&entry.metadata()),
            })
            .collect())
    }

    async fn stat(&self, path: &str) -> Result<SftpFileStat, SftpError> {
        let attrs = self
            .sftp
            .metadata(path)
            .await
            .map_err(|e| SftpError::operation(path, e))?;
        Ok(stat_from(&attrs))
    }

    async fn open_read(&self, path: &str) -> Result<ResourceStream, SftpError> {
        let file = self
            .sftp
            .open(path)
            .await
            .map_err(|e| SftpError::operation(path, e))?;
        Ok(Box::new(file))
    }

    async fn exists(&self, path: &str) -> Result<bool, SftpError> {
        self.sftp
            .try_exists(path)
            .await
            .map_err(|e| SftpError::operation(path, e))
    }

    async fn canonicalize(&self, path: &str) -> Result<String, SftpError> {
        self.sftp
            .canonicalize(path)
            .await
            .map_err(|e| SftpError::operation(path, e))
    }

    async fn close(&self) {
        let _ = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await;
    }
}
