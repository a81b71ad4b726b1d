//! SFTP sessions over `ssh2`, public-key authentication only.
//!
//! The TCP stream is opened directly (with a connect timeout) or tunnelled
//! through a SOCKS5 proxy. Every call blocks; the engine runs them inside
//! `spawn_blocking`.

use super::{Connector, RemoteStore};
use crate::config::SftpConfig;
use crate::error::{AppResult, DaqError};
use ssh2::{ErrorCode, RenameFlags, Session, Sftp};
use std::fs::File;
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;

// LIBSSH2_FX_NO_SUCH_FILE
const SFTP_NO_SUCH_FILE: i32 = 2;

/// Connects to the archive host described by an `[sftp]` section.
#[derive(Debug, Clone)]
pub struct SftpConnector {
    settings: SftpConfig,
}

impl SftpConnector {
    /// Connector for `settings`.
    pub fn new(settings: SftpConfig) -> Self {
        Self { settings }
    }

    /// Check that the private key can be read, without connecting.
    pub fn check_credentials(&self) -> AppResult<()> {
        File::open(&self.settings.key_path).map(|_| ()).map_err(|e| {
            DaqError::Authentication(format!(
                "cannot read private key {}: {e}",
                self.settings.key_path.display()
            ))
        })
    }

    fn open_tcp(&self) -> AppResult<TcpStream> {
        let target = (self.settings.host.as_str(), self.settings.port);
        let timeout = self.settings.timeout;
        let stream = match &self.settings.proxy {
            Some(proxy) => socks::Socks5Stream::connect((proxy.host.as_str(), proxy.port), target)
                .map_err(|e| transfer_error(&format!("SOCKS5 proxy {}:{}", proxy.host, proxy.port), e))?
                .into_inner(),
            None => {
                let mut last_error = io::Error::new(io::ErrorKind::NotFound, "host resolved to no address");
                let mut connected = None;
                for addr in target.to_socket_addrs()? {
                    match TcpStream::connect_timeout(&addr, timeout) {
                        Ok(stream) => {
                            connected = Some(stream);
                            break;
                        }
                        Err(e) => last_error = e,
                    }
                }
                connected.ok_or_else(|| transfer_error(&self.describe(), last_error))?
            }
        };
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        Ok(stream)
    }
}

fn transfer_error(context: &str, error: impl std::fmt::Display) -> DaqError {
    DaqError::Transfer(format!("{context}: {error}"))
}

impl Connector for SftpConnector {
    fn connect(&self) -> AppResult<Box<dyn RemoteStore>> {
        let endpoint = self.describe();
        let tcp = self.open_tcp()?;

        let mut session = Session::new().map_err(|e| transfer_error("create SSH session", e))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(u32::try_from(self.settings.timeout.as_millis()).unwrap_or(u32::MAX));
        session.handshake().map_err(|e| transfer_error(&endpoint, e))?;

        session
            .userauth_pubkey_file(
                &self.settings.username,
                None,
                &self.settings.key_path,
                self.settings.key_passphrase.as_deref(),
            )
            .map_err(|e| DaqError::Authentication(format!("{endpoint}: key authentication failed: {e}")))?;
        if !session.authenticated() {
            return Err(DaqError::Authentication(format!("{endpoint}: not authenticated")));
        }

        let sftp = session.sftp().map_err(|e| transfer_error("open SFTP channel", e))?;
        tracing::debug!(remote = %endpoint, "SFTP session open");
        Ok(Box::new(SftpStore {
            sftp,
            _session: session,
        }))
    }

    fn describe(&self) -> String {
        match &self.settings.proxy {
            Some(proxy) => format!(
                "sftp://{}@{}:{} via socks5://{}:{}",
                self.settings.username, self.settings.host, self.settings.port, proxy.host, proxy.port
            ),
            None => format!("sftp://{}@{}:{}", self.settings.username, self.settings.host, self.settings.port),
        }
    }
}

struct SftpStore {
    sftp: Sftp,
    // Dropped after the channel.
    _session: Session,
}

fn is_missing(error: &ssh2::Error) -> bool {
    matches!(error.code(), ErrorCode::SFTP(SFTP_NO_SUCH_FILE))
}

impl RemoteStore for SftpStore {
    fn create_dir_all(&mut self, path: &str) -> AppResult<()> {
        let mut current = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            if path.starts_with('/') || !current.is_empty() {
                current.push('/');
            }
            current.push_str(part);
            let dir = Path::new(&current);
            match self.sftp.stat(dir) {
                Ok(stat) if stat.is_dir() => continue,
                Ok(_) => return Err(DaqError::Transfer(format!("{current} exists and is not a directory"))),
                Err(e) if is_missing(&e) => {
                    // Another session may have created it in the meantime.
                    if let Err(e) = self.sftp.mkdir(dir, 0o755) {
                        if !self.sftp.stat(dir).is_ok_and(|s| s.is_dir()) {
                            return Err(transfer_error(&format!("mkdir {current}"), e));
                        }
                    }
                }
                Err(e) => return Err(transfer_error(&format!("stat {current}"), e)),
            }
        }
        Ok(())
    }

    fn size(&mut self, path: &str) -> AppResult<Option<u64>> {
        match self.sftp.stat(Path::new(path)) {
            Ok(stat) => Ok(Some(stat.size.unwrap_or(0))),
            Err(e) if is_missing(&e) => Ok(None),
            Err(e) => Err(transfer_error(&format!("stat {path}"), e)),
        }
    }

    fn put(&mut self, local: &Path, remote: &str) -> AppResult<u64> {
        let mut source = File::open(local)?;
        let mut target = self
            .sftp
            .create(Path::new(remote))
            .map_err(|e| transfer_error(&format!("create {remote}"), e))?;
        let written = io::copy(&mut source, &mut target).map_err(|e| transfer_error(&format!("write {remote}"), e))?;
        target
            .close()
            .map_err(|e| transfer_error(&format!("close {remote}"), e))?;
        Ok(written)
    }

    fn rename(&mut self, from: &str, to: &str) -> AppResult<()> {
        let flags = RenameFlags::OVERWRITE | RenameFlags::ATOMIC | RenameFlags::NATIVE;
        match self.sftp.rename(Path::new(from), Path::new(to), Some(flags)) {
            Ok(()) => Ok(()),
            // SFTPv3 servers refuse to replace; remove the stale target and retry once.
            Err(first) => {
                if self.sftp.unlink(Path::new(to)).is_err() {
                    return Err(transfer_error(&format!("rename {from} -> {to}"), first));
                }
                self.sftp
                    .rename(Path::new(from), Path::new(to), None)
                    .map_err(|e| transfer_error(&format!("rename {from} -> {to}"), e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;
    use std::time::Duration;

    fn settings() -> SftpConfig {
        SftpConfig {
            host: "archive.example.org".into(),
            port: 22,
            username: "station".into(),
            key_path: "/nonexistent/id_ed25519".into(),
            key_passphrase: None,
            remote_root: "/data".into(),
            timeout: Duration::from_secs(5),
            proxy: None,
        }
    }

    #[test]
    fn missing_key_is_a_credential_failure() {
        let err = SftpConnector::new(settings()).check_credentials().unwrap_err();
        assert!(matches!(err, DaqError::Authentication(_)));
        assert!(err.is_fatal_at_startup());
    }

    #[test]
    fn endpoint_description_names_the_proxy() {
        let mut with_proxy = settings();
        with_proxy.proxy = Some(ProxyConfig {
            host: "127.0.0.1".into(),
            port: 1080,
        });
        assert_eq!(
            SftpConnector::new(with_proxy).describe(),
            "sftp://station@archive.example.org:22 via socks5://127.0.0.1:1080"
        );
        assert_eq!(SftpConnector::new(settings()).describe(), "sftp://station@archive.example.org:22");
    }

    #[test]
    fn unreachable_host_is_a_transfer_error() {
        let mut local = settings();
        local.host = "127.0.0.1".into();
        // nothing listens on port 1
        local.port = 1;
        local.timeout = Duration::from_millis(200);
        let err = SftpConnector::new(local).connect().err().unwrap();
        assert!(matches!(err, DaqError::Transfer(_) | DaqError::Io(_)));
    }
}
