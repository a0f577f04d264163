//! SFTP driver
//!
//! Authenticates with the stored password, or, when the access key is
//! empty, with the public key from the local agent identity file
//! (`~/.ssh/id_rsa`). Host keys are not checked; the sources are
//! operator-provisioned.

use std::io::{self, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use ssh2::{Session, Sftp};
use tracing::debug;

use super::{RemoteEntry, SourceDriver, TransportError, TransportResult};
use phenodcc_tracker::FileSource;

pub struct SftpDriver {
    // The session must stay alive for the sftp channel to remain usable.
    _session: Session,
    sftp: Sftp,
    hostname: String,
}

impl SftpDriver {
    pub fn connect(source: &FileSource, timeout: Duration) -> TransportResult<Self> {
        let hostname = source.hostname.clone();
        debug!(hostname = %hostname, "Connecting to sftp server");

        let addr = (hostname.as_str(), 22)
            .to_socket_addrs()
            .map_err(|e| TransportError::Connect {
                host: hostname.clone(),
                message: e.to_string(),
            })?
            .next()
            .ok_or_else(|| TransportError::Connect {
                host: hostname.clone(),
                message: "hostname did not resolve".to_string(),
            })?;
        let tcp = TcpStream::connect_timeout(&addr, timeout).map_err(|e| {
            TransportError::Connect {
                host: hostname.clone(),
                message: e.to_string(),
            }
        })?;

        let mut session = Session::new().map_err(|e| TransportError::Connect {
            host: hostname.clone(),
            message: e.to_string(),
        })?;
        session.set_tcp_stream(tcp);
        session.handshake().map_err(|e| TransportError::Connect {
            host: hostname.clone(),
            message: e.to_string(),
        })?;

        // An empty access key means public-key authentication from the
        // local identity file.
        if source.accesskey.is_empty() {
            session
                .userauth_pubkey_file(&source.username, None, &identity_file(), None)
                .map_err(|e| TransportError::Auth {
                    host: hostname.clone(),
                    message: e.to_string(),
                })?;
        } else {
            session
                .userauth_password(&source.username, &source.accesskey)
                .map_err(|e| TransportError::Auth {
                    host: hostname.clone(),
                    message: e.to_string(),
                })?;
        }
        if !session.authenticated() {
            return Err(TransportError::Auth {
                host: hostname,
                message: "authentication was not accepted".to_string(),
            });
        }

        let sftp = session.sftp().map_err(|e| TransportError::Connect {
            host: hostname.clone(),
            message: e.to_string(),
        })?;

        debug!(hostname = %hostname, "Connected to sftp server");
        Ok(Self {
            _session: session,
            sftp,
            hostname,
        })
    }
}

fn identity_file() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_default();
    Path::new(&home).join(".ssh").join("id_rsa")
}

impl SourceDriver for SftpDriver {
    fn list_archives(&mut self, dir: &str) -> TransportResult<Vec<RemoteEntry>> {
        let listing = self
            .sftp
            .readdir(Path::new(dir))
            .map_err(|e| TransportError::List {
                path: dir.to_string(),
                message: e.to_string(),
            })?;
        let entries = listing
            .into_iter()
            .filter(|(_, stat)| stat.is_file())
            .filter_map(|(path, stat)| {
                let name = path.file_name()?.to_str()?.to_string();
                name.ends_with(".zip").then(|| RemoteEntry {
                    name,
                    size: stat.size.unwrap_or(0),
                })
            })
            .collect();
        Ok(entries)
    }

    fn fetch(&mut self, path: &str, sink: &mut dyn Write) -> TransportResult<()> {
        let mut remote = self
            .sftp
            .open(Path::new(path))
            .map_err(|e| TransportError::Fetch {
                path: path.to_string(),
                message: e.to_string(),
            })?;
        io::copy(&mut remote, sink).map_err(|e| TransportError::Fetch {
            path: path.to_string(),
            message: e.to_string(),
        })?;
        Ok(())
    }

    fn close(&mut self) {
        debug!(hostname = %self.hostname, "Closing sftp session");
    }
}
