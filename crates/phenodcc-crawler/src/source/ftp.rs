//! FTP driver
//!
//! Transfers use binary mode and Extended Passive Mode, which behaves
//! better behind NAT and container networking.

use std::io::{self, Write};
use std::net::ToSocketAddrs;
use std::time::Duration;

use suppaftp::types::FileType;
use suppaftp::{FtpStream, Mode};
use tracing::{debug, warn};

use super::{RemoteEntry, SourceDriver, TransportError, TransportResult};
use phenodcc_tracker::FileSource;

pub struct FtpDriver {
    stream: FtpStream,
    hostname: String,
}

impl FtpDriver {
    pub fn connect(source: &FileSource, timeout: Duration) -> TransportResult<Self> {
        let hostname = source.hostname.clone();
        debug!(hostname = %hostname, "Connecting to ftp server");

        let addr = (hostname.as_str(), 21)
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

        let mut stream =
            FtpStream::connect_timeout(addr, timeout).map_err(|e| TransportError::Connect {
                host: hostname.clone(),
                message: e.to_string(),
            })?;
        stream.set_mode(Mode::ExtendedPassive);

        stream
            .login(&source.username, &source.accesskey)
            .map_err(|e| TransportError::Auth {
                host: hostname.clone(),
                message: e.to_string(),
            })?;
        stream
            .transfer_type(FileType::Binary)
            .map_err(|e| TransportError::Connect {
                host: hostname.clone(),
                message: format!("failed to set binary mode: {e}"),
            })?;

        debug!(hostname = %hostname, "Connected to ftp server");
        Ok(Self { stream, hostname })
    }
}

impl SourceDriver for FtpDriver {
    fn list_archives(&mut self, dir: &str) -> TransportResult<Vec<RemoteEntry>> {
        let lines = self
            .stream
            .list(Some(dir))
            .map_err(|e| TransportError::List {
                path: dir.to_string(),
                message: e.to_string(),
            })?;
        let entries = lines
            .iter()
            .filter_map(|line| parse_list_line(line))
            .filter(|entry| entry.name.ends_with(".zip"))
            .collect();
        Ok(entries)
    }

    fn fetch(&mut self, path: &str, sink: &mut dyn Write) -> TransportResult<()> {
        let mut reader = self
            .stream
            .retr_as_stream(path)
            .map_err(|e| TransportError::Fetch {
                path: path.to_string(),
                message: e.to_string(),
            })?;
        let copied = io::copy(&mut reader, sink).map_err(|e| TransportError::Fetch {
            path: path.to_string(),
            message: e.to_string(),
        });
        let finalised = self
            .stream
            .finalize_retr_stream(reader)
            .map_err(|e| TransportError::Fetch {
                path: path.to_string(),
                message: e.to_string(),
            });
        copied?;
        finalised?;
        Ok(())
    }

    fn close(&mut self) {
        if let Err(e) = self.stream.quit() {
            warn!(hostname = %self.hostname, error = %e, "Failed to quit ftp session gracefully");
        }
    }
}

/// Parse a Unix-style FTP LIST line:
/// `-rw-r--r--   1 ftp ftp  1234 Jan 15 12:00 name.zip`
fn parse_list_line(line: &str) -> Option<RemoteEntry> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 4 || parts[0].starts_with('d') {
        return None;
    }
    let name = (*parts.last()?).to_string();
    let size = if parts.len() >= 5 {
        parts[4].parse().unwrap_or(0)
    } else {
        0
    };
    Some(RemoteEntry { name, size })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_file_entries() {
        let entry =
            parse_list_line("-rw-r--r--   1 ftp ftp  123456 Jan 15 12:00 ABCD_20140115_1.zip")
                .unwrap();
        assert_eq!(entry.name, "ABCD_20140115_1.zip");
        assert_eq!(entry.size, 123456);
    }

    #[test]
    fn skips_directories_and_noise() {
        assert!(parse_list_line("drwxr-xr-x   2 ftp ftp  4096 Jan 15 12:00 add").is_none());
        assert!(parse_list_line("").is_none());
        assert!(parse_list_line("total 12").is_none());
    }
}
