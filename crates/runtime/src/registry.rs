//! Configuration registry: the on-disk address book of running tool servers.
//!
//! Plain text, one `name,host,port,transport` line per running server.
//! Lines starting with `#` are comments. The supervisor rewrites the whole
//! file once per launch; clients read it once at startup.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::Utc;
use tracing::{debug, warn};

use crate::supervisor::{RunningServerRecord, ServerStatus};
use crate::{Error, Result};

/// Default registry location, relative to the working directory.
pub const DEFAULT_REGISTRY_FILE: &str = "server_config.txt";

/// How a client reaches a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    /// Line-delimited JSON-RPC over TCP.
    Tcp,
}

impl Transport {
    pub fn as_str(self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Transport::Tcp),
            other => Err(format!("unknown transport: {other}")),
        }
    }
}

/// Network location of one registered server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub transport: Transport,
}

impl Endpoint {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            transport: Transport::Tcp,
        }
    }

    /// Resolve to a socket address (first match).
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("cannot resolve {}", self.host),
                ))
            })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.transport, self.host, self.port)
    }
}

/// Handle on the registry file.
#[derive(Debug, Clone)]
pub struct Registry {
    path: PathBuf,
}

impl Registry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record every `running` server, replacing any previous contents.
    ///
    /// Returns the number of entries written.
    pub fn write(&self, records: &[RunningServerRecord]) -> Result<usize> {
        let entries: BTreeMap<String, Endpoint> = records
            .iter()
            .filter(|r| r.status == ServerStatus::Running)
            .filter_map(|r| {
                r.assigned_port
                    .map(|port| (r.name.clone(), Endpoint::tcp(r.host.clone(), port)))
            })
            .collect();

        self.write_entries(&entries)?;
        Ok(entries.len())
    }

    /// Replace the registry with `entries`.
    pub fn write_entries(&self, entries: &BTreeMap<String, Endpoint>) -> Result<()> {
        let write_err = |source| Error::RegistryWrite {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(write_err)?;
        }

        let tmp = self.tmp_path();
        fs::write(&tmp, render(entries)).map_err(write_err)?;
        fs::rename(&tmp, &self.path).map_err(write_err)?;

        debug!(path = %self.path.display(), entries = entries.len(), "registry written");
        Ok(())
    }

    /// Read the registry.
    pub fn read(&self) -> Result<BTreeMap<String, Endpoint>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::RegistryMissing {
                    path: self.path.clone(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        Ok(parse(&contents))
    }

    /// Remove the registry file. Missing is fine.
    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn tmp_path(&self) -> PathBuf {
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| DEFAULT_REGISTRY_FILE.to_string());
        self.path.with_file_name(format!(".{file_name}.tmp"))
    }
}

fn render(entries: &BTreeMap<String, Endpoint>) -> String {
    let mut out = format!(
        "# toolhub server registry, written {}\n# name,host,port,transport\n",
        Utc::now().to_rfc3339()
    );
    for (name, endpoint) in entries {
        out.push_str(&format!(
            "{name},{},{},{}\n",
            endpoint.host, endpoint.port, endpoint.transport
        ));
    }
    out
}

/// Parse registry text. Malformed lines are skipped with a warning.
pub fn parse(contents: &str) -> BTreeMap<String, Endpoint> {
    let mut entries = BTreeMap::new();
    for (index, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match parse_line(line) {
            Some((name, endpoint)) => {
                entries.insert(name, endpoint);
            }
            None => warn!(line = index + 1, content = line, "skipping invalid registry line"),
        }
    }
    entries
}

fn parse_line(line: &str) -> Option<(String, Endpoint)> {
    let parts: Vec<&str> = line.split(',').map(str::trim).collect();
    let [name, host, port, transport] = parts.as_slice() else {
        return None;
    };
    if name.is_empty() || host.is_empty() {
        return None;
    }

    let endpoint = Endpoint {
        host: host.to_string(),
        port: port.parse().ok()?,
        transport: transport.parse().ok()?,
    };
    Some((name.to_string(), endpoint))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(name: &str, port: Option<u16>, status: ServerStatus) -> RunningServerRecord {
        RunningServerRecord {
            name: name.to_string(),
            host: "127.0.0.1".to_string(),
            assigned_port: port,
            pid: None,
            status,
            error: None,
        }
    }

    #[test]
    fn round_trip_is_identity() {
        let dir = tempdir().unwrap();
        let registry = Registry::new(dir.path().join("server_config.txt"));

        let entries = BTreeMap::from([
            ("weather".to_string(), Endpoint::tcp("localhost", 8001)),
            ("sql".to_string(), Endpoint::tcp("localhost", 8002)),
            ("ppt".to_string(), Endpoint::tcp("localhost", 8003)),
        ]);
        registry.write_entries(&entries).unwrap();

        assert_eq!(registry.read().unwrap(), entries);
    }

    #[test]
    fn only_running_records_are_written() {
        let dir = tempdir().unwrap();
        let registry = Registry::new(dir.path().join("server_config.txt"));

        let written = registry
            .write(&[
                record("weather", Some(8001), ServerStatus::Running),
                record("sql_query", Some(8002), ServerStatus::Failed),
                record("ppt_translator", None, ServerStatus::Failed),
            ])
            .unwrap();
        assert_eq!(written, 1);

        let entries = registry.read().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries["weather"], Endpoint::tcp("127.0.0.1", 8001));
    }

    #[test]
    fn write_overwrites_previous_contents() {
        let dir = tempdir().unwrap();
        let registry = Registry::new(dir.path().join("server_config.txt"));

        registry
            .write(&[record("weather", Some(8001), ServerStatus::Running)])
            .unwrap();
        registry
            .write(&[record("sql_query", Some(8002), ServerStatus::Running)])
            .unwrap();

        let entries = registry.read().unwrap();
        assert_eq!(entries.keys().collect::<Vec<_>>(), ["sql_query"]);
    }

    #[test]
    fn missing_registry_is_reported() {
        let dir = tempdir().unwrap();
        let registry = Registry::new(dir.path().join("absent.txt"));
        assert!(matches!(registry.read(), Err(Error::RegistryMissing { .. })));
    }

    #[test]
    fn clear_removes_file_and_tolerates_absence() {
        let dir = tempdir().unwrap();
        let registry = Registry::new(dir.path().join("server_config.txt"));
        registry.write_entries(&BTreeMap::new()).unwrap();

        registry.clear().unwrap();
        registry.clear().unwrap();
        assert!(matches!(registry.read(), Err(Error::RegistryMissing { .. })));
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let entries = parse(
            "# comment\n\
             weather,127.0.0.1,8001,tcp\n\
             broken line\n\
             sql_query,127.0.0.1,notaport,tcp\n\
             ppt_translator,127.0.0.1,8003,sse\n",
        );
        assert_eq!(entries.len(), 1);
        assert!(entries.contains_key("weather"));
    }

    #[test]
    fn file_is_human_readable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("server_config.txt");
        Registry::new(&path)
            .write_entries(&BTreeMap::from([(
                "weather".to_string(),
                Endpoint::tcp("127.0.0.1", 8001),
            )]))
            .unwrap();

        let text = fs::read_to_string(path).unwrap();
        assert!(text.starts_with("# toolhub server registry"));
        assert!(text.contains("weather,127.0.0.1,8001,tcp\n"));
    }
}
