//! Line-oriented configuration file plus CLI auto-connect targets (§4.10).
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;

use log::{debug, warn};

use crate::error::RtpMidiError;

pub const DEFAULT_PORT: u16 = 10008;

/// Resolved startup configuration: SSRC override, control port, and the set of
/// peers to invite as soon as the dispatcher starts.
#[derive(Debug, Clone)]
pub struct Config {
    pub ssrc_override: Option<u32>,
    pub port: u16,
    pub auto_connect: Vec<SocketAddr>,
}

impl Default for Config {
    fn default() -> Self {
        Config { ssrc_override: None, port: DEFAULT_PORT, auto_connect: Vec::new() }
    }
}

impl Config {
    /// Layers CLI-supplied `host:port` positional arguments on top of whatever
    /// the config file already queued (§4.10: "additional ... not replacing").
    pub fn add_cli_targets<I>(&mut self, args: I) -> Result<(), RtpMidiError>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        for arg in args {
            self.auto_connect.push(parse_host_port(arg.as_ref())?);
        }
        Ok(())
    }
}

/// Loads `path`, applying each line in order. A missing file is not an error:
/// the daemon starts with defaults (§4.10).
pub fn load(path: &Path) -> Result<Config, RtpMidiError> {
    let mut config = Config::default();
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("config: {} not found, starting with defaults", path.display());
            return Ok(config);
        }
        Err(e) => return Err(RtpMidiError::Io(e)),
    };

    for (lineno, raw) in text.lines().enumerate() {
        apply_line(raw, &mut config).map_err(|e| match e {
            RtpMidiError::Config(msg) => RtpMidiError::Config(format!("{}:{}: {msg}", path.display(), lineno + 1)),
            other => other,
        })?;
    }
    Ok(config)
}

/// Applies one line: `#` truncates trailing comments, blank lines are skipped,
/// `key = value` sets `id`/`port`, anything else is a `host:port` auto-connect
/// target. Matches the reference implementation's whitespace/case tolerance
/// (`line.split('#')[0].strip().lower()`).
fn apply_line(raw: &str, config: &mut Config) -> Result<(), RtpMidiError> {
    let line = raw.split('#').next().unwrap_or("").trim();
    if line.is_empty() {
        return Ok(());
    }

    if let Some((key, value)) = line.split_once('=') {
        let key = key.trim().to_lowercase();
        let value = value.trim();
        match key.as_str() {
            "id" => {
                let hex = value.trim_start_matches("0x").trim_start_matches("0X");
                config.ssrc_override =
                    Some(u32::from_str_radix(hex, 16).map_err(|_| RtpMidiError::Config(format!("'{value}' is not a valid hex ssrc")))?);
            }
            "port" => {
                config.port = value.parse().map_err(|_| RtpMidiError::Config(format!("'{value}' is not a valid port number")))?;
            }
            other => warn!("config: unknown key '{other}', ignoring"),
        }
        return Ok(());
    }

    config.auto_connect.push(parse_host_port(line)?);
    Ok(())
}

fn parse_host_port(entry: &str) -> Result<SocketAddr, RtpMidiError> {
    let (host, port) = entry.rsplit_once(':').ok_or_else(|| RtpMidiError::Config(format!("'{entry}' is not a host:port pair")))?;
    let port: u16 = port.parse().map_err(|_| RtpMidiError::Config(format!("'{port}' is not a valid port number")))?;
    (host, port)
        .to_socket_addrs()
        .map_err(|e| RtpMidiError::Config(format!("failed to resolve '{host}': {e}")))?
        .next()
        .ok_or_else(|| RtpMidiError::Config(format!("'{host}' resolved to no addresses")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(contents: &str) -> tempfile_path::TempPath {
        tempfile_path::TempPath::with_contents(contents)
    }

    /// Minimal scratch-file helper, local to this test module: the reference
    /// implementation's tests don't pull in a tempfile crate for this, and
    /// neither do we.
    mod tempfile_path {
        use std::io::Write;
        use std::path::{Path, PathBuf};

        pub struct TempPath(PathBuf);

        impl TempPath {
            pub fn with_contents(contents: &str) -> Self {
                let path = std::env::temp_dir().join(format!("rtpmidid-config-test-{:?}-{}", std::thread::current().id(), contents.len()));
                let mut file = std::fs::File::create(&path).unwrap();
                file.write_all(contents.as_bytes()).unwrap();
                TempPath(path)
            }
        }

        impl AsRef<Path> for TempPath {
            fn as_ref(&self) -> &Path {
                &self.0
            }
        }

        impl Drop for TempPath {
            fn drop(&mut self) {
                let _ = std::fs::remove_file(&self.0);
            }
        }
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = load(Path::new("/nonexistent/path/to/rtpmidid.conf")).unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert!(config.ssrc_override.is_none());
        assert!(config.auto_connect.is_empty());
    }

    #[test]
    fn parses_id_port_and_autoconnect_lines() {
        let file = write_temp(
            "# a comment line\n\
             ID = 0xBBBBBBBB  # trailing comment\n\
             port = 10100\n\
             \n\
             127.0.0.1:5004\n",
        );
        let config = load(file.as_ref()).unwrap();
        assert_eq!(config.ssrc_override, Some(0xBBBB_BBBB));
        assert_eq!(config.port, 10100);
        assert_eq!(config.auto_connect, vec!["127.0.0.1:5004".parse().unwrap()]);
    }

    #[test]
    fn malformed_host_port_is_rejected() {
        let file = write_temp("not-a-host-port-pair\n");
        let result = load(file.as_ref());
        assert!(matches!(result, Err(RtpMidiError::Config(_))));
    }

    #[test]
    fn non_numeric_port_is_rejected() {
        let file = write_temp("127.0.0.1:abc\n");
        let result = load(file.as_ref());
        assert!(matches!(result, Err(RtpMidiError::Config(_))));
    }

    #[test]
    fn cli_targets_layer_on_top_of_file_targets() {
        let file = write_temp("127.0.0.1:5004\n");
        let mut config = load(file.as_ref()).unwrap();
        config.add_cli_targets(["127.0.0.1:5006"]).unwrap();
        assert_eq!(config.auto_connect.len(), 2);
    }
}
