use crate::error::Error;
use keel::rendezvous;
use serde_derive::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Broker tuning knobs. Loaded from TOML or built from defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the rendezvous file. Server workers publish here,
    /// client workers read from here.
    pub rendezvous_dir: PathBuf,
    /// Server-side handshake deadline, in milliseconds from acceptance.
    pub handshake_timeout_ms: u64,
    /// Backlog of the listening socket.
    pub listen_backlog: i32,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            rendezvous_dir: rendezvous::default_dir(),
            handshake_timeout_ms: 5_000,
            listen_backlog: 1,
        }
    }
}

impl Config {
    pub fn from_toml_str(text: &str) -> Result<Config, Error> {
        serdeconv::from_toml_str(text)
            .map_err(|err| Error::generic(format!("config parse: {}", err)))
    }

    pub fn from_toml_file(path: &Path) -> Result<Config, Error> {
        serdeconv::from_toml_file(path)
            .map_err(|err| Error::generic(format!("config load: {}", err)))
    }

    pub fn to_toml_string(&self) -> Result<String, Error> {
        serdeconv::to_toml_string(self)
            .map_err(|err| Error::generic(format!("config serialize: {}", err)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();

        assert_eq!(cfg.handshake_timeout_ms, 5_000);
        assert_eq!(cfg.listen_backlog, 1);
    }

    #[test]
    fn test_toml_roundtrip() {
        let mut cfg = Config::default();
        cfg.rendezvous_dir = PathBuf::from("/tmp/kanp-test");
        cfg.handshake_timeout_ms = 250;

        let text = cfg.to_toml_string().unwrap();
        let parsed = Config::from_toml_str(&text).unwrap();

        assert_eq!(parsed.rendezvous_dir, cfg.rendezvous_dir);
        assert_eq!(parsed.handshake_timeout_ms, 250);
        assert_eq!(parsed.listen_backlog, 1);
    }

    #[test]
    fn test_from_toml_str_err() {
        assert!(Config::from_toml_str("rendezvous_dir = 5").is_err());
    }
}
