use crate::logging;
use crate::secret::{self, Secret};
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Name of the rendezvous file carrying `(port, secret)`.
pub const INFO_FILE: &str = "info.txt";

/// Name of the companion file whose creation signals that the info file is
/// ready to be read.
pub const TRIGGER_FILE: &str = "info.txt.trigger";

const TMP_FILE: &str = "info.txt.tmp";

/// Contents of a parsed rendezvous file.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Rendezvous {
    pub port: u16,
    pub secret: Secret,
}

/// Removes the published info file when dropped.
///
/// Emulates delete-on-close semantics: if the process is killed before the
/// guard drops, a stale file remains until the next publish overwrites it.
/// Readers observing a stale port fail on connect and retry on the next
/// trigger.
pub struct Guard {
    path: PathBuf,
    log: logging::Logger,
}

impl Drop for Guard {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => logging::debug!(self.log, "rendezvous file removed"),
            Err(err) => {
                logging::warn!(self.log, "failed to remove rendezvous file"; "error" => %err)
            }
        }
    }
}

/// Default per-user directory for the rendezvous file.
pub fn default_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(env::temp_dir)
        .join("kanp")
}

/// Publishes the rendezvous file under `dir` and signals readiness through
/// the trigger file. The info file is written to a temporary sibling and
/// renamed into place so that readers never observe a partial write.
pub fn publish(dir: &Path, port: u16, secret: &Secret, log: &logging::Logger) -> io::Result<Guard> {
    fs::create_dir_all(dir)?;

    let path = dir.join(INFO_FILE);
    let tmp = dir.join(TMP_FILE);

    let body = format!("{}\n{}\n", port, secret::to_hex_tokens(secret));
    fs::write(&tmp, body)?;
    fs::rename(&tmp, &path)?;

    // Create and immediately remove the trigger so watchers observe a fresh
    // creation event for every publish.
    let trigger = dir.join(TRIGGER_FILE);
    drop(fs::File::create(&trigger)?);
    drop(fs::remove_file(&trigger));

    let guard_log = log.new(logging::o!());
    logging::debug!(guard_log, "rendezvous file published"; "port" => port, "dir" => %dir.display());

    Ok(Guard {
        path,
        log: guard_log,
    })
}

/// Reads and parses the rendezvous file under `dir`.
pub fn read(dir: &Path) -> io::Result<Rendezvous> {
    let text = fs::read_to_string(dir.join(INFO_FILE))?;
    let mut lines = text.lines();

    let port_line = lines
        .next()
        .ok_or_else(|| malformed("missing port line".to_string()))?;
    let port = port_line
        .trim()
        .parse::<u16>()
        .map_err(|_| malformed(format!("malformed port {:?}", port_line)))?;

    let secret_line = lines
        .next()
        .ok_or_else(|| malformed("missing secret line".to_string()))?;
    let secret =
        secret::parse_hex_tokens(secret_line).map_err(|err| malformed(err.to_string()))?;

    Ok(Rendezvous { port, secret })
}

fn malformed(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secret::SECRET_LEN;

    fn test_dir(name: &str) -> PathBuf {
        let dir = env::temp_dir().join(format!("keel-rendezvous-{}-{}", name, std::process::id()));
        drop(fs::remove_dir_all(&dir));
        dir
    }

    #[test]
    fn test_publish_read_roundtrip() {
        let dir = test_dir("roundtrip");
        let secret = [42u8; SECRET_LEN];

        let guard = publish(&dir, 12345, &secret, &logging::discard()).unwrap();
        let info = read(&dir).unwrap();

        assert_eq!(info.port, 12345);
        assert_eq!(info.secret, secret);

        drop(guard);
        assert!(!dir.join(INFO_FILE).exists());

        drop(fs::remove_dir_all(&dir));
    }

    #[test]
    fn test_publish_overwrites_stale_file() {
        let dir = test_dir("stale");

        let first = publish(&dir, 1, &[1u8; SECRET_LEN], &logging::discard()).unwrap();
        std::mem::forget(first);

        let _second = publish(&dir, 2, &[2u8; SECRET_LEN], &logging::discard()).unwrap();
        let info = read(&dir).unwrap();

        assert_eq!(info.port, 2);
        assert_eq!(info.secret, [2u8; SECRET_LEN]);

        drop(fs::remove_dir_all(&dir));
    }

    #[test]
    fn test_read_err_missing_file() {
        let dir = test_dir("missing");

        let err = read(&dir).unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_read_err_malformed_port() {
        let dir = test_dir("badport");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(INFO_FILE), "not-a-port\naa bb\n").unwrap();

        let err = read(&dir).unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        drop(fs::remove_dir_all(&dir));
    }

    #[test]
    fn test_read_err_missing_secret() {
        let dir = test_dir("nosecret");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(INFO_FILE), "4242\n").unwrap();

        let err = read(&dir).unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        drop(fs::remove_dir_all(&dir));
    }

    #[test]
    fn test_trigger_removed_after_publish() {
        let dir = test_dir("trigger");

        let _guard = publish(&dir, 7, &[7u8; SECRET_LEN], &logging::discard()).unwrap();

        assert!(dir.join(INFO_FILE).exists());
        assert!(!dir.join(TRIGGER_FILE).exists());

        drop(fs::remove_dir_all(&dir));
    }
}
