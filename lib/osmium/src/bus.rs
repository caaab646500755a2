use crate::shutdown::Shutdown;
use ferrite::logging;
use std::io;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

/// Queue discriminator for messages that arrived over the secure channel.
pub const SECURE_MQ: char = '1';

const RETRY_PAUSE: Duration = Duration::from_secs(5);

/// Write-only client for the downstream analysis bus, a local datagram socket.
/// Delivery failures are never surfaced to the agent; the callers reconnect
/// inline and retry once.
pub struct MessageBus {
    path: PathBuf,
    sock: Mutex<Option<UnixDatagram>>,
    log: logging::Logger,
}

impl MessageBus {
    pub fn new(path: PathBuf, log: &logging::Logger) -> MessageBus {
        MessageBus {
            path,
            sock: Mutex::new(None),
            log: log.new(logging::o!("context" => "bus")),
        }
    }

    /// Connects with unbounded retry. Returns false only when shutdown was
    /// requested before the bus came up.
    pub fn connect(&self, shutdown: &Shutdown) -> bool {
        loop {
            if shutdown.is_set() {
                return false;
            }

            match Self::dial(&self.path) {
                Ok(sock) => {
                    *self.sock.lock().expect("bus socket lock poisoned") = Some(sock);
                    logging::info!(self.log, "Connected to the downstream bus"; "path" => %self.path.display());
                    return true;
                }
                Err(err) => {
                    logging::warn!(self.log, "Unable to connect to the downstream bus, retrying";
                                   "path" => %self.path.display(),
                                   "error" => %err);
                    if shutdown.sleep(RETRY_PAUSE) {
                        return false;
                    }
                }
            }
        }
    }

    /// Drops the broken socket and dials again with unbounded retry.
    pub fn reconnect(&self, shutdown: &Shutdown) -> bool {
        *self.sock.lock().expect("bus socket lock poisoned") = None;
        self.connect(shutdown)
    }

    /// Frames and submits one cleartext message tagged with its source.
    pub fn submit(&self, text: &str, source: &str) -> io::Result<()> {
        let frame = format!("{}:{}:{}", SECURE_MQ, source, text);

        let sock = self.sock.lock().expect("bus socket lock poisoned");
        match sock.as_ref() {
            Some(sock) => sock.send(frame.as_bytes()).map(|_| ()),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    fn dial(path: &Path) -> io::Result<UnixDatagram> {
        let sock = UnixDatagram::unbound()?;
        sock.connect(path)?;
        Ok(sock)
    }
}
