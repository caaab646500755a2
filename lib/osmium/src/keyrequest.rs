use crate::shutdown::Shutdown;
use ferrite::logging;
use std::io;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const CONNECT_ATTEMPTS: u32 = 4;
const CONNECT_PAUSE: Duration = Duration::from_secs(1);
const RECONNECT_PAUSE: Duration = Duration::from_secs(300);
const BUSY_PAUSE: Duration = Duration::from_secs(1);
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum KeyRequest {
    Query(String),
    Shutdown,
}

/// Out-of-band provisioning channel towards the key-request back-end. Requests
/// are only accepted while the channel reports itself connected; everything else
/// is dropped, since a rekey query is advisory.
pub struct KeyRequestClient {
    tx: flume::Sender<KeyRequest>,
    rx: flume::Receiver<KeyRequest>,
    available: AtomicBool,
    path: PathBuf,
    log: logging::Logger,
}

impl KeyRequestClient {
    pub fn new(path: PathBuf, capacity: usize, log: &logging::Logger) -> KeyRequestClient {
        let (tx, rx) = flume::bounded(capacity);
        KeyRequestClient {
            tx,
            rx,
            available: AtomicBool::new(false),
            path,
            log: log.new(logging::o!("context" => "keyrequest")),
        }
    }

    /// Queues a `kind:payload` query when the channel is up.
    pub fn push(&self, kind: &str, payload: &str) {
        if !self.available.load(Ordering::SeqCst) {
            return;
        }

        let message = format!("{}:{}", kind, payload);
        if self.tx.try_send(KeyRequest::Query(message)).is_err() {
            logging::debug!(self.log, "Key request queue is full, dropping query");
        }
    }

    /// Queues the shutdown sentinel for the client thread.
    pub fn push_shutdown(&self) {
        let _ = self.tx.send(KeyRequest::Shutdown);
    }

    /// Client thread body: keep a datagram socket towards the back-end open and
    /// drain the queue into it. A busy socket retries the same message after a
    /// short pause; any other failure tears the socket down and redials.
    pub fn run(&self, shutdown: &Shutdown) {
        let mut sock: Option<UnixDatagram> = None;
        let mut pending: Option<String> = None;

        while !shutdown.is_set() {
            if sock.is_none() {
                sock = self.reconnect(shutdown);
                if sock.is_none() {
                    return;
                }
            }

            let message = match pending.take() {
                Some(message) => message,
                None => match self.rx.recv() {
                    Ok(KeyRequest::Query(message)) => message,
                    Ok(KeyRequest::Shutdown) | Err(_) => return,
                },
            };

            let channel = sock.as_ref().expect("key request socket must be open");
            match channel.send(message.as_bytes()) {
                Ok(_) => {}
                Err(err) if busy(&err) => {
                    logging::debug!(self.log, "Key request socket busy.");
                    pending = Some(message);
                    if shutdown.sleep(BUSY_PAUSE) {
                        return;
                    }
                }
                Err(err) => {
                    logging::error!(self.log, "Could not reach the key request back-end"; "error" => %err);
                    self.available.store(false, Ordering::SeqCst);
                    sock = None;
                    pending = Some(message);
                }
            }
        }
    }

    fn reconnect(&self, shutdown: &Shutdown) -> Option<UnixDatagram> {
        loop {
            for _ in 0..CONNECT_ATTEMPTS {
                if shutdown.is_set() {
                    return None;
                }

                match Self::dial(&self.path) {
                    Ok(sock) => {
                        self.available.store(true, Ordering::SeqCst);
                        return Some(sock);
                    }
                    Err(_) => {
                        if shutdown.sleep(CONNECT_PAUSE) {
                            return None;
                        }
                    }
                }
            }

            logging::debug!(self.log, "Key request back-end is not available. Retrying.";
                            "pause_secs" => RECONNECT_PAUSE.as_secs());
            if shutdown.sleep(RECONNECT_PAUSE) {
                return None;
            }
        }
    }

    fn dial(path: &Path) -> io::Result<UnixDatagram> {
        let sock = UnixDatagram::unbound()?;
        sock.connect(path)?;
        sock.set_write_timeout(Some(SEND_TIMEOUT))?;
        Ok(sock)
    }

    #[cfg(test)]
    pub(crate) fn force_available(&self) {
        self.available.store(true, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub(crate) fn try_pop(&self) -> Option<KeyRequest> {
        self.rx.try_recv().ok()
    }
}

fn busy(err: &io::Error) -> bool {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => true,
        _ => false,
    }
}
