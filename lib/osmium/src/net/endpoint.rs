use crate::config::Config;
use crate::core::Core;
use crate::net::notifier::{Notifier, Readiness};
use crate::net::support::NetError;
use crate::{SockId, UDP_NO_CLIENT};
use ferrite::logging;
use mio::net::{TcpListener, UdpSocket};
use mio::Interest;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Listener sockets, opened before the shared context exists so a plain clone
/// of the UDP socket can be handed to the workers for ping replies.
pub struct Listeners {
    pub tcp: Option<TcpListener>,
    pub udp: Option<UdpSocket>,
    pub udp_reply: Option<std::net::UdpSocket>,
}

impl Listeners {
    pub fn open(config: &Config) -> io::Result<Listeners> {
        let addr: SocketAddr = config
            .listen_addr()
            .parse()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid listen address"))?;

        let tcp = if config.protocols.tcp {
            Some(TcpListener::bind(addr)?)
        } else {
            None
        };

        let (udp, udp_reply) = if config.protocols.udp {
            let sock = std::net::UdpSocket::bind(addr)?;
            sock.set_nonblocking(true)?;
            let reply = sock.try_clone()?;
            (Some(UdpSocket::from_std(sock)), Some(reply))
        } else {
            (None, None)
        };

        Ok(Listeners { tcp, udp, udp_reply })
    }

    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp.as_ref().and_then(|listener| listener.local_addr().ok())
    }

    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.udp.as_ref().and_then(|sock| sock.local_addr().ok())
    }
}

/// Single-threaded dispatcher owning the readiness watcher and the listener
/// sockets. Everything it receives is either a new connection, a datagram, or
/// buffered TCP bytes; complete messages leave through the inbound queue.
pub struct Endpoint {
    core: Arc<Core>,
    notifier: Notifier,
    tcp: Option<TcpListener>,
    udp: Option<UdpSocket>,
    tcp_fd: SockId,
    udp_fd: SockId,
    udp_buf: Vec<u8>,
    log: logging::Logger,
}

impl Endpoint {
    pub fn new(
        core: Arc<Core>,
        notifier: Notifier,
        listeners: Listeners,
        log: &logging::Logger,
    ) -> io::Result<Endpoint> {
        let handle = notifier.handle()?;

        let mut tcp_fd = -1;
        let tcp = match listeners.tcp {
            Some(mut listener) => {
                tcp_fd = listener.as_raw_fd();
                handle.add(&mut listener, tcp_fd as usize, Interest::READABLE)?;
                Some(listener)
            }
            None => None,
        };

        let mut udp_fd = -1;
        let udp = match listeners.udp {
            Some(mut sock) => {
                udp_fd = sock.as_raw_fd();
                handle.add(&mut sock, udp_fd as usize, Interest::READABLE)?;
                Some(sock)
            }
            None => None,
        };

        let udp_buf = vec![0u8; core.config.max_message_size];

        Ok(Endpoint {
            core,
            notifier,
            tcp,
            udp,
            tcp_fd,
            udp_fd,
            udp_buf,
            log: log.new(logging::o!("context" => "endpoint")),
        })
    }

    /// Event loop body. Runs until the shutdown token flips; a failing wait is
    /// retried after a one-second pause.
    pub fn run(&mut self) {
        let timeout = Duration::from_millis(self.core.config.notify_timeout_ms);

        while !self.core.shutdown.is_set() {
            let fired: Vec<Readiness> = match self.notifier.wait(timeout) {
                Ok(fired) => fired.to_vec(),
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    logging::error!(self.log, "Waiting for connection"; "error" => %err);
                    thread::sleep(Duration::from_secs(1));
                    continue;
                }
            };

            for event in fired {
                self.dispatch(event);
            }
        }

        logging::debug!(self.log, "Event loop stopped.");
    }

    fn dispatch(&mut self, event: Readiness) {
        let fd = event.token as SockId;

        if fd <= 0 {
            logging::error!(self.log, "Unexpected file descriptor"; "fd" => fd);
            return;
        }

        if fd == self.tcp_fd {
            self.accept_clients();
            return;
        }

        if fd == self.udp_fd {
            self.read_udp();
            return;
        }

        if event.readable {
            self.incoming_client_data(fd);
        }
        if event.writable {
            self.outgoing_client_data(fd);
        }
    }

    fn accept_clients(&mut self) {
        let listener = match self.tcp.as_ref() {
            Some(listener) => listener,
            None => return,
        };

        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    let sock = stream.as_raw_fd();
                    match self.core.table.open(sock, stream, peer) {
                        Ok(()) => {
                            self.core.state.inc_tcp();
                            logging::debug!(self.log, "New TCP connection"; "sock" => sock, "peer" => %peer);
                        }
                        Err(err) => {
                            logging::error!(self.log, "Unable to watch new TCP connection";
                                            "sock" => sock, "error" => %err);
                        }
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::ConnectionAborted => {
                    logging::debug!(self.log, "Connection aborted during accept");
                }
                Err(err) => {
                    logging::error!(self.log, "Accepting connection"; "error" => %err);
                    break;
                }
            }
        }
    }

    fn read_udp(&mut self) {
        let udp = match self.udp.as_ref() {
            Some(udp) => udp,
            None => return,
        };

        loop {
            match udp.recv_from(&mut self.udp_buf) {
                Ok((count, peer)) => {
                    if count > 0 {
                        self.core.inbound.push(&self.udp_buf[..count], UDP_NO_CLIENT, peer);
                        self.core.state.add_recv(count as u64);
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    logging::error!(self.log, "Receiving datagram"; "error" => %err);
                    break;
                }
            }
        }
    }

    fn incoming_client_data(&self, sock: SockId) {
        match self.core.table.recv(sock, &self.core.inbound) {
            Ok(received) => self.core.state.add_recv(received as u64),
            Err(err) => {
                match &err {
                    NetError::FrameTooBig => {
                        logging::warn!(self.log, "Too big message size from socket"; "sock" => sock);
                    }
                    NetError::Closed => {
                        logging::debug!(self.log, "TCP peer closed the connection"; "sock" => sock);
                    }
                    other if other.is_routine() => {
                        logging::debug!(self.log, "TCP peer receive failed"; "sock" => sock, "error" => ?other);
                    }
                    other => {
                        logging::error!(self.log, "TCP peer receive failed"; "sock" => sock, "error" => ?other);
                    }
                }
                self.core.close_sock(sock);
            }
        }
    }

    fn outgoing_client_data(&self, sock: SockId) {
        match self.core.table.send(sock) {
            Ok(sent) => self.core.state.add_send(sent as u64),
            Err(err) => {
                logging::debug!(self.log, "TCP peer send failed"; "sock" => sock, "error" => ?err);
                self.core.close_sock(sock);
            }
        }
    }
}
