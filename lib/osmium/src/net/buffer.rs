use crate::net::notifier::NotifyHandle;
use crate::net::support::{NetError, NetResult};
use crate::queue::InboundQueue;
use crate::SockId;
use byteorder::{ByteOrder, LittleEndian};
use bytes::{Buf, BytesMut};
use ferrite::logging;
use hashbrown::HashMap;
use mio::net::TcpStream;
use mio::Interest;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Frames are a 4-byte little-endian payload length followed by the payload.
pub const HEADER_SIZE: usize = 4;

const READ_CHUNK: usize = 4096;
const FULL_RING_PAUSE: Duration = Duration::from_secs(1);

/// One connected TCP client: the owned socket plus its receive and send rings.
/// The receive side is driven by the event loop only, the send side is fed by
/// handler and sender threads; lock order is stream before ring.
struct Slot {
    peer: SocketAddr,
    stream: Mutex<TcpStream>,
    recv: Mutex<BytesMut>,
    send: Mutex<BytesMut>,
}

/// Per-socket framed buffers for every live TCP client. Write interest is
/// registered on the empty-to-non-empty edge of a send ring and dropped again
/// once the ring drains; that edge is the backpressure mechanism.
pub struct SocketTable {
    slots: Mutex<HashMap<SockId, Arc<Slot>>>,
    notify: NotifyHandle,
    max_message_size: usize,
    send_capacity: usize,
    log: logging::Logger,
}

impl SocketTable {
    pub fn new(
        notify: NotifyHandle,
        max_message_size: usize,
        send_capacity: usize,
        log: &logging::Logger,
    ) -> SocketTable {
        SocketTable {
            slots: Mutex::new(HashMap::new()),
            notify,
            max_message_size,
            send_capacity,
            log: log.new(logging::o!("context" => "netbuffer")),
        }
    }

    /// Adopts an accepted connection: allocates its buffer slot and registers it
    /// for read readiness.
    pub fn open(&self, sock: SockId, mut stream: TcpStream, peer: SocketAddr) -> io::Result<()> {
        self.notify.add(&mut stream, sock as usize, Interest::READABLE)?;

        let mut slots = self.slots.lock().expect("socket table lock poisoned");
        slots.insert(
            sock,
            Arc::new(Slot {
                peer,
                stream: Mutex::new(stream),
                recv: Mutex::new(BytesMut::with_capacity(READ_CHUNK)),
                send: Mutex::new(BytesMut::new()),
            }),
        );

        Ok(())
    }

    /// Releases the slot and everything buffered in it. The socket leaves the
    /// readiness watcher before the descriptor is dropped.
    pub fn close(&self, sock: SockId) -> bool {
        let slot = {
            let mut slots = self.slots.lock().expect("socket table lock poisoned");
            slots.remove(&sock)
        };

        match slot {
            Some(slot) => {
                let mut stream = slot.stream.lock().expect("socket stream lock poisoned");
                if let Err(err) = self.notify.remove(&mut *stream) {
                    logging::debug!(self.log, "Deregistration failed"; "sock" => sock, "error" => %err);
                }
                true
            }
            None => false,
        }
    }

    /// Reads everything the socket currently has, slicing complete frames into
    /// the inbound queue. Returns the bytes consumed; the peer hanging up or a
    /// declared frame above the maximum surface as errors.
    pub fn recv(&self, sock: SockId, inbound: &InboundQueue) -> NetResult<usize> {
        let slot = match self.slot(sock) {
            Some(slot) => slot,
            None => return Err(NetError::Io(io::ErrorKind::NotFound)),
        };

        let mut stream = slot.stream.lock().expect("socket stream lock poisoned");
        let mut ring = slot.recv.lock().expect("receive ring lock poisoned");

        let mut chunk = [0u8; READ_CHUNK];
        let mut total = 0;

        loop {
            match stream.read(&mut chunk) {
                Ok(0) => return Err(NetError::Closed),
                Ok(count) => {
                    ring.extend_from_slice(&chunk[..count]);
                    total += count;
                    self.drain_frames(sock, slot.peer, &mut ring, inbound)?;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }

        Ok(total)
    }

    fn drain_frames(
        &self,
        sock: SockId,
        peer: SocketAddr,
        ring: &mut BytesMut,
        inbound: &InboundQueue,
    ) -> NetResult<()> {
        loop {
            if ring.len() < HEADER_SIZE {
                return Ok(());
            }

            let declared = LittleEndian::read_u32(&ring[..HEADER_SIZE]) as usize;
            if declared > self.max_message_size {
                return Err(NetError::FrameTooBig);
            }

            if ring.len() < HEADER_SIZE + declared {
                return Ok(());
            }

            ring.advance(HEADER_SIZE);
            let frame = ring.split_to(declared);
            inbound.push(&frame, sock, peer);
        }
    }

    /// Emits as much of the send ring as the socket accepts. Once the ring
    /// drains, write interest is dropped again.
    pub fn send(&self, sock: SockId) -> NetResult<usize> {
        let slot = match self.slot(sock) {
            Some(slot) => slot,
            None => return Err(NetError::Io(io::ErrorKind::NotFound)),
        };

        let mut stream = slot.stream.lock().expect("socket stream lock poisoned");
        let mut ring = slot.send.lock().expect("send ring lock poisoned");

        let mut total = 0;
        while !ring.is_empty() {
            match stream.write(&ring[..]) {
                Ok(0) => return Err(NetError::Io(io::ErrorKind::WriteZero)),
                Ok(count) => {
                    ring.advance(count);
                    total += count;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }

        if ring.is_empty() {
            if let Err(err) = self.notify.modify(&mut *stream, sock as usize, Interest::READABLE) {
                logging::debug!(self.log, "Unable to drop write readiness"; "sock" => sock, "error" => %err);
            }
        }

        Ok(total)
    }

    /// Appends a length-prefixed frame to the socket's send ring. A full ring is
    /// given one second to drain before the message is dropped with a warning.
    pub fn push_send(&self, sock: SockId, msg: &[u8]) -> NetResult<()> {
        if msg.len() > self.max_message_size {
            logging::warn!(self.log, "Refusing to queue oversized message"; "sock" => sock, "size" => msg.len());
            return Err(NetError::FrameTooBig);
        }

        let mut attempt = 0;
        loop {
            let slot = match self.slot(sock) {
                Some(slot) => slot,
                None => return Err(NetError::Io(io::ErrorKind::NotFound)),
            };

            {
                let mut stream = slot.stream.lock().expect("socket stream lock poisoned");
                let mut ring = slot.send.lock().expect("send ring lock poisoned");

                if ring.len() + HEADER_SIZE + msg.len() <= self.send_capacity {
                    let was_empty = ring.is_empty();

                    let mut header = [0u8; HEADER_SIZE];
                    LittleEndian::write_u32(&mut header, msg.len() as u32);
                    ring.extend_from_slice(&header);
                    ring.extend_from_slice(msg);

                    if was_empty {
                        let interest = Interest::READABLE | Interest::WRITABLE;
                        if let Err(err) = self.notify.modify(&mut *stream, sock as usize, interest) {
                            logging::debug!(self.log, "Unable to request write readiness";
                                            "sock" => sock, "error" => %err);
                        }
                    }

                    return Ok(());
                }
            }

            attempt += 1;
            if attempt >= 2 {
                break;
            }
            thread::sleep(FULL_RING_PAUSE);
        }

        logging::warn!(self.log, "Not enough buffer space, dropping message"; "sock" => sock);
        Err(NetError::Wait)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.lock().expect("socket table lock poisoned").len()
    }

    #[inline]
    pub fn contains(&self, sock: SockId) -> bool {
        self.slots.lock().expect("socket table lock poisoned").contains_key(&sock)
    }

    pub fn peer(&self, sock: SockId) -> Option<SocketAddr> {
        self.slot(sock).map(|slot| slot.peer)
    }

    fn slot(&self, sock: SockId) -> Option<Arc<Slot>> {
        let slots = self.slots.lock().expect("socket table lock poisoned");
        slots.get(&sock).cloned()
    }
}
