use crate::SockId;
use ferrite::logging;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

/// One inbound payload as it came off the wire, after transport framing.
#[derive(Debug, Clone)]
pub struct Message {
    pub buffer: Vec<u8>,
    /// Origin TCP socket, or `UDP_NO_CLIENT`.
    pub sock: SockId,
    pub addr: SocketAddr,
    /// Global enqueue sequence number, used for socket takeover arbitration.
    pub counter: u64,
}

#[derive(Debug)]
pub enum Job {
    Message(Message),
    Shutdown,
}

/// Bounded FIFO between the event loop and the handler pool. Pushes never block:
/// when the queue is full the message is dropped with a warning, which is the
/// operator's backpressure signal.
pub struct InboundQueue {
    tx: flume::Sender<Job>,
    rx: flume::Receiver<Job>,
    sequence: AtomicU64,
    log: logging::Logger,
}

impl InboundQueue {
    pub fn new(capacity: usize, log: &logging::Logger) -> InboundQueue {
        let (tx, rx) = flume::bounded(capacity);
        InboundQueue {
            tx,
            rx,
            sequence: AtomicU64::new(0),
            log: log.new(logging::o!("queue" => "inbound")),
        }
    }

    /// Stamps the message with the next global sequence number and enqueues it.
    pub fn push(&self, buffer: &[u8], sock: SockId, addr: SocketAddr) -> bool {
        let counter = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let message = Message {
            buffer: buffer.to_vec(),
            sock,
            addr,
            counter,
        };

        match self.tx.try_send(Job::Message(message)) {
            Ok(()) => true,
            Err(_) => {
                logging::warn!(self.log, "Input queue is full, dropping message"; "sock" => sock);
                false
            }
        }
    }

    /// Blocks until the next job. A disconnected queue reads as shutdown.
    pub fn pop(&self) -> Job {
        self.rx.recv().unwrap_or(Job::Shutdown)
    }

    /// Current value of the global enqueue sequence.
    #[inline]
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    /// Queues one shutdown sentinel per consumer.
    pub fn push_shutdown(&self, consumers: usize) {
        for _ in 0..consumers {
            let _ = self.tx.send(Job::Shutdown);
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.rx.len()
    }
}

/// One frame awaiting delivery to a connected TCP client.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub sock: SockId,
    pub data: Vec<u8>,
}

#[derive(Debug)]
pub enum Outbound {
    Dispatch(Dispatch),
    Shutdown,
}

/// Bounded FIFO between forwarders and the sender pool.
pub struct OutboundQueue {
    tx: flume::Sender<Outbound>,
    rx: flume::Receiver<Outbound>,
    log: logging::Logger,
}

impl OutboundQueue {
    pub fn new(capacity: usize, log: &logging::Logger) -> OutboundQueue {
        let (tx, rx) = flume::bounded(capacity);
        OutboundQueue {
            tx,
            rx,
            log: log.new(logging::o!("queue" => "outbound")),
        }
    }

    pub fn push(&self, sock: SockId, data: Vec<u8>) -> bool {
        match self.tx.try_send(Outbound::Dispatch(Dispatch { sock, data })) {
            Ok(()) => true,
            Err(_) => {
                logging::warn!(self.log, "Output queue is full, dropping message"; "sock" => sock);
                false
            }
        }
    }

    pub fn pop(&self) -> Outbound {
        self.rx.recv().unwrap_or(Outbound::Shutdown)
    }

    pub fn push_shutdown(&self, consumers: usize) {
        for _ in 0..consumers {
            let _ = self.tx.send(Outbound::Shutdown);
        }
    }
}
