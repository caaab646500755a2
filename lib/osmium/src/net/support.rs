use std::io;

pub type NetResult<T> = Result<T, NetError>;

#[derive(Debug, Eq, PartialEq)]
pub enum NetError {
    /// The operation would block; retry when readiness fires again.
    Wait,
    /// Orderly close by the peer.
    Closed,
    /// A frame header declared a payload above the configured maximum.
    FrameTooBig,
    /// Any other socket-level failure.
    Io(io::ErrorKind),
}

impl From<io::Error> for NetError {
    #[inline]
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock => NetError::Wait,
            kind => NetError::Io(kind),
        }
    }
}

impl NetError {
    /// Failure kinds that routinely show up on live peers and deserve no more
    /// than a debug line; everything else is unexpected.
    pub fn is_routine(&self) -> bool {
        match self {
            NetError::Wait | NetError::Closed => true,
            NetError::FrameTooBig => false,
            NetError::Io(kind) => match kind {
                io::ErrorKind::ConnectionReset
                | io::ErrorKind::NotConnected
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::TimedOut => true,
                _ => false,
            },
        }
    }
}
