use mio::event::Source;
use mio::{Events, Interest, Poll, Registry, Token};
use std::io;
use std::time::Duration;

/// Readiness of a single descriptor as reported by `wait`.
#[derive(Debug, Copy, Clone)]
pub struct Readiness {
    pub token: usize,
    pub readable: bool,
    pub writable: bool,
}

/// Readiness watcher over a set of descriptors. The watcher itself belongs to
/// exactly one thread (the event loop); interest changes from other threads go
/// through cloned `NotifyHandle`s.
pub struct Notifier {
    poll: Poll,
    events: Events,
    fired: Vec<Readiness>,
}

impl Notifier {
    pub fn new(capacity: usize) -> io::Result<Notifier> {
        Ok(Notifier {
            poll: Poll::new()?,
            events: Events::with_capacity(capacity),
            fired: Vec::new(),
        })
    }

    /// Clones a registration handle usable from any thread.
    pub fn handle(&self) -> io::Result<NotifyHandle> {
        Ok(NotifyHandle {
            registry: self.poll.registry().try_clone()?,
        })
    }

    /// The one blocking point of the event loop. Collects whatever readiness the
    /// OS reports within the timeout.
    pub fn wait(&mut self, timeout: Duration) -> io::Result<&[Readiness]> {
        self.poll.poll(&mut self.events, Some(timeout))?;

        self.fired.clear();
        for event in self.events.iter() {
            self.fired.push(Readiness {
                token: event.token().0,
                readable: event.is_readable(),
                writable: event.is_writable(),
            });
        }

        Ok(&self.fired)
    }
}

/// Cloneable interest-registration handle backed by the watcher's registry.
pub struct NotifyHandle {
    registry: Registry,
}

impl NotifyHandle {
    #[inline]
    pub fn add<S: Source + ?Sized>(&self, source: &mut S, token: usize, interest: Interest) -> io::Result<()> {
        self.registry.register(source, Token(token), interest)
    }

    #[inline]
    pub fn modify<S: Source + ?Sized>(&self, source: &mut S, token: usize, interest: Interest) -> io::Result<()> {
        self.registry.reregister(source, Token(token), interest)
    }

    #[inline]
    pub fn remove<S: Source + ?Sized>(&self, source: &mut S) -> io::Result<()> {
        self.registry.deregister(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::net::UdpSocket;

    #[test]
    fn test_read_readiness_fires() {
        let mut notifier = Notifier::new(8).unwrap();
        let handle = notifier.handle().unwrap();

        let mut receiver = UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let target = receiver.local_addr().unwrap();
        handle.add(&mut receiver, 7, Interest::READABLE).unwrap();

        let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"wake", target).unwrap();

        let mut seen = false;
        for _ in 0..100 {
            let events = notifier.wait(Duration::from_millis(50)).unwrap();
            if events.iter().any(|event| event.token == 7 && event.readable) {
                seen = true;
                break;
            }
        }
        assert!(seen);

        handle.remove(&mut receiver).unwrap();
    }

    #[test]
    fn test_modify_interest() {
        let notifier = Notifier::new(8).unwrap();
        let handle = notifier.handle().unwrap();

        let mut sock = UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        handle.add(&mut sock, 1, Interest::READABLE).unwrap();
        handle
            .modify(&mut sock, 1, Interest::READABLE | Interest::WRITABLE)
            .unwrap();
        handle.remove(&mut sock).unwrap();
    }
}
