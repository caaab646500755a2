use crate::core::Core;
use crate::keystore::{EntrySnapshot, KeyStore, SocketBind};
use crate::queue::{Job, Message};
use crate::secure::{self, DecodeError, Envelope};
use crate::{Protocol, UDP_NO_CLIENT};
use ferrite::choose;
use ferrite::logging;
use ferrite::time::timestamp_secs;
use std::sync::Arc;
use std::sync::RwLockReadGuard;

/// Consumer for accepted control messages (startup, shutdown, keepalive state).
/// The handoff happens outside the store lock, on a duplicated entry snapshot.
pub trait ControlSink: Send + Sync {
    fn save(&self, agent: &EntrySnapshot, message: &str);
}

/// One worker of the handler pool: pops inbound messages, authenticates them
/// against the key store, decrypts, classifies and emits.
pub struct MessageHandler {
    core: Arc<Core>,
    control: Arc<dyn ControlSink>,
    log: logging::Logger,
}

impl MessageHandler {
    pub fn new(core: Arc<Core>, control: Arc<dyn ControlSink>, log: &logging::Logger) -> MessageHandler {
        MessageHandler {
            core,
            control,
            log: log.new(logging::o!("context" => "handler")),
        }
    }

    pub fn run(&self) {
        logging::debug!(self.log, "Message handler thread started.");

        loop {
            match self.core.inbound.pop() {
                Job::Message(message) => self.handle(&message),
                Job::Shutdown => break,
            }
        }

        logging::debug!(self.log, "Message handler thread stopped.");
    }

    fn handle(&self, message: &Message) {
        let srcip = message.addr.ip();
        let protocol = choose!(message.sock == UDP_NO_CLIENT => Protocol::Udp, Protocol::Tcp);

        let envelope = match secure::parse_envelope(&message.buffer) {
            Ok(envelope) => envelope,
            Err(_) => {
                logging::warn!(self.log, "Badly formatted message envelope"; "peer" => %message.addr);
                self.discard_unknown(message);
                return;
            }
        };

        // Liveness probes bypass the key store entirely.
        if let Envelope::Ping = envelope {
            self.reply_pong(message, protocol);
            self.core.state.inc_ping();
            return;
        }

        let store = self.core.keys.read();

        let (idx, payload, ip_lookup) = match envelope {
            Envelope::Addressed { id, payload } => match store.lookup_by_dynamic(id, srcip) {
                Some(idx) => (idx, payload, false),
                None => {
                    let name = store
                        .lookup_by_id(id)
                        .map(|idx| store.entry(idx).name.clone())
                        .unwrap_or_else(|| "unknown".to_string());
                    drop(store);

                    logging::warn!(self.log, "Agent id is not valid for this source address";
                                   "id" => id, "srcip" => %srcip, "name" => %name);
                    self.core.key_requests.push("id", id);
                    self.discard_unknown(message);
                    return;
                }
            },
            Envelope::Plain(payload) => match store.lookup_by_ip(srcip) {
                Some(idx) => (idx, payload, true),
                None => {
                    drop(store);

                    logging::warn!(self.log, "Source address is unknown, no agent key matches"; "srcip" => %srcip);
                    self.core.key_requests.push("ip", &srcip.to_string());
                    self.discard_unknown(message);
                    return;
                }
            },
            Envelope::Ping => return,
        };

        // An entry already served by a different live socket refuses the newcomer.
        {
            let entry = store.entry(idx);
            let state = entry.lock();
            if state.sock >= 0 && state.sock != message.sock {
                logging::warn!(self.log, "Agent key already in use"; "id" => %entry.id);
                drop(state);
                drop(store);
                self.discard_unknown(message);
                return;
            }
        }

        if payload.is_empty() {
            logging::warn!(self.log, "Received message is empty"; "peer" => %message.addr);
            drop(store);
            self.discard_unknown(message);
            return;
        }

        let decoded = match secure::decode(&self.core.keys, &store, idx, payload, &self.log) {
            Ok(decoded) => decoded,
            Err(err) => {
                drop(store);

                if err == DecodeError::InvalidKey {
                    if ip_lookup {
                        self.core.key_requests.push("ip", &srcip.to_string());
                    } else if let Envelope::Addressed { id, .. } = envelope {
                        self.core.key_requests.push("id", id);
                    }
                }

                if message.sock >= 0 {
                    logging::warn!(self.log, "Decrypting message failed"; "sock" => message.sock, "error" => ?err);
                    self.core.close_sock(message.sock);
                }
                self.core.state.inc_unknown();
                return;
            }
        };

        if secure::is_control(&decoded.text) {
            self.handle_control(message, store, idx, protocol, &decoded.text);
            return;
        }

        let entry = store.entry(idx);
        let source_tag = format!("[{}] ({}) {}", entry.id, entry.name, entry.addr);
        let agent_id = entry.id.clone();
        drop(store);

        self.forward_event(&decoded.text, &source_tag, &agent_id);
    }

    /// Control messages are accepted over UDP unconditionally, over TCP only
    /// when the enqueue counter says this connection is newer than the last one
    /// closed under the same descriptor. The shutdown notice always passes.
    fn handle_control(
        &self,
        message: &Message,
        store: RwLockReadGuard<'_, KeyStore>,
        idx: usize,
        protocol: Protocol,
        text: &str,
    ) {
        let shutdown_msg = secure::is_shutdown(text);
        let fresh = message.counter > self.core.keys.sock_counter(message.sock);

        if message.sock != UDP_NO_CLIENT && !fresh && !shutdown_msg {
            drop(store);
            self.core.state.inc_dequeued();
            return;
        }

        let entry = store.entry(idx);
        let mut displaced = None;

        let snapshot = {
            let mut state = entry.lock();
            state.net_protocol = Some(protocol);
            state.last_received_at = timestamp_secs();
            state.peer_info = Some(message.addr);

            if protocol == Protocol::Tcp {
                if fresh {
                    if state.sock >= 0 && state.sock != message.sock {
                        displaced = Some(state.sock);
                    }
                    state.sock = message.sock;
                }
            } else {
                state.sock = UDP_NO_CLIENT;
            }

            entry.snapshot(&state)
        };

        if protocol == Protocol::Tcp && fresh && !shutdown_msg {
            match self.core.keys.bind_socket(&store, idx, message.sock) {
                SocketBind::Added => {
                    logging::debug!(self.log, "TCP socket added to keystore"; "sock" => message.sock);
                }
                SocketBind::Updated => {
                    logging::debug!(self.log, "TCP socket already in keystore, updating"; "sock" => message.sock);
                }
            }
        }

        drop(store);

        if let Some(old) = displaced {
            self.core.close_sock(old);
        }

        self.control.save(&snapshot, text);
        self.core.state.inc_ctrl(&snapshot.id);
    }

    /// Event messages go to the downstream bus. A failing bus is reconnected
    /// with unbounded retry and the submission is attempted once more; the
    /// agent never learns about either outcome.
    fn forward_event(&self, text: &str, source_tag: &str, agent_id: &str) {
        if self.core.bus.submit(text, source_tag).is_ok() {
            self.core.state.inc_evt(agent_id);
            return;
        }

        logging::error!(self.log, "Unable to reach the downstream bus, reconnecting");

        if !self.core.bus.reconnect(&self.core.shutdown) {
            return;
        }
        logging::info!(self.log, "Successfully reconnected to the downstream bus");

        match self.core.bus.submit(text, source_tag) {
            Ok(()) => self.core.state.inc_evt(agent_id),
            Err(err) => {
                logging::error!(self.log, "Unable to reach the downstream bus"; "error" => %err);
            }
        }
    }

    fn reply_pong(&self, message: &Message, protocol: Protocol) {
        let delivered = match protocol {
            Protocol::Udp => match self.core.udp_reply.as_ref() {
                Some(sock) => sock.send_to(b"#pong", message.addr).is_ok(),
                None => false,
            },
            Protocol::Tcp => self.core.table.push_send(message.sock, b"#pong").is_ok(),
        };

        if !delivered {
            logging::warn!(self.log, "Ping reply could not be delivered"; "peer" => %message.addr);
        }
    }

    /// Terminal branch for everything that failed before classification: the
    /// TCP socket (if any) goes down and the message counts as unknown.
    fn discard_unknown(&self, message: &Message) {
        if message.sock >= 0 {
            self.core.close_sock(message.sock);
        }
        self.core.state.inc_unknown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::keyrequest::KeyRequest;
    use crate::net::notifier::Notifier;
    use crate::secure::seal_payload;
    use crate::SockId;
    use ferrite::crypto;
    use ferrite::encoding::base64;
    use ferrite::logging::{o, Discard, Logger};
    use std::fs;
    use std::net::SocketAddr;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixDatagram;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    const KEY_A: [u8; crypto::KEY_SIZE] = [1u8; crypto::KEY_SIZE];
    const KEY_B: [u8; crypto::KEY_SIZE] = [2u8; crypto::KEY_SIZE];

    #[derive(Default)]
    struct RecordSink {
        saved: Mutex<Vec<(String, String)>>,
    }

    impl ControlSink for RecordSink {
        fn save(&self, agent: &EntrySnapshot, message: &str) {
            let mut saved = self.saved.lock().unwrap();
            saved.push((agent.id.clone(), message.to_string()));
        }
    }

    impl RecordSink {
        fn saved(&self) -> Vec<(String, String)> {
            self.saved.lock().unwrap().clone()
        }
    }

    struct Fixture {
        _dir: TempDir,
        _notifier: Notifier,
        core: Arc<Core>,
        sink: Arc<RecordSink>,
        handler: MessageHandler,
    }

    fn test_log() -> Logger {
        Logger::root(Discard, o!())
    }

    fn fixture_with_reply(udp_reply: Option<std::net::UdpSocket>) -> Fixture {
        let dir = TempDir::new().unwrap();
        let log = test_log();

        let mut config = Config::default();
        config.keys_file = dir.path().join("client.keys");
        config.rids_dir = dir.path().join("rids");
        config.bus_socket = dir.path().join("bus.sock");
        config.key_request_socket = dir.path().join("krequest.sock");
        config.queue_size = 64;

        fs::write(
            &config.keys_file,
            format!(
                "001 agentA 10.0.0.5 {}\n002 agentB any {}\n",
                base64::encode(&KEY_A),
                base64::encode(&KEY_B)
            ),
        )
        .unwrap();

        let notifier = Notifier::new(8).unwrap();
        let notify = notifier.handle().unwrap();
        let core = Arc::new(Core::new(config, notify, udp_reply, &log));
        core.keys.load().unwrap();

        let sink = Arc::new(RecordSink::default());
        let handler = MessageHandler::new(core.clone(), sink.clone(), &log);

        Fixture {
            _dir: dir,
            _notifier: notifier,
            core,
            sink,
            handler,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_reply(None)
    }

    fn message(buffer: Vec<u8>, sock: SockId, addr: &str, counter: u64) -> Message {
        Message {
            buffer,
            sock,
            addr: addr.parse::<SocketAddr>().unwrap(),
            counter,
        }
    }

    fn bind_bus(fixture: &Fixture) -> UnixDatagram {
        let receiver = UnixDatagram::bind(&fixture.core.config.bus_socket).unwrap();
        receiver.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        assert!(fixture.core.bus.connect(&fixture.core.shutdown));
        receiver
    }

    #[test]
    fn test_udp_event_reaches_bus() {
        let fixture = fixture();
        let receiver = bind_bus(&fixture);

        let payload = seal_payload(&KEY_A, "001", 1, b"some event");
        fixture
            .handler
            .handle(&message(payload, UDP_NO_CLIENT, "10.0.0.5:49152", 1));

        let mut buf = [0u8; 256];
        let read = receiver.recv(&mut buf).unwrap();
        assert_eq!(&buf[..read], b"1:[001] (agentA) 10.0.0.5:some event");

        let snapshot = fixture.core.state.snapshot();
        assert_eq!(snapshot.recv_evt, 1);
        assert_eq!(snapshot.recv_unknown, 0);
        assert_eq!(fixture.core.state.agent("001").evt, 1);
    }

    #[test]
    fn test_addressed_event_from_dynamic_agent() {
        let fixture = fixture();
        let receiver = bind_bus(&fixture);

        let mut buffer = b"!002!".to_vec();
        buffer.extend_from_slice(&seal_payload(&KEY_B, "002", 1, b"roaming event"));
        fixture
            .handler
            .handle(&message(buffer, UDP_NO_CLIENT, "172.16.3.3:40000", 1));

        let mut buf = [0u8; 256];
        let read = receiver.recv(&mut buf).unwrap();
        assert_eq!(&buf[..read], b"1:[002] (agentB) any:roaming event");
    }

    #[test]
    fn test_udp_control_message_accepted() {
        let fixture = fixture();

        let payload = seal_payload(&KEY_A, "001", 1, b"#!-agent startup");
        fixture
            .handler
            .handle(&message(payload, UDP_NO_CLIENT, "10.0.0.5:49152", 1));

        assert_eq!(fixture.sink.saved(), vec![("001".to_string(), "#!-agent startup".to_string())]);
        assert_eq!(fixture.core.state.agent("001").ctrl, 1);

        let store = fixture.core.keys.read();
        let state = store.entry(0).lock();
        assert_eq!(state.net_protocol, Some(Protocol::Udp));
        assert_eq!(state.sock, UDP_NO_CLIENT);
        assert!(state.last_received_at > 0);
        assert_eq!(state.peer_info, Some("10.0.0.5:49152".parse().unwrap()));
    }

    #[test]
    fn test_tcp_control_binds_socket() {
        let fixture = fixture();

        let mut buffer = b"!002!".to_vec();
        buffer.extend_from_slice(&seal_payload(&KEY_B, "002", 1, b"#!-agent startup"));
        fixture.handler.handle(&message(buffer, 42, "172.16.3.3:40000", 5));

        let store = fixture.core.keys.read();
        let idx = store.lookup_by_id("002").unwrap();
        let state = store.entry(idx).lock();
        assert_eq!(state.sock, 42);
        assert_eq!(state.net_protocol, Some(Protocol::Tcp));
        drop(state);
        drop(store);

        assert_eq!(fixture.core.keys.socket_owner(42), Some(idx));
        assert_eq!(fixture.sink.saved().len(), 1);
        assert_eq!(fixture.core.state.snapshot().recv_ctrl, 1);
    }

    #[test]
    fn test_duplicate_socket_collision_closes_newcomer() {
        let fixture = fixture();

        // Bind entry 002 to socket 10.
        let mut buffer = b"!002!".to_vec();
        buffer.extend_from_slice(&seal_payload(&KEY_B, "002", 1, b"#!-agent startup"));
        fixture.handler.handle(&message(buffer, 10, "172.16.3.3:40000", 5));

        // A second connection speaks for the same agent.
        let mut buffer = b"!002!".to_vec();
        buffer.extend_from_slice(&seal_payload(&KEY_B, "002", 2, b"#!-agent startup"));
        fixture.handler.handle(&message(buffer, 11, "172.16.3.4:40001", 6));

        let store = fixture.core.keys.read();
        let idx = store.lookup_by_id("002").unwrap();
        assert_eq!(store.entry(idx).lock().sock, 10);
        drop(store);

        assert_eq!(fixture.core.keys.socket_owner(10), Some(idx));
        assert_eq!(fixture.core.state.snapshot().recv_unknown, 1);
        // The newcomer never made it to the control sink.
        assert_eq!(fixture.sink.saved().len(), 1);
    }

    #[test]
    fn test_stale_tcp_control_dequeued() {
        let fixture = fixture();

        // Socket 7 was closed while the global sequence stood at 100.
        fixture.core.keys.set_sock_counter(7, 100);

        let mut buffer = b"!002!".to_vec();
        buffer.extend_from_slice(&seal_payload(&KEY_B, "002", 1, b"#!-agent startup"));
        fixture.handler.handle(&message(buffer, 7, "172.16.3.3:40000", 42));

        let snapshot = fixture.core.state.snapshot();
        assert_eq!(snapshot.recv_dequeued, 1);
        assert_eq!(snapshot.recv_ctrl, 0);
        assert!(fixture.sink.saved().is_empty());

        let store = fixture.core.keys.read();
        let idx = store.lookup_by_id("002").unwrap();
        assert_eq!(store.entry(idx).lock().sock, UDP_NO_CLIENT);
    }

    #[test]
    fn test_stale_shutdown_control_still_accepted() {
        let fixture = fixture();
        fixture.core.keys.set_sock_counter(7, 100);

        let mut buffer = b"!002!".to_vec();
        buffer.extend_from_slice(&seal_payload(&KEY_B, "002", 1, b"#!-agent shutdown"));
        fixture.handler.handle(&message(buffer, 7, "172.16.3.3:40000", 42));

        assert_eq!(fixture.sink.saved(), vec![("002".to_string(), "#!-agent shutdown".to_string())]);

        // A stale connection may report the shutdown but must not take the slot.
        let store = fixture.core.keys.read();
        let idx = store.lookup_by_id("002").unwrap();
        assert_eq!(store.entry(idx).lock().sock, UDP_NO_CLIENT);
        drop(store);
        assert_eq!(fixture.core.keys.socket_owner(7), None);
    }

    #[test]
    fn test_unknown_ip_pushes_key_request() {
        let fixture = fixture();
        fixture.core.key_requests.force_available();

        let payload = seal_payload(&KEY_A, "001", 1, b"event");
        fixture
            .handler
            .handle(&message(payload, UDP_NO_CLIENT, "192.168.9.9:40000", 1));

        match fixture.core.key_requests.try_pop() {
            Some(KeyRequest::Query(query)) => assert_eq!(query, "ip:192.168.9.9"),
            other => panic!("Unexpected request {:?}", other),
        }
        assert_eq!(fixture.core.state.snapshot().recv_unknown, 1);
        assert_eq!(fixture.core.state.snapshot().recv_evt, 0);
    }

    #[test]
    fn test_id_with_wrong_source_pushes_key_request() {
        let fixture = fixture();
        fixture.core.key_requests.force_available();

        // Agent 001 is pinned to 10.0.0.5 but speaks from elsewhere.
        let mut buffer = b"!001!".to_vec();
        buffer.extend_from_slice(&seal_payload(&KEY_A, "001", 1, b"event"));
        fixture
            .handler
            .handle(&message(buffer, UDP_NO_CLIENT, "10.9.9.9:40000", 1));

        match fixture.core.key_requests.try_pop() {
            Some(KeyRequest::Query(query)) => assert_eq!(query, "id:001"),
            other => panic!("Unexpected request {:?}", other),
        }
        assert_eq!(fixture.core.state.snapshot().recv_unknown, 1);
    }

    #[test]
    fn test_invalid_key_pushes_key_request() {
        let fixture = fixture();
        fixture.core.key_requests.force_available();

        let wrong = [9u8; crypto::KEY_SIZE];
        let mut buffer = b"!002!".to_vec();
        buffer.extend_from_slice(&seal_payload(&wrong, "002", 1, b"event"));
        fixture
            .handler
            .handle(&message(buffer, UDP_NO_CLIENT, "172.16.3.3:40000", 1));

        match fixture.core.key_requests.try_pop() {
            Some(KeyRequest::Query(query)) => assert_eq!(query, "id:002"),
            other => panic!("Unexpected request {:?}", other),
        }
        assert_eq!(fixture.core.state.snapshot().recv_unknown, 1);
    }

    #[test]
    fn test_replayed_frame_changes_nothing() {
        let fixture = fixture();
        let receiver = bind_bus(&fixture);

        let payload = seal_payload(&KEY_A, "001", 3, b"some event");
        fixture
            .handler
            .handle(&message(payload.clone(), UDP_NO_CLIENT, "10.0.0.5:49152", 1));

        let mut buf = [0u8; 256];
        receiver.recv(&mut buf).unwrap();

        fixture
            .handler
            .handle(&message(payload, UDP_NO_CLIENT, "10.0.0.5:49152", 2));

        let snapshot = fixture.core.state.snapshot();
        assert_eq!(snapshot.recv_evt, 1);
        assert_eq!(snapshot.recv_unknown, 1);

        let store = fixture.core.keys.read();
        assert_eq!(store.entry(0).lock().counter, 3);
    }

    #[test]
    fn test_empty_payload_discarded() {
        let fixture = fixture();

        fixture
            .handler
            .handle(&message(b"!002!".to_vec(), UDP_NO_CLIENT, "172.16.3.3:40000", 1));

        assert_eq!(fixture.core.state.snapshot().recv_unknown, 1);
    }

    #[test]
    fn test_malformed_envelope_discarded() {
        let fixture = fixture();

        fixture
            .handler
            .handle(&message(b"!12ab".to_vec(), UDP_NO_CLIENT, "10.0.0.5:40000", 1));

        assert_eq!(fixture.core.state.snapshot().recv_unknown, 1);
    }

    #[test]
    fn test_udp_ping_pong() {
        let agent = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        agent.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let agent_addr = agent.local_addr().unwrap();

        let reply = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let fixture = fixture_with_reply(Some(reply));

        fixture
            .handler
            .handle(&message(b"#ping".to_vec(), UDP_NO_CLIENT, &agent_addr.to_string(), 1));

        let mut buf = [0u8; 16];
        let read = agent.recv(&mut buf).unwrap();
        assert_eq!(&buf[..read], b"#pong");
        assert_eq!(fixture.core.state.snapshot().recv_ping, 1);
    }

    #[test]
    fn test_tcp_ping_pong() {
        use byteorder::{ByteOrder, LittleEndian};
        use std::io::Read;

        let fixture = fixture();

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        let stream = mio::net::TcpStream::from_std(server);
        let sock = stream.as_raw_fd();
        fixture.core.table.open(sock, stream, peer).unwrap();

        fixture
            .handler
            .handle(&message(b"#ping".to_vec(), sock, &peer.to_string(), 1));
        fixture.core.table.send(sock).unwrap();

        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut framed = [0u8; 9];
        client.read_exact(&mut framed).unwrap();
        assert_eq!(LittleEndian::read_u32(&framed[..4]), 5);
        assert_eq!(&framed[4..], b"#pong");

        assert_eq!(fixture.core.state.snapshot().recv_ping, 1);
    }
}
