use crate::bus::MessageBus;
use crate::config::Config;
use crate::keyrequest::KeyRequestClient;
use crate::keystore::SharedKeys;
use crate::net::buffer::SocketTable;
use crate::net::notifier::NotifyHandle;
use crate::queue::{InboundQueue, OutboundQueue};
use crate::shutdown::Shutdown;
use crate::state::State;
use crate::SockId;
use ferrite::logging;

const KEY_REQUEST_QUEUE_SIZE: usize = 1024;

/// Shared context of the ingestion core. Built once by the launcher and handed
/// to every thread; nothing in here is reachable through globals.
pub struct Core {
    pub config: Config,
    pub keys: SharedKeys,
    pub table: SocketTable,
    pub inbound: InboundQueue,
    pub outbound: OutboundQueue,
    pub state: State,
    pub bus: MessageBus,
    pub key_requests: KeyRequestClient,
    pub shutdown: Shutdown,
    /// Plain clone of the UDP listener used for ping replies from workers.
    pub udp_reply: Option<std::net::UdpSocket>,
    log: logging::Logger,
}

impl Core {
    pub fn new(
        config: Config,
        notify: NotifyHandle,
        udp_reply: Option<std::net::UdpSocket>,
        log: &logging::Logger,
    ) -> Core {
        Core {
            keys: SharedKeys::new(&config, log),
            table: SocketTable::new(notify, config.max_message_size, config.send_buffer_size, log),
            inbound: InboundQueue::new(config.queue_size, log),
            outbound: OutboundQueue::new(config.queue_size, log),
            state: State::new(),
            bus: MessageBus::new(config.bus_socket.clone(), log),
            key_requests: KeyRequestClient::new(config.key_request_socket.clone(), KEY_REQUEST_QUEUE_SIZE, log),
            shutdown: Shutdown::new(),
            udp_reply,
            config,
            log: log.new(logging::o!()),
        }
    }

    /// Closes a TCP client and detaches every reference to it. The enqueue
    /// sequence is recorded against the socket first, so messages of this
    /// connection still sitting in the queue read as stale afterwards.
    pub fn close_sock(&self, sock: SockId) {
        self.keys.set_sock_counter(sock, self.inbound.sequence());

        {
            let store = self.keys.read();
            self.keys.unbind_socket(&store, sock);
        }

        if self.table.close(sock) {
            self.state.dec_tcp();
            logging::debug!(self.log, "TCP peer disconnected"; "sock" => sock);
        }
    }
}
