use crate::core::Core;
use crate::queue::Outbound;
use ferrite::logging;

/// Sender thread body: drains outbound dispatch records into the per-socket
/// send rings. Write readiness towards the peer is driven by the ring's
/// non-empty edge, not by this thread.
pub fn run_sender(core: &Core, log: &logging::Logger) {
    logging::debug!(log, "Sender thread started.");

    loop {
        match core.outbound.pop() {
            Outbound::Dispatch(dispatch) => {
                if let Err(err) = core.table.push_send(dispatch.sock, &dispatch.data) {
                    logging::debug!(log, "Dispatch not delivered"; "sock" => dispatch.sock, "error" => ?err);
                }
            }
            Outbound::Shutdown => break,
        }
    }

    logging::debug!(log, "Sender thread stopped.");
}
