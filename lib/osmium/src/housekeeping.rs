use crate::core::Core;
use ferrite::logging;
use std::time::Duration;

/// Key reloader thread body: watches the key file and commits changed credential
/// sets atomically under the store write lock.
pub fn run_key_reloader(core: &Core, log: &logging::Logger) {
    logging::debug!(log, "Key reloader thread started.");
    let interval = Duration::from_secs(core.config.keyupdate_interval);

    while !core.shutdown.sleep(interval) {
        logging::debug!(log, "Checking for keys file changes.");
        match core.keys.reload_if_changed() {
            Ok(true) => core.state.inc_keys_reload(),
            Ok(false) => {}
            Err(err) => {
                logging::warn!(log, "Unable to reload the keys file"; "error" => %err);
            }
        }
    }

    logging::debug!(log, "Key reloader thread stopped.");
}

/// Rids closer thread body: walks the open-journal queue from its oldest entry
/// and closes handles nobody touched within the closing window.
pub fn run_rids_closer(core: &Core, log: &logging::Logger) {
    logging::debug!(log, "Rids closer thread started.");
    let window = core.config.rids_closing_time;

    while !core.shutdown.sleep(Duration::from_secs(window)) {
        core.keys.close_idle_rids(window);
    }

    logging::debug!(log, "Rids closer thread stopped.");
}
