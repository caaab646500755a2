use clap::{Arg, Command};
use ferrite::logging;
use osmium::config::Config;
use osmium::core::Core;
use osmium::handler::{ControlSink, MessageHandler};
use osmium::housekeeping;
use osmium::keystore::EntrySnapshot;
use osmium::net::endpoint::{Endpoint, Listeners};
use osmium::net::notifier::Notifier;
use osmium::sender;
use std::sync::Arc;
use std::thread;

const MAX_EVENTS: usize = 1024;

/// Default consumer for accepted agent control messages. The fleet state
/// subsystem hooks in here; on its own the daemon records the transition.
struct LogControlSink {
    log: logging::Logger,
}

impl ControlSink for LogControlSink {
    fn save(&self, agent: &EntrySnapshot, message: &str) {
        let header = message.lines().next().unwrap_or("");
        logging::info!(self.log, "Agent control message";
                       "id" => %agent.id,
                       "name" => %agent.name,
                       "addr" => %agent.addr,
                       "header" => header);
    }
}

fn main() {
    let matches = Command::new("ingestd")
        .version("0.1.0")
        .about("Runs the secure agent ingestion server.")
        .arg(
            Arg::new("CONFIG_FILE")
                .help("Path to the config file")
                .required(true),
        )
        .get_matches();

    let config_path = matches
        .get_one::<String>("CONFIG_FILE")
        .expect("CONFIG_FILE is required");

    let config = Config::load(config_path);
    if let Err(err) = config.validate() {
        panic!("Invalid configuration: {}", err);
    }

    let log = logging::init(&config.log_level);
    logging::info!(log, "Starting ingestion server"; "address" => config.listen_addr());

    let notifier = Notifier::new(MAX_EVENTS).expect("Error creating event notifier");
    let notify = notifier.handle().expect("Error cloning notifier handle");
    let mut listeners = Listeners::open(&config).expect("Error opening listener sockets");

    let core = Arc::new(Core::new(config, notify, listeners.udp_reply.take(), &log));

    {
        let core = core.clone();
        ctrlc::set_handler(move || core.shutdown.set()).expect("Error installing signal handler");
    }

    // The downstream bus must be up before any message flows.
    if !core.bus.connect(&core.shutdown) {
        return;
    }

    logging::info!(log, "Reading authentication keys.");
    let entries = core.keys.load().expect("Error reading authentication keys");
    logging::info!(log, "Authentication keys loaded"; "entries" => entries);

    let mut threads = Vec::new();

    logging::debug!(log, "Creating sender threads."; "count" => core.config.sender_pool);
    for _ in 0..core.config.sender_pool {
        let core = core.clone();
        let log = log.clone();
        threads.push(thread::spawn(move || sender::run_sender(&core, &log)));
    }

    let control: Arc<dyn ControlSink> = Arc::new(LogControlSink { log: log.clone() });
    logging::debug!(log, "Creating message handler threads."; "count" => core.config.worker_pool);
    for _ in 0..core.config.worker_pool {
        let handler = MessageHandler::new(core.clone(), control.clone(), &log);
        threads.push(thread::spawn(move || handler.run()));
    }

    {
        let core = core.clone();
        let log = log.clone();
        threads.push(thread::spawn(move || housekeeping::run_key_reloader(&core, &log)));
    }
    {
        let core = core.clone();
        let log = log.clone();
        threads.push(thread::spawn(move || housekeeping::run_rids_closer(&core, &log)));
    }
    {
        let core = core.clone();
        threads.push(thread::spawn(move || core.key_requests.run(&core.shutdown)));
    }

    let mut endpoint =
        Endpoint::new(core.clone(), notifier, listeners, &log).expect("Error starting event loop");
    endpoint.run();

    // The event loop is down; unblock every queue consumer and collect them.
    core.inbound.push_shutdown(core.config.worker_pool);
    core.outbound.push_shutdown(core.config.sender_pool);
    core.key_requests.push_shutdown();

    for handle in threads {
        let _ = handle.join();
    }

    logging::info!(log, "Ingestion server stopped.");
}
