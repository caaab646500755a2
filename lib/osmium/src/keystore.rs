use crate::config::Config;
use crate::{Protocol, SockId, UDP_NO_CLIENT};
use ferrite::crypto;
use ferrite::encoding::base64;
use ferrite::logging;
use ferrite::time::timestamp_secs;
use hashbrown::HashMap;
use indexmap::IndexMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::SystemTime;

/// Address constraint attached to a key entry. `Any` is the dynamic pattern that
/// admits an agent from whatever address it currently reports.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum AgentAddr {
    Any,
    Fixed(IpAddr),
}

impl AgentAddr {
    fn parse(text: &str) -> Option<AgentAddr> {
        if text == "any" {
            return Some(AgentAddr::Any);
        }
        text.parse().ok().map(AgentAddr::Fixed)
    }

    #[inline]
    pub fn permits(&self, ip: IpAddr) -> bool {
        match self {
            AgentAddr::Any => true,
            AgentAddr::Fixed(fixed) => *fixed == ip,
        }
    }
}

impl fmt::Display for AgentAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AgentAddr::Any => write!(f, "any"),
            AgentAddr::Fixed(ip) => write!(f, "{}", ip),
        }
    }
}

/// Runtime half of a key entry, guarded by the per-entry mutex. Fields may only
/// be touched while the store-level lock is held for reading and this mutex is
/// taken; structural store changes take the store lock for writing instead.
pub struct EntryState {
    /// Last accepted message counter; never decreases.
    pub counter: u64,
    /// Currently bound TCP socket, or `UDP_NO_CLIENT`.
    pub sock: SockId,
    pub net_protocol: Option<Protocol>,
    pub last_received_at: u64,
    pub peer_info: Option<SocketAddr>,
    /// Last rids journal touch; zero while the journal handle is closed.
    pub updating_time: u64,
    pub rids: Option<File>,
}

pub struct KeyEntry {
    pub id: String,
    pub name: String,
    pub addr: AgentAddr,
    pub key: [u8; crypto::KEY_SIZE],
    state: Mutex<EntryState>,
}

impl KeyEntry {
    fn new(id: String, name: String, addr: AgentAddr, key: [u8; crypto::KEY_SIZE], counter: u64) -> KeyEntry {
        KeyEntry {
            id,
            name,
            addr,
            key,
            state: Mutex::new(EntryState {
                counter,
                sock: UDP_NO_CLIENT,
                net_protocol: None,
                last_received_at: 0,
                peer_info: None,
                updating_time: 0,
                rids: None,
            }),
        }
    }

    #[inline]
    pub fn lock(&self) -> MutexGuard<EntryState> {
        self.state.lock().expect("key entry mutex poisoned")
    }

    /// Duplicates the entry for handoff outside the store lock.
    pub fn snapshot(&self, state: &EntryState) -> EntrySnapshot {
        EntrySnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            addr: self.addr.clone(),
            counter: state.counter,
            net_protocol: state.net_protocol,
            last_received_at: state.last_received_at,
            peer_info: state.peer_info,
        }
    }

    fn matches(&self, parsed: &ParsedKey) -> bool {
        self.id == parsed.id && self.name == parsed.name && self.addr == parsed.addr && self.key == parsed.key
    }
}

/// Copy of an entry at the moment a control message was accepted.
#[derive(Debug, Clone)]
pub struct EntrySnapshot {
    pub id: String,
    pub name: String,
    pub addr: AgentAddr,
    pub counter: u64,
    pub net_protocol: Option<Protocol>,
    pub last_received_at: u64,
    pub peer_info: Option<SocketAddr>,
}

/// Outcome of binding a TCP socket to an entry.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SocketBind {
    Added,
    Updated,
}

struct ParsedKey {
    id: String,
    name: String,
    addr: AgentAddr,
    key: [u8; crypto::KEY_SIZE],
}

/// The indexed credential mapping living behind the global reader/writer lock.
pub struct KeyStore {
    entries: Vec<Arc<KeyEntry>>,
    by_id: HashMap<String, usize>,
    by_ip: HashMap<IpAddr, usize>,
}

impl KeyStore {
    fn empty() -> KeyStore {
        KeyStore {
            entries: Vec::new(),
            by_id: HashMap::new(),
            by_ip: HashMap::new(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn entry(&self, idx: usize) -> &Arc<KeyEntry> {
        &self.entries[idx]
    }

    #[inline]
    pub fn get(&self, idx: usize) -> Option<&Arc<KeyEntry>> {
        self.entries.get(idx)
    }

    #[inline]
    pub fn lookup_by_id(&self, id: &str) -> Option<usize> {
        self.by_id.get(id).copied()
    }

    #[inline]
    pub fn lookup_by_ip(&self, ip: IpAddr) -> Option<usize> {
        self.by_ip.get(&ip).copied()
    }

    /// Matches an id-addressed agent against its allowed source address.
    pub fn lookup_by_dynamic(&self, id: &str, ip: IpAddr) -> Option<usize> {
        let idx = self.lookup_by_id(id)?;
        if self.entries[idx].addr.permits(ip) {
            return Some(idx);
        }
        None
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
struct FileSignature {
    mtime: SystemTime,
    size: u64,
}

/// Authoritative set of agent credentials plus the runtime bookkeeping around it:
/// the socket binding index, the per-socket close counters and the queue of open
/// rids journal handles ordered by last touch.
pub struct SharedKeys {
    store: RwLock<KeyStore>,
    sock_index: Mutex<HashMap<SockId, usize>>,
    sock_counters: Mutex<HashMap<SockId, u64>>,
    rids_queue: Mutex<IndexMap<usize, u64>>,
    keys_file: PathBuf,
    rids_dir: PathBuf,
    signature: Mutex<Option<FileSignature>>,
    log: logging::Logger,
}

impl SharedKeys {
    pub fn new(config: &Config, log: &logging::Logger) -> SharedKeys {
        SharedKeys {
            store: RwLock::new(KeyStore::empty()),
            sock_index: Mutex::new(HashMap::new()),
            sock_counters: Mutex::new(HashMap::new()),
            rids_queue: Mutex::new(IndexMap::new()),
            keys_file: config.keys_file.clone(),
            rids_dir: config.rids_dir.clone(),
            signature: Mutex::new(None),
            log: log.new(logging::o!("context" => "keystore")),
        }
    }

    #[inline]
    pub fn read(&self) -> RwLockReadGuard<KeyStore> {
        self.store.read().expect("key store lock poisoned")
    }

    #[inline]
    fn write(&self) -> RwLockWriteGuard<KeyStore> {
        self.store.write().expect("key store lock poisoned")
    }

    /// Initial key file read. Creates the rids directory on first use.
    pub fn load(&self) -> io::Result<usize> {
        fs::create_dir_all(&self.rids_dir)?;

        let signature = Self::signature_of(&self.keys_file)?;
        let parsed = self.parse_keys_file()?;
        let count = parsed.len();

        let mut store = self.write();
        *store = self.build_store(parsed, None);
        *self.signature.lock().expect("signature lock poisoned") = Some(signature);

        Ok(count)
    }

    /// Rereads the key file when its mtime or size moved. Additions and removals
    /// commit atomically under the store write lock; entries whose four fields are
    /// unchanged keep their runtime state (counter, socket, journal handle).
    pub fn reload_if_changed(&self) -> io::Result<bool> {
        let signature = Self::signature_of(&self.keys_file)?;
        {
            let saved = self.signature.lock().expect("signature lock poisoned");
            if *saved == Some(signature) {
                return Ok(false);
            }
        }

        let parsed = self.parse_keys_file()?;
        let count = parsed.len();

        let mut store = self.write();
        let rebuilt = self.build_store(parsed, Some(&store));
        let old = std::mem::replace(&mut *store, rebuilt);
        self.reindex_runtime(&store, &old);
        *self.signature.lock().expect("signature lock poisoned") = Some(signature);

        logging::info!(self.log, "Authentication keys reloaded"; "entries" => count);
        Ok(true)
    }

    fn signature_of(path: &Path) -> io::Result<FileSignature> {
        let meta = fs::metadata(path)?;
        Ok(FileSignature {
            mtime: meta.modified()?,
            size: meta.len(),
        })
    }

    fn parse_keys_file(&self) -> io::Result<Vec<ParsedKey>> {
        let text = fs::read_to_string(&self.keys_file)?;
        let mut parsed: Vec<ParsedKey> = Vec::new();

        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut fields = line.split_whitespace();
            let entry = match (fields.next(), fields.next(), fields.next(), fields.next(), fields.next()) {
                (Some(id), Some(name), Some(ip), Some(key), None) => {
                    let addr = AgentAddr::parse(ip).ok_or_else(|| invalid_line(lineno))?;
                    let raw = base64::decode(key).map_err(|_| invalid_line(lineno))?;
                    if raw.len() != crypto::KEY_SIZE || id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
                        return Err(invalid_line(lineno));
                    }
                    let mut key = [0u8; crypto::KEY_SIZE];
                    key.copy_from_slice(&raw);
                    ParsedKey {
                        id: id.to_string(),
                        name: name.to_string(),
                        addr,
                        key,
                    }
                }
                _ => return Err(invalid_line(lineno)),
            };

            parsed.push(entry);
        }

        Ok(parsed)
    }

    fn build_store(&self, parsed: Vec<ParsedKey>, previous: Option<&KeyStore>) -> KeyStore {
        let mut store = KeyStore::empty();

        for key in parsed {
            if store.by_id.contains_key(&key.id) {
                logging::warn!(self.log, "Duplicated agent id in key file, keeping the first entry"; "id" => %key.id);
                continue;
            }

            let reused = previous
                .and_then(|old| old.lookup_by_id(&key.id).map(|idx| old.entry(idx)))
                .filter(|old_entry| old_entry.matches(&key))
                .cloned();

            let entry = match reused {
                Some(entry) => entry,
                None => {
                    let counter = self.seed_counter(&key.id);
                    Arc::new(KeyEntry::new(
                        key.id.clone(),
                        key.name.clone(),
                        key.addr.clone(),
                        key.key,
                        counter,
                    ))
                }
            };

            let idx = store.entries.len();
            if let AgentAddr::Fixed(ip) = &key.addr {
                if store.by_ip.insert(*ip, idx).is_some() {
                    logging::warn!(self.log, "Duplicated agent address in key file, keeping the last entry"; "ip" => %ip);
                }
            }
            store.by_id.insert(key.id, idx);
            store.entries.push(entry);
        }

        store
    }

    /// Repoints the socket index and the rids queue at the rebuilt entry positions.
    /// Runs under the store write lock, so no reader can observe the gap.
    fn reindex_runtime(&self, store: &KeyStore, old: &KeyStore) {
        let mut sock_index = self.sock_index.lock().expect("socket index lock poisoned");
        sock_index.clear();
        for (idx, entry) in store.entries.iter().enumerate() {
            let state = entry.lock();
            if state.sock >= 0 {
                sock_index.insert(state.sock, idx);
            }
        }
        drop(sock_index);

        let mut rids_queue = self.rids_queue.lock().expect("rids queue lock poisoned");
        let order: Vec<(usize, u64)> = rids_queue.drain(..).collect();
        for (old_idx, touched) in order {
            if let Some(old_entry) = old.get(old_idx) {
                if let Some(idx) = store.lookup_by_id(&old_entry.id) {
                    if Arc::ptr_eq(old_entry, store.entry(idx)) {
                        rids_queue.insert(idx, touched);
                    }
                }
            }
        }
    }

    /// Seeds the message counter from an existing rids journal, so replay
    /// protection survives a restart.
    fn seed_counter(&self, id: &str) -> u64 {
        fs::read_to_string(self.rids_dir.join(id))
            .ok()
            .and_then(|text| text.trim().parse().ok())
            .unwrap_or(0)
    }

    /// Records the socket as serving the entry. The caller must hold the store
    /// read lock; the entry's own `sock` field is written by the caller under the
    /// entry mutex.
    pub fn bind_socket(&self, _store: &KeyStore, idx: usize, sock: SockId) -> SocketBind {
        let mut sock_index = self.sock_index.lock().expect("socket index lock poisoned");
        match sock_index.insert(sock, idx) {
            Some(_) => SocketBind::Updated,
            None => SocketBind::Added,
        }
    }

    /// Detaches the socket from whatever entry it served.
    pub fn unbind_socket(&self, store: &KeyStore, sock: SockId) {
        let idx = {
            let mut sock_index = self.sock_index.lock().expect("socket index lock poisoned");
            sock_index.remove(&sock)
        };

        if let Some(idx) = idx {
            if let Some(entry) = store.get(idx) {
                let mut state = entry.lock();
                if state.sock == sock {
                    state.sock = UDP_NO_CLIENT;
                }
            }
        }
    }

    /// Entry index currently bound to the socket, if any.
    pub fn socket_owner(&self, sock: SockId) -> Option<usize> {
        let sock_index = self.sock_index.lock().expect("socket index lock poisoned");
        sock_index.get(&sock).copied()
    }

    /// Last global sequence number recorded against the socket at close time.
    #[inline]
    pub fn sock_counter(&self, sock: SockId) -> u64 {
        let counters = self.sock_counters.lock().expect("socket counters lock poisoned");
        counters.get(&sock).copied().unwrap_or(0)
    }

    #[inline]
    pub fn set_sock_counter(&self, sock: SockId, counter: u64) {
        let mut counters = self.sock_counters.lock().expect("socket counters lock poisoned");
        counters.insert(sock, counter);
    }

    /// Opens the rids journal on demand and moves the entry to the tail of the
    /// open-handle queue. Caller holds the store read lock and the entry mutex.
    pub fn touch_rids(&self, idx: usize, entry: &KeyEntry, state: &mut EntryState) {
        if state.rids.is_none() {
            match OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(self.rids_dir.join(&entry.id))
            {
                Ok(file) => state.rids = Some(file),
                Err(err) => {
                    logging::warn!(self.log, "Unable to open rids journal"; "id" => %entry.id, "error" => %err);
                    return;
                }
            }
        }

        let now = timestamp_secs();
        state.updating_time = now;

        let mut rids_queue = self.rids_queue.lock().expect("rids queue lock poisoned");
        rids_queue.shift_remove(&idx);
        rids_queue.insert(idx, now);
    }

    /// Advances the entry counter and journals it through the rids handle.
    pub(crate) fn store_counter(&self, idx: usize, entry: &KeyEntry, state: &mut EntryState, counter: u64) {
        state.counter = counter;
        self.touch_rids(idx, entry, state);

        if let Some(file) = state.rids.as_mut() {
            if let Err(err) = write_journal(file, counter) {
                logging::warn!(self.log, "Unable to update rids journal"; "id" => %entry.id, "error" => %err);
            }
        }
    }

    /// Walks the rids queue from its oldest entry, closing journal handles that
    /// have not been touched inside the closing window. Stops at the first fresh
    /// head.
    pub fn close_idle_rids(&self, older_than_secs: u64) {
        let store = self.write();
        let now = timestamp_secs();

        loop {
            let head = {
                let rids_queue = self.rids_queue.lock().expect("rids queue lock poisoned");
                rids_queue.get_index(0).map(|(idx, touched)| (*idx, *touched))
            };

            let (idx, touched) = match head {
                Some(head) => head,
                None => break,
            };

            if touched >= now.saturating_sub(older_than_secs) {
                break;
            }

            {
                let mut rids_queue = self.rids_queue.lock().expect("rids queue lock poisoned");
                rids_queue.shift_remove_index(0);
            }

            if let Some(entry) = store.get(idx) {
                let mut state = entry.lock();
                logging::debug!(self.log, "Closing rids journal"; "id" => %entry.id);
                state.rids = None;
                state.updating_time = 0;
            }
        }
    }

    /// Snapshot of the open-handle queue in order, for diagnostics.
    pub fn rids_queue_snapshot(&self) -> Vec<(usize, u64)> {
        let rids_queue = self.rids_queue.lock().expect("rids queue lock poisoned");
        rids_queue.iter().map(|(idx, touched)| (*idx, *touched)).collect()
    }
}

fn invalid_line(lineno: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("invalid key entry at line {}", lineno + 1),
    )
}

/// The journal holds exactly the latest accepted counter, rewritten in place.
fn write_journal(file: &mut File, counter: u64) -> io::Result<()> {
    file.seek(SeekFrom::Start(0))?;
    file.set_len(0)?;
    writeln!(file, "{}", counter)
}
