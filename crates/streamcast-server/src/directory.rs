//! Registry of peer servers learned through gossip.
//!
//! Entries are keyed by (id, hostname, port), updated in place by every
//! SERVER_ANNOUNCE from that peer, and never evicted; only the live
//! socket is dropped on disconnect, not the directory entry.

/// One mesh peer as last announced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerServer {
    pub id: String,
    pub hostname: String,
    pub port: u16,
    pub load: u32,
}

#[derive(Debug, Default)]
pub struct PeerDirectory {
    servers: Vec<PeerServer>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update the entry for (id, hostname, port), creating it on first
    /// sight.
    pub fn upsert(&mut self, id: &str, hostname: &str, port: u16, load: u32) {
        match self
            .servers
            .iter_mut()
            .find(|s| s.id == id && s.hostname == hostname && s.port == port)
        {
            Some(server) => server.load = load,
            None => self.servers.push(PeerServer {
                id: id.to_owned(),
                hostname: hostname.to_owned(),
                port,
                load,
            }),
        }
    }

    /// The peer with the lowest announced load; ties go to the first
    /// entry encountered.
    pub fn least_loaded(&self) -> Option<&PeerServer> {
        self.servers
            .iter()
            .min_by_key(|s| s.load)
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}
