//! The coordinator actor.
//!
//! All protocol state — peer and client connection sets, the peer
//! directory, the user directory, the activity log, and in-flight
//! registration rounds — is owned by one task consuming [`Event`]s
//! from a single channel. The channel is the mutual-exclusion domain:
//! connection readers, the gossip timer, and lock-round timers all
//! feed it, and no handler runs concurrently with another.

use std::collections::{HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

use streamcast_core::{
    activity_key, decode, info, ActivityLog, Message, UserDirectory, ANONYMOUS_USERNAME,
};
use tokio::sync::mpsc;

use crate::config::ServerConfig;
use crate::connection::{ConnId, Connection};
use crate::directory::PeerDirectory;

/// Everything that can reach the coordinator.
#[derive(Debug)]
pub enum Event {
    /// Inbound socket accepted; starts unauthenticated.
    Accepted(Connection),
    /// Outbound peer dial completed; AUTHENTICATE was already sent and
    /// the link optimistically joins the peer set.
    Dialed(Connection),
    /// One wire line from a connection.
    Line { conn: ConnId, line: String },
    /// Reader hit EOF or an I/O error.
    Disconnected(ConnId),
    /// Periodic gossip trigger.
    GossipTick,
    /// A lock round ran out of time.
    LockTimeout { username: String },
    /// Cooperative teardown.
    Shutdown,
}

/// Handler verdict for the connection a message arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    KeepOpen,
    Close,
}

/// A registration suspended on a lock round. The round commits only
/// when every peer listed in `awaiting` has answered LOCK_ALLOWED;
/// any LOCK_DENIED, or the round timer, fails it.
#[derive(Debug)]
struct PendingRegistration {
    secret: String,
    client: ConnId,
    awaiting: HashSet<ConnId>,
}

pub struct Coordinator {
    config: ServerConfig,
    events: mpsc::UnboundedSender<Event>,
    /// Accepted but not yet admitted as client or peer.
    pending: HashMap<ConnId, Connection>,
    peers: HashMap<ConnId, Connection>,
    clients: HashMap<ConnId, Connection>,
    directory: PeerDirectory,
    users: UserDirectory,
    activity: ActivityLog,
    registrations: HashMap<String, PendingRegistration>,
}

impl Coordinator {
    pub fn new(config: ServerConfig, events: mpsc::UnboundedSender<Event>) -> Self {
        Self {
            config,
            events,
            pending: HashMap::new(),
            peers: HashMap::new(),
            clients: HashMap::new(),
            directory: PeerDirectory::new(),
            users: UserDirectory::new(),
            activity: ActivityLog::new(),
            registrations: HashMap::new(),
        }
    }

    /// Consume events until shutdown.
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Event>) {
        while let Some(event) = rx.recv().await {
            if !self.handle(event) {
                break;
            }
        }
        tracing::info!("coordinator stopped");
    }

    /// Apply one event. Returns false when the coordinator should stop.
    pub fn handle(&mut self, event: Event) -> bool {
        match event {
            Event::Accepted(conn) => {
                tracing::debug!("incoming connection from {}", conn.addr());
                self.pending.insert(conn.id(), conn);
            }
            Event::Dialed(conn) => {
                tracing::info!("dialed peer {}", conn.addr());
                self.peers.insert(conn.id(), conn);
            }
            Event::Line { conn, line } => self.on_line(conn, &line),
            Event::Disconnected(id) => self.drop_connection(id),
            Event::GossipTick => self.gossip(),
            Event::LockTimeout { username } => self.on_lock_timeout(&username),
            Event::Shutdown => {
                let connections = self
                    .pending
                    .values()
                    .chain(self.peers.values())
                    .chain(self.clients.values())
                    .cloned()
                    .collect::<Vec<_>>();
                tracing::info!("shutting down, closing {} connections", connections.len());
                for conn in connections {
                    conn.close();
                }
                return false;
            }
        }
        true
    }

    fn on_line(&mut self, id: ConnId, line: &str) {
        // The connection may already be gone; lines racing a close are
        // dropped silently.
        let Some(sender) = self.any_connection(id) else {
            return;
        };

        tracing::debug!("received from {}: {line}", sender.addr());

        let disposition = match decode(line) {
            Ok(msg) => self.dispatch(&sender, msg),
            Err(err) => {
                sender.send_msg(&Message::invalid(err.to_string()));
                if err.is_fatal() {
                    Disposition::Close
                } else {
                    Disposition::KeepOpen
                }
            }
        };

        if disposition == Disposition::Close {
            self.drop_connection(id);
        }
    }

    fn dispatch(&mut self, sender: &Connection, msg: Message) -> Disposition {
        match msg {
            Message::Authenticate { secret } => self.on_authenticate(sender, secret),
            Message::AuthenticationFail { info } => {
                tracing::info!("peer rejected our handshake: {info}");
                Disposition::Close
            }
            Message::Login { username, secret } => self.on_login(sender, username, secret),
            Message::ClientAuthenticate {
                username, secret, ..
            } => self.on_client_authenticate(sender, username, secret),
            Message::Register { username, secret } => self.on_register(sender, username, secret),
            Message::LockRequest {
                username,
                secret,
                original_server,
            } => self.on_lock_request(sender, username, secret, original_server),
            Message::LockAllowed { username, .. } => self.on_lock_allowed(sender, &username),
            Message::LockDenied { username, .. } => self.on_lock_denied(sender, &username),
            Message::ServerAnnounce {
                id,
                hostname,
                port,
                load,
                user_list,
                all_json_message,
            } => self.on_server_announce(sender, id, hostname, port, load, &user_list, &all_json_message),
            Message::ActivityMessage {
                username,
                secret,
                activity,
            } => self.on_activity_message(sender, username, secret, activity),
            Message::ActivityBroadcast { actor, object } => {
                self.on_activity_broadcast(sender, actor, object)
            }
            Message::RequestAll {
                username, secret, ..
            } => self.on_request_all(sender, username, secret),
            Message::Logout { .. } => {
                tracing::info!("client at {} logged out", sender.addr());
                Disposition::Close
            }
            Message::InvalidMessage { info } => self.on_invalid_message(&info),
            // Replies have no business arriving at a server.
            other => {
                sender.send_msg(&Message::invalid(format!(
                    "unexpected command: {}",
                    other.command()
                )));
                Disposition::Close
            }
        }
    }

    // ---- server-to-server handshake -------------------------------

    fn on_authenticate(&mut self, sender: &Connection, secret: Option<String>) -> Disposition {
        let fail = |info: &str| {
            sender.send_msg(&Message::AuthenticationFail { info: info.into() });
            Disposition::Close
        };

        if self.peers.contains_key(&sender.id()) {
            tracing::info!("repeated handshake from {}", sender.addr());
            return fail(info::REPEATED_AUTHENTICATION);
        }
        if self.peers.len() >= self.config.max_peers {
            tracing::info!("rejecting peer {}: ceiling reached", sender.addr());
            return fail("too many servers connecting to this server");
        }
        let Some(secret) = secret else {
            return fail("the supplied secret is absent");
        };
        if secret != self.config.secret {
            tracing::info!("rejecting peer {}: wrong secret", sender.addr());
            return fail("the supplied secret is incorrect");
        }

        tracing::info!("peer authenticated: {}", sender.addr());
        self.pending.remove(&sender.id());
        self.peers.insert(sender.id(), sender.clone());
        Disposition::KeepOpen
    }

    // ---- client admission -----------------------------------------

    fn on_login(
        &mut self,
        sender: &Connection,
        username: Option<String>,
        secret: Option<String>,
    ) -> Disposition {
        let (Some(username), Some(secret)) = (username, secret) else {
            sender.send_msg(&Message::LoginFailed {
                info: "message must contain username and secret".into(),
            });
            return Disposition::Close;
        };

        if username != ANONYMOUS_USERNAME && !self.users.verify(&username, &secret) {
            tracing::info!("login rejected for {username}: bad credentials");
            sender.send_msg(&Message::LoginFailed {
                info: "attempt to login with wrong username or secret".into(),
            });
            return Disposition::Close;
        }

        if self.clients.len() < self.config.max_clients {
            tracing::info!("logged in as user {username}");
            sender.send_msg(&Message::LoginSuccess {
                info: format!("logged in as user {username}"),
            });
            self.admit_client(sender);
            return Disposition::KeepOpen;
        }

        // At capacity: point the caller at the least-loaded peer we
        // know of, and leave the connection open so it can leave on
        // its own.
        match self.directory.least_loaded() {
            Some(peer) => {
                tracing::info!("at capacity, redirecting {username} to {}", peer.id);
                sender.send_msg(&Message::Redirect {
                    host: peer.hostname.clone(),
                    port: peer.port,
                    id: peer.id.clone(),
                });
            }
            None => {
                tracing::info!("at capacity and no peer known, refusing {username}");
                sender.send_msg(&Message::LoginFailed {
                    info: "server is at capacity and no peer is known".into(),
                });
            }
        }
        Disposition::KeepOpen
    }

    fn on_client_authenticate(
        &mut self,
        sender: &Connection,
        username: Option<String>,
        secret: Option<String>,
    ) -> Disposition {
        let (Some(username), Some(_secret)) = (username, secret) else {
            sender.send_msg(&Message::LoginFailed {
                info: "message must contain username and secret".into(),
            });
            return Disposition::Close;
        };

        if !self.users.contains(&username) {
            sender.send_msg(&Message::LoginFailed {
                info: "this server does not know that user".into(),
            });
            return Disposition::Close;
        }

        tracing::info!("redirected client re-admitted as {username}");
        sender.send_msg(&Message::LoginSuccess {
            info: "connected with server successfully".into(),
        });
        self.admit_client(sender);
        Disposition::KeepOpen
    }

    fn admit_client(&mut self, sender: &Connection) {
        self.pending.remove(&sender.id());
        self.clients.insert(sender.id(), sender.clone());
    }

    // ---- registration and the lock protocol -----------------------

    fn on_register(
        &mut self,
        sender: &Connection,
        username: Option<String>,
        secret: Option<String>,
    ) -> Disposition {
        let (Some(username), Some(secret)) = (username, secret) else {
            sender.send_msg(&Message::RegisterFailed {
                info: "message must contain username and secret".into(),
            });
            return Disposition::Close;
        };

        if username == ANONYMOUS_USERNAME
            || self.users.contains(&username)
            || self.registrations.contains_key(&username)
        {
            tracing::info!("register rejected: {username} already taken");
            sender.send_msg(&Message::RegisterFailed {
                info: format!("{username} is already registered in the system"),
            });
            return Disposition::KeepOpen;
        }

        if self.peers.is_empty() {
            // Single-node fast path.
            self.users.register(username.clone(), secret);
            tracing::info!("registered {username} locally");
            sender.send_msg(&Message::RegisterSuccess {
                info: format!("register success for {username}"),
            });
            return Disposition::KeepOpen;
        }

        // Suspend the client and ask every current peer for the name.
        tracing::info!(
            "starting lock round for {username} across {} peers",
            self.peers.len()
        );
        let request = Message::LockRequest {
            username: username.clone(),
            secret: secret.clone(),
            original_server: self.config.advertised_address(),
        };
        let line = request.encode();
        let mut awaiting = HashSet::new();
        for (id, peer) in &self.peers {
            if peer.send(&line) {
                awaiting.insert(*id);
            }
        }

        // Every peer socket may already be closed but not yet reaped;
        // with no approval left to wait for, the round commits now.
        if awaiting.is_empty() {
            self.users.register(username.clone(), secret);
            tracing::info!("no reachable peer, registered {username} locally");
            sender.send_msg(&Message::RegisterSuccess {
                info: format!("register success for {username}"),
            });
            return Disposition::KeepOpen;
        }

        self.registrations.insert(
            username.clone(),
            PendingRegistration {
                secret,
                client: sender.id(),
                awaiting,
            },
        );

        let events = self.events.clone();
        let timeout = self.config.lock_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = events.send(Event::LockTimeout { username });
        });

        Disposition::KeepOpen
    }

    fn on_lock_request(
        &mut self,
        sender: &Connection,
        username: String,
        secret: String,
        original_server: String,
    ) -> Disposition {
        if !self.peers.contains_key(&sender.id()) {
            sender.send_msg(&Message::invalid(info::UNAUTHENTICATED_SERVER));
            return Disposition::Close;
        }

        // The verdict travels back over the same peer link.
        let verdict = if self.users.contains(&username) {
            tracing::info!("denying lock for {username}");
            Message::LockDenied {
                username,
                secret,
                original_server,
            }
        } else {
            tracing::debug!("allowing lock for {username}");
            Message::LockAllowed {
                username,
                secret,
                original_server,
            }
        };
        sender.send_msg(&verdict);
        Disposition::KeepOpen
    }

    fn on_lock_allowed(&mut self, sender: &Connection, username: &str) -> Disposition {
        if !self.peers.contains_key(&sender.id()) {
            sender.send_msg(&Message::invalid(info::UNAUTHENTICATED_SERVER));
            return Disposition::Close;
        }
        let settled = match self.registrations.get_mut(username) {
            Some(round) => {
                round.awaiting.remove(&sender.id());
                round.awaiting.is_empty()
            }
            None => false,
        };
        if settled {
            self.commit_registration(username);
        }
        Disposition::KeepOpen
    }

    fn on_lock_denied(&mut self, sender: &Connection, username: &str) -> Disposition {
        if !self.peers.contains_key(&sender.id()) {
            sender.send_msg(&Message::invalid(info::UNAUTHENTICATED_SERVER));
            return Disposition::Close;
        }
        if let Some(round) = self.registrations.remove(username) {
            tracing::info!("lock denied for {username}, failing registration");
            if let Some(client) = self.any_connection(round.client) {
                client.send_msg(&Message::RegisterFailed {
                    info: format!("{username} is already registered elsewhere in the mesh"),
                });
            }
            self.drop_connection(round.client);
        }
        Disposition::KeepOpen
    }

    fn on_lock_timeout(&mut self, username: &str) {
        if let Some(round) = self.registrations.remove(username) {
            tracing::info!("lock round for {username} timed out, treating as denied");
            if let Some(client) = self.any_connection(round.client) {
                client.send_msg(&Message::RegisterFailed {
                    info: format!("registration of {username} timed out"),
                });
            }
            self.drop_connection(round.client);
        }
    }

    /// Every awaited peer has allowed the name: insert the record and
    /// wake the suspended client.
    fn commit_registration(&mut self, username: &str) {
        let Some(round) = self.registrations.remove(username) else {
            return;
        };
        self.users.register(username.to_owned(), round.secret);
        tracing::info!("lock round complete, registered {username}");
        if let Some(client) = self.any_connection(round.client) {
            client.send_msg(&Message::RegisterSuccess {
                info: format!("register success for {username}"),
            });
        }
    }

    // ---- gossip ----------------------------------------------------

    fn gossip(&mut self) {
        if self.peers.is_empty() {
            return;
        }
        let announce = Message::ServerAnnounce {
            id: self.config.id.clone(),
            hostname: self.config.hostname.clone(),
            port: self.config.port,
            load: self.clients.len() as u32,
            user_list: self.users.as_map().clone(),
            all_json_message: self.activity.entries().clone(),
        };
        let line = announce.encode();
        for peer in self.peers.values() {
            peer.send(&line);
        }
        tracing::debug!("announced to {} peers", self.peers.len());
    }

    #[allow(clippy::too_many_arguments)]
    fn on_server_announce(
        &mut self,
        sender: &Connection,
        id: String,
        hostname: String,
        port: u16,
        load: u32,
        user_list: &HashMap<String, String>,
        all_json_message: &std::collections::BTreeMap<String, String>,
    ) -> Disposition {
        if !self.peers.contains_key(&sender.id()) {
            sender.send_msg(&Message::invalid(info::UNAUTHENTICATED_SERVER));
            return Disposition::Close;
        }

        tracing::debug!("announce from {id} ({hostname}:{port}), load {load}");
        self.directory.upsert(&id, &hostname, port, load);
        self.users.merge(user_list);
        self.activity.merge(all_json_message);
        Disposition::KeepOpen
    }

    // ---- activity routing -----------------------------------------

    fn on_activity_message(
        &mut self,
        sender: &Connection,
        username: Option<String>,
        secret: Option<String>,
        activity: Option<streamcast_core::Activity>,
    ) -> Disposition {
        let (Some(username), Some(secret)) = (username, secret) else {
            sender.send_msg(&Message::invalid("message must contain username and secret"));
            return Disposition::KeepOpen;
        };
        let Some(activity) = activity else {
            sender.send_msg(&Message::invalid("message must contain field activity"));
            return Disposition::KeepOpen;
        };

        if username != ANONYMOUS_USERNAME && !self.users.verify(&username, &secret) {
            tracing::info!("activity rejected for {username}: bad credentials");
            sender.send_msg(&Message::invalid("client auth failed"));
            return Disposition::Close;
        }

        let broadcast = Message::ActivityBroadcast {
            actor: username.clone(),
            object: activity.object,
        };
        let line = broadcast.encode();
        self.activity
            .record(activity_key(&username, now_millis()), line.clone());

        self.fan_out(&line, sender.id());
        Disposition::KeepOpen
    }

    fn on_activity_broadcast(
        &mut self,
        sender: &Connection,
        actor: String,
        object: String,
    ) -> Disposition {
        let line = Message::ActivityBroadcast { actor, object }.encode();
        self.fan_out(&line, sender.id());
        Disposition::KeepOpen
    }

    /// Deliver to every local client and every peer except the
    /// connection the message arrived on. Skipping the origin is the
    /// mesh's only loop prevention; it is sound for the one-hop
    /// topologies this server targets.
    fn fan_out(&self, line: &str, origin: ConnId) {
        for (id, client) in &self.clients {
            if *id != origin {
                client.send(line);
            }
        }
        for (id, peer) in &self.peers {
            if *id != origin {
                peer.send(line);
            }
        }
    }

    fn on_request_all(
        &mut self,
        sender: &Connection,
        username: Option<String>,
        secret: Option<String>,
    ) -> Disposition {
        let (Some(username), Some(secret)) = (username, secret) else {
            sender.send_msg(&Message::invalid("message must contain username and secret"));
            return Disposition::KeepOpen;
        };
        if username != ANONYMOUS_USERNAME && !self.users.verify(&username, &secret) {
            sender.send_msg(&Message::invalid("client auth failed"));
            return Disposition::Close;
        }

        tracing::info!("replaying {} activity records to {username}", self.activity.len());
        sender.send_msg(&Message::RequestAll {
            username: None,
            secret: None,
            all_activity_message: Some(self.activity.entries().clone()),
        });
        Disposition::KeepOpen
    }

    // ---- lifecycle -------------------------------------------------

    fn on_invalid_message(&mut self, received_info: &str) -> Disposition {
        tracing::info!("received invalid-message notice: {received_info}");
        // These two mean the far end will not talk to us on this link.
        if received_info == info::UNAUTHENTICATED_SERVER
            || received_info == info::REPEATED_AUTHENTICATION
        {
            Disposition::Close
        } else {
            Disposition::KeepOpen
        }
    }

    /// Remove a connection from every registry and close it. Peer
    /// removals also settle any lock rounds that were waiting on that
    /// peer; its approval is no longer required.
    fn drop_connection(&mut self, id: ConnId) {
        let was_peer = self.peers.remove(&id);
        let conn = self
            .pending
            .remove(&id)
            .or(was_peer.clone())
            .or_else(|| self.clients.remove(&id));

        if was_peer.is_some() {
            let mut settled = Vec::new();
            for (username, round) in &mut self.registrations {
                round.awaiting.remove(&id);
                if round.awaiting.is_empty() {
                    settled.push(username.clone());
                }
            }
            for username in settled {
                self.commit_registration(&username);
            }
        }

        // Rounds whose suspended client is gone have no one to answer.
        self.registrations.retain(|_, round| round.client != id);

        if let Some(conn) = conn {
            tracing::debug!("connection {} removed", conn.addr());
            conn.close();
        }
    }

    fn any_connection(&self, id: ConnId) -> Option<Connection> {
        self.pending
            .get(&id)
            .or_else(|| self.peers.get(&id))
            .or_else(|| self.clients.get(&id))
            .cloned()
    }
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Outbound;
    use std::net::SocketAddr;
    use std::time::Duration;

    fn test_config() -> ServerConfig {
        ServerConfig {
            port: 3780,
            hostname: "localhost".into(),
            id: "node-test".into(),
            secret: "mesh".into(),
            remote: None,
            max_clients: 16,
            max_peers: 50,
            gossip_interval: Duration::from_secs(5),
            lock_timeout: Duration::from_secs(5),
        }
    }

    fn coordinator(config: ServerConfig) -> (Coordinator, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Coordinator::new(config, tx), rx)
    }

    fn attach(coord: &mut Coordinator) -> (Connection, mpsc::UnboundedReceiver<Outbound>) {
        let addr: SocketAddr = "127.0.0.1:49152".parse().unwrap();
        let (conn, rx) = Connection::channel(addr);
        coord.handle(Event::Accepted(conn.clone()));
        (conn, rx)
    }

    fn feed(coord: &mut Coordinator, conn: &Connection, line: &str) {
        coord.handle(Event::Line {
            conn: conn.id(),
            line: line.to_owned(),
        });
    }

    fn next_msg(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Message {
        match rx.try_recv().expect("expected an outbound message") {
            Outbound::Line(line) => decode(&line).expect("outbound line must decode"),
            Outbound::Close => panic!("expected a message, got close"),
        }
    }

    fn expect_close(rx: &mut mpsc::UnboundedReceiver<Outbound>) {
        match rx.try_recv().expect("expected a close") {
            Outbound::Close => {}
            Outbound::Line(line) => panic!("expected close, got line: {line}"),
        }
    }

    fn assert_idle(rx: &mut mpsc::UnboundedReceiver<Outbound>) {
        assert!(rx.try_recv().is_err(), "expected no outbound traffic");
    }

    fn attach_peer(coord: &mut Coordinator) -> (Connection, mpsc::UnboundedReceiver<Outbound>) {
        let (conn, mut rx) = attach(coord);
        feed(coord, &conn, r#"{"command":"AUTHENTICATE","secret":"mesh"}"#);
        assert_idle(&mut rx); // success is silent
        (conn, rx)
    }

    fn attach_anonymous_client(
        coord: &mut Coordinator,
    ) -> (Connection, mpsc::UnboundedReceiver<Outbound>) {
        let (conn, mut rx) = attach(coord);
        feed(
            coord,
            &conn,
            r#"{"command":"LOGIN","username":"anonymous","secret":""}"#,
        );
        assert!(matches!(next_msg(&mut rx), Message::LoginSuccess { .. }));
        (conn, rx)
    }

    // -- handshake ---------------------------------------------------

    #[test]
    fn authenticate_with_wrong_secret_fails_and_closes() {
        let (mut coord, _events) = coordinator(test_config());
        let (conn, mut rx) = attach(&mut coord);
        feed(&mut coord, &conn, r#"{"command":"AUTHENTICATE","secret":"wrong"}"#);
        assert!(matches!(next_msg(&mut rx), Message::AuthenticationFail { .. }));
        expect_close(&mut rx);
        assert!(coord.peers.is_empty());
    }

    #[test]
    fn authenticate_without_secret_fails() {
        let (mut coord, _events) = coordinator(test_config());
        let (conn, mut rx) = attach(&mut coord);
        feed(&mut coord, &conn, r#"{"command":"AUTHENTICATE"}"#);
        assert!(matches!(next_msg(&mut rx), Message::AuthenticationFail { .. }));
        expect_close(&mut rx);
    }

    #[test]
    fn peer_ceiling_is_enforced() {
        let mut config = test_config();
        config.max_peers = 2;
        let (mut coord, _events) = coordinator(config);

        let (_p1, _rx1) = attach_peer(&mut coord);
        let (_p2, _rx2) = attach_peer(&mut coord);
        assert_eq!(coord.peers.len(), 2);

        let (extra, mut rx3) = attach(&mut coord);
        feed(&mut coord, &extra, r#"{"command":"AUTHENTICATE","secret":"mesh"}"#);
        assert!(matches!(next_msg(&mut rx3), Message::AuthenticationFail { .. }));
        expect_close(&mut rx3);
        assert_eq!(coord.peers.len(), 2);
    }

    #[test]
    fn repeated_handshake_is_rejected() {
        let (mut coord, _events) = coordinator(test_config());
        let (peer, mut rx) = attach_peer(&mut coord);
        feed(&mut coord, &peer, r#"{"command":"AUTHENTICATE","secret":"mesh"}"#);
        match next_msg(&mut rx) {
            Message::AuthenticationFail { info } => {
                assert_eq!(info, info::REPEATED_AUTHENTICATION)
            }
            other => panic!("unexpected reply: {other:?}"),
        }
        expect_close(&mut rx);
    }

    #[test]
    fn authentication_fail_drops_the_peer_link() {
        let (mut coord, _events) = coordinator(test_config());
        let addr: SocketAddr = "127.0.0.1:49153".parse().unwrap();
        let (conn, mut rx) = Connection::channel(addr);
        coord.handle(Event::Dialed(conn.clone()));
        assert_eq!(coord.peers.len(), 1);

        feed(
            &mut coord,
            &conn,
            r#"{"command":"AUTHENTICATION_FAIL","info":"the supplied secret is incorrect"}"#,
        );
        expect_close(&mut rx);
        assert!(coord.peers.is_empty());
    }

    // -- login and admission ----------------------------------------

    #[test]
    fn anonymous_login_bypasses_secret_check() {
        let (mut coord, _events) = coordinator(test_config());
        let (_c, _rx) = attach_anonymous_client(&mut coord);
        assert_eq!(coord.clients.len(), 1);
    }

    #[test]
    fn login_unknown_user_fails_and_closes() {
        let (mut coord, _events) = coordinator(test_config());
        let (conn, mut rx) = attach(&mut coord);
        feed(
            &mut coord,
            &conn,
            r#"{"command":"LOGIN","username":"nobody","secret":"pw"}"#,
        );
        assert!(matches!(next_msg(&mut rx), Message::LoginFailed { .. }));
        expect_close(&mut rx);
    }

    #[test]
    fn login_missing_fields_fails() {
        let (mut coord, _events) = coordinator(test_config());
        let (conn, mut rx) = attach(&mut coord);
        feed(&mut coord, &conn, r#"{"command":"LOGIN","username":"alice"}"#);
        assert!(matches!(next_msg(&mut rx), Message::LoginFailed { .. }));
        expect_close(&mut rx);
    }

    #[test]
    fn capacity_overflow_redirects_to_least_loaded_peer() {
        let mut config = test_config();
        config.max_clients = 1;
        let (mut coord, _events) = coordinator(config);

        let (peer, _prx) = attach_peer(&mut coord);
        feed(
            &mut coord,
            &peer,
            r#"{"command":"SERVER_ANNOUNCE","id":"node-b","hostname":"b.example","port":3781,"load":5,"userList":{},"allJSONMessage":{}}"#,
        );
        feed(
            &mut coord,
            &peer,
            r#"{"command":"SERVER_ANNOUNCE","id":"node-c","hostname":"c.example","port":3782,"load":1,"userList":{},"allJSONMessage":{}}"#,
        );

        // First login fills the single slot.
        let (_c1, _rx1) = attach_anonymous_client(&mut coord);

        // Second gets redirected to the lighter peer, link stays open.
        let (c2, mut rx2) = attach(&mut coord);
        feed(
            &mut coord,
            &c2,
            r#"{"command":"LOGIN","username":"anonymous","secret":""}"#,
        );
        match next_msg(&mut rx2) {
            Message::Redirect { host, port, id } => {
                assert_eq!(host, "c.example");
                assert_eq!(port, 3782);
                assert_eq!(id, "node-c");
            }
            other => panic!("expected redirect, got {other:?}"),
        }
        assert_idle(&mut rx2);
        assert_eq!(coord.clients.len(), 1);
    }

    #[test]
    fn capacity_overflow_without_peers_fails_but_stays_open() {
        let mut config = test_config();
        config.max_clients = 1;
        let (mut coord, _events) = coordinator(config);

        let (_c1, _rx1) = attach_anonymous_client(&mut coord);

        let (c2, mut rx2) = attach(&mut coord);
        feed(
            &mut coord,
            &c2,
            r#"{"command":"LOGIN","username":"anonymous","secret":""}"#,
        );
        assert!(matches!(next_msg(&mut rx2), Message::LoginFailed { .. }));
        assert_idle(&mut rx2);
        assert!(!c2.is_closed());
    }

    #[test]
    fn login_accepts_gossiped_user() {
        let (mut coord, _events) = coordinator(test_config());
        let (peer, _prx) = attach_peer(&mut coord);
        feed(
            &mut coord,
            &peer,
            r#"{"command":"SERVER_ANNOUNCE","id":"node-b","hostname":"b.example","port":3781,"load":0,"userList":{"gina":"pw-g"},"allJSONMessage":{}}"#,
        );

        let (conn, mut rx) = attach(&mut coord);
        feed(
            &mut coord,
            &conn,
            r#"{"command":"LOGIN","username":"gina","secret":"pw-g"}"#,
        );
        assert!(matches!(next_msg(&mut rx), Message::LoginSuccess { .. }));
    }

    #[test]
    fn client_authenticate_known_and_unknown_user() {
        let (mut coord, _events) = coordinator(test_config());
        coord.users.register("alice", "pw");

        let (known, mut krx) = attach(&mut coord);
        feed(
            &mut coord,
            &known,
            r#"{"command":"CLIENT_AUTHENTICATE","username":"alice","secret":"pw","id":"node-b"}"#,
        );
        assert!(matches!(next_msg(&mut krx), Message::LoginSuccess { .. }));
        assert_eq!(coord.clients.len(), 1);

        let (unknown, mut urx) = attach(&mut coord);
        feed(
            &mut coord,
            &unknown,
            r#"{"command":"CLIENT_AUTHENTICATE","username":"mallory","secret":"pw","id":"node-b"}"#,
        );
        assert!(matches!(next_msg(&mut urx), Message::LoginFailed { .. }));
        expect_close(&mut urx);
    }

    // -- registration -----------------------------------------------

    #[tokio::test]
    async fn single_node_registration_is_exclusive() {
        let (mut coord, _events) = coordinator(test_config());

        let (c1, mut rx1) = attach(&mut coord);
        feed(
            &mut coord,
            &c1,
            r#"{"command":"REGISTER","username":"alice","secret":"pw"}"#,
        );
        assert!(matches!(next_msg(&mut rx1), Message::RegisterSuccess { .. }));

        let (c2, mut rx2) = attach(&mut coord);
        feed(
            &mut coord,
            &c2,
            r#"{"command":"REGISTER","username":"alice","secret":"other"}"#,
        );
        assert!(matches!(next_msg(&mut rx2), Message::RegisterFailed { .. }));
        assert!(coord.users.verify("alice", "pw"));
    }

    #[tokio::test]
    async fn anonymous_cannot_be_registered() {
        let (mut coord, _events) = coordinator(test_config());
        let (conn, mut rx) = attach(&mut coord);
        feed(
            &mut coord,
            &conn,
            r#"{"command":"REGISTER","username":"anonymous","secret":"pw"}"#,
        );
        assert!(matches!(next_msg(&mut rx), Message::RegisterFailed { .. }));
    }

    #[tokio::test]
    async fn lock_round_commits_on_allowed() {
        let (mut coord, _events) = coordinator(test_config());
        let (peer, mut prx) = attach_peer(&mut coord);

        let (client, mut crx) = attach(&mut coord);
        feed(
            &mut coord,
            &client,
            r#"{"command":"REGISTER","username":"carol","secret":"pw"}"#,
        );
        // No reply to the client yet; the request went to the peer.
        assert_idle(&mut crx);
        match next_msg(&mut prx) {
            Message::LockRequest {
                username,
                original_server,
                ..
            } => {
                assert_eq!(username, "carol");
                assert_eq!(original_server, "localhost:3780");
            }
            other => panic!("expected lock request, got {other:?}"),
        }

        feed(
            &mut coord,
            &peer,
            r#"{"command":"LOCK_ALLOWED","username":"carol","secret":"pw","originalServer":"localhost:3780"}"#,
        );
        assert!(matches!(next_msg(&mut crx), Message::RegisterSuccess { .. }));
        assert!(coord.users.verify("carol", "pw"));
        assert!(coord.registrations.is_empty());
    }

    #[tokio::test]
    async fn lock_round_fails_on_denied() {
        let (mut coord, _events) = coordinator(test_config());
        let (peer, _prx) = attach_peer(&mut coord);

        let (client, mut crx) = attach(&mut coord);
        feed(
            &mut coord,
            &client,
            r#"{"command":"REGISTER","username":"carol","secret":"pw"}"#,
        );

        feed(
            &mut coord,
            &peer,
            r#"{"command":"LOCK_DENIED","username":"carol","secret":"pw","originalServer":"localhost:3780"}"#,
        );
        assert!(matches!(next_msg(&mut crx), Message::RegisterFailed { .. }));
        expect_close(&mut crx);
        assert!(!coord.users.contains("carol"));
        assert!(coord.registrations.is_empty());
    }

    #[tokio::test]
    async fn lock_round_requires_every_peer() {
        let (mut coord, _events) = coordinator(test_config());
        let (p1, _rx1) = attach_peer(&mut coord);
        let (p2, _rx2) = attach_peer(&mut coord);

        let (client, mut crx) = attach(&mut coord);
        feed(
            &mut coord,
            &client,
            r#"{"command":"REGISTER","username":"carol","secret":"pw"}"#,
        );

        feed(
            &mut coord,
            &p1,
            r#"{"command":"LOCK_ALLOWED","username":"carol","secret":"pw","originalServer":"localhost:3780"}"#,
        );
        // One approval is not enough.
        assert_idle(&mut crx);
        assert!(!coord.users.contains("carol"));

        feed(
            &mut coord,
            &p2,
            r#"{"command":"LOCK_ALLOWED","username":"carol","secret":"pw","originalServer":"localhost:3780"}"#,
        );
        assert!(matches!(next_msg(&mut crx), Message::RegisterSuccess { .. }));
    }

    #[tokio::test]
    async fn peer_disconnect_settles_the_round() {
        let (mut coord, _events) = coordinator(test_config());
        let (p1, _rx1) = attach_peer(&mut coord);
        let (p2, _rx2) = attach_peer(&mut coord);

        let (client, mut crx) = attach(&mut coord);
        feed(
            &mut coord,
            &client,
            r#"{"command":"REGISTER","username":"carol","secret":"pw"}"#,
        );
        feed(
            &mut coord,
            &p1,
            r#"{"command":"LOCK_ALLOWED","username":"carol","secret":"pw","originalServer":"localhost:3780"}"#,
        );
        assert_idle(&mut crx);

        // The second peer vanishes; its approval is no longer needed.
        coord.handle(Event::Disconnected(p2.id()));
        assert!(matches!(next_msg(&mut crx), Message::RegisterSuccess { .. }));
    }

    #[tokio::test]
    async fn lock_timeout_counts_as_denied() {
        let (mut coord, _events) = coordinator(test_config());
        let (_peer, _prx) = attach_peer(&mut coord);

        let (client, mut crx) = attach(&mut coord);
        feed(
            &mut coord,
            &client,
            r#"{"command":"REGISTER","username":"carol","secret":"pw"}"#,
        );
        assert_idle(&mut crx);

        coord.handle(Event::LockTimeout {
            username: "carol".into(),
        });
        assert!(matches!(next_msg(&mut crx), Message::RegisterFailed { .. }));
        expect_close(&mut crx);
        assert!(!coord.users.contains("carol"));
    }

    #[tokio::test]
    async fn late_allowed_after_timeout_is_ignored() {
        let (mut coord, _events) = coordinator(test_config());
        let (peer, _prx) = attach_peer(&mut coord);

        let (client, mut crx) = attach(&mut coord);
        feed(
            &mut coord,
            &client,
            r#"{"command":"REGISTER","username":"carol","secret":"pw"}"#,
        );
        coord.handle(Event::LockTimeout {
            username: "carol".into(),
        });
        assert!(matches!(next_msg(&mut crx), Message::RegisterFailed { .. }));

        feed(
            &mut coord,
            &peer,
            r#"{"command":"LOCK_ALLOWED","username":"carol","secret":"pw","originalServer":"localhost:3780"}"#,
        );
        assert!(!coord.users.contains("carol"));
    }

    #[test]
    fn lock_request_answers_on_the_same_link() {
        let (mut coord, _events) = coordinator(test_config());
        coord.users.register("taken", "pw");
        let (peer, mut prx) = attach_peer(&mut coord);

        feed(
            &mut coord,
            &peer,
            r#"{"command":"LOCK_REQUEST","username":"taken","secret":"pw","originalServer":"b.example:3781"}"#,
        );
        assert!(matches!(next_msg(&mut prx), Message::LockDenied { .. }));

        feed(
            &mut coord,
            &peer,
            r#"{"command":"LOCK_REQUEST","username":"free","secret":"pw","originalServer":"b.example:3781"}"#,
        );
        match next_msg(&mut prx) {
            Message::LockAllowed {
                username,
                original_server,
                ..
            } => {
                assert_eq!(username, "free");
                assert_eq!(original_server, "b.example:3781");
            }
            other => panic!("expected lock allowed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn lock_verdicts_from_non_peers_are_rejected() {
        let (mut coord, _events) = coordinator(test_config());
        let (_peer, _prx) = attach_peer(&mut coord);

        let (client, mut crx) = attach(&mut coord);
        feed(
            &mut coord,
            &client,
            r#"{"command":"REGISTER","username":"carol","secret":"pw"}"#,
        );
        assert_idle(&mut crx);

        // A stranger's denial must not abort the round.
        let (stranger, mut srx) = attach(&mut coord);
        feed(
            &mut coord,
            &stranger,
            r#"{"command":"LOCK_DENIED","username":"carol","secret":"pw","originalServer":"localhost:3780"}"#,
        );
        match next_msg(&mut srx) {
            Message::InvalidMessage { info } => {
                assert_eq!(info, info::UNAUTHENTICATED_SERVER)
            }
            other => panic!("unexpected reply: {other:?}"),
        }
        expect_close(&mut srx);
        assert_idle(&mut crx);
        assert!(coord.registrations.contains_key("carol"));

        // Nor can a stranger's approval settle it.
        let (forger, mut frx) = attach(&mut coord);
        feed(
            &mut coord,
            &forger,
            r#"{"command":"LOCK_ALLOWED","username":"carol","secret":"pw","originalServer":"localhost:3780"}"#,
        );
        match next_msg(&mut frx) {
            Message::InvalidMessage { info } => {
                assert_eq!(info, info::UNAUTHENTICATED_SERVER)
            }
            other => panic!("unexpected reply: {other:?}"),
        }
        expect_close(&mut frx);
        assert_idle(&mut crx);
        assert!(!coord.users.contains("carol"));
    }

    #[tokio::test]
    async fn register_commits_when_no_peer_is_reachable() {
        let (mut coord, _events) = coordinator(test_config());
        let (peer, _prx) = attach_peer(&mut coord);
        // The peer socket dies before the round starts; the reader has
        // not yet reported the disconnect.
        peer.close();

        let (client, mut crx) = attach(&mut coord);
        feed(
            &mut coord,
            &client,
            r#"{"command":"REGISTER","username":"carol","secret":"pw"}"#,
        );
        assert!(matches!(next_msg(&mut crx), Message::RegisterSuccess { .. }));
        assert!(coord.users.verify("carol", "pw"));
        assert!(coord.registrations.is_empty());
    }

    #[test]
    fn lock_request_from_non_peer_is_rejected() {
        let (mut coord, _events) = coordinator(test_config());
        let (conn, mut rx) = attach(&mut coord);
        feed(
            &mut coord,
            &conn,
            r#"{"command":"LOCK_REQUEST","username":"x","secret":"pw","originalServer":"b.example:3781"}"#,
        );
        match next_msg(&mut rx) {
            Message::InvalidMessage { info } => {
                assert_eq!(info, info::UNAUTHENTICATED_SERVER)
            }
            other => panic!("unexpected reply: {other:?}"),
        }
        expect_close(&mut rx);
    }

    // -- gossip ------------------------------------------------------

    #[test]
    fn gossip_announces_load_and_state() {
        let (mut coord, _events) = coordinator(test_config());
        coord.users.register("alice", "pw");
        let (_client, _crx) = attach_anonymous_client(&mut coord);
        let (_peer, mut prx) = attach_peer(&mut coord);

        coord.handle(Event::GossipTick);
        match next_msg(&mut prx) {
            Message::ServerAnnounce {
                id,
                hostname,
                port,
                load,
                user_list,
                ..
            } => {
                assert_eq!(id, "node-test");
                assert_eq!(hostname, "localhost");
                assert_eq!(port, 3780);
                assert_eq!(load, 1);
                assert_eq!(user_list["alice"], "pw");
            }
            other => panic!("expected announce, got {other:?}"),
        }
    }

    #[test]
    fn announce_from_non_peer_is_rejected() {
        let (mut coord, _events) = coordinator(test_config());
        let (conn, mut rx) = attach(&mut coord);
        feed(
            &mut coord,
            &conn,
            r#"{"command":"SERVER_ANNOUNCE","id":"node-b","hostname":"b.example","port":3781,"load":0,"userList":{},"allJSONMessage":{}}"#,
        );
        match next_msg(&mut rx) {
            Message::InvalidMessage { info } => {
                assert_eq!(info, info::UNAUTHENTICATED_SERVER)
            }
            other => panic!("unexpected reply: {other:?}"),
        }
        expect_close(&mut rx);
        assert!(coord.directory.is_empty());
    }

    #[test]
    fn applying_the_same_announce_twice_is_idempotent() {
        let (mut coord, _events) = coordinator(test_config());
        let (peer, _prx) = attach_peer(&mut coord);
        let announce = r#"{"command":"SERVER_ANNOUNCE","id":"node-b","hostname":"b.example","port":3781,"load":2,"userList":{"alice":"pw"},"allJSONMessage":{"alice,1":"{}"}}"#;

        feed(&mut coord, &peer, announce);
        let users_once = coord.users.as_map().clone();
        let activity_once = coord.activity.entries().clone();

        feed(&mut coord, &peer, announce);
        assert_eq!(coord.users.as_map(), &users_once);
        assert_eq!(coord.activity.entries(), &activity_once);
        assert_eq!(coord.directory.len(), 1);
    }

    // -- activity routing -------------------------------------------

    #[test]
    fn activity_fans_out_without_echo() {
        let (mut coord, _events) = coordinator(test_config());
        let (c1, mut rx1) = attach_anonymous_client(&mut coord);
        let (_c2, mut rx2) = attach_anonymous_client(&mut coord);
        let (_peer, mut prx) = attach_peer(&mut coord);

        feed(
            &mut coord,
            &c1,
            r#"{"command":"ACTIVITY_MESSAGE","username":"anonymous","secret":"","activity":{"object":"hello mesh"}}"#,
        );

        for rx in [&mut rx2, &mut prx] {
            match next_msg(rx) {
                Message::ActivityBroadcast { actor, object } => {
                    assert_eq!(actor, "anonymous");
                    assert_eq!(object, "hello mesh");
                }
                other => panic!("expected broadcast, got {other:?}"),
            }
        }
        // Never echoed to the origin.
        assert_idle(&mut rx1);
        assert_eq!(coord.activity.len(), 1);
    }

    #[test]
    fn peer_broadcast_is_forwarded_to_clients_and_other_peers() {
        let (mut coord, _events) = coordinator(test_config());
        let (p1, mut rx1) = attach_peer(&mut coord);
        let (_p2, mut rx2) = attach_peer(&mut coord);
        let (_client, mut crx) = attach_anonymous_client(&mut coord);

        feed(
            &mut coord,
            &p1,
            r#"{"command":"ACTIVITY_BROADCAST","actor":"alice","object":"from afar"}"#,
        );
        assert!(matches!(next_msg(&mut crx), Message::ActivityBroadcast { .. }));
        assert!(matches!(next_msg(&mut rx2), Message::ActivityBroadcast { .. }));
        assert_idle(&mut rx1);
        // Forwarded broadcasts are not re-logged; the log converges by
        // gossip from the origin server.
        assert_eq!(coord.activity.len(), 0);
    }

    #[test]
    fn activity_with_bad_credentials_is_rejected() {
        let (mut coord, _events) = coordinator(test_config());
        coord.users.register("alice", "pw");
        let (conn, mut rx) = attach_anonymous_client(&mut coord);

        feed(
            &mut coord,
            &conn,
            r#"{"command":"ACTIVITY_MESSAGE","username":"alice","secret":"wrong","activity":{"object":"hi"}}"#,
        );
        assert!(matches!(next_msg(&mut rx), Message::InvalidMessage { .. }));
        expect_close(&mut rx);
        assert_eq!(coord.activity.len(), 0);
    }

    #[test]
    fn request_all_replays_the_log() {
        let (mut coord, _events) = coordinator(test_config());
        let (c1, mut rx1) = attach_anonymous_client(&mut coord);
        feed(
            &mut coord,
            &c1,
            r#"{"command":"ACTIVITY_MESSAGE","username":"anonymous","secret":"","activity":{"object":"for the record"}}"#,
        );

        feed(
            &mut coord,
            &c1,
            r#"{"command":"REQUEST_ALL","username":"anonymous","secret":""}"#,
        );
        match next_msg(&mut rx1) {
            Message::RequestAll {
                all_activity_message: Some(log),
                ..
            } => {
                assert_eq!(log.len(), 1);
                let payload = log.values().next().unwrap();
                assert!(payload.contains("for the record"));
            }
            other => panic!("expected replay, got {other:?}"),
        }
        assert_idle(&mut rx1);
    }

    // -- malformed input and lifecycle ------------------------------

    #[test]
    fn malformed_line_gets_one_invalid_message_and_stays_open() {
        let (mut coord, _events) = coordinator(test_config());
        let (conn, mut rx) = attach_anonymous_client(&mut coord);

        feed(&mut coord, &conn, "this is not json");
        assert!(matches!(next_msg(&mut rx), Message::InvalidMessage { .. }));
        assert_idle(&mut rx);
        assert!(!conn.is_closed());
        assert_eq!(coord.clients.len(), 1);
        assert!(coord.users.is_empty());

        feed(&mut coord, &conn, r#"{"username":"alice"}"#);
        assert!(matches!(next_msg(&mut rx), Message::InvalidMessage { .. }));
        assert_idle(&mut rx);
        assert!(!conn.is_closed());
    }

    #[test]
    fn unknown_command_closes_the_connection() {
        let (mut coord, _events) = coordinator(test_config());
        let (conn, mut rx) = attach(&mut coord);
        feed(&mut coord, &conn, r#"{"command":"FROBNICATE"}"#);
        match next_msg(&mut rx) {
            Message::InvalidMessage { info } => assert!(info.contains("unknown command")),
            other => panic!("unexpected reply: {other:?}"),
        }
        expect_close(&mut rx);
    }

    #[test]
    fn logout_removes_the_client() {
        let (mut coord, _events) = coordinator(test_config());
        let (conn, mut rx) = attach_anonymous_client(&mut coord);
        feed(
            &mut coord,
            &conn,
            r#"{"command":"LOGOUT","username":"anonymous","secret":""}"#,
        );
        expect_close(&mut rx);
        assert!(coord.clients.is_empty());
    }

    #[test]
    fn disconnect_cleans_registries_but_keeps_directory() {
        let (mut coord, _events) = coordinator(test_config());
        let (peer, _prx) = attach_peer(&mut coord);
        feed(
            &mut coord,
            &peer,
            r#"{"command":"SERVER_ANNOUNCE","id":"node-b","hostname":"b.example","port":3781,"load":0,"userList":{},"allJSONMessage":{}}"#,
        );
        assert_eq!(coord.directory.len(), 1);

        coord.handle(Event::Disconnected(peer.id()));
        assert!(coord.peers.is_empty());
        // The directory remembers the peer even without a live socket.
        assert_eq!(coord.directory.len(), 1);
    }

    #[test]
    fn shutdown_closes_everything() {
        let (mut coord, _events) = coordinator(test_config());
        let (client, mut crx) = attach_anonymous_client(&mut coord);
        let (peer, mut prx) = attach_peer(&mut coord);

        assert!(!coord.handle(Event::Shutdown));
        expect_close(&mut crx);
        expect_close(&mut prx);
        assert!(client.is_closed());
        assert!(peer.is_closed());
    }
}
