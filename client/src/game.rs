use crate::input::Command;
use crate::session::Session;
use log::{debug, info, warn};
use shared::{
    ClassInfo, ClassRef, ClassRegistry, ClientId, ClientPacket, Object, ObjectId,
    ObjectRecord, PackageLoader, Placement, RosterEntry, RttEntry, ServerEntry, ServerPacket,
    Spawn, Table, Vec2, MAX_NICK_LEN, PROTOCOL_VERSION,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// Largest class file accepted from the server
pub const MAX_CLASS_FILE: u32 = 1024 * 1024;

/// How many alternative nicks are tried after the first one is taken
pub const NICK_RETRIES: u8 = 5;

/// Another client as this client knows it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub nick: String,
    pub rtt_ms: u16,
}

/// Something the user should hear about after a server packet was applied
#[derive(Debug, Clone, PartialEq)]
pub enum TableEvent {
    Joined { client: ClientId, objects: usize },
    NickTaken { nick: String },
    PeerJoined { client: ClientId },
    PeerLeft { client: ClientId, nick: Option<String> },
    Created { from: ClientId, ids: Vec<ObjectId> },
    Selected { from: ClientId, ids: Vec<ObjectId> },
    Removed { from: ClientId, ids: Vec<ObjectId> },
    Moved { from: ClientId, ids: Vec<ObjectId> },
    Flipped { from: ClientId, ids: Vec<ObjectId> },
    Owned {
        from: ClientId,
        owner: Option<ClientId>,
        ids: Vec<ObjectId>,
    },
    Shuffled { from: ClientId, count: usize },
    Rotated {
        from: ClientId,
        steps: i8,
        ids: Vec<ObjectId>,
    },
    Chat { from: ClientId, text: String },
    Rolled {
        from: ClientId,
        sides: u8,
        results: Vec<u8>,
    },
    Login { granted: bool },
    Kicked { from: ClientId, target: ClientId },
    ClassLoaded { class: ClassRef, objects: usize },
    ClassUnavailable { class: ClassRef },
    /// A telemetry stamp that should be echoed back
    Stream { stamp: u32 },
    Directory { servers: Vec<ServerEntry> },
}

#[derive(Debug)]
struct Download {
    total: usize,
    data: Vec<u8>,
}

/// The client's mirror of the server table
///
/// The mirror never changes on its own: every mutation comes from a server
/// effect passed to [`ClientGameState::apply`], so it stays identical to the
/// server as long as effects are applied in arrival order.
pub struct ClientGameState {
    session: Session,
    nick: String,
    base_nick: String,
    nick_attempts: u8,
    me: Option<ClientId>,
    is_admin: bool,
    table: Table,
    registry: ClassRegistry,
    loader: Box<dyn PackageLoader>,
    placeholder: Arc<ClassInfo>,
    roster: BTreeMap<ClientId, Member>,
    downloads: HashMap<ClassRef, Download>,
    requested: HashSet<ClassRef>,
    requests: Vec<ClientPacket>,
}

impl ClientGameState {
    pub fn new(nick: impl Into<String>, loader: Box<dyn PackageLoader>) -> Self {
        let nick = nick.into();
        Self {
            session: Session::new(),
            base_nick: nick.clone(),
            nick,
            nick_attempts: 0,
            me: None,
            is_admin: false,
            table: Table::new(),
            registry: ClassRegistry::new(),
            loader,
            placeholder: Arc::new(ClassInfo::placeholder()),
            roster: BTreeMap::new(),
            downloads: HashMap::new(),
            requested: HashSet::new(),
            requests: Vec::new(),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    pub fn nick(&self) -> &str {
        &self.nick
    }

    /// Our own client id once joined
    pub fn me(&self) -> Option<ClientId> {
        self.me
    }

    pub fn is_admin(&self) -> bool {
        self.is_admin
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    pub fn roster(&self) -> &BTreeMap<ClientId, Member> {
        &self.roster
    }

    pub fn nick_of(&self, client: ClientId) -> Option<&str> {
        self.roster.get(&client).map(|m| m.nick.as_str())
    }

    pub fn handshake_packet(&self) -> ClientPacket {
        ClientPacket::Handshake {
            version: PROTOCOL_VERSION,
            nick: self.nick.clone(),
        }
    }

    /// Picks the next nick after a refusal, giving up after [`NICK_RETRIES`]
    pub fn retry_nick(&mut self) -> Option<ClientPacket> {
        if self.nick_attempts >= NICK_RETRIES {
            return None;
        }
        self.nick_attempts += 1;
        let suffix = self.nick_attempts.to_string();
        let mut base = self.base_nick.clone();
        while base.len() + suffix.len() > MAX_NICK_LEN {
            base.pop();
        }
        self.nick = format!("{}{}", base, suffix);
        Some(self.handshake_packet())
    }

    /// The datagram that registers our stream address
    pub fn stream_registration(&self) -> Option<ClientPacket> {
        self.stream_echo(0)
    }

    pub fn stream_echo(&self, stamp: u32) -> Option<ClientPacket> {
        self.me.map(|client| ClientPacket::PingStream { client, stamp })
    }

    /// Class requests queued while applying packets
    pub fn take_requests(&mut self) -> Vec<ClientPacket> {
        std::mem::take(&mut self.requests)
    }

    fn class_info(&mut self, class: &ClassRef) -> Arc<ClassInfo> {
        if let Some(info) = self.registry.get(class) {
            return info;
        }
        if self.requested.contains(class) {
            return self.placeholder.clone();
        }
        match self.registry.load(class, self.loader.as_ref()) {
            Ok(info) => info,
            Err(e) => {
                debug!("Class {} not available locally: {}", class, e);
                self.requested.insert(class.clone());
                self.requests.push(ClientPacket::PackageMissing {
                    package: class.package.clone(),
                    class: class.name.clone(),
                });
                self.placeholder.clone()
            }
        }
    }

    fn object_from(&mut self, record: &ObjectRecord) -> Object {
        let info = self.class_info(&record.class);
        Object::from_record(record, info)
    }

    /// Applies one server packet to the mirror
    pub fn apply(&mut self, packet: ServerPacket) -> Vec<TableEvent> {
        let header = packet.header();
        if !self.session.accepts(header) {
            debug!("Ignoring {:?} in state {:?}", header, self.session.state());
            return Vec::new();
        }

        match packet {
            ServerPacket::Handshake {
                client,
                clients,
                objects,
            } => self.handshake(client, clients, objects),
            ServerPacket::NickTaken { nick } => vec![TableEvent::NickTaken { nick }],
            ServerPacket::Join { client, nick } => {
                self.roster.insert(client, Member { nick, rtt_ms: 0 });
                vec![TableEvent::PeerJoined { client }]
            }
            ServerPacket::Leave { client } => {
                self.table.release_client(client);
                let nick = self.roster.remove(&client).map(|m| m.nick);
                vec![TableEvent::PeerLeft { client, nick }]
            }
            ServerPacket::Create { from, objects } => {
                let ids = objects.iter().map(|r| r.id).collect();
                let objects: Vec<Object> = objects.iter().map(|r| self.object_from(r)).collect();
                self.table.extend(objects);
                vec![TableEvent::Created { from, ids }]
            }
            ServerPacket::Select { from, ids } => {
                self.select(from, &ids);
                vec![TableEvent::Selected { from, ids }]
            }
            ServerPacket::Remove { from, ids } => {
                for &id in &ids {
                    self.table.remove(id);
                }
                vec![TableEvent::Removed { from, ids }]
            }
            ServerPacket::Move { from, moves } => {
                let ids = self.place(&moves);
                self.table.raise(&ids);
                vec![TableEvent::Moved { from, ids }]
            }
            ServerPacket::Flip { from, ids } => {
                for &id in &ids {
                    if let Some(object) = self.table.get_mut(id) {
                        object.toggle_flip();
                    }
                }
                self.table.raise(&ids);
                vec![TableEvent::Flipped { from, ids }]
            }
            ServerPacket::Own { from, owner, ids } => {
                for &id in &ids {
                    if let Some(object) = self.table.get_mut(id) {
                        object.own(owner);
                    }
                }
                self.table.raise(&ids);
                vec![TableEvent::Owned { from, owner, ids }]
            }
            ServerPacket::Shuffle {
                from,
                moves,
                draw_order,
            } => {
                self.place(&moves);
                if !self.table.set_draw_order(draw_order) {
                    warn!("Shuffle from client {} does not match the local table", from);
                    self.table.restack();
                }
                vec![TableEvent::Shuffled {
                    from,
                    count: moves.len(),
                }]
            }
            ServerPacket::Rotate { from, steps, ids } => {
                for &id in &ids {
                    if let Some(object) = self.table.get_mut(id) {
                        object.rotate(steps);
                    }
                }
                self.table.restack();
                vec![TableEvent::Rotated { from, steps, ids }]
            }
            ServerPacket::Chat { from, text } => vec![TableEvent::Chat { from, text }],
            ServerPacket::Roll {
                from,
                sides,
                results,
            } => vec![TableEvent::Rolled {
                from,
                sides,
                results,
            }],
            ServerPacket::Login { granted } => {
                self.is_admin |= granted;
                vec![TableEvent::Login { granted }]
            }
            ServerPacket::Kick { from, target } => vec![TableEvent::Kicked { from, target }],
            ServerPacket::PackageMissing { package, class } => {
                let class = ClassRef::new(package, class);
                self.downloads.remove(&class);
                warn!("Server has no class file for {}", class);
                vec![TableEvent::ClassUnavailable { class }]
            }
            ServerPacket::FileTransfer {
                package,
                class,
                offset,
                total,
                data,
            } => self.receive_chunk(ClassRef::new(package, class), offset, total, data),
            ServerPacket::PingStream { stamp, rtts } => {
                self.record_rtts(&rtts);
                vec![TableEvent::Stream { stamp }]
            }
            ServerPacket::DirectoryUpdate { servers } => vec![TableEvent::Directory { servers }],
        }
    }

    fn handshake(
        &mut self,
        client: ClientId,
        clients: Vec<RosterEntry>,
        objects: Vec<ObjectRecord>,
    ) -> Vec<TableEvent> {
        if let Err(e) = self.session.joined() {
            warn!("Unexpected handshake: {}", e);
            return Vec::new();
        }
        info!("Joined as client {} with nick {:?}", client, self.nick);
        self.me = Some(client);
        self.roster = clients
            .into_iter()
            .map(|entry| {
                (
                    entry.id,
                    Member {
                        nick: entry.nick,
                        rtt_ms: 0,
                    },
                )
            })
            .collect();

        self.table.clear();
        let objects: Vec<Object> = objects.iter().map(|r| self.object_from(r)).collect();
        let count = objects.len();
        self.table.extend(objects);
        vec![TableEvent::Joined {
            client,
            objects: count,
        }]
    }

    fn select(&mut self, from: ClientId, ids: &[ObjectId]) {
        let chosen: HashSet<ObjectId> = ids.iter().copied().collect();
        for id in self.table.selected_by(from) {
            if !chosen.contains(&id) {
                if let Some(object) = self.table.get_mut(id) {
                    object.select(None);
                }
            }
        }
        for &id in ids {
            if let Some(object) = self.table.get_mut(id) {
                object.select(Some(from));
            }
        }
        self.table.raise(ids);
        self.table.restack();
    }

    /// Sets locations without restacking; returns the ids that exist
    fn place(&mut self, moves: &[Placement]) -> Vec<ObjectId> {
        let mut placed = Vec::with_capacity(moves.len());
        for placement in moves {
            if let Some(object) = self.table.get_mut(placement.id) {
                object.set_location(placement.location);
                placed.push(placement.id);
            }
        }
        placed
    }

    fn record_rtts(&mut self, rtts: &[RttEntry]) {
        for entry in rtts {
            if let Some(member) = self.roster.get_mut(&entry.id) {
                member.rtt_ms = entry.rtt_ms;
            }
        }
    }

    fn receive_chunk(
        &mut self,
        class: ClassRef,
        offset: u32,
        total: u32,
        data: Vec<u8>,
    ) -> Vec<TableEvent> {
        if total > MAX_CLASS_FILE {
            warn!("Refusing {} byte class file for {}", total, class);
            self.downloads.remove(&class);
            return vec![TableEvent::ClassUnavailable { class }];
        }
        let total = total as usize;
        let download = self
            .downloads
            .entry(class.clone())
            .or_insert_with(|| Download {
                total,
                data: Vec::with_capacity(total),
            });
        if offset == 0 {
            download.total = total;
            download.data.clear();
        }
        if offset as usize != download.data.len() || download.total != total {
            warn!(
                "Out of order chunk for {} at offset {} (have {} bytes)",
                class,
                offset,
                download.data.len()
            );
            self.downloads.remove(&class);
            return Vec::new();
        }
        download.data.extend_from_slice(&data);
        if download.data.len() < total {
            return Vec::new();
        }

        let Some(download) = self.downloads.remove(&class) else {
            return Vec::new();
        };
        if download.data.len() > total {
            warn!("Class file for {} is longer than announced", class);
            return vec![TableEvent::ClassUnavailable { class }];
        }
        let parsed = String::from_utf8(download.data)
            .map_err(|e| e.to_string())
            .and_then(|text| {
                self.registry
                    .insert_text(&class, &text)
                    .map_err(|e| e.to_string())
            });
        match parsed {
            Ok(info) => {
                let updated = self.table.refresh_class(&class, info);
                debug!("Loaded {} for {} objects", class, updated.len());
                vec![TableEvent::ClassLoaded {
                    class,
                    objects: updated.len(),
                }]
            }
            Err(e) => {
                warn!("Class file for {} is unusable: {}", class, e);
                vec![TableEvent::ClassUnavailable { class }]
            }
        }
    }

    /// Object ids to act on: the given list, or our selection when it is empty
    fn targets(&self, ids: &[ObjectId]) -> Vec<ObjectId> {
        match (ids.is_empty(), self.me) {
            (false, _) => ids.to_vec(),
            (true, Some(me)) => self.table.selected_by(me),
            (true, None) => Vec::new(),
        }
    }

    fn non_empty(ids: Vec<ObjectId>) -> Option<Vec<ObjectId>> {
        (!ids.is_empty()).then_some(ids)
    }

    /// The packet a command translates into, if it is sent at all
    ///
    /// Local commands (`/table`, `/who`, `/script`, `/quit`) and commands with
    /// nothing to act on yield `None`.
    pub fn intent_for(&self, command: &Command) -> Option<ClientPacket> {
        let me = self.me?;
        let packet = match command {
            Command::Create {
                package,
                class,
                x,
                y,
                variant,
            } => ClientPacket::Create {
                spawns: vec![Spawn {
                    class: ClassRef::new(package.as_str(), class.as_str()),
                    variant: *variant,
                    location: Vec2::new(*x, *y),
                }],
            },
            Command::Select(ids) => ClientPacket::Select { ids: ids.clone() },
            Command::Grab { x, y } => ClientPacket::Select {
                ids: vec![self.table.topmost_at(Vec2::new(*x, *y))?],
            },
            Command::Deselect => ClientPacket::Select { ids: Vec::new() },
            Command::Move { dx, dy } => {
                let delta = Vec2::new(*dx, *dy);
                let moves: Vec<Placement> = self
                    .table
                    .selected_by(me)
                    .into_iter()
                    .filter_map(|id| self.table.get(id))
                    .map(|object| Placement {
                        id: object.id(),
                        location: (object.location() + delta).clamp_to_table(),
                    })
                    .collect();
                if moves.is_empty() {
                    return None;
                }
                ClientPacket::Move { moves }
            }
            Command::Flip(ids) => ClientPacket::Flip {
                ids: Self::non_empty(self.targets(ids))?,
            },
            Command::Own(ids) => ClientPacket::Own {
                take: true,
                ids: Self::non_empty(self.targets(ids))?,
            },
            Command::Disown(ids) => ClientPacket::Own {
                take: false,
                ids: Self::non_empty(self.targets(ids))?,
            },
            Command::Rotate { steps, ids } => ClientPacket::Rotate {
                steps: *steps,
                ids: Self::non_empty(self.targets(ids))?,
            },
            Command::Remove(ids) => ClientPacket::Remove {
                ids: Self::non_empty(self.targets(ids))?,
            },
            Command::Shuffle => ClientPacket::Shuffle,
            Command::Roll { count, sides } => ClientPacket::Roll {
                count: *count,
                sides: *sides,
            },
            Command::Login(password) => ClientPacket::Login {
                password: password.clone(),
            },
            Command::Kick(nick) => {
                let target = self
                    .roster
                    .iter()
                    .find(|(_, member)| member.nick.eq_ignore_ascii_case(nick))
                    .map(|(id, _)| *id)?;
                ClientPacket::Kick { target }
            }
            Command::Chat(text) => ClientPacket::Chat { text: text.clone() },
            Command::Script(_) | Command::Table | Command::Who | Command::Quit => return None,
        };
        Some(packet)
    }
}
