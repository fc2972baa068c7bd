//! Authoritative table state and packet dispatch
//!
//! `GameState` owns the table, the class registry and the peer roster. The
//! network loop feeds it decoded traffic and carries out the returned
//! [`Outbound`] actions; nothing here touches a socket.

use crate::client_manager::{ClientManager, JoinError};
use crate::config::Settings;
use crate::stream;
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use shared::{
    ClassRef, ClassRegistry, ClientId, ClientPacket, Object, ObjectId, ObjectRecord,
    PackageLoader, Placement, ServerEntry, ServerPacket, Spawn, Stack, Table, CLIENT_CAPACITY,
    MAX_NICK_LEN, PROTOCOL_VERSION,
};
use shared::transport::MAX_FRAME;
use std::collections::HashSet;
use std::net::SocketAddr;

/// Size of one `FileTransfer` chunk
pub const TRANSFER_CHUNK: usize = 1024;

/// Most spawns honoured from one `Create` request
pub const MAX_CREATE_BATCH: usize = 1024;

pub const MAX_DICE: u8 = 10;
pub const MIN_SIDES: u8 = 2;
pub const MAX_SIDES: u8 = 100;

/// An action for the network layer
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Reliable packet to one peer
    Send { to: ClientId, packet: ServerPacket },
    /// Reliable packet to every joined peer except `exclude`
    Broadcast {
        packet: ServerPacket,
        exclude: Option<ClientId>,
    },
    /// Tear down the transport of a peer the game state already dropped
    Close { client: ClientId },
}

/// Record bytes one snapshot packet may carry. The rest of the frame holds
/// the header, the counts and the roster.
const SNAPSHOT_BUDGET: usize = MAX_FRAME - 8 * 1024;

const _: () = assert!(CLIENT_CAPACITY * (2 + MAX_NICK_LEN) + 16 < MAX_FRAME - SNAPSHOT_BUDGET);
const _: () = assert!(MAX_CREATE_BATCH * ObjectRecord::MAX_ENCODED_LEN <= SNAPSHOT_BUDGET);

/// Splits a table snapshot into runs that each fit in one frame. Always
/// yields at least one, possibly empty, run.
fn snapshot_runs(records: Vec<ObjectRecord>) -> Vec<Vec<ObjectRecord>> {
    let mut runs = Vec::new();
    let mut current = Vec::new();
    let mut size = 0;
    for record in records {
        let len = record.encoded_len();
        if size + len > SNAPSHOT_BUDGET && !current.is_empty() {
            runs.push(std::mem::take(&mut current));
            size = 0;
        }
        size += len;
        current.push(record);
    }
    runs.push(current);
    runs
}

/// Snaps to the class grid, then to the positions the wire can carry
fn settle(object: &mut Object) {
    object.snap();
    object.set_location(object.location().quantized());
}

impl Outbound {
    fn broadcast(packet: ServerPacket) -> Self {
        Outbound::Broadcast {
            packet,
            exclude: None,
        }
    }
}

pub struct GameState {
    table: Table,
    registry: ClassRegistry,
    loader: Box<dyn PackageLoader>,
    clients: ClientManager,
    settings: Settings,
    rng: StdRng,
}

impl GameState {
    pub fn new(settings: Settings, loader: Box<dyn PackageLoader>) -> Self {
        Self::with_rng(settings, loader, StdRng::from_entropy())
    }

    /// Builds a state with a caller supplied random source
    pub fn with_rng(settings: Settings, loader: Box<dyn PackageLoader>, rng: StdRng) -> Self {
        Self {
            table: Table::new(),
            registry: ClassRegistry::new(),
            loader,
            clients: ClientManager::new(),
            settings,
            rng,
        }
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    pub fn clients(&self) -> &ClientManager {
        &self.clients
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Registers a new transport connection. None means the roster is full.
    pub fn connect(&mut self, addr: SocketAddr) -> Option<ClientId> {
        self.clients.add_client(addr)
    }

    /// Runs the disconnect path for a peer
    ///
    /// A joined peer's selections and ownerships are cleared and the
    /// remaining peers are told it left. The id is freed in every case.
    pub fn disconnect(&mut self, client: ClientId) -> Vec<Outbound> {
        let Some(peer) = self.clients.remove_client(client) else {
            return Vec::new();
        };
        if peer.nick.is_none() {
            return Vec::new();
        }
        let released = self.table.release_client(client);
        debug!(
            "Released {} objects held by client {}",
            released.len(),
            client
        );
        vec![Outbound::broadcast(ServerPacket::Leave { client })]
    }

    /// Entry point for one reliable packet
    pub fn handle_packet(&mut self, from: ClientId, bytes: &[u8]) -> Vec<Outbound> {
        match ClientPacket::decode(bytes) {
            Ok(packet) => self.handle(from, packet),
            Err(e) => {
                warn!("Dropping malformed packet from client {}: {}", from, e);
                Vec::new()
            }
        }
    }

    pub fn handle(&mut self, from: ClientId, packet: ClientPacket) -> Vec<Outbound> {
        let Some(peer) = self.clients.get(from) else {
            warn!("Packet from unknown client {}", from);
            return Vec::new();
        };
        if !peer.is_joined() {
            return self.handle_awaiting(from, packet);
        }

        debug!("Client {} sent {:?}", from, packet.header());
        match packet {
            ClientPacket::Create { spawns } => self.create(from, spawns),
            ClientPacket::Select { ids } => self.select(from, &ids),
            ClientPacket::Move { moves } => self.move_objects(from, &moves),
            ClientPacket::Flip { ids } => self.flip(from, &ids),
            ClientPacket::Rotate { steps, ids } => self.rotate(from, steps, &ids),
            ClientPacket::Remove { ids } => self.remove(from, &ids),
            ClientPacket::Own { take, ids } => self.own(from, take, &ids),
            ClientPacket::Shuffle => self.shuffle(from),
            ClientPacket::Chat { text } => self.chat(from, text),
            ClientPacket::Roll { count, sides } => self.roll(from, count, sides),
            ClientPacket::Login { password } => self.login(from, &password),
            ClientPacket::Kick { target } => self.kick(from, target),
            ClientPacket::PackageMissing { package, class } => {
                self.send_class_file(from, ClassRef::new(package, class))
            }
            other @ (ClientPacket::Handshake { .. }
            | ClientPacket::DirectoryQuery
            | ClientPacket::DirectoryRegister { .. }
            | ClientPacket::PingStream { .. }) => {
                warn!(
                    "Ignoring {:?} from joined client {}",
                    other.header(),
                    from
                );
                Vec::new()
            }
        }
    }

    fn handle_awaiting(&mut self, from: ClientId, packet: ClientPacket) -> Vec<Outbound> {
        match packet {
            ClientPacket::Handshake { version, nick } => self.handshake(from, version, nick),
            ClientPacket::DirectoryQuery => {
                info!("Client {} asked for a directory listing", from);
                let reply = Outbound::Send {
                    to: from,
                    packet: ServerPacket::DirectoryUpdate {
                        servers: vec![self.directory_entry()],
                    },
                };
                let mut out = vec![reply];
                out.extend(self.disconnect(from));
                out.push(Outbound::Close { client: from });
                out
            }
            other => {
                warn!(
                    "Ignoring {:?} from client {} before handshake",
                    other.header(),
                    from
                );
                Vec::new()
            }
        }
    }

    fn handshake(&mut self, from: ClientId, version: u16, nick: String) -> Vec<Outbound> {
        if version != PROTOCOL_VERSION {
            warn!(
                "Client {} speaks protocol {}, expected {}",
                from, version, PROTOCOL_VERSION
            );
            let mut out = self.disconnect(from);
            out.push(Outbound::Close { client: from });
            return out;
        }

        match self.clients.join(from, &nick) {
            Ok(()) => {}
            Err(JoinError::InvalidNick(_)) | Err(JoinError::NickTaken(_)) => {
                info!("Client {} cannot join as {:?}", from, nick);
                return vec![Outbound::Send {
                    to: from,
                    packet: ServerPacket::NickTaken { nick },
                }];
            }
            Err(e) => {
                warn!("Handshake from client {} failed: {}", from, e);
                return Vec::new();
            }
        }

        // A table too large for one frame continues in `Create` packets
        // that only the newcomer receives, still in draw order
        let objects: Vec<ObjectRecord> = self.table.iter().map(Object::to_record).collect();
        let mut runs = snapshot_runs(objects).into_iter();
        let first = runs.next().unwrap_or_default();
        let mut out = vec![Outbound::Send {
            to: from,
            packet: ServerPacket::Handshake {
                client: from,
                clients: self.clients.roster(),
                objects: first,
            },
        }];
        out.extend(runs.map(|objects| Outbound::Send {
            to: from,
            packet: ServerPacket::Create { from, objects },
        }));
        out.push(Outbound::Broadcast {
            packet: ServerPacket::Join { client: from, nick },
            exclude: Some(from),
        });
        out
    }

    fn create(&mut self, from: ClientId, mut spawns: Vec<Spawn>) -> Vec<Outbound> {
        if spawns.len() > MAX_CREATE_BATCH {
            warn!(
                "Client {} asked for {} objects at once, keeping the first {}",
                from,
                spawns.len(),
                MAX_CREATE_BATCH
            );
            spawns.truncate(MAX_CREATE_BATCH);
        }

        let mut batch = Vec::with_capacity(spawns.len());
        for spawn in spawns {
            let info = match self.registry.load(&spawn.class, self.loader.as_ref()) {
                Ok(info) => info,
                Err(e) => {
                    warn!("Client {} created unknown class {}: {}", from, spawn.class, e);
                    continue;
                }
            };
            if !info.is_valid_variant(spawn.variant) {
                warn!(
                    "Client {} asked for variant {} of {}",
                    from, spawn.variant, spawn.class
                );
                continue;
            }
            batch.push((spawn.class, spawn.variant, info, spawn.location));
        }

        let wanted = batch.len();
        let ids = self.table.spawn_batch(batch, settle);
        if ids.len() < wanted {
            warn!("Object ids exhausted, dropped {} spawns", wanted - ids.len());
        }
        let records: Vec<ObjectRecord> = ids
            .iter()
            .filter_map(|&id| self.table.get(id).map(Object::to_record))
            .collect();
        if records.is_empty() {
            return Vec::new();
        }
        vec![Outbound::broadcast(ServerPacket::Create {
            from,
            objects: records,
        })]
    }

    /// Replaces the sender's selection with `ids` plus everything stacked on
    /// them. Refused as a whole if any id is unknown or any stack is held by
    /// another client.
    fn select(&mut self, from: ClientId, ids: &[ObjectId]) -> Vec<Outbound> {
        let mut chosen = HashSet::new();
        for &id in ids {
            if !self.table.contains(id) {
                warn!("Client {} selected unknown object {}", from, id);
                return Vec::new();
            }
            match self.table.resolve_stack(id, from) {
                Stack::Blocked => {
                    debug!("Selection of {} by client {} is blocked", id, from);
                    return Vec::new();
                }
                Stack::Above(above) => {
                    chosen.insert(id);
                    chosen.extend(above);
                }
            }
        }

        for id in self.table.selected_by(from) {
            if !chosen.contains(&id) {
                if let Some(object) = self.table.get_mut(id) {
                    object.select(None);
                }
            }
        }
        for &id in &chosen {
            if let Some(object) = self.table.get_mut(id) {
                object.select(Some(from));
            }
        }
        let chosen: Vec<ObjectId> = chosen.into_iter().collect();
        self.table.raise(&chosen);
        self.table.restack();

        vec![Outbound::broadcast(ServerPacket::Select {
            from,
            ids: self.table.selected_by(from),
        })]
    }

    fn move_objects(&mut self, from: ClientId, moves: &[Placement]) -> Vec<Outbound> {
        let mut applied = Vec::new();
        for placement in moves {
            match self.table.get_mut(placement.id) {
                Some(object) if object.selected_by() == Some(from) => {
                    object.set_location(placement.location);
                    settle(object);
                    applied.push(Placement {
                        id: placement.id,
                        location: object.location(),
                    });
                }
                Some(_) => debug!(
                    "Client {} moved object {} it has not selected",
                    from, placement.id
                ),
                None => debug!("Client {} moved unknown object {}", from, placement.id),
            }
        }
        if applied.is_empty() {
            return Vec::new();
        }
        let ids: Vec<ObjectId> = applied.iter().map(|p| p.id).collect();
        self.table.raise(&ids);
        vec![Outbound::broadcast(ServerPacket::Move {
            from,
            moves: applied,
        })]
    }

    /// Ids in `ids` that exist and are neither selected nor owned by another client
    fn modifiable(&self, from: ClientId, ids: &[ObjectId]) -> Vec<ObjectId> {
        let mut seen = HashSet::new();
        ids.iter()
            .copied()
            .filter(|id| seen.insert(*id))
            .filter(|id| match self.table.get(*id) {
                Some(object) => {
                    object.selected_by().map_or(true, |c| c == from)
                        && object.owned_by().map_or(true, |c| c == from)
                }
                None => false,
            })
            .collect()
    }

    fn flip(&mut self, from: ClientId, ids: &[ObjectId]) -> Vec<Outbound> {
        let ids = self.modifiable(from, ids);
        if ids.is_empty() {
            return Vec::new();
        }
        for &id in &ids {
            if let Some(object) = self.table.get_mut(id) {
                object.toggle_flip();
            }
        }
        self.table.raise(&ids);
        vec![Outbound::broadcast(ServerPacket::Flip { from, ids })]
    }

    fn rotate(&mut self, from: ClientId, steps: i8, ids: &[ObjectId]) -> Vec<Outbound> {
        let ids = self.modifiable(from, ids);
        if ids.is_empty() {
            return Vec::new();
        }
        for &id in &ids {
            if let Some(object) = self.table.get_mut(id) {
                object.rotate(steps);
            }
        }
        self.table.restack();
        vec![Outbound::broadcast(ServerPacket::Rotate { from, steps, ids })]
    }

    fn remove(&mut self, from: ClientId, ids: &[ObjectId]) -> Vec<Outbound> {
        let ids = self.modifiable(from, ids);
        if ids.is_empty() {
            return Vec::new();
        }
        for &id in &ids {
            self.table.remove(id);
        }
        vec![Outbound::broadcast(ServerPacket::Remove { from, ids })]
    }

    fn own(&mut self, from: ClientId, take: bool, ids: &[ObjectId]) -> Vec<Outbound> {
        let mut seen = HashSet::new();
        let ids: Vec<ObjectId> = ids
            .iter()
            .copied()
            .filter(|id| seen.insert(*id))
            .filter(|id| match self.table.get(*id) {
                Some(object) if take => {
                    object.owned_by().map_or(true, |c| c == from)
                        && object.selected_by().map_or(true, |c| c == from)
                }
                Some(object) => object.owned_by() == Some(from),
                None => false,
            })
            .collect();
        if ids.is_empty() {
            return Vec::new();
        }

        let owner = take.then_some(from);
        for &id in &ids {
            if let Some(object) = self.table.get_mut(id) {
                object.own(owner);
            }
        }
        self.table.raise(&ids);
        vec![Outbound::broadcast(ServerPacket::Own { from, owner, ids })]
    }

    /// Permutes the sender's selection: locations among themselves, and the
    /// objects among the draw-order slots they already occupied
    fn shuffle(&mut self, from: ClientId) -> Vec<Outbound> {
        let selected = self.table.selected_by(from);
        if selected.len() < 2 {
            debug!("Client {} shuffled fewer than two objects", from);
            return Vec::new();
        }

        let mut locations: Vec<_> = selected
            .iter()
            .filter_map(|id| self.table.get(*id).map(|o| o.location()))
            .collect();
        locations.shuffle(&mut self.rng);
        let mut moves = Vec::with_capacity(selected.len());
        for (&id, location) in selected.iter().zip(locations) {
            if let Some(object) = self.table.get_mut(id) {
                object.set_location(location);
                moves.push(Placement {
                    id,
                    location: object.location(),
                });
            }
        }

        let picked: HashSet<ObjectId> = selected.iter().copied().collect();
        let mut order = self.table.draw_order().to_vec();
        let slots: Vec<usize> = order
            .iter()
            .enumerate()
            .filter(|(_, id)| picked.contains(id))
            .map(|(slot, _)| slot)
            .collect();
        let mut permuted = selected;
        permuted.shuffle(&mut self.rng);
        for (slot, id) in slots.into_iter().zip(permuted) {
            order[slot] = id;
        }
        if !self.table.set_draw_order(order) {
            self.table.restack();
        }

        vec![Outbound::broadcast(ServerPacket::Shuffle {
            from,
            moves,
            draw_order: self.table.draw_order().to_vec(),
        })]
    }

    fn chat(&mut self, from: ClientId, text: String) -> Vec<Outbound> {
        if text.trim().is_empty() {
            return Vec::new();
        }
        info!("<{}> {}", from, text);
        vec![Outbound::broadcast(ServerPacket::Chat { from, text })]
    }

    fn roll(&mut self, from: ClientId, count: u8, sides: u8) -> Vec<Outbound> {
        if !(1..=MAX_DICE).contains(&count) || !(MIN_SIDES..=MAX_SIDES).contains(&sides) {
            warn!("Client {} rolled {}d{}", from, count, sides);
            return Vec::new();
        }
        let results = (0..count)
            .map(|_| self.rng.gen_range(1..=sides))
            .collect();
        vec![Outbound::broadcast(ServerPacket::Roll {
            from,
            sides,
            results,
        })]
    }

    fn login(&mut self, from: ClientId, password: &str) -> Vec<Outbound> {
        let granted = self.settings.admits(password);
        if granted {
            if let Some(peer) = self.clients.get_mut(from) {
                peer.is_admin = true;
            }
            info!("Client {} is now admin", from);
        } else {
            warn!("Client {} failed to log in", from);
        }
        vec![Outbound::Send {
            to: from,
            packet: ServerPacket::Login { granted },
        }]
    }

    fn kick(&mut self, from: ClientId, target: ClientId) -> Vec<Outbound> {
        let is_admin = self.clients.get(from).map_or(false, |p| p.is_admin);
        if !is_admin {
            warn!("Client {} tried to kick without admin rights", from);
            return Vec::new();
        }
        if target == from || self.clients.get(target).is_none() {
            warn!("Client {} tried to kick invalid target {}", from, target);
            return Vec::new();
        }

        info!("Client {} kicked client {}", from, target);
        let packet = ServerPacket::Kick { from, target };
        let mut out = vec![
            Outbound::Broadcast {
                packet: packet.clone(),
                exclude: Some(target),
            },
            Outbound::Send { to: target, packet },
        ];
        out.extend(self.disconnect(target));
        out.push(Outbound::Close { client: target });
        out
    }

    /// Streams a class file to a client that lacks it
    fn send_class_file(&mut self, to: ClientId, class: ClassRef) -> Vec<Outbound> {
        let text = match self.loader.read_text(&class.package, &class.file_name()) {
            Ok(text) => text,
            Err(e) => {
                warn!("Cannot send {} to client {}: {}", class, to, e);
                return vec![Outbound::Send {
                    to,
                    packet: ServerPacket::PackageMissing {
                        package: class.package,
                        class: class.name,
                    },
                }];
            }
        };

        let bytes = text.into_bytes();
        let total = bytes.len() as u32;
        let mut chunks: Vec<&[u8]> = bytes.chunks(TRANSFER_CHUNK).collect();
        if chunks.is_empty() {
            chunks.push(&[]);
        }
        let mut offset = 0u32;
        let mut out = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            out.push(Outbound::Send {
                to,
                packet: ServerPacket::FileTransfer {
                    package: class.package.clone(),
                    class: class.name.clone(),
                    offset,
                    total,
                    data: chunk.to_vec(),
                },
            });
            offset += chunk.len() as u32;
        }
        debug!("Sending {} ({} bytes) to client {}", class, total, to);
        out
    }

    /// Handles one unreliable datagram. Returns true when it was accepted.
    pub fn handle_datagram(&mut self, addr: SocketAddr, bytes: &[u8], now_ms: u32) -> bool {
        let (client, stamp) = match ClientPacket::decode(bytes) {
            Ok(ClientPacket::PingStream { client, stamp }) => (client, stamp),
            Ok(other) => {
                debug!("Ignoring {:?} datagram from {}", other.header(), addr);
                return false;
            }
            Err(e) => {
                debug!("Malformed datagram from {}: {}", addr, e);
                return false;
            }
        };
        if !self.clients.bind_stream(client, addr) {
            debug!("Stream datagram from {} does not match client {}", addr, client);
            return false;
        }
        if stamp != 0 {
            self.clients
                .record_rtt(client, stream::round_trip(now_ms, stamp));
        }
        true
    }

    /// This server as it would be listed by a directory
    pub fn directory_entry(&self) -> ServerEntry {
        ServerEntry {
            host: String::new(),
            port: self.settings.port,
            name: self.settings.name.clone(),
            players: self.clients.joined_count().min(usize::from(u8::MAX)) as u8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{ClassInfo, MemoryPackages, Vec2};

    fn test_addr() -> SocketAddr {
        "127.0.0.1:5555".parse().unwrap()
    }

    fn packages() -> MemoryPackages {
        MemoryPackages::new()
            .with_class("cards", "card", &ClassInfo::sized("Card", 10.0, 10.0))
            .with_class(
                "chess",
                "pawn",
                &ClassInfo {
                    grid: Some(10.0),
                    images: vec!["white".into(), "black".into()],
                    ..ClassInfo::sized("Pawn", 8.0, 8.0)
                },
            )
    }

    fn game_with(settings: Settings) -> GameState {
        GameState::with_rng(settings, Box::new(packages()), StdRng::seed_from_u64(7))
    }

    fn game() -> GameState {
        game_with(Settings::default())
    }

    fn join(game: &mut GameState, nick: &str) -> ClientId {
        let id = game.connect(test_addr()).unwrap();
        let out = game.handle(
            id,
            ClientPacket::Handshake {
                version: PROTOCOL_VERSION,
                nick: nick.to_string(),
            },
        );
        assert!(matches!(
            out.first(),
            Some(Outbound::Send {
                packet: ServerPacket::Handshake { .. },
                ..
            })
        ));
        id
    }

    fn card(x: f32, y: f32) -> Spawn {
        Spawn {
            class: ClassRef::new("cards", "card"),
            variant: 0,
            location: Vec2::new(x, y),
        }
    }

    fn create(game: &mut GameState, from: ClientId, spawns: Vec<Spawn>) -> Vec<ObjectId> {
        match game.handle(from, ClientPacket::Create { spawns }).as_slice() {
            [Outbound::Broadcast {
                packet: ServerPacket::Create { objects, .. },
                ..
            }] => objects.iter().map(|o| o.id).collect(),
            other => panic!("unexpected create result {:?}", other),
        }
    }

    fn broadcast_of(out: &[Outbound]) -> Option<&ServerPacket> {
        out.iter().find_map(|o| match o {
            Outbound::Broadcast { packet, .. } => Some(packet),
            _ => None,
        })
    }

    #[test]
    fn test_handshake_reply_and_join_broadcast() {
        let mut game = game();
        let bob = join(&mut game, "Bob");
        create(&mut game, bob, vec![card(0.0, 0.0), card(100.0, 0.0)]);

        let alice = game.connect(test_addr()).unwrap();
        let out = game.handle(
            alice,
            ClientPacket::Handshake {
                version: PROTOCOL_VERSION,
                nick: "Alice".to_string(),
            },
        );
        match &out[..] {
            [Outbound::Send {
                to,
                packet:
                    ServerPacket::Handshake {
                        client,
                        clients,
                        objects,
                    },
            }, Outbound::Broadcast { packet, exclude }] => {
                assert_eq!(*to, alice);
                assert_eq!(*client, alice);
                assert_eq!(clients.len(), 2);
                assert_eq!(objects.iter().map(|o| o.id).collect::<Vec<_>>(), vec![0, 1]);
                assert_eq!(
                    *packet,
                    ServerPacket::Join {
                        client: alice,
                        nick: "Alice".to_string()
                    }
                );
                assert_eq!(*exclude, Some(alice));
            }
            other => panic!("unexpected handshake result {:?}", other),
        }
    }

    #[test]
    fn test_nick_taken_allows_retry() {
        let mut game = game();
        join(&mut game, "Alice");
        let second = game.connect(test_addr()).unwrap();

        let out = game.handle(
            second,
            ClientPacket::Handshake {
                version: PROTOCOL_VERSION,
                nick: "Alice".to_string(),
            },
        );
        assert_eq!(
            out,
            vec![Outbound::Send {
                to: second,
                packet: ServerPacket::NickTaken {
                    nick: "Alice".to_string()
                }
            }]
        );
        assert!(!game.clients().is_joined(second));

        let out = game.handle(
            second,
            ClientPacket::Handshake {
                version: PROTOCOL_VERSION,
                nick: "Alicia".to_string(),
            },
        );
        assert_eq!(out.len(), 2);
        assert!(game.clients().is_joined(second));
    }

    #[test]
    fn test_version_mismatch_closes() {
        let mut game = game();
        let id = game.connect(test_addr()).unwrap();
        let out = game.handle(
            id,
            ClientPacket::Handshake {
                version: PROTOCOL_VERSION + 1,
                nick: "Alice".to_string(),
            },
        );
        assert_eq!(out, vec![Outbound::Close { client: id }]);
        assert!(game.clients().get(id).is_none());
    }

    #[test]
    fn test_packets_before_handshake_are_ignored() {
        let mut game = game();
        let id = game.connect(test_addr()).unwrap();
        assert!(game
            .handle(id, ClientPacket::Create { spawns: vec![card(0.0, 0.0)] })
            .is_empty());
        assert!(game.table().is_empty());
    }

    #[test]
    fn test_directory_query_is_redirected() {
        let mut game = game_with(Settings {
            name: "Friday".to_string(),
            ..Settings::default()
        });
        join(&mut game, "Alice");
        let lister = game.connect(test_addr()).unwrap();

        let out = game.handle(lister, ClientPacket::DirectoryQuery);
        assert_eq!(
            out,
            vec![
                Outbound::Send {
                    to: lister,
                    packet: ServerPacket::DirectoryUpdate {
                        servers: vec![ServerEntry {
                            host: String::new(),
                            port: shared::DEFAULT_PORT,
                            name: "Friday".to_string(),
                            players: 1,
                        }]
                    }
                },
                Outbound::Close { client: lister },
            ]
        );
    }

    #[test]
    fn test_malformed_packet_is_dropped() {
        let mut game = game();
        let id = join(&mut game, "Alice");
        assert!(game.handle_packet(id, &[]).is_empty());
        assert!(game.handle_packet(id, &[250, 1, 2]).is_empty());
        assert!(game.handle_packet(id, &[shared::Header::Select as u8, 1]).is_empty());
        assert!(game.clients().is_joined(id));
    }

    #[test]
    fn test_create_assigns_sequential_ids() {
        let mut game = game();
        let alice = join(&mut game, "Alice");
        let ids = create(
            &mut game,
            alice,
            vec![card(0.0, 0.0), card(100.0, 0.0), card(200.0, 0.0)],
        );
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(game.table().draw_order(), &[0, 1, 2]);
    }

    #[test]
    fn test_create_skips_bad_spawns() {
        let mut game = game();
        let alice = join(&mut game, "Alice");
        let bad_class = Spawn {
            class: ClassRef::new("cards", "joker"),
            ..card(0.0, 0.0)
        };
        let bad_variant = Spawn {
            variant: 5,
            ..card(0.0, 0.0)
        };
        let sneaky = Spawn {
            class: ClassRef::new("..", "card"),
            ..card(0.0, 0.0)
        };
        assert!(game
            .handle(
                alice,
                ClientPacket::Create {
                    spawns: vec![bad_class.clone(), bad_variant.clone(), sneaky]
                }
            )
            .is_empty());

        let ids = create(&mut game, alice, vec![bad_class, card(1.0, 1.0), bad_variant]);
        assert_eq!(ids, vec![0]);
    }

    #[test]
    fn test_create_snaps_to_grid() {
        let mut game = game();
        let alice = join(&mut game, "Alice");
        let pawn = Spawn {
            class: ClassRef::new("chess", "pawn"),
            variant: 1,
            location: Vec2::new(14.0, 26.0),
        };
        let ids = create(&mut game, alice, vec![pawn]);
        assert_eq!(
            game.table().get(ids[0]).unwrap().location(),
            Vec2::new(10.0, 30.0).quantized()
        );
    }

    #[test]
    fn test_create_batch_is_capped() {
        let mut game = game();
        let alice = join(&mut game, "Alice");
        let spawns = (0..MAX_CREATE_BATCH + 50)
            .map(|i| card((i % 100) as f32 * 20.0 - 1000.0, (i / 100) as f32 * 20.0))
            .collect();
        let out = game.handle(alice, ClientPacket::Create { spawns });

        let Some(created) = broadcast_of(&out) else {
            panic!("create was not broadcast: {:?}", out);
        };
        let ServerPacket::Create { objects, .. } = created else {
            panic!("unexpected broadcast {:?}", created);
        };
        assert_eq!(objects.len(), MAX_CREATE_BATCH);
        assert_eq!(game.table().len(), MAX_CREATE_BATCH);
        assert!(created.encode().unwrap().len() <= MAX_FRAME);
    }

    #[test]
    fn test_longest_class_names_still_fit_a_frame() {
        let limit = shared::codec::MAX_STRING_LEN;
        let class = ClassRef::new("p".repeat(limit), "c".repeat(limit - ".json".len()));
        let loader = packages().with_class(
            &class.package,
            &class.name,
            &ClassInfo::sized("Token", 1.0, 1.0),
        );
        let mut game =
            GameState::with_rng(Settings::default(), Box::new(loader), StdRng::seed_from_u64(7));
        let alice = join(&mut game, "Alice");
        let spawns = (0..MAX_CREATE_BATCH)
            .map(|i| Spawn {
                class: class.clone(),
                variant: 0,
                location: Vec2::new((i % 64) as f32 * 10.0, (i / 64) as f32 * 10.0),
            })
            .collect();
        let out = game.handle(alice, ClientPacket::Create { spawns });
        let created = broadcast_of(&out).unwrap();
        assert!(created.encode().unwrap().len() <= MAX_FRAME);
    }

    #[test]
    fn test_large_table_handshake_spans_frames() {
        let class = ClassRef::new("p".repeat(200), "c".repeat(200));
        let loader = packages().with_class(
            &class.package,
            &class.name,
            &ClassInfo::sized("Token", 10.0, 10.0),
        );
        let mut game =
            GameState::with_rng(Settings::default(), Box::new(loader), StdRng::seed_from_u64(7));
        let alice = join(&mut game, "Alice");
        for batch in 0..3 {
            let spawns = (0..MAX_CREATE_BATCH)
                .map(|i| {
                    let n = batch * MAX_CREATE_BATCH + i;
                    Spawn {
                        class: class.clone(),
                        variant: 0,
                        location: Vec2::new(
                            (n % 300) as f32 * 50.0 - 7500.0,
                            (n / 300) as f32 * 50.0 - 7500.0,
                        ),
                    }
                })
                .collect();
            game.handle(alice, ClientPacket::Create { spawns });
        }
        assert_eq!(game.table().len(), 3 * MAX_CREATE_BATCH);

        let bob = game.connect(test_addr()).unwrap();
        let out = game.handle(
            bob,
            ClientPacket::Handshake {
                version: PROTOCOL_VERSION,
                nick: "Bob".into(),
            },
        );

        let mut received = Vec::new();
        let mut frames = 0;
        for action in &out {
            match action {
                Outbound::Send { to, packet } => {
                    assert_eq!(*to, bob);
                    let objects = match packet {
                        ServerPacket::Handshake { objects, .. } if frames == 0 => objects,
                        ServerPacket::Create { from, objects } if frames > 0 => {
                            assert_eq!(*from, bob);
                            objects
                        }
                        other => panic!("unexpected {:?}", other),
                    };
                    assert!(packet.encode().unwrap().len() <= MAX_FRAME);
                    received.extend(objects.iter().map(|o| o.id));
                    frames += 1;
                }
                Outbound::Broadcast {
                    packet: ServerPacket::Join { client, .. },
                    exclude,
                } => {
                    assert_eq!(*client, bob);
                    assert_eq!(*exclude, Some(bob));
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert!(frames > 1);
        assert_eq!(received.as_slice(), game.table().draw_order());
    }

    #[test]
    fn test_stored_locations_match_the_wire() {
        let mut game = game();
        let alice = join(&mut game, "Alice");
        let out = game.handle(
            alice,
            ClientPacket::Create {
                spawns: vec![card(1234.567, -0.3)],
            },
        );
        let bytes = broadcast_of(&out).unwrap().encode().unwrap();
        let ServerPacket::Create { objects, .. } = ServerPacket::decode(&bytes).unwrap() else {
            panic!("create did not decode as a create");
        };
        assert_eq!(game.table().get(0).unwrap().location(), objects[0].location);

        game.handle(alice, ClientPacket::Select { ids: vec![0] });
        let out = game.handle(
            alice,
            ClientPacket::Move {
                moves: vec![Placement {
                    id: 0,
                    location: Vec2::new(-77.77, 9999.9),
                }],
            },
        );
        let bytes = broadcast_of(&out).unwrap().encode().unwrap();
        let ServerPacket::Move { moves, .. } = ServerPacket::decode(&bytes).unwrap() else {
            panic!("move did not decode as a move");
        };
        assert_eq!(game.table().get(0).unwrap().location(), moves[0].location);
    }

    #[test]
    fn test_select_takes_whole_stack() {
        let mut game = game();
        let alice = join(&mut game, "Alice");
        create(
            &mut game,
            alice,
            vec![card(0.0, 0.0), card(4.0, 0.0), card(300.0, 0.0)],
        );

        let out = game.handle(alice, ClientPacket::Select { ids: vec![0] });
        assert_eq!(
            broadcast_of(&out),
            Some(&ServerPacket::Select {
                from: alice,
                ids: vec![0, 1]
            })
        );
        assert_eq!(game.table().draw_order(), &[2, 0, 1]);
    }

    #[test]
    fn test_select_is_idempotent() {
        let mut game = game();
        let alice = join(&mut game, "Alice");
        create(&mut game, alice, vec![card(0.0, 0.0), card(4.0, 0.0)]);

        let first = game.handle(alice, ClientPacket::Select { ids: vec![0] });
        let second = game.handle(alice, ClientPacket::Select { ids: vec![0] });
        assert_eq!(first, second);
        assert_eq!(game.table().selected_by(alice), vec![0, 1]);
    }

    #[test]
    fn test_select_replaces_previous_selection() {
        let mut game = game();
        let alice = join(&mut game, "Alice");
        create(&mut game, alice, vec![card(0.0, 0.0), card(300.0, 0.0)]);

        game.handle(alice, ClientPacket::Select { ids: vec![0] });
        game.handle(alice, ClientPacket::Select { ids: vec![1] });
        assert_eq!(game.table().get(0).unwrap().selected_by(), None);
        assert_eq!(game.table().selected_by(alice), vec![1]);

        let out = game.handle(alice, ClientPacket::Select { ids: vec![] });
        assert_eq!(
            broadcast_of(&out),
            Some(&ServerPacket::Select {
                from: alice,
                ids: vec![]
            })
        );
        assert!(game.table().selected_by(alice).is_empty());
    }

    #[test]
    fn test_select_blocked_by_other_client() {
        let mut game = game();
        let alice = join(&mut game, "Alice");
        let bob = join(&mut game, "Bob");
        create(
            &mut game,
            alice,
            vec![card(0.0, 0.0), card(4.0, 0.0), card(300.0, 0.0)],
        );

        game.handle(bob, ClientPacket::Select { ids: vec![1] });
        assert!(game
            .handle(alice, ClientPacket::Select { ids: vec![2, 0] })
            .is_empty());
        assert!(game.table().selected_by(alice).is_empty());
        assert_eq!(game.table().selected_by(bob), vec![1]);
    }

    #[test]
    fn test_select_unknown_id_rejects_request() {
        let mut game = game();
        let alice = join(&mut game, "Alice");
        create(&mut game, alice, vec![card(0.0, 0.0)]);
        assert!(game
            .handle(alice, ClientPacket::Select { ids: vec![0, 99] })
            .is_empty());
        assert!(game.table().selected_by(alice).is_empty());
    }

    #[test]
    fn test_move_requires_selection() {
        let mut game = game();
        let alice = join(&mut game, "Alice");
        let bob = join(&mut game, "Bob");
        create(&mut game, alice, vec![card(0.0, 0.0), card(300.0, 0.0)]);
        game.handle(alice, ClientPacket::Select { ids: vec![0] });

        let target = Vec2::new(50.0, 50.0);
        let settled = target.quantized();
        let moves = vec![
            Placement { id: 0, location: target },
            Placement { id: 1, location: target },
            Placement { id: 77, location: target },
        ];
        assert!(game
            .handle(bob, ClientPacket::Move { moves: moves.clone() })
            .is_empty());

        let out = game.handle(alice, ClientPacket::Move { moves });
        assert_eq!(
            broadcast_of(&out),
            Some(&ServerPacket::Move {
                from: alice,
                moves: vec![Placement { id: 0, location: settled }]
            })
        );
        assert_eq!(
            game.table().get(1).unwrap().location(),
            Vec2::new(300.0, 0.0).quantized()
        );
    }

    #[test]
    fn test_move_clamps_to_table() {
        let mut game = game();
        let alice = join(&mut game, "Alice");
        create(&mut game, alice, vec![card(0.0, 0.0)]);
        game.handle(alice, ClientPacket::Select { ids: vec![0] });
        game.handle(
            alice,
            ClientPacket::Move {
                moves: vec![Placement {
                    id: 0,
                    location: Vec2::new(1e9, -1e9),
                }],
            },
        );
        assert_eq!(
            game.table().get(0).unwrap().location(),
            Vec2::new(shared::TABLE_EXTENT, -shared::TABLE_EXTENT)
        );
    }

    #[test]
    fn test_ownership_gates_flip_and_remove() {
        let mut game = game();
        let alice = join(&mut game, "Alice");
        let bob = join(&mut game, "Bob");
        create(&mut game, alice, vec![card(0.0, 0.0), card(300.0, 0.0)]);

        let out = game.handle(alice, ClientPacket::Own { take: true, ids: vec![0] });
        assert_eq!(
            broadcast_of(&out),
            Some(&ServerPacket::Own {
                from: alice,
                owner: Some(alice),
                ids: vec![0]
            })
        );

        assert!(game.handle(bob, ClientPacket::Flip { ids: vec![0] }).is_empty());
        assert!(game.handle(bob, ClientPacket::Remove { ids: vec![0] }).is_empty());
        assert!(game
            .handle(bob, ClientPacket::Own { take: true, ids: vec![0] })
            .is_empty());
        assert!(game
            .handle(bob, ClientPacket::Own { take: false, ids: vec![0] })
            .is_empty());

        let out = game.handle(bob, ClientPacket::Flip { ids: vec![0, 1] });
        assert_eq!(
            broadcast_of(&out),
            Some(&ServerPacket::Flip { from: bob, ids: vec![1] })
        );
        assert!(game.table().get(1).unwrap().flipped());
        assert!(!game.table().get(0).unwrap().flipped());

        let out = game.handle(alice, ClientPacket::Own { take: false, ids: vec![0] });
        assert_eq!(
            broadcast_of(&out),
            Some(&ServerPacket::Own {
                from: alice,
                owner: None,
                ids: vec![0]
            })
        );
    }

    #[test]
    fn test_rotate_wraps() {
        let mut game = game();
        let alice = join(&mut game, "Alice");
        create(&mut game, alice, vec![card(0.0, 0.0)]);
        game.handle(alice, ClientPacket::Rotate { steps: -1, ids: vec![0] });
        assert_eq!(game.table().get(0).unwrap().rotation(), 15);
        game.handle(alice, ClientPacket::Rotate { steps: 3, ids: vec![0, 0] });
        assert_eq!(game.table().get(0).unwrap().rotation(), 2);
    }

    #[test]
    fn test_remove_frees_id() {
        let mut game = game();
        let alice = join(&mut game, "Alice");
        create(&mut game, alice, vec![card(0.0, 0.0), card(300.0, 0.0)]);
        let out = game.handle(alice, ClientPacket::Remove { ids: vec![0, 42] });
        assert_eq!(
            broadcast_of(&out),
            Some(&ServerPacket::Remove { from: alice, ids: vec![0] })
        );
        assert_eq!(create(&mut game, alice, vec![card(0.0, 300.0)]), vec![0]);
    }

    #[test]
    fn test_shuffle_permutes_within_selection() {
        let mut game = game();
        let alice = join(&mut game, "Alice");
        let spawns = (0..6).map(|i| card(i as f32 * 100.0, 0.0)).collect();
        create(&mut game, alice, spawns);
        game.handle(alice, ClientPacket::Select { ids: vec![1, 3, 4] });

        let before: Vec<Vec2> = [1, 3, 4]
            .iter()
            .map(|id| game.table().get(*id).unwrap().location())
            .collect();
        let out = game.handle(alice, ClientPacket::Shuffle);
        let Some(ServerPacket::Shuffle { moves, draw_order, .. }) = broadcast_of(&out) else {
            panic!("shuffle was not broadcast: {:?}", out);
        };

        assert_eq!(moves.len(), 3);
        let mut after: Vec<Vec2> = moves.iter().map(|p| p.location).collect();
        let mut expected = before.clone();
        let key = |v: &Vec2| (v.x as i64, v.y as i64);
        after.sort_by_key(key);
        expected.sort_by_key(key);
        assert_eq!(after, expected);

        assert_eq!(draw_order.as_slice(), game.table().draw_order());
        // Unselected objects keep their slots
        assert_eq!(&draw_order[..3], &[0, 2, 5]);
        let mut tail = draw_order[3..].to_vec();
        tail.sort_unstable();
        assert_eq!(tail, vec![1, 3, 4]);
    }

    #[test]
    fn test_shuffle_needs_two_objects() {
        let mut game = game();
        let alice = join(&mut game, "Alice");
        create(&mut game, alice, vec![card(0.0, 0.0)]);
        game.handle(alice, ClientPacket::Select { ids: vec![0] });
        assert!(game.handle(alice, ClientPacket::Shuffle).is_empty());
    }

    #[test]
    fn test_roll_bounds() {
        let mut game = game();
        let alice = join(&mut game, "Alice");
        assert!(game.handle(alice, ClientPacket::Roll { count: 0, sides: 6 }).is_empty());
        assert!(game.handle(alice, ClientPacket::Roll { count: 11, sides: 6 }).is_empty());
        assert!(game.handle(alice, ClientPacket::Roll { count: 1, sides: 1 }).is_empty());
        assert!(game.handle(alice, ClientPacket::Roll { count: 1, sides: 101 }).is_empty());

        let out = game.handle(alice, ClientPacket::Roll { count: 10, sides: 6 });
        match broadcast_of(&out) {
            Some(ServerPacket::Roll { sides, results, .. }) => {
                assert_eq!(*sides, 6);
                assert_eq!(results.len(), 10);
                assert!(results.iter().all(|r| (1..=6).contains(r)));
            }
            other => panic!("unexpected roll result {:?}", other),
        }
    }

    #[test]
    fn test_empty_chat_is_dropped() {
        let mut game = game();
        let alice = join(&mut game, "Alice");
        assert!(game
            .handle(alice, ClientPacket::Chat { text: "  ".to_string() })
            .is_empty());
        let out = game.handle(alice, ClientPacket::Chat { text: "hi".to_string() });
        assert_eq!(
            broadcast_of(&out),
            Some(&ServerPacket::Chat {
                from: alice,
                text: "hi".to_string()
            })
        );
    }

    #[test]
    fn test_login_and_kick() {
        let mut game = game_with(Settings {
            allow_admin: true,
            admin_password: Some("secret".to_string()),
            ..Settings::default()
        });
        let alice = join(&mut game, "Alice");
        let bob = join(&mut game, "Bob");
        create(&mut game, bob, vec![card(0.0, 0.0)]);
        game.handle(bob, ClientPacket::Select { ids: vec![0] });

        assert!(game.handle(alice, ClientPacket::Kick { target: bob }).is_empty());
        assert_eq!(
            game.handle(alice, ClientPacket::Login { password: "nope".to_string() }),
            vec![Outbound::Send {
                to: alice,
                packet: ServerPacket::Login { granted: false }
            }]
        );
        game.handle(alice, ClientPacket::Login { password: "secret".to_string() });
        assert!(game.clients().get(alice).unwrap().is_admin);

        let out = game.handle(alice, ClientPacket::Kick { target: bob });
        let kick = ServerPacket::Kick { from: alice, target: bob };
        assert_eq!(
            out,
            vec![
                Outbound::Broadcast {
                    packet: kick.clone(),
                    exclude: Some(bob)
                },
                Outbound::Send { to: bob, packet: kick },
                Outbound::broadcast(ServerPacket::Leave { client: bob }),
                Outbound::Close { client: bob },
            ]
        );
        assert!(game.clients().get(bob).is_none());
        assert_eq!(game.table().get(0).unwrap().selected_by(), None);
    }

    #[test]
    fn test_kick_self_or_unknown_is_refused() {
        let mut game = game_with(Settings {
            allow_admin: true,
            admin_password: Some("secret".to_string()),
            ..Settings::default()
        });
        let alice = join(&mut game, "Alice");
        game.handle(alice, ClientPacket::Login { password: "secret".to_string() });
        assert!(game.handle(alice, ClientPacket::Kick { target: alice }).is_empty());
        assert!(game.handle(alice, ClientPacket::Kick { target: 200 }).is_empty());
    }

    #[test]
    fn test_disconnect_releases_holdings() {
        let mut game = game();
        let alice = join(&mut game, "Alice");
        create(&mut game, alice, vec![card(0.0, 0.0), card(300.0, 0.0)]);
        game.handle(alice, ClientPacket::Select { ids: vec![0] });
        game.handle(alice, ClientPacket::Own { take: true, ids: vec![1] });

        let out = game.disconnect(alice);
        assert_eq!(out, vec![Outbound::broadcast(ServerPacket::Leave { client: alice })]);
        assert_eq!(game.table().get(0).unwrap().selected_by(), None);
        assert_eq!(game.table().get(1).unwrap().owned_by(), None);
        assert!(game.disconnect(alice).is_empty());
    }

    #[test]
    fn test_disconnect_before_handshake_is_silent() {
        let mut game = game();
        let id = game.connect(test_addr()).unwrap();
        assert!(game.disconnect(id).is_empty());
        assert_eq!(game.connect(test_addr()), Some(id));
    }

    #[test]
    fn test_file_transfer_chunks() {
        let mut files = MemoryPackages::new();
        files.insert("big", "blob.json", "x".repeat(2500));
        let mut game =
            GameState::with_rng(Settings::default(), Box::new(files), StdRng::seed_from_u64(1));
        let alice = join(&mut game, "Alice");

        let out = game.handle(
            alice,
            ClientPacket::PackageMissing {
                package: "big".to_string(),
                class: "blob".to_string(),
            },
        );
        let chunks: Vec<(u32, u32, usize)> = out
            .iter()
            .map(|o| match o {
                Outbound::Send {
                    packet:
                        ServerPacket::FileTransfer {
                            offset, total, data, ..
                        },
                    ..
                } => (*offset, *total, data.len()),
                other => panic!("unexpected transfer output {:?}", other),
            })
            .collect();
        assert_eq!(
            chunks,
            vec![(0, 2500, 1024), (1024, 2500, 1024), (2048, 2500, 452)]
        );
    }

    #[test]
    fn test_missing_file_is_reported() {
        let mut game = game();
        let alice = join(&mut game, "Alice");
        let out = game.handle(
            alice,
            ClientPacket::PackageMissing {
                package: "cards".to_string(),
                class: "joker".to_string(),
            },
        );
        assert_eq!(
            out,
            vec![Outbound::Send {
                to: alice,
                packet: ServerPacket::PackageMissing {
                    package: "cards".to_string(),
                    class: "joker".to_string()
                }
            }]
        );
    }

    #[test]
    fn test_stream_datagrams_bind_and_measure() {
        let mut game = game();
        let alice = join(&mut game, "Alice");
        let stream_addr: SocketAddr = "127.0.0.1:6000".parse().unwrap();
        let other: SocketAddr = "127.0.0.1:6001".parse().unwrap();

        let register = ClientPacket::PingStream { client: alice, stamp: 0 }
            .encode()
            .unwrap();
        assert!(game.handle_datagram(stream_addr, &register, 10));
        assert!(!game.handle_datagram(other, &register, 10));

        let echo = ClientPacket::PingStream { client: alice, stamp: 1000 }
            .encode()
            .unwrap();
        assert!(game.handle_datagram(stream_addr, &echo, 1040));
        assert_eq!(game.clients().get(alice).unwrap().rtt_ms, 40);

        let stranger = ClientPacket::PingStream { client: 99, stamp: 0 }
            .encode()
            .unwrap();
        assert!(!game.handle_datagram(other, &stranger, 10));
        assert!(!game.handle_datagram(other, &[1, 2, 3], 10));
    }
}
