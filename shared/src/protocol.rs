//! Packet definitions for the table protocol
//!
//! Every packet is one [`Header`] byte followed by a type specific payload.
//! Clients send intents ([`ClientPacket`]); the server answers with effects
//! ([`ServerPacket`]) that carry the originating client id right after the
//! header, so one format serves both the sender's confirmation and every
//! other client's notification.

use crate::class::ClassRef;
use crate::codec::{CodecError, PacketReader, PacketWriter, MAX_STRING_LEN};
use crate::ids::{ClientId, ObjectId};
use crate::object::Vec2;

/// Bumped whenever the wire format changes incompatibly
pub const PROTOCOL_VERSION: u16 = 1;

/// Default TCP/UDP port of a game server
pub const DEFAULT_PORT: u16 = 4890;

/// Default TCP port of the directory service
pub const DIRECTORY_PORT: u16 = 4891;

/// Longest nick a client may join with, in bytes
pub const MAX_NICK_LEN: usize = 16;

/// Header byte identifying the semantic type of a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Header {
    Handshake = 0,
    NickTaken = 1,
    Join = 2,
    Leave = 3,
    Create = 4,
    Select = 5,
    Remove = 6,
    Move = 7,
    Flip = 8,
    Own = 9,
    Shuffle = 10,
    Rotate = 11,
    Chat = 12,
    Roll = 13,
    Login = 14,
    Kick = 15,
    PackageMissing = 16,
    FileTransfer = 17,
    PingStream = 18,
    DirectoryQuery = 19,
    DirectoryRegister = 20,
    DirectoryUpdate = 21,
}

impl TryFrom<u8> for Header {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use Header::*;
        Ok(match value {
            0 => Handshake,
            1 => NickTaken,
            2 => Join,
            3 => Leave,
            4 => Create,
            5 => Select,
            6 => Remove,
            7 => Move,
            8 => Flip,
            9 => Own,
            10 => Shuffle,
            11 => Rotate,
            12 => Chat,
            13 => Roll,
            14 => Login,
            15 => Kick,
            16 => PackageMissing,
            17 => FileTransfer,
            18 => PingStream,
            19 => DirectoryQuery,
            20 => DirectoryRegister,
            21 => DirectoryUpdate,
            other => return Err(CodecError::UnknownHeader(other)),
        })
    }
}

/// Delivery channel a packet type travels on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Reliable,
    Unreliable,
}

impl Header {
    /// Telemetry is the only unreliable traffic; everything else is reliable
    pub fn channel(self) -> Channel {
        match self {
            Header::PingStream => Channel::Unreliable,
            _ => Channel::Reliable,
        }
    }
}

/// One object a client asks the server to create
#[derive(Debug, Clone, PartialEq)]
pub struct Spawn {
    pub class: ClassRef,
    pub variant: u8,
    pub location: Vec2,
}

/// Complete wire state of one object
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectRecord {
    pub id: ObjectId,
    pub class: ClassRef,
    pub variant: u8,
    pub location: Vec2,
    pub rotation: u8,
    pub flipped: bool,
    pub selected_by: Option<ClientId>,
    pub owned_by: Option<ClientId>,
}

impl ObjectRecord {
    /// Wire size of a record whose class names are both at the string limit
    pub const MAX_ENCODED_LEN: usize = RECORD_MIN_LEN + 2 * MAX_STRING_LEN;

    /// Bytes this record takes inside a packet
    pub fn encoded_len(&self) -> usize {
        RECORD_MIN_LEN + self.class.package.len() + self.class.name.len()
    }
}

/// New location for one object
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Placement {
    pub id: ObjectId,
    pub location: Vec2,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterEntry {
    pub id: ClientId,
    pub nick: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RttEntry {
    pub id: ClientId,
    pub rtt_ms: u16,
}

/// One game server as listed by the directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEntry {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub players: u8,
}

/// Intents sent by clients (and by game servers to the directory)
#[derive(Debug, Clone, PartialEq)]
pub enum ClientPacket {
    Handshake { version: u16, nick: String },
    Create { spawns: Vec<Spawn> },
    /// The complete new selection of the sender; empty deselects everything
    Select { ids: Vec<ObjectId> },
    Remove { ids: Vec<ObjectId> },
    Move { moves: Vec<Placement> },
    Flip { ids: Vec<ObjectId> },
    /// `take` claims ownership, otherwise ownership is released
    Own { take: bool, ids: Vec<ObjectId> },
    Shuffle,
    /// Rotation in 22.5 degree steps
    Rotate { steps: i8, ids: Vec<ObjectId> },
    Chat { text: String },
    Roll { count: u8, sides: u8 },
    Login { password: String },
    Kick { target: ClientId },
    PackageMissing { package: String, class: String },
    /// Echo of the last stream stamp; a stamp of 0 only registers the address
    PingStream { client: ClientId, stamp: u32 },
    DirectoryQuery,
    DirectoryRegister { name: String, port: u16, players: u8 },
}

/// Effects broadcast by the server, and directory listings
#[derive(Debug, Clone, PartialEq)]
pub enum ServerPacket {
    /// Handshake reply: own id, every joined client, every object back to front
    Handshake {
        client: ClientId,
        clients: Vec<RosterEntry>,
        objects: Vec<ObjectRecord>,
    },
    NickTaken { nick: String },
    Join { client: ClientId, nick: String },
    Leave { client: ClientId },
    Create { from: ClientId, objects: Vec<ObjectRecord> },
    Select { from: ClientId, ids: Vec<ObjectId> },
    Remove { from: ClientId, ids: Vec<ObjectId> },
    Move { from: ClientId, moves: Vec<Placement> },
    Flip { from: ClientId, ids: Vec<ObjectId> },
    Own {
        from: ClientId,
        owner: Option<ClientId>,
        ids: Vec<ObjectId>,
    },
    Shuffle {
        from: ClientId,
        moves: Vec<Placement>,
        draw_order: Vec<ObjectId>,
    },
    Rotate {
        from: ClientId,
        steps: i8,
        ids: Vec<ObjectId>,
    },
    Chat { from: ClientId, text: String },
    Roll {
        from: ClientId,
        sides: u8,
        results: Vec<u8>,
    },
    Login { granted: bool },
    Kick { from: ClientId, target: ClientId },
    PackageMissing { package: String, class: String },
    FileTransfer {
        package: String,
        class: String,
        offset: u32,
        total: u32,
        data: Vec<u8>,
    },
    PingStream { stamp: u32, rtts: Vec<RttEntry> },
    DirectoryUpdate { servers: Vec<ServerEntry> },
}

const SPAWN_MIN_LEN: usize = 1 + 1 + 1 + 8;
const RECORD_MIN_LEN: usize = 2 + 1 + 1 + 1 + 8 + 1 + 1 + 1 + 1;
const PLACEMENT_LEN: usize = 2 + 8;

fn write_class(writer: &mut PacketWriter, class: &ClassRef) -> Result<(), CodecError> {
    writer.str(&class.package)?.str(&class.name)?;
    Ok(())
}

fn read_class(reader: &mut PacketReader<'_>) -> Result<ClassRef, CodecError> {
    let package = reader.str()?;
    let name = reader.str()?;
    Ok(ClassRef { package, name })
}

fn write_record(writer: &mut PacketWriter, record: &ObjectRecord) -> Result<(), CodecError> {
    writer.u16(record.id);
    write_class(writer, &record.class)?;
    writer
        .u8(record.variant)
        .position(record.location)
        .u8(record.rotation)
        .bool(record.flipped)
        .client_ref(record.selected_by)
        .client_ref(record.owned_by);
    Ok(())
}

fn read_record(reader: &mut PacketReader<'_>) -> Result<ObjectRecord, CodecError> {
    Ok(ObjectRecord {
        id: reader.u16()?,
        class: read_class(reader)?,
        variant: reader.u8()?,
        location: reader.position()?,
        rotation: reader.u8()?,
        flipped: reader.bool()?,
        selected_by: reader.client_ref()?,
        owned_by: reader.client_ref()?,
    })
}

fn write_records(writer: &mut PacketWriter, records: &[ObjectRecord]) -> Result<(), CodecError> {
    writer.count(records.len())?;
    for record in records {
        write_record(writer, record)?;
    }
    Ok(())
}

fn read_records(reader: &mut PacketReader<'_>) -> Result<Vec<ObjectRecord>, CodecError> {
    let count = reader.count(RECORD_MIN_LEN)?;
    (0..count).map(|_| read_record(reader)).collect()
}

fn write_placement(writer: &mut PacketWriter, placement: &Placement) {
    writer.u16(placement.id).position(placement.location);
}

fn read_placement(reader: &mut PacketReader<'_>) -> Result<Placement, CodecError> {
    Ok(Placement {
        id: reader.u16()?,
        location: reader.position()?,
    })
}

/// Placements packed back to back until the end of the packet
fn read_placements_packed(reader: &mut PacketReader<'_>) -> Result<Vec<Placement>, CodecError> {
    if reader.remaining() % PLACEMENT_LEN != 0 {
        return Err(CodecError::Truncated {
            need: PLACEMENT_LEN - reader.remaining() % PLACEMENT_LEN,
            have: 0,
        });
    }
    let mut moves = Vec::with_capacity(reader.remaining() / PLACEMENT_LEN);
    while reader.remaining() > 0 {
        moves.push(read_placement(reader)?);
    }
    Ok(moves)
}

impl ClientPacket {
    pub fn header(&self) -> Header {
        match self {
            ClientPacket::Handshake { .. } => Header::Handshake,
            ClientPacket::Create { .. } => Header::Create,
            ClientPacket::Select { .. } => Header::Select,
            ClientPacket::Remove { .. } => Header::Remove,
            ClientPacket::Move { .. } => Header::Move,
            ClientPacket::Flip { .. } => Header::Flip,
            ClientPacket::Own { .. } => Header::Own,
            ClientPacket::Shuffle => Header::Shuffle,
            ClientPacket::Rotate { .. } => Header::Rotate,
            ClientPacket::Chat { .. } => Header::Chat,
            ClientPacket::Roll { .. } => Header::Roll,
            ClientPacket::Login { .. } => Header::Login,
            ClientPacket::Kick { .. } => Header::Kick,
            ClientPacket::PackageMissing { .. } => Header::PackageMissing,
            ClientPacket::PingStream { .. } => Header::PingStream,
            ClientPacket::DirectoryQuery => Header::DirectoryQuery,
            ClientPacket::DirectoryRegister { .. } => Header::DirectoryRegister,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut w = PacketWriter::new(self.header());
        match self {
            ClientPacket::Handshake { version, nick } => {
                w.u16(*version).str(nick)?;
            }
            ClientPacket::Create { spawns } => {
                w.count(spawns.len())?;
                for spawn in spawns {
                    write_class(&mut w, &spawn.class)?;
                    w.u8(spawn.variant).position(spawn.location);
                }
            }
            ClientPacket::Select { ids }
            | ClientPacket::Remove { ids }
            | ClientPacket::Flip { ids } => {
                w.ids(ids);
            }
            ClientPacket::Move { moves } => {
                for placement in moves {
                    write_placement(&mut w, placement);
                }
            }
            ClientPacket::Own { take, ids } => {
                w.bool(*take).ids(ids);
            }
            ClientPacket::Shuffle | ClientPacket::DirectoryQuery => {}
            ClientPacket::Rotate { steps, ids } => {
                w.i8(*steps).ids(ids);
            }
            ClientPacket::Chat { text } => {
                w.str(text)?;
            }
            ClientPacket::Roll { count, sides } => {
                w.u8(*count).u8(*sides);
            }
            ClientPacket::Login { password } => {
                w.str(password)?;
            }
            ClientPacket::Kick { target } => {
                w.u8(*target);
            }
            ClientPacket::PackageMissing { package, class } => {
                w.str(package)?.str(class)?;
            }
            ClientPacket::PingStream { client, stamp } => {
                w.u8(*client).u32(*stamp);
            }
            ClientPacket::DirectoryRegister {
                name,
                port,
                players,
            } => {
                w.str(name)?.u16(*port).u8(*players);
            }
        }
        Ok(w.finish())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let (header, mut r) = PacketReader::open(bytes)?;
        let packet = match header {
            Header::Handshake => ClientPacket::Handshake {
                version: r.u16()?,
                nick: r.str()?,
            },
            Header::Create => {
                let count = r.count(SPAWN_MIN_LEN)?;
                let mut spawns = Vec::with_capacity(count);
                for _ in 0..count {
                    spawns.push(Spawn {
                        class: read_class(&mut r)?,
                        variant: r.u8()?,
                        location: r.position()?,
                    });
                }
                ClientPacket::Create { spawns }
            }
            Header::Select => ClientPacket::Select { ids: r.ids()? },
            Header::Remove => ClientPacket::Remove { ids: r.ids()? },
            Header::Move => ClientPacket::Move {
                moves: read_placements_packed(&mut r)?,
            },
            Header::Flip => ClientPacket::Flip { ids: r.ids()? },
            Header::Own => ClientPacket::Own {
                take: r.bool()?,
                ids: r.ids()?,
            },
            Header::Shuffle => ClientPacket::Shuffle,
            Header::Rotate => ClientPacket::Rotate {
                steps: r.i8()?,
                ids: r.ids()?,
            },
            Header::Chat => ClientPacket::Chat { text: r.str()? },
            Header::Roll => ClientPacket::Roll {
                count: r.u8()?,
                sides: r.u8()?,
            },
            Header::Login => ClientPacket::Login { password: r.str()? },
            Header::Kick => ClientPacket::Kick { target: r.u8()? },
            Header::PackageMissing => ClientPacket::PackageMissing {
                package: r.str()?,
                class: r.str()?,
            },
            Header::PingStream => ClientPacket::PingStream {
                client: r.u8()?,
                stamp: r.u32()?,
            },
            Header::DirectoryQuery => ClientPacket::DirectoryQuery,
            Header::DirectoryRegister => ClientPacket::DirectoryRegister {
                name: r.str()?,
                port: r.u16()?,
                players: r.u8()?,
            },
            Header::NickTaken
            | Header::Join
            | Header::Leave
            | Header::FileTransfer
            | Header::DirectoryUpdate => return Err(CodecError::UnexpectedHeader(header)),
        };
        r.finish()?;
        Ok(packet)
    }
}

impl ServerPacket {
    pub fn header(&self) -> Header {
        match self {
            ServerPacket::Handshake { .. } => Header::Handshake,
            ServerPacket::NickTaken { .. } => Header::NickTaken,
            ServerPacket::Join { .. } => Header::Join,
            ServerPacket::Leave { .. } => Header::Leave,
            ServerPacket::Create { .. } => Header::Create,
            ServerPacket::Select { .. } => Header::Select,
            ServerPacket::Remove { .. } => Header::Remove,
            ServerPacket::Move { .. } => Header::Move,
            ServerPacket::Flip { .. } => Header::Flip,
            ServerPacket::Own { .. } => Header::Own,
            ServerPacket::Shuffle { .. } => Header::Shuffle,
            ServerPacket::Rotate { .. } => Header::Rotate,
            ServerPacket::Chat { .. } => Header::Chat,
            ServerPacket::Roll { .. } => Header::Roll,
            ServerPacket::Login { .. } => Header::Login,
            ServerPacket::Kick { .. } => Header::Kick,
            ServerPacket::PackageMissing { .. } => Header::PackageMissing,
            ServerPacket::FileTransfer { .. } => Header::FileTransfer,
            ServerPacket::PingStream { .. } => Header::PingStream,
            ServerPacket::DirectoryUpdate { .. } => Header::DirectoryUpdate,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut w = PacketWriter::new(self.header());
        match self {
            ServerPacket::Handshake {
                client,
                clients,
                objects,
            } => {
                w.u8(*client).count(clients.len())?;
                for entry in clients {
                    w.u8(entry.id).str(&entry.nick)?;
                }
                write_records(&mut w, objects)?;
            }
            ServerPacket::NickTaken { nick } => {
                w.str(nick)?;
            }
            ServerPacket::Join { client, nick } => {
                w.u8(*client).str(nick)?;
            }
            ServerPacket::Leave { client } => {
                w.u8(*client);
            }
            ServerPacket::Create { from, objects } => {
                w.u8(*from);
                write_records(&mut w, objects)?;
            }
            ServerPacket::Select { from, ids }
            | ServerPacket::Remove { from, ids }
            | ServerPacket::Flip { from, ids } => {
                w.u8(*from).ids(ids);
            }
            ServerPacket::Move { from, moves } => {
                w.u8(*from);
                for placement in moves {
                    write_placement(&mut w, placement);
                }
            }
            ServerPacket::Own { from, owner, ids } => {
                w.u8(*from).client_ref(*owner).ids(ids);
            }
            ServerPacket::Shuffle {
                from,
                moves,
                draw_order,
            } => {
                w.u8(*from).count(moves.len())?;
                for placement in moves {
                    write_placement(&mut w, placement);
                }
                w.count(draw_order.len())?.ids(draw_order);
            }
            ServerPacket::Rotate { from, steps, ids } => {
                w.u8(*from).i8(*steps).ids(ids);
            }
            ServerPacket::Chat { from, text } => {
                w.u8(*from).str(text)?;
            }
            ServerPacket::Roll {
                from,
                sides,
                results,
            } => {
                w.u8(*from).u8(*sides).count(results.len())?;
                for result in results {
                    w.u8(*result);
                }
            }
            ServerPacket::Login { granted } => {
                w.bool(*granted);
            }
            ServerPacket::Kick { from, target } => {
                w.u8(*from).u8(*target);
            }
            ServerPacket::PackageMissing { package, class } => {
                w.str(package)?.str(class)?;
            }
            ServerPacket::FileTransfer {
                package,
                class,
                offset,
                total,
                data,
            } => {
                w.str(package)?
                    .str(class)?
                    .u32(*offset)
                    .u32(*total)
                    .blob(data)?;
            }
            ServerPacket::PingStream { stamp, rtts } => {
                w.u32(*stamp).count(rtts.len())?;
                for entry in rtts {
                    w.u8(entry.id).u16(entry.rtt_ms);
                }
            }
            ServerPacket::DirectoryUpdate { servers } => {
                w.count(servers.len())?;
                for server in servers {
                    w.str(&server.host)?
                        .u16(server.port)
                        .str(&server.name)?
                        .u8(server.players);
                }
            }
        }
        Ok(w.finish())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let (header, mut r) = PacketReader::open(bytes)?;
        let packet = match header {
            Header::Handshake => {
                let client = r.u8()?;
                let count = r.count(2)?;
                let mut clients = Vec::with_capacity(count);
                for _ in 0..count {
                    clients.push(RosterEntry {
                        id: r.u8()?,
                        nick: r.str()?,
                    });
                }
                ServerPacket::Handshake {
                    client,
                    clients,
                    objects: read_records(&mut r)?,
                }
            }
            Header::NickTaken => ServerPacket::NickTaken { nick: r.str()? },
            Header::Join => ServerPacket::Join {
                client: r.u8()?,
                nick: r.str()?,
            },
            Header::Leave => ServerPacket::Leave { client: r.u8()? },
            Header::Create => ServerPacket::Create {
                from: r.u8()?,
                objects: read_records(&mut r)?,
            },
            Header::Select => ServerPacket::Select {
                from: r.u8()?,
                ids: r.ids()?,
            },
            Header::Remove => ServerPacket::Remove {
                from: r.u8()?,
                ids: r.ids()?,
            },
            Header::Move => ServerPacket::Move {
                from: r.u8()?,
                moves: read_placements_packed(&mut r)?,
            },
            Header::Flip => ServerPacket::Flip {
                from: r.u8()?,
                ids: r.ids()?,
            },
            Header::Own => ServerPacket::Own {
                from: r.u8()?,
                owner: r.client_ref()?,
                ids: r.ids()?,
            },
            Header::Shuffle => {
                let from = r.u8()?;
                let count = r.count(PLACEMENT_LEN)?;
                let moves = (0..count)
                    .map(|_| read_placement(&mut r))
                    .collect::<Result<Vec<_>, _>>()?;
                let count = r.count(2)?;
                let draw_order = (0..count)
                    .map(|_| r.u16())
                    .collect::<Result<Vec<_>, _>>()?;
                ServerPacket::Shuffle {
                    from,
                    moves,
                    draw_order,
                }
            }
            Header::Rotate => ServerPacket::Rotate {
                from: r.u8()?,
                steps: r.i8()?,
                ids: r.ids()?,
            },
            Header::Chat => ServerPacket::Chat {
                from: r.u8()?,
                text: r.str()?,
            },
            Header::Roll => {
                let from = r.u8()?;
                let sides = r.u8()?;
                let count = r.count(1)?;
                let results = (0..count).map(|_| r.u8()).collect::<Result<Vec<_>, _>>()?;
                ServerPacket::Roll {
                    from,
                    sides,
                    results,
                }
            }
            Header::Login => ServerPacket::Login { granted: r.bool()? },
            Header::Kick => ServerPacket::Kick {
                from: r.u8()?,
                target: r.u8()?,
            },
            Header::PackageMissing => ServerPacket::PackageMissing {
                package: r.str()?,
                class: r.str()?,
            },
            Header::FileTransfer => ServerPacket::FileTransfer {
                package: r.str()?,
                class: r.str()?,
                offset: r.u32()?,
                total: r.u32()?,
                data: r.blob()?,
            },
            Header::PingStream => {
                let stamp = r.u32()?;
                let count = r.count(3)?;
                let mut rtts = Vec::with_capacity(count);
                for _ in 0..count {
                    rtts.push(RttEntry {
                        id: r.u8()?,
                        rtt_ms: r.u16()?,
                    });
                }
                ServerPacket::PingStream { stamp, rtts }
            }
            Header::DirectoryUpdate => {
                let count = r.count(1 + 2 + 1 + 1)?;
                let mut servers = Vec::with_capacity(count);
                for _ in 0..count {
                    servers.push(ServerEntry {
                        host: r.str()?,
                        port: r.u16()?,
                        name: r.str()?,
                        players: r.u8()?,
                    });
                }
                ServerPacket::DirectoryUpdate { servers }
            }
            Header::DirectoryQuery | Header::DirectoryRegister => {
                return Err(CodecError::UnexpectedHeader(header))
            }
        };
        r.finish()?;
        Ok(packet)
    }
}
