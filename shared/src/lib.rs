//! Types shared by the tabletop server and client
//!
//! The table model, the stack resolution engine and the binary protocol
//! live here so both ends interpret every packet with the same code.

pub mod class;
pub mod codec;
pub mod ids;
pub mod object;
pub mod protocol;
pub mod stack;
pub mod table;
pub mod transport;

pub use class::{ClassError, ClassInfo, ClassRef, ClassRegistry, DirPackageLoader, MemoryPackages, PackageLoader};
pub use codec::CodecError;
pub use ids::{client_color, ClientId, IdPool, ObjectId, CLIENT_CAPACITY, NO_CLIENT, OBJECT_CAPACITY};
pub use object::{Bounds, Object, Vec2, ROTATION_STEPS, TABLE_EXTENT};
pub use protocol::{
    Channel, ClientPacket, Header, ObjectRecord, Placement, RosterEntry, RttEntry, ServerEntry,
    ServerPacket, Spawn, DEFAULT_PORT, DIRECTORY_PORT, MAX_NICK_LEN, PROTOCOL_VERSION,
};
pub use stack::{Stack, StackGraph};
pub use table::Table;
