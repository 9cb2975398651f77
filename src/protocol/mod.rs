//! C2: the binary KV wire format (packet codec) and its supporting constants.

pub mod features;
pub mod opcode;
pub mod packet;

pub use features::HelloFeature;
pub use opcode::{Magic, Opcode, Status};
pub use packet::{Packet, PacketHeader, decode, encode};
