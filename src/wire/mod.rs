//! The connection-oriented framed-protocol codec: `opcode:u16 | flags:u16 |
//! varuint length | payload`. Stateless per frame, transport-agnostic.

pub mod frame;
pub mod opcode;

pub use frame::{Frame, MAX_FRAME_PAYLOAD};
pub use opcode::{Opcode, QueryFlags};
