//! NDR (Network Data Representation) marshal/unmarshal engine
//!
//! This crate implements the NDR wire format as specified in DCE RPC and
//! MS-RPCE: a symmetric pair of codecs that encode typed values into, and
//! decode them from, the flat byte buffer an RPC stub exchanges with its
//! peer.
//!
//! # NDR Wire Format
//!
//! Key characteristics:
//! - Primitives align to their natural size (1, 2, 4, or 8 bytes)
//! - Pointers transmit an inline referent ID; the pointed-to data is
//!   serialized after the aggregate containing the pointer, not at the
//!   pointer site
//! - Conformant data (arrays with runtime-determined size) carries its
//!   maximum count ahead of the elements; for conformant structures the
//!   count is hoisted to the front of the structure
//! - Strings are conformant varying arrays of code units with a null
//!   terminator
//! - Under the NDR64 transfer syntax all counts, offsets and referent IDs
//!   widen from 4 to 8 bytes
//!
//! [`NdrWriter`] appends correctly aligned, correctly ordered bytes for a
//! sequence of typed write calls and produces the final buffer, padded to
//! an 8-byte total length. [`NdrReader`] consumes the identical grammar,
//! one read per write. Both share the deferral discipline that gives
//! pointer referents their out-of-line placement.

mod defer;
mod error;
mod handles;
mod pointers;
mod reader;
mod syntax;
mod types;
mod writer;

pub use error::{NdrError, Result, MAX_NDR_ALLOCATION_SIZE, MAX_NDR_ARRAY_ELEMENTS};
pub use handles::{HandleTransfer, SystemHandle};
pub use pointers::NdrEmbedded;
pub use reader::NdrReader;
pub use syntax::{
    CharacterRep, FloatingPointRep, IntegerRep, NdrDataRepresentation, TransferSyntax,
};
pub use types::{NdrConformantStructure, NdrPrimitive, NdrStructure, NdrUnion, NdrUuid};
pub use writer::NdrWriter;

/// Re-export bytes for convenience
pub use bytes::{Buf, BufMut, Bytes, BytesMut};
