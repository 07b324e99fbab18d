//! Wire-shape seams the codec dispatches through.
//!
//! NDR primitive types and their encodings:
//!
//! | MIDL Type     | Rust Type | Size | Alignment |
//! |---------------|-----------|------|-----------|
//! | boolean       | bool      | 1    | 1         |
//! | byte/char     | u8        | 1    | 1         |
//! | small         | i8        | 1    | 1         |
//! | short         | i16       | 2    | 2         |
//! | long/int      | i32       | 4    | 4         |
//! | hyper         | i64       | 8    | 8         |
//! | unsigned short| u16       | 2    | 2         |
//! | unsigned long | u32       | 4    | 4         |
//! | unsigned hyper| u64       | 8    | 8         |
//! | float         | f32       | 4    | 4         |
//! | double        | f64       | 8    | 8         |
//! | wchar_t       | u16       | 2    | 2         |
//!
//! Composite shapes go through [`NdrStructure`] and [`NdrUnion`]: a value
//! describes its field-by-field marshal/unmarshal sequence and the
//! writer/reader supplies alignment, conformance and pointer deferral.

use bytes::{BufMut, BytesMut};

use crate::error::Result;
use crate::reader::NdrReader;
use crate::syntax::TransferSyntax;
use crate::writer::NdrWriter;

/// Fixed-width scalar that can be moved to and from the wire.
///
/// Implemented for the integer and floating point widths NDR defines.
/// `read_raw` may assume the slice holds at least [`Self::SIZE`] bytes;
/// the reader performs the bounds check.
pub trait NdrPrimitive: Copy + Default + 'static {
    const SIZE: usize;
    const ALIGN: usize;

    fn write_raw(self, buf: &mut BytesMut);
    fn read_raw(data: &[u8]) -> Self;
}

// Macro to implement NdrPrimitive for fixed-width scalars
macro_rules! impl_ndr_primitive {
    ($ty:ty, $size:expr, $put:ident) => {
        impl NdrPrimitive for $ty {
            const SIZE: usize = $size;
            const ALIGN: usize = $size;

            fn write_raw(self, buf: &mut BytesMut) {
                buf.$put(self);
            }

            fn read_raw(data: &[u8]) -> Self {
                let mut raw = [0u8; $size];
                raw.copy_from_slice(&data[..$size]);
                <$ty>::from_le_bytes(raw)
            }
        }
    };
}

impl_ndr_primitive!(u8, 1, put_u8);
impl_ndr_primitive!(i8, 1, put_i8);
impl_ndr_primitive!(u16, 2, put_u16_le);
impl_ndr_primitive!(i16, 2, put_i16_le);
impl_ndr_primitive!(u32, 4, put_u32_le);
impl_ndr_primitive!(i32, 4, put_i32_le);
impl_ndr_primitive!(u64, 8, put_u64_le);
impl_ndr_primitive!(i64, 8, put_i64_le);
impl_ndr_primitive!(f32, 4, put_f32_le);
impl_ndr_primitive!(f64, 8, put_f64_le);

/// A structure's field-by-field wire sequence.
///
/// `marshal` issues one write call per member in declaration order;
/// `unmarshal` mirrors it. The writer/reader aligns the structure, opens
/// the deferral scope for embedded pointers, and drains it once the
/// immediate members are done; implementations only describe the members.
pub trait NdrStructure: Sized {
    /// Natural alignment: the largest member alignment.
    fn alignment(syntax: TransferSyntax) -> usize {
        let _ = syntax;
        4
    }

    fn marshal<'a>(&'a self, writer: &mut NdrWriter<'a>) -> Result<()>;

    fn unmarshal(reader: &mut NdrReader<'_>) -> Result<Self>;
}

/// A structure whose trailing member is conformant.
///
/// The maximum count is hoisted into a slot at the front of the structure;
/// `conformance` supplies the value to patch in if the embedded conformant
/// member never writes one (which also closes the slot).
pub trait NdrConformantStructure: NdrStructure {
    fn conformance(&self) -> usize;
}

/// A non-encapsulated union: discriminant plus active arm.
///
/// `marshal` writes the discriminant and then the active arm; `unmarshal`
/// reads the discriminant and selects the arm, failing with
/// [`crate::NdrError::InvalidDiscriminant`] on an unknown selector. The
/// writer/reader contributes alignment and the aggregate deferral scope.
pub trait NdrUnion: Sized {
    fn alignment(syntax: TransferSyntax) -> usize {
        let _ = syntax;
        4
    }

    fn marshal<'a>(&'a self, writer: &mut NdrWriter<'a>) -> Result<()>;

    fn unmarshal(reader: &mut NdrReader<'_>) -> Result<Self>;
}

/// GUID/UUID type for NDR encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NdrUuid {
    pub data1: u32,
    pub data2: u16,
    pub data3: u16,
    pub data4: [u8; 8],
}

impl NdrUuid {
    /// Nil UUID
    pub const NIL: Self = Self {
        data1: 0,
        data2: 0,
        data3: 0,
        data4: [0; 8],
    };

    /// Parse from string "xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx"
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.len() != 36 {
            return None;
        }
        let parts: Vec<&str> = s.split('-').collect();
        if parts.len() != 5 {
            return None;
        }

        let data1 = u32::from_str_radix(parts[0], 16).ok()?;
        let data2 = u16::from_str_radix(parts[1], 16).ok()?;
        let data3 = u16::from_str_radix(parts[2], 16).ok()?;
        let clock = u16::from_str_radix(parts[3], 16).ok()?;
        let node_str = parts[4];
        if node_str.len() != 12 {
            return None;
        }

        let mut data4 = [0u8; 8];
        data4[0] = (clock >> 8) as u8;
        data4[1] = clock as u8;
        for i in 0..6 {
            data4[2 + i] = u8::from_str_radix(&node_str[i * 2..i * 2 + 2], 16).ok()?;
        }

        Some(Self {
            data1,
            data2,
            data3,
            data4,
        })
    }
}

impl std::fmt::Display for NdrUuid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            self.data1,
            self.data2,
            self.data3,
            self.data4[0],
            self.data4[1],
            self.data4[2],
            self.data4[3],
            self.data4[4],
            self.data4[5],
            self.data4[6],
            self.data4[7],
        )
    }
}

impl NdrStructure for NdrUuid {
    fn alignment(_syntax: TransferSyntax) -> usize {
        4
    }

    fn marshal<'a>(&'a self, writer: &mut NdrWriter<'a>) -> Result<()> {
        writer.write_u32(self.data1)?;
        writer.write_u16(self.data2)?;
        writer.write_u16(self.data3)?;
        writer.write_bytes(&self.data4)
    }

    fn unmarshal(reader: &mut NdrReader<'_>) -> Result<Self> {
        let data1 = reader.read_u32()?;
        let data2 = reader.read_u16()?;
        let data3 = reader.read_u16()?;
        let bytes = reader.read_bytes(8)?;
        let mut data4 = [0u8; 8];
        data4.copy_from_slice(&bytes);
        Ok(Self {
            data1,
            data2,
            data3,
            data4,
        })
    }
}
