//! NDR encoder.
//!
//! [`NdrWriter`] accepts a sequence of typed write calls mirroring a
//! value's shape and appends correctly aligned, correctly ordered bytes to
//! its output buffer. Pointer bodies are deferred: the pointer site gets a
//! referent ID and the pointed-to data is written once the enclosing
//! aggregate's immediate members are done. [`NdrWriter::to_bytes`]
//! finalizes the buffer, padded to an 8-byte total length.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

use std::collections::VecDeque;

use crate::defer::DeferralStack;
use crate::error::{NdrError, Result};
use crate::handles::{HandleTransfer, SystemHandle};
use crate::syntax::{align_padding, TransferSyntax};
use crate::types::{NdrConformantStructure, NdrPrimitive, NdrStructure, NdrUnion, NdrUuid};

/// Base of the referent ID counter.
const REFERENT_BASE: u32 = 0x20000;

type DeferredWrite<'a> = Box<dyn FnOnce(&mut NdrWriter<'a>) -> Result<()> + 'a>;

/// NDR encoder over an owned output buffer.
///
/// One writer serves exactly one encode operation: issue the typed write
/// calls matching the value's shape, then take the finished buffer with
/// [`NdrWriter::to_bytes`] or [`NdrWriter::into_parts`]. Not safe for
/// concurrent use; the owning call layer must not share an instance.
pub struct NdrWriter<'a> {
    syntax: TransferSyntax,
    buf: BytesMut,
    deferred: DeferralStack<DeferredWrite<'a>>,
    next_referent: u32,
    conformance_slot: Option<usize>,
    handles: Vec<HandleTransfer<'a>>,
}

impl<'a> NdrWriter<'a> {
    pub fn new(syntax: TransferSyntax) -> Self {
        Self {
            syntax,
            buf: BytesMut::new(),
            deferred: DeferralStack::new(),
            next_referent: REFERENT_BASE,
            conformance_slot: None,
            handles: Vec::new(),
        }
    }

    pub fn syntax(&self) -> TransferSyntax {
        self.syntax
    }

    /// Current byte offset from the start of the buffer.
    pub fn position(&self) -> usize {
        self.buf.len()
    }

    /// Handles captured so far, for out-of-band transfer.
    pub fn handles(&self) -> &[HandleTransfer<'a>] {
        &self.handles
    }

    /// Finalize: pad the buffer to an 8-byte total length and freeze it.
    pub fn to_bytes(mut self) -> Bytes {
        debug_assert!(self.deferred.is_empty(), "unbalanced deferral scope");
        self.align(8);
        trace!(len = self.buf.len(), "finalized NDR buffer");
        self.buf.freeze()
    }

    /// Finalize, also handing back the captured handle side list.
    pub fn into_parts(mut self) -> (Bytes, Vec<HandleTransfer<'a>>) {
        let handles = std::mem::take(&mut self.handles);
        (self.to_bytes(), handles)
    }

    // Alignment and raw output

    /// Pad with zero bytes so the next write lands on `alignment`.
    pub fn align(&mut self, alignment: usize) {
        let padding = align_padding(self.buf.len(), alignment);
        for _ in 0..padding {
            self.buf.put_u8(0);
        }
    }

    /// Append raw bytes with no alignment.
    pub fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.buf.put_slice(data);
        Ok(())
    }

    // Primitives

    /// Write a fixed-width scalar, aligned to its natural boundary.
    pub fn write_primitive<T: NdrPrimitive>(&mut self, value: T) -> Result<()> {
        self.align(T::ALIGN);
        value.write_raw(&mut self.buf);
        Ok(())
    }

    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.write_primitive(value)
    }

    pub fn write_i8(&mut self, value: i8) -> Result<()> {
        self.write_primitive(value)
    }

    pub fn write_u16(&mut self, value: u16) -> Result<()> {
        self.write_primitive(value)
    }

    pub fn write_i16(&mut self, value: i16) -> Result<()> {
        self.write_primitive(value)
    }

    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.write_primitive(value)
    }

    pub fn write_i32(&mut self, value: i32) -> Result<()> {
        self.write_primitive(value)
    }

    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        self.write_primitive(value)
    }

    pub fn write_i64(&mut self, value: i64) -> Result<()> {
        self.write_primitive(value)
    }

    pub fn write_f32(&mut self, value: f32) -> Result<()> {
        self.write_primitive(value)
    }

    pub fn write_f64(&mut self, value: f64) -> Result<()> {
        self.write_primitive(value)
    }

    /// NDR boolean - a single byte, 0x00 = false, 0x01 = true.
    pub fn write_bool(&mut self, value: bool) -> Result<()> {
        self.write_u8(u8::from(value))
    }

    /// 16-bit character (wchar_t code unit).
    pub fn write_wchar(&mut self, value: u16) -> Result<()> {
        self.write_u16(value)
    }

    /// 16-bit enum; widens to 32 bits under NDR64.
    pub fn write_enum16(&mut self, value: u16) -> Result<()> {
        match self.syntax {
            TransferSyntax::Ndr => self.write_u16(value),
            TransferSyntax::Ndr64 => self.write_u32(u32::from(value)),
        }
    }

    /// MIDL `__int3264`: 4 bytes (truncating) under NDR, 8 under NDR64.
    pub fn write_int3264(&mut self, value: i64) -> Result<()> {
        match self.syntax {
            TransferSyntax::Ndr => self.write_i32(value as i32),
            TransferSyntax::Ndr64 => self.write_i64(value),
        }
    }

    /// MIDL `unsigned __int3264`.
    pub fn write_uint3264(&mut self, value: u64) -> Result<()> {
        match self.syntax {
            TransferSyntax::Ndr => self.write_u32(value as u32),
            TransferSyntax::Ndr64 => self.write_u64(value),
        }
    }

    pub fn write_guid(&mut self, value: &'a NdrUuid) -> Result<()> {
        self.write_struct(value)
    }

    // Size-dependent fields

    fn write_size_word(&mut self, value: u64) -> Result<()> {
        match self.syntax {
            TransferSyntax::Ndr => {
                let value = u32::try_from(value).map_err(|_| NdrError::IntegerOverflow)?;
                self.write_u32(value)
            }
            TransferSyntax::Ndr64 => self.write_u64(value),
        }
    }

    fn patch_size_word(&mut self, offset: usize, value: u64) -> Result<()> {
        match self.syntax {
            TransferSyntax::Ndr => {
                let value = u32::try_from(value).map_err(|_| NdrError::IntegerOverflow)?;
                self.buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
            }
            TransferSyntax::Ndr64 => {
                self.buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
            }
        }
        Ok(())
    }

    /// Write a conformance count: into the open slot if a conformant
    /// structure reserved one (closing it), inline otherwise.
    pub(crate) fn write_conformance(&mut self, count: u64) -> Result<()> {
        match self.conformance_slot.take() {
            Some(offset) => self.patch_size_word(offset, count),
            None => self.write_size_word(count),
        }
    }

    /// Write a variance header: offset (always zero, no partial
    /// transmission) followed by the actual count.
    fn write_variance(&mut self, actual: u64) -> Result<()> {
        self.write_size_word(0)?;
        self.write_size_word(actual)
    }

    // Deferral

    fn drain(&mut self, mut queue: VecDeque<DeferredWrite<'a>>) -> Result<()> {
        if !queue.is_empty() {
            trace!(pending = queue.len(), "flushing deferred writes");
        }
        while let Some(op) = queue.pop_front() {
            op(self)?;
        }
        Ok(())
    }

    fn with_deferral_scope<R>(&mut self, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        self.deferred.push();
        let result = f(self);
        let queue = self.deferred.pop();
        match result {
            Ok(value) => {
                self.drain(queue)?;
                Ok(value)
            }
            Err(err) => Err(err),
        }
    }

    /// Run a pointer body after the current aggregate, or immediately if no
    /// aggregate is open (a standalone pointer's body directly follows it).
    fn defer_or_run(&mut self, op: DeferredWrite<'a>) -> Result<()> {
        if self.deferred.is_empty() {
            op(self)
        } else {
            self.deferred.defer(op);
            Ok(())
        }
    }

    // Pointers

    fn allocate_referent(&mut self) -> u32 {
        let id = self.next_referent;
        self.next_referent = self.next_referent.wrapping_add(4);
        id
    }

    /// Write a null pointer: a zero referent field and no deferred data.
    pub fn write_null_ptr(&mut self) -> Result<()> {
        self.write_size_word(0)
    }

    /// Write a non-null pointer: a freshly allocated referent ID inline,
    /// with `body` deferred until the enclosing aggregate completes.
    pub fn write_embedded_ptr<F>(&mut self, body: F) -> Result<()>
    where
        F: FnOnce(&mut NdrWriter<'a>) -> Result<()> + 'a,
    {
        let id = self.allocate_referent();
        self.write_size_word(u64::from(id))?;
        self.defer_or_run(Box::new(body))
    }

    /// Embedded pointer to a structure.
    pub fn write_embedded_struct_ptr<T: NdrStructure>(
        &mut self,
        value: Option<&'a T>,
    ) -> Result<()> {
        match value {
            Some(value) => self.write_embedded_ptr(move |writer| writer.write_struct(value)),
            None => self.write_null_ptr(),
        }
    }

    /// Embedded pointer to a NUL-terminated UTF-16 string.
    pub fn write_embedded_string_ptr(&mut self, value: Option<&'a str>) -> Result<()> {
        match value {
            Some(value) => self.write_embedded_ptr(move |writer| writer.write_string(value)),
            None => self.write_null_ptr(),
        }
    }

    /// Embedded pointer to a NUL-terminated ANSI string.
    pub fn write_embedded_ansi_string_ptr(&mut self, value: Option<&'a str>) -> Result<()> {
        match value {
            Some(value) => self.write_embedded_ptr(move |writer| writer.write_ansi_string(value)),
            None => self.write_null_ptr(),
        }
    }

    /// Unique pointer to a structure. At the top level the body directly
    /// follows the referent field.
    pub fn write_unique_struct_ptr<T: NdrStructure>(
        &mut self,
        value: Option<&'a T>,
    ) -> Result<()> {
        self.write_embedded_struct_ptr(value)
    }

    /// Unique pointer to a NUL-terminated UTF-16 string.
    pub fn write_unique_string_ptr(&mut self, value: Option<&'a str>) -> Result<()> {
        self.write_embedded_string_ptr(value)
    }

    /// Full pointer to a structure. The encoder has no aliasing notion:
    /// every occurrence gets a fresh referent ID and its own body.
    pub fn write_full_struct_ptr<T: NdrStructure>(&mut self, value: Option<&'a T>) -> Result<()> {
        self.write_embedded_struct_ptr(value)
    }

    // Structures and unions

    /// Write a structure: align, then run its field sequence under a
    /// deferral scope so embedded pointer bodies follow the structure.
    pub fn write_struct<T: NdrStructure>(&mut self, value: &'a T) -> Result<()> {
        self.align(T::alignment(self.syntax));
        self.with_deferral_scope(|writer| value.marshal(writer))
    }

    /// Write a conformant structure: reserve the leading conformance slot,
    /// run the field sequence, and back-patch the slot if no conformant
    /// member closed it.
    ///
    /// # Panics
    ///
    /// Opening a second conformance slot while one is open is a caller
    /// contract violation and panics.
    pub fn write_conformant_struct<T: NdrConformantStructure>(
        &mut self,
        value: &'a T,
    ) -> Result<()> {
        let alignment = T::alignment(self.syntax).max(self.syntax.size_word_align());
        self.align(alignment);
        assert!(
            self.conformance_slot.is_none(),
            "conformance slot already open"
        );
        let slot = self.buf.len();
        for _ in 0..self.syntax.size_word_len() {
            self.buf.put_u8(0);
        }
        self.conformance_slot = Some(slot);

        self.deferred.push();
        let result = value.marshal(self);
        let queue = self.deferred.pop();
        if self.conformance_slot.take() == Some(slot) {
            self.patch_size_word(slot, value.conformance() as u64)?;
        }
        result?;
        self.drain(queue)
    }

    /// Write a non-encapsulated union: the value supplies its discriminant
    /// alongside the active arm; the deferral discipline matches
    /// structures.
    pub fn write_union<T: NdrUnion>(&mut self, value: &'a T) -> Result<()> {
        self.align(T::alignment(self.syntax));
        self.with_deferral_scope(|writer| value.marshal(writer))
    }

    // Arrays of primitives

    fn write_array_elements<T: NdrPrimitive>(&mut self, elements: &[T], total: usize) -> Result<()> {
        self.align(T::ALIGN);
        for element in elements {
            element.write_raw(&mut self.buf);
        }
        for _ in elements.len()..total {
            T::default().write_raw(&mut self.buf);
        }
        Ok(())
    }

    /// Fixed array: just the elements. An explicit count zero-fills the
    /// tail; `None` means the actual length.
    pub fn write_fixed_array<T: NdrPrimitive>(
        &mut self,
        elements: &[T],
        count: Option<usize>,
    ) -> Result<()> {
        let total = resolve_count(elements.len(), count)?;
        self.write_array_elements(elements, total)
    }

    /// Conformant array: max count, then the elements.
    pub fn write_conformant_array<T: NdrPrimitive>(
        &mut self,
        elements: &[T],
        count: Option<usize>,
    ) -> Result<()> {
        let total = resolve_count(elements.len(), count)?;
        self.write_conformance(total as u64)?;
        self.write_array_elements(elements, total)
    }

    /// Varying array: zero offset, actual count, then the elements.
    pub fn write_varying_array<T: NdrPrimitive>(
        &mut self,
        elements: &[T],
        count: Option<usize>,
    ) -> Result<()> {
        let total = resolve_count(elements.len(), count)?;
        self.write_variance(total as u64)?;
        self.write_array_elements(elements, total)
    }

    /// Conformant varying array: max count, zero offset, actual count, then
    /// the elements. The explicit count is the conformance; the actual
    /// count is always the slice length.
    pub fn write_conformant_varying_array<T: NdrPrimitive>(
        &mut self,
        elements: &[T],
        conformance: Option<usize>,
    ) -> Result<()> {
        let max = resolve_count(elements.len(), conformance)?;
        self.write_conformance(max as u64)?;
        self.write_variance(elements.len() as u64)?;
        self.write_array_elements(elements, elements.len())
    }

    // Arrays of structures
    //
    // One deferral scope wraps the whole array: embedded pointer bodies of
    // every element follow the array, not their own element.

    pub fn write_struct_array<T: NdrStructure>(&mut self, elements: &'a [T]) -> Result<()> {
        self.with_deferral_scope(|writer| {
            for element in elements {
                writer.align(T::alignment(writer.syntax));
                element.marshal(writer)?;
            }
            Ok(())
        })
    }

    pub fn write_conformant_struct_array<T: NdrStructure>(
        &mut self,
        elements: &'a [T],
        count: Option<usize>,
    ) -> Result<()> {
        let total = resolve_exact(elements.len(), count)?;
        self.write_conformance(total as u64)?;
        self.write_struct_array(elements)
    }

    pub fn write_varying_struct_array<T: NdrStructure>(&mut self, elements: &'a [T]) -> Result<()> {
        self.write_variance(elements.len() as u64)?;
        self.write_struct_array(elements)
    }

    pub fn write_conformant_varying_struct_array<T: NdrStructure>(
        &mut self,
        elements: &'a [T],
        conformance: Option<usize>,
    ) -> Result<()> {
        let max = resolve_count(elements.len(), conformance)?;
        self.write_conformance(max as u64)?;
        self.write_varying_struct_array(elements)
    }

    // Strings
    //
    // Wire format of a [string] parameter: a conformant varying array of
    // code units including the trailing NUL.

    /// NUL-terminated UTF-16 string as a conformant varying array.
    pub fn write_string(&mut self, value: &str) -> Result<()> {
        let mut units: Vec<u16> = value.encode_utf16().collect();
        units.push(0);
        let count = units.len() as u64;
        self.write_conformance(count)?;
        self.write_variance(count)?;
        for unit in units {
            self.write_u16(unit)?;
        }
        Ok(())
    }

    /// NUL-terminated ANSI string as a conformant varying array.
    pub fn write_ansi_string(&mut self, value: &str) -> Result<()> {
        let bytes = value.as_bytes();
        let count = (bytes.len() + 1) as u64;
        self.write_conformance(count)?;
        self.write_variance(count)?;
        self.write_bytes(bytes)?;
        self.write_u8(0)
    }

    /// Varying UTF-16 string: no conformance, just offset and count.
    pub fn write_varying_string(&mut self, value: &str) -> Result<()> {
        let mut units: Vec<u16> = value.encode_utf16().collect();
        units.push(0);
        self.write_variance(units.len() as u64)?;
        for unit in units {
            self.write_u16(unit)?;
        }
        Ok(())
    }

    /// Varying ANSI string.
    pub fn write_varying_ansi_string(&mut self, value: &str) -> Result<()> {
        let bytes = value.as_bytes();
        self.write_variance((bytes.len() + 1) as u64)?;
        self.write_bytes(bytes)?;
        self.write_u8(0)
    }

    /// Fixed UTF-16 string: exactly `count` code units, NUL-padded, no
    /// header words.
    pub fn write_fixed_string(&mut self, value: &str, count: usize) -> Result<()> {
        let units: Vec<u16> = value.encode_utf16().collect();
        if units.len() > count {
            return Err(NdrError::InvalidArgument(format!(
                "string of {} code units does not fit a fixed length of {}",
                units.len(),
                count
            )));
        }
        self.align(2);
        for unit in &units {
            self.write_u16(*unit)?;
        }
        for _ in units.len()..count {
            self.write_u16(0)?;
        }
        Ok(())
    }

    /// Fixed ANSI string: exactly `count` bytes, NUL-padded.
    pub fn write_fixed_ansi_string(&mut self, value: &str, count: usize) -> Result<()> {
        let bytes = value.as_bytes();
        if bytes.len() > count {
            return Err(NdrError::InvalidArgument(format!(
                "string of {} bytes does not fit a fixed length of {}",
                bytes.len(),
                count
            )));
        }
        self.write_bytes(bytes)?;
        for _ in bytes.len()..count {
            self.buf.put_u8(0);
        }
        Ok(())
    }

    // Pipes

    /// Write a pipe payload: a (count, elements) chunk when non-empty,
    /// terminated by a zero-count chunk.
    pub fn write_pipe<T: NdrPrimitive>(&mut self, data: &[T]) -> Result<()> {
        if !data.is_empty() {
            self.write_size_word(data.len() as u64)?;
            self.write_array_elements(data, data.len())?;
        }
        self.write_size_word(0)
    }

    // System handles

    /// Write a system handle: a 1-based index into the side list the caller
    /// transmits out-of-band, recorded together with the desired access
    /// mask.
    pub fn write_system_handle(
        &mut self,
        handle: &'a dyn SystemHandle,
        desired_access: u32,
    ) -> Result<()> {
        self.handles.push(HandleTransfer {
            handle,
            desired_access,
        });
        self.write_u32(self.handles.len() as u32)
    }
}

fn resolve_count(len: usize, count: Option<usize>) -> Result<usize> {
    match count {
        None => Ok(len),
        Some(count) if count < len => Err(NdrError::InvalidArgument(format!(
            "declared count {} is smaller than the {} elements supplied",
            count, len
        ))),
        Some(count) => Ok(count),
    }
}

fn resolve_exact(len: usize, count: Option<usize>) -> Result<usize> {
    match count {
        None => Ok(len),
        Some(count) if count != len => Err(NdrError::InvalidArgument(format!(
            "declared count {} does not match the {} structures supplied",
            count, len
        ))),
        Some(count) => Ok(count),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::NdrReader;
    use crate::syntax::NdrDataRepresentation;

    struct Packet {
        id: u32,
        payload: Vec<u8>,
    }

    impl NdrStructure for Packet {
        fn alignment(_syntax: TransferSyntax) -> usize {
            4
        }

        fn marshal<'a>(&'a self, writer: &mut NdrWriter<'a>) -> Result<()> {
            writer.write_u32(self.id)?;
            writer.write_conformant_array(&self.payload, None)
        }

        fn unmarshal(reader: &mut NdrReader<'_>) -> Result<Self> {
            let id = reader.read_u32()?;
            let payload = reader.read_conformant_array()?;
            Ok(Self { id, payload })
        }
    }

    impl NdrConformantStructure for Packet {
        fn conformance(&self) -> usize {
            self.payload.len()
        }
    }

    #[test]
    fn test_alignment_padding_emitted() {
        let mut writer = NdrWriter::new(TransferSyntax::Ndr);
        writer.write_u8(42).unwrap();
        writer.write_u32(0xDEADBEEF).unwrap();
        assert_eq!(writer.position(), 8); // 1 + 3 padding + 4
        let bytes = writer.to_bytes();
        assert_eq!(&bytes[..], &[42, 0, 0, 0, 0xEF, 0xBE, 0xAD, 0xDE]);
    }

    #[test]
    fn test_mixed_width_alignment_invariant() {
        let mut writer = NdrWriter::new(TransferSyntax::Ndr);
        writer.write_u8(1).unwrap();
        writer.write_u16(2).unwrap();
        assert_eq!(writer.position() % 2, 0);
        writer.write_u8(3).unwrap();
        writer.write_u64(4).unwrap();
        assert_eq!(writer.position(), 16);
    }

    #[test]
    fn test_null_pointer_is_four_zero_bytes() {
        let mut writer = NdrWriter::new(TransferSyntax::Ndr);
        writer.write_null_ptr().unwrap();
        assert_eq!(writer.position(), 4);
        let bytes = writer.to_bytes();
        assert_eq!(&bytes[..4], &[0, 0, 0, 0]);
        assert_eq!(bytes.len(), 8); // final padding only
    }

    #[test]
    fn test_referent_ids_increase_from_base() {
        let mut writer = NdrWriter::new(TransferSyntax::Ndr);
        writer.write_embedded_ptr(|w| w.write_u8(0xAA)).unwrap();
        writer.write_embedded_ptr(|w| w.write_u8(0xBB)).unwrap();
        let bytes = writer.to_bytes();
        // Top-level pointers: body follows each referent directly.
        assert_eq!(&bytes[0..4], &0x20000u32.to_le_bytes());
        assert_eq!(bytes[4], 0xAA);
        assert_eq!(&bytes[8..12], &0x20004u32.to_le_bytes());
        assert_eq!(bytes[12], 0xBB);
    }

    #[test]
    fn test_conformant_array_inline_count() {
        let mut writer = NdrWriter::new(TransferSyntax::Ndr);
        writer.write_conformant_array(&[1u8, 2, 3], None).unwrap();
        let bytes = writer.to_bytes();
        assert_eq!(&bytes[..7], &[3, 0, 0, 0, 1, 2, 3]);
    }

    #[test]
    fn test_explicit_count_zero_fills_tail() {
        let mut writer = NdrWriter::new(TransferSyntax::Ndr);
        writer.write_conformant_array(&[1u8, 2], Some(4)).unwrap();
        let bytes = writer.to_bytes();
        assert_eq!(&bytes[..8], &[4, 0, 0, 0, 1, 2, 0, 0]);
    }

    #[test]
    fn test_count_smaller_than_slice_is_invalid() {
        let mut writer = NdrWriter::new(TransferSyntax::Ndr);
        let err = writer
            .write_conformant_array(&[1u8, 2, 3], Some(2))
            .unwrap_err();
        assert!(matches!(err, NdrError::InvalidArgument(_)));
    }

    #[test]
    fn test_varying_array_offset_is_zero() {
        let mut writer = NdrWriter::new(TransferSyntax::Ndr);
        writer.write_varying_array(&[7u16, 8], None).unwrap();
        let bytes = writer.to_bytes();
        assert_eq!(&bytes[0..4], &[0, 0, 0, 0]); // offset
        assert_eq!(&bytes[4..8], &[2, 0, 0, 0]); // actual count
        assert_eq!(&bytes[8..12], &[7, 0, 8, 0]);
    }

    #[test]
    fn test_conformant_varying_string() {
        let mut writer = NdrWriter::new(TransferSyntax::Ndr);
        writer.write_string("ab").unwrap();
        let bytes = writer.to_bytes();
        assert_eq!(&bytes[0..4], &[3, 0, 0, 0]); // max including NUL
        assert_eq!(&bytes[4..8], &[0, 0, 0, 0]); // offset
        assert_eq!(&bytes[8..12], &[3, 0, 0, 0]); // actual including NUL
        assert_eq!(&bytes[12..18], &[b'a', 0, b'b', 0, 0, 0]);
    }

    #[test]
    fn test_conformant_struct_back_patch() {
        let packet = Packet {
            id: 7,
            payload: vec![1, 2, 3],
        };
        let mut writer = NdrWriter::new(TransferSyntax::Ndr);
        writer.write_conformant_struct(&packet).unwrap();
        let bytes = writer.to_bytes();
        // Conformance hoisted to the front, not repeated at the array.
        assert_eq!(
            &bytes[..],
            &[3, 0, 0, 0, 7, 0, 0, 0, 1, 2, 3, 0, 0, 0, 0, 0]
        );

        // Byte-identical to writing the count inline before the structure
        // fields if no slot mechanism were used.
        let mut manual = NdrWriter::new(TransferSyntax::Ndr);
        manual.write_u32(3).unwrap();
        manual.write_u32(7).unwrap();
        manual.write_bytes(&[1, 2, 3]).unwrap();
        assert_eq!(writer_bytes(manual), bytes);
    }

    fn writer_bytes(writer: NdrWriter<'_>) -> Bytes {
        writer.to_bytes()
    }

    #[test]
    fn test_embedded_pointer_body_follows_aggregate() {
        struct Linked {
            a: u32,
            target: Option<u32>,
            b: u32,
        }

        impl NdrStructure for Linked {
            fn marshal<'a>(&'a self, writer: &mut NdrWriter<'a>) -> Result<()> {
                writer.write_u32(self.a)?;
                match self.target {
                    Some(value) => writer.write_embedded_ptr(move |w| w.write_u32(value))?,
                    None => writer.write_null_ptr()?,
                }
                writer.write_u32(self.b)
            }

            fn unmarshal(_reader: &mut NdrReader<'_>) -> Result<Self> {
                unimplemented!("encode-only test type")
            }
        }

        let value = Linked {
            a: 1,
            target: Some(9),
            b: 2,
        };
        let mut writer = NdrWriter::new(TransferSyntax::Ndr);
        writer.write_struct(&value).unwrap();
        let bytes = writer.to_bytes();
        // a, referent, b, then the deferred body.
        assert_eq!(&bytes[0..4], &1u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &0x20000u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &2u32.to_le_bytes());
        assert_eq!(&bytes[12..16], &9u32.to_le_bytes());
    }

    #[test]
    fn test_ndr64_size_words_are_eight_bytes() {
        let mut writer = NdrWriter::new(TransferSyntax::Ndr64);
        writer.write_conformant_array(&[1u8, 2], None).unwrap();
        let bytes = writer.to_bytes();
        assert_eq!(&bytes[0..8], &2u64.to_le_bytes());
        assert_eq!(&bytes[8..10], &[1, 2]);
    }

    #[test]
    fn test_ndr64_referent_is_eight_bytes() {
        let mut writer = NdrWriter::new(TransferSyntax::Ndr64);
        writer.write_embedded_ptr(|w| w.write_u8(5)).unwrap();
        let bytes = writer.to_bytes();
        assert_eq!(&bytes[0..8], &0x20000u64.to_le_bytes());
        assert_eq!(bytes[8], 5);
    }

    #[test]
    fn test_final_buffer_is_eight_byte_aligned() {
        let mut writer = NdrWriter::new(TransferSyntax::Ndr);
        writer.write_u8(1).unwrap();
        let bytes = writer.to_bytes();
        assert_eq!(bytes.len(), 8);
        assert_eq!(&bytes[1..], &[0u8; 7]);
    }

    #[test]
    #[should_panic(expected = "conformance slot already open")]
    fn test_second_conformance_slot_panics() {
        struct Nested(Packet);

        impl NdrStructure for Nested {
            fn marshal<'a>(&'a self, writer: &mut NdrWriter<'a>) -> Result<()> {
                // Directly embedding a conformant structure would need its
                // conformance hoisted; opening a second slot is a contract
                // violation.
                writer.write_conformant_struct(&self.0)
            }

            fn unmarshal(_reader: &mut NdrReader<'_>) -> Result<Self> {
                unimplemented!("encode-only test type")
            }
        }

        impl NdrConformantStructure for Nested {
            fn conformance(&self) -> usize {
                self.0.payload.len()
            }
        }

        let nested = Nested(Packet {
            id: 1,
            payload: vec![2],
        });
        let mut writer = NdrWriter::new(TransferSyntax::Ndr);
        let _ = writer.write_conformant_struct(&nested);
    }

    #[test]
    fn test_pipe_chunks_and_terminator() {
        let mut writer = NdrWriter::new(TransferSyntax::Ndr);
        writer.write_pipe(&[1u8, 2, 3]).unwrap();
        let bytes = writer.to_bytes();
        assert_eq!(&bytes[0..4], &[3, 0, 0, 0]);
        assert_eq!(&bytes[4..7], &[1, 2, 3]);
        assert_eq!(&bytes[8..12], &[0, 0, 0, 0]); // terminator, 4-aligned
    }

    #[test]
    fn test_empty_pipe_is_just_the_terminator() {
        let mut writer = NdrWriter::new(TransferSyntax::Ndr);
        writer.write_pipe::<u32>(&[]).unwrap();
        let bytes = writer.to_bytes();
        assert_eq!(&bytes[0..4], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_conformant_struct_roundtrip() {
        let packet = Packet {
            id: 0xABCD,
            payload: vec![9, 8, 7, 6],
        };
        let mut writer = NdrWriter::new(TransferSyntax::Ndr);
        writer.write_conformant_struct(&packet).unwrap();
        let bytes = writer.to_bytes();

        let mut reader = NdrReader::new(
            &bytes,
            TransferSyntax::Ndr,
            NdrDataRepresentation::ndr(),
        )
        .unwrap();
        let decoded: Packet = reader.read_conformant_struct().unwrap();
        assert_eq!(decoded.id, packet.id);
        assert_eq!(decoded.payload, packet.payload);
    }
}
