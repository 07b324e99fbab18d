//! NDR decoder.
//!
//! [`NdrReader`] mirrors the encoder exactly: one read operation per write
//! operation, consuming the identical byte grammar. Aggregate reads follow
//! the same deferral discipline, so embedded pointer targets are populated
//! once the enclosing aggregate's immediate members have been read. Full
//! pointers resolve through a referent cache: repeated occurrences of one
//! referent ID decode to one shared instance.

use tracing::{debug, trace};

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use crate::defer::DeferralStack;
use crate::error::{
    NdrError, Result, MAX_NDR_ALLOCATION_SIZE, MAX_NDR_ARRAY_ELEMENTS,
};
use crate::handles::SystemHandle;
use crate::pointers::NdrEmbedded;
use crate::syntax::{align_padding, NdrDataRepresentation, TransferSyntax};
use crate::types::{NdrPrimitive, NdrStructure, NdrUnion, NdrUuid};

type DeferredRead<'a> = Box<dyn FnOnce(&mut NdrReader<'a>) -> Result<()> + 'a>;

/// NDR decoder over a borrowed input buffer.
///
/// One reader serves exactly one decode operation. Construction validates
/// the declared data representation before any read; dropping the reader
/// releases every duplicated handle the caller never claimed.
pub struct NdrReader<'a> {
    syntax: TransferSyntax,
    data: &'a [u8],
    pos: usize,
    deferred: DeferralStack<DeferredRead<'a>>,
    referents: HashMap<u64, Rc<dyn Any>>,
    conformance_slot: Option<u64>,
    handles: Vec<Box<dyn SystemHandle>>,
}

impl<'a> NdrReader<'a> {
    /// Construct over `data`, rejecting any representation other than
    /// little-endian/IEEE/ASCII before a single byte is consumed.
    pub fn new(
        data: &'a [u8],
        syntax: TransferSyntax,
        representation: NdrDataRepresentation,
    ) -> Result<Self> {
        representation.validate()?;
        Ok(Self {
            syntax,
            data,
            pos: 0,
            deferred: DeferralStack::new(),
            referents: HashMap::new(),
            conformance_slot: None,
            handles: Vec::new(),
        })
    }

    /// Construct with a handle list referenced by index from the payload.
    /// Each handle is duplicated so the reader owns independently closable
    /// copies.
    pub fn with_handles(
        data: &'a [u8],
        syntax: TransferSyntax,
        representation: NdrDataRepresentation,
        handles: &[&dyn SystemHandle],
    ) -> Result<Self> {
        let mut reader = Self::new(data, syntax, representation)?;
        let mut owned = Vec::with_capacity(handles.len());
        for handle in handles {
            owned.push(handle.duplicate()?);
        }
        debug!(count = owned.len(), "decoder duplicated handle table");
        reader.handles = owned;
        Ok(reader)
    }

    pub fn syntax(&self) -> TransferSyntax {
        self.syntax
    }

    /// Current byte offset from the start of the buffer.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn check(&self, needed: usize) -> Result<()> {
        if self.remaining() < needed {
            return Err(NdrError::UnexpectedEndOfData {
                needed,
                have: self.remaining(),
            });
        }
        Ok(())
    }

    /// Skip padding so the next read lands on `alignment`.
    fn skip_align(&mut self, alignment: usize) -> Result<()> {
        let padding = align_padding(self.pos, alignment);
        self.check(padding)?;
        self.pos += padding;
        Ok(())
    }

    /// Consume raw bytes with no alignment.
    pub fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        self.check(len)?;
        let out = self.data[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(out)
    }

    // Primitives

    /// Read a fixed-width scalar, skipping to its natural alignment first.
    pub fn read_primitive<T: NdrPrimitive>(&mut self) -> Result<T> {
        self.skip_align(T::ALIGN)?;
        self.check(T::SIZE)?;
        let value = T::read_raw(&self.data[self.pos..]);
        self.pos += T::SIZE;
        Ok(value)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.read_primitive()
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        self.read_primitive()
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        self.read_primitive()
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        self.read_primitive()
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.read_primitive()
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        self.read_primitive()
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.read_primitive()
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        self.read_primitive()
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        self.read_primitive()
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        self.read_primitive()
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    /// 16-bit character (wchar_t code unit).
    pub fn read_wchar(&mut self) -> Result<u16> {
        self.read_u16()
    }

    /// 16-bit enum; 32 bits on the wire under NDR64.
    pub fn read_enum16(&mut self) -> Result<u16> {
        match self.syntax {
            TransferSyntax::Ndr => self.read_u16(),
            TransferSyntax::Ndr64 => {
                let value = self.read_u32()?;
                u16::try_from(value).map_err(|_| NdrError::InvalidEnumValue(i64::from(value)))
            }
        }
    }

    /// MIDL `__int3264`: sign-extends from 4 bytes under NDR.
    pub fn read_int3264(&mut self) -> Result<i64> {
        match self.syntax {
            TransferSyntax::Ndr => Ok(i64::from(self.read_i32()?)),
            TransferSyntax::Ndr64 => self.read_i64(),
        }
    }

    /// MIDL `unsigned __int3264`.
    pub fn read_uint3264(&mut self) -> Result<u64> {
        match self.syntax {
            TransferSyntax::Ndr => Ok(u64::from(self.read_u32()?)),
            TransferSyntax::Ndr64 => self.read_u64(),
        }
    }

    pub fn read_guid(&mut self) -> Result<NdrUuid> {
        self.read_struct()
    }

    // Size-dependent fields

    fn read_size_word(&mut self) -> Result<u64> {
        match self.syntax {
            TransferSyntax::Ndr => Ok(u64::from(self.read_u32()?)),
            TransferSyntax::Ndr64 => self.read_u64(),
        }
    }

    /// Read a conformance count: from the open slot a conformant structure
    /// filled (consuming it), inline otherwise.
    pub(crate) fn read_conformance(&mut self) -> Result<u64> {
        match self.conformance_slot.take() {
            Some(count) => Ok(count),
            None => self.read_size_word(),
        }
    }

    fn read_variance(&mut self) -> Result<(u64, u64)> {
        let offset = self.read_size_word()?;
        let actual = self.read_size_word()?;
        Ok((offset, actual))
    }

    fn bounded_count(&self, count: u64) -> Result<usize> {
        let count = usize::try_from(count).map_err(|_| NdrError::IntegerOverflow)?;
        if count > MAX_NDR_ARRAY_ELEMENTS {
            return Err(NdrError::AllocationLimitExceeded {
                requested: count,
                limit: MAX_NDR_ARRAY_ELEMENTS,
            });
        }
        Ok(count)
    }

    // Deferral

    fn drain(&mut self, mut queue: VecDeque<DeferredRead<'a>>) -> Result<()> {
        if !queue.is_empty() {
            trace!(pending = queue.len(), "running deferred reads");
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

    fn defer_or_run(&mut self, op: DeferredRead<'a>) -> Result<()> {
        if self.deferred.is_empty() {
            op(self)
        } else {
            self.deferred.defer(op);
            Ok(())
        }
    }

    // Pointers

    /// Read a referent ID (4 or 8 bytes per the transfer syntax).
    pub fn read_referent(&mut self) -> Result<u64> {
        self.read_size_word()
    }

    /// Read an embedded pointer. A zero referent yields a null cell and
    /// consumes nothing further; otherwise `read` is deferred until the
    /// enclosing aggregate's members are done, then fills the cell.
    pub fn read_embedded_ptr<T, F>(&mut self, read: F) -> Result<NdrEmbedded<T>>
    where
        T: 'a,
        F: FnOnce(&mut NdrReader<'a>) -> Result<T> + 'a,
    {
        let referent = self.read_referent()?;
        if referent == 0 {
            return Ok(NdrEmbedded::null());
        }
        let cell = NdrEmbedded::pending();
        let slot = cell.share();
        self.defer_or_run(Box::new(move |reader| {
            let value = read(reader)?;
            *slot.borrow_mut() = Some(value);
            Ok(())
        }))?;
        Ok(cell)
    }

    /// Embedded pointer to a structure.
    pub fn read_embedded_struct_ptr<T>(&mut self) -> Result<NdrEmbedded<T>>
    where
        T: NdrStructure + 'a,
    {
        self.read_embedded_ptr(|reader| reader.read_struct::<T>())
    }

    /// Embedded pointer to a NUL-terminated UTF-16 string.
    pub fn read_embedded_string_ptr(&mut self) -> Result<NdrEmbedded<String>> {
        self.read_embedded_ptr(|reader| reader.read_string())
    }

    /// Embedded pointer to a NUL-terminated ANSI string.
    pub fn read_embedded_ansi_string_ptr(&mut self) -> Result<NdrEmbedded<String>> {
        self.read_embedded_ptr(|reader| reader.read_ansi_string())
    }

    /// Embedded full pointer: occurrences sharing a referent ID share one
    /// decoded instance, and only the first consumes body bytes.
    pub fn read_embedded_full_struct_ptr<T>(&mut self) -> Result<NdrEmbedded<Rc<T>>>
    where
        T: NdrStructure + 'static,
    {
        let referent = self.read_referent()?;
        if referent == 0 {
            return Ok(NdrEmbedded::null());
        }
        let cell = NdrEmbedded::pending();
        let slot = cell.share();
        self.defer_or_run(Box::new(move |reader| {
            let value = reader.resolve_full_referent::<T>(referent)?;
            *slot.borrow_mut() = Some(value);
            Ok(())
        }))?;
        Ok(cell)
    }

    /// Top-level unique pointer to a structure: the body directly follows
    /// the referent field.
    pub fn read_struct_ptr<T: NdrStructure>(&mut self) -> Result<Option<T>> {
        let referent = self.read_referent()?;
        if referent == 0 {
            return Ok(None);
        }
        Ok(Some(self.read_struct()?))
    }

    /// Top-level unique pointer to a NUL-terminated UTF-16 string.
    pub fn read_string_ptr(&mut self) -> Result<Option<String>> {
        let referent = self.read_referent()?;
        if referent == 0 {
            return Ok(None);
        }
        Ok(Some(self.read_string()?))
    }

    /// Top-level full pointer to a structure.
    pub fn read_full_struct_ptr<T>(&mut self) -> Result<Option<Rc<T>>>
    where
        T: NdrStructure + 'static,
    {
        let referent = self.read_referent()?;
        if referent == 0 {
            return Ok(None);
        }
        Ok(Some(self.resolve_full_referent(referent)?))
    }

    fn resolve_full_referent<T>(&mut self, referent: u64) -> Result<Rc<T>>
    where
        T: NdrStructure + 'static,
    {
        if let Some(existing) = self.referents.get(&referent) {
            return Rc::clone(existing)
                .downcast::<T>()
                .map_err(|_| NdrError::InvalidPointer(referent));
        }
        let value = Rc::new(self.read_struct::<T>()?);
        self.referents.insert(referent, Rc::clone(&value) as Rc<dyn Any>);
        Ok(value)
    }

    // Structures and unions

    /// Read a structure: align, then run its field sequence under a
    /// deferral scope, then populate its embedded pointer targets.
    pub fn read_struct<T: NdrStructure>(&mut self) -> Result<T> {
        self.skip_align(T::alignment(self.syntax))?;
        self.with_deferral_scope(|reader| T::unmarshal(reader))
    }

    /// Read a conformant structure: the leading count fills the conformance
    /// slot, which the embedded conformant member consumes instead of
    /// reading its count inline.
    pub fn read_conformant_struct<T: NdrStructure>(&mut self) -> Result<T> {
        let alignment = T::alignment(self.syntax).max(self.syntax.size_word_align());
        self.skip_align(alignment)?;
        let conformance = self.read_size_word()?;
        assert!(
            self.conformance_slot.is_none(),
            "conformance slot already open"
        );
        self.conformance_slot = Some(conformance);

        self.deferred.push();
        let result = T::unmarshal(self);
        let queue = self.deferred.pop();
        self.conformance_slot = None;
        match result {
            Ok(value) => {
                self.drain(queue)?;
                Ok(value)
            }
            Err(err) => Err(err),
        }
    }

    /// Read a non-encapsulated union: the implementation reads the
    /// discriminant and selects the arm.
    pub fn read_union<T: NdrUnion>(&mut self) -> Result<T> {
        self.skip_align(T::alignment(self.syntax))?;
        self.with_deferral_scope(|reader| T::unmarshal(reader))
    }

    // Arrays of primitives

    /// Fixed array of `count` elements, no header words.
    pub fn read_fixed_array<T: NdrPrimitive>(&mut self, count: usize) -> Result<Vec<T>> {
        self.skip_align(T::ALIGN)?;
        let byte_len = count.checked_mul(T::SIZE).ok_or(NdrError::IntegerOverflow)?;
        self.check(byte_len)?;
        let mut elements = Vec::with_capacity(count);
        for _ in 0..count {
            elements.push(T::read_raw(&self.data[self.pos..]));
            self.pos += T::SIZE;
        }
        Ok(elements)
    }

    /// Conformant array: max count, then the elements.
    pub fn read_conformant_array<T: NdrPrimitive>(&mut self) -> Result<Vec<T>> {
        let max = self.read_conformance()?;
        let count = self.bounded_count(max)?;
        self.read_fixed_array(count)
    }

    /// Varying array: offset and actual count, then the elements. The
    /// offset is always zero in this implementation and is discarded.
    pub fn read_varying_array<T: NdrPrimitive>(&mut self) -> Result<Vec<T>> {
        let (_offset, actual) = self.read_variance()?;
        let count = self.bounded_count(actual)?;
        self.read_fixed_array(count)
    }

    /// Conformant varying array: both headers, then the transmitted
    /// elements.
    pub fn read_conformant_varying_array<T: NdrPrimitive>(&mut self) -> Result<Vec<T>> {
        let max = self.read_conformance()?;
        let (offset, actual) = self.read_variance()?;
        let total = offset.checked_add(actual).ok_or(NdrError::IntegerOverflow)?;
        if total > max {
            return Err(NdrError::ConformanceMismatch {
                max_count: max,
                actual_count: total,
            });
        }
        let count = self.bounded_count(actual)?;
        self.read_fixed_array(count)
    }

    // Arrays of structures

    /// Fixed array of `count` structures. One deferral scope wraps the
    /// whole array, so every element's pointer targets follow the array.
    pub fn read_struct_array<T: NdrStructure>(&mut self, count: usize) -> Result<Vec<T>> {
        self.with_deferral_scope(|reader| {
            let mut elements = Vec::with_capacity(count.min(MAX_NDR_ARRAY_ELEMENTS));
            for _ in 0..count {
                reader.skip_align(T::alignment(reader.syntax))?;
                elements.push(T::unmarshal(reader)?);
            }
            Ok(elements)
        })
    }

    pub fn read_conformant_struct_array<T: NdrStructure>(&mut self) -> Result<Vec<T>> {
        let max = self.read_conformance()?;
        let count = self.bounded_count(max)?;
        self.read_struct_array(count)
    }

    pub fn read_varying_struct_array<T: NdrStructure>(&mut self) -> Result<Vec<T>> {
        let (_offset, actual) = self.read_variance()?;
        let count = self.bounded_count(actual)?;
        self.read_struct_array(count)
    }

    pub fn read_conformant_varying_struct_array<T: NdrStructure>(&mut self) -> Result<Vec<T>> {
        let max = self.read_conformance()?;
        let (offset, actual) = self.read_variance()?;
        let total = offset.checked_add(actual).ok_or(NdrError::IntegerOverflow)?;
        if total > max {
            return Err(NdrError::ConformanceMismatch {
                max_count: max,
                actual_count: total,
            });
        }
        let count = self.bounded_count(actual)?;
        self.read_struct_array(count)
    }

    // Strings

    fn read_utf16_raw(&mut self, count: usize) -> Result<Vec<u16>> {
        if count > MAX_NDR_ALLOCATION_SIZE / 2 {
            return Err(NdrError::AllocationLimitExceeded {
                requested: count,
                limit: MAX_NDR_ALLOCATION_SIZE / 2,
            });
        }
        let byte_len = count.checked_mul(2).ok_or(NdrError::IntegerOverflow)?;
        self.skip_align(2)?;
        self.check(byte_len)?;
        let mut units = Vec::with_capacity(count);
        for _ in 0..count {
            units.push(u16::read_raw(&self.data[self.pos..]));
            self.pos += 2;
        }
        Ok(units)
    }

    fn decode_utf16(units: Vec<u16>) -> Result<String> {
        char::decode_utf16(units)
            .collect::<std::result::Result<String, _>>()
            .map_err(NdrError::Utf16Error)
    }

    fn read_ansi_raw(&mut self, count: usize) -> Result<Vec<u8>> {
        if count > MAX_NDR_ALLOCATION_SIZE {
            return Err(NdrError::AllocationLimitExceeded {
                requested: count,
                limit: MAX_NDR_ALLOCATION_SIZE,
            });
        }
        self.read_bytes(count)
    }

    fn check_string_headers(max: u64, offset: u64, actual: u64) -> Result<usize> {
        if offset != 0 {
            return Err(NdrError::InvalidString("non-zero offset".to_string()));
        }
        if actual > max {
            return Err(NdrError::ConformanceMismatch {
                max_count: max,
                actual_count: actual,
            });
        }
        usize::try_from(actual).map_err(|_| NdrError::IntegerOverflow)
    }

    /// NUL-terminated UTF-16 string as a conformant varying array.
    pub fn read_string(&mut self) -> Result<String> {
        let max = self.read_conformance()?;
        let (offset, actual) = self.read_variance()?;
        let count = Self::check_string_headers(max, offset, actual)?;
        let mut units = self.read_utf16_raw(count)?;
        if units.last() == Some(&0) {
            units.pop();
        }
        Self::decode_utf16(units)
    }

    /// NUL-terminated ANSI string as a conformant varying array.
    pub fn read_ansi_string(&mut self) -> Result<String> {
        let max = self.read_conformance()?;
        let (offset, actual) = self.read_variance()?;
        let count = Self::check_string_headers(max, offset, actual)?;
        let mut bytes = self.read_ansi_raw(count)?;
        if bytes.last() == Some(&0) {
            bytes.pop();
        }
        Ok(String::from_utf8(bytes)?)
    }

    /// Varying UTF-16 string: offset and count only.
    pub fn read_varying_string(&mut self) -> Result<String> {
        let (offset, actual) = self.read_variance()?;
        let count = Self::check_string_headers(u64::MAX, offset, actual)?;
        let mut units = self.read_utf16_raw(count)?;
        if units.last() == Some(&0) {
            units.pop();
        }
        Self::decode_utf16(units)
    }

    /// Varying ANSI string.
    pub fn read_varying_ansi_string(&mut self) -> Result<String> {
        let (offset, actual) = self.read_variance()?;
        let count = Self::check_string_headers(u64::MAX, offset, actual)?;
        let mut bytes = self.read_ansi_raw(count)?;
        if bytes.last() == Some(&0) {
            bytes.pop();
        }
        Ok(String::from_utf8(bytes)?)
    }

    /// Fixed UTF-16 string: exactly `count` code units, trailing NUL
    /// padding stripped.
    pub fn read_fixed_string(&mut self, count: usize) -> Result<String> {
        let mut units = self.read_utf16_raw(count)?;
        while units.last() == Some(&0) {
            units.pop();
        }
        Self::decode_utf16(units)
    }

    /// Fixed ANSI string: exactly `count` bytes, trailing NUL padding
    /// stripped.
    pub fn read_fixed_ansi_string(&mut self, count: usize) -> Result<String> {
        let mut bytes = self.read_ansi_raw(count)?;
        while bytes.last() == Some(&0) {
            bytes.pop();
        }
        Ok(String::from_utf8(bytes)?)
    }

    // Pipes

    /// Read a pipe payload: (count, elements) chunks until a zero count,
    /// concatenated.
    pub fn read_pipe<T: NdrPrimitive>(&mut self) -> Result<Vec<T>> {
        let mut data = Vec::new();
        loop {
            let chunk = self.read_size_word()?;
            if chunk == 0 {
                break;
            }
            let count = self.bounded_count(chunk)?;
            let total = data.len().checked_add(count).ok_or(NdrError::IntegerOverflow)?;
            if total > MAX_NDR_ARRAY_ELEMENTS {
                return Err(NdrError::AllocationLimitExceeded {
                    requested: total,
                    limit: MAX_NDR_ARRAY_ELEMENTS,
                });
            }
            data.extend(self.read_fixed_array::<T>(count)?);
        }
        Ok(data)
    }

    // System handles

    /// Claim a system handle: reads its index and duplicates the indexed
    /// handle again, transferring ownership of the copy to the caller. The
    /// reader's own copy stays open until the reader is dropped.
    pub fn read_system_handle<T: SystemHandle>(&mut self) -> Result<T> {
        let index = self.read_u32()?;
        let slot = index
            .checked_sub(1)
            .and_then(|i| self.handles.get(i as usize))
            .ok_or(NdrError::InvalidHandleIndex(index))?;
        let duplicate = slot.duplicate()?;
        trace!(index, "claimed system handle");
        duplicate
            .into_any()
            .downcast::<T>()
            .map(|handle| *handle)
            .map_err(|_| NdrError::UnsupportedType("system handle type mismatch"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::NdrWriter;

    use std::cell::Cell;
    use std::io;

    fn reader(data: &[u8]) -> NdrReader<'_> {
        NdrReader::new(data, TransferSyntax::Ndr, NdrDataRepresentation::ndr()).unwrap()
    }

    #[derive(Debug, PartialEq)]
    struct Node {
        value: u32,
    }

    impl NdrStructure for Node {
        fn marshal<'a>(&'a self, writer: &mut NdrWriter<'a>) -> Result<()> {
            writer.write_u32(self.value)
        }

        fn unmarshal(reader: &mut NdrReader<'_>) -> Result<Self> {
            Ok(Self {
                value: reader.read_u32()?,
            })
        }
    }

    #[test]
    fn test_read_past_end_errors() {
        let mut r = reader(&[1, 2]);
        let err = r.read_u32().unwrap_err();
        assert!(matches!(
            err,
            NdrError::UnexpectedEndOfData { needed: 4, have: 2 }
        ));
    }

    #[test]
    fn test_alignment_skipped_on_read() {
        let mut r = reader(&[42, 0, 0, 0, 0xEF, 0xBE, 0xAD, 0xDE]);
        assert_eq!(r.read_u8().unwrap(), 42);
        assert_eq!(r.read_u32().unwrap(), 0xDEADBEEF);
        assert_eq!(r.position(), 8);
    }

    #[test]
    fn test_representation_rejection_before_any_read() {
        let rep = NdrDataRepresentation::decode([0x00, 0x00, 0x00, 0x00]); // big-endian
        let result = NdrReader::new(&[1, 2, 3, 4], TransferSyntax::Ndr, rep);
        assert!(matches!(
            result,
            Err(NdrError::UnsupportedDataRepresentation(_))
        ));
    }

    #[test]
    fn test_zero_referent_consumes_nothing_further() {
        let mut r = reader(&[0, 0, 0, 0, 0xFF, 0xFF, 0xFF, 0xFF]);
        let decoded: Option<Node> = r.read_struct_ptr().unwrap();
        assert!(decoded.is_none());
        assert_eq!(r.position(), 4);
    }

    #[test]
    fn test_full_pointer_aliasing_yields_shared_instance() {
        struct TwoPtrs {
            first: NdrEmbedded<Rc<Node>>,
            second: NdrEmbedded<Rc<Node>>,
        }

        impl NdrStructure for TwoPtrs {
            fn marshal<'a>(&'a self, _writer: &mut NdrWriter<'a>) -> Result<()> {
                unimplemented!("decode-only test type")
            }

            fn unmarshal(reader: &mut NdrReader<'_>) -> Result<Self> {
                Ok(Self {
                    first: reader.read_embedded_full_struct_ptr()?,
                    second: reader.read_embedded_full_struct_ptr()?,
                })
            }
        }

        // Two occurrences of referent 0x20000, one body (42).
        let mut data = Vec::new();
        data.extend_from_slice(&0x20000u32.to_le_bytes());
        data.extend_from_slice(&0x20000u32.to_le_bytes());
        data.extend_from_slice(&42u32.to_le_bytes());

        let mut r = reader(&data);
        let decoded: TwoPtrs = r.read_struct().unwrap();
        let first = decoded.first.into_option().unwrap();
        let second = decoded.second.into_option().unwrap();
        assert_eq!(first.value, 42);
        assert!(Rc::ptr_eq(&first, &second));
        // The second occurrence consumed no body bytes.
        assert_eq!(r.position(), 12);
    }

    #[test]
    fn test_embedded_pointer_fills_after_members() {
        struct Holder {
            before: u32,
            target: NdrEmbedded<u32>,
            after: u32,
        }

        impl NdrStructure for Holder {
            fn marshal<'a>(&'a self, _writer: &mut NdrWriter<'a>) -> Result<()> {
                unimplemented!("decode-only test type")
            }

            fn unmarshal(reader: &mut NdrReader<'_>) -> Result<Self> {
                let before = reader.read_u32()?;
                let target = reader.read_embedded_ptr(|r| r.read_u32())?;
                let after = reader.read_u32()?;
                Ok(Self {
                    before,
                    target,
                    after,
                })
            }
        }

        let mut data = Vec::new();
        data.extend_from_slice(&1u32.to_le_bytes());
        data.extend_from_slice(&0x20000u32.to_le_bytes());
        data.extend_from_slice(&2u32.to_le_bytes());
        data.extend_from_slice(&9u32.to_le_bytes()); // deferred body

        let mut r = reader(&data);
        let decoded: Holder = r.read_struct().unwrap();
        assert_eq!(decoded.before, 1);
        assert_eq!(decoded.after, 2);
        assert_eq!(decoded.target.into_option(), Some(9));
    }

    #[test]
    fn test_conformance_mismatch_rejected() {
        // max 2, offset 0, actual 3
        let mut data = Vec::new();
        data.extend_from_slice(&2u32.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&3u32.to_le_bytes());
        data.extend_from_slice(&[1, 2, 3]);

        let mut r = reader(&data);
        let err = r.read_conformant_varying_array::<u8>().unwrap_err();
        assert!(matches!(err, NdrError::ConformanceMismatch { .. }));
    }

    #[test]
    fn test_allocation_limit_guards_decode() {
        let mut data = Vec::new();
        data.extend_from_slice(&(2 * 1024 * 1024u32).to_le_bytes());
        let mut r = reader(&data);
        let err = r.read_conformant_array::<u8>().unwrap_err();
        assert!(matches!(err, NdrError::AllocationLimitExceeded { .. }));
    }

    #[test]
    fn test_string_with_nonzero_offset_rejected() {
        let mut data = Vec::new();
        data.extend_from_slice(&4u32.to_le_bytes()); // max
        data.extend_from_slice(&1u32.to_le_bytes()); // offset (invalid)
        data.extend_from_slice(&3u32.to_le_bytes()); // actual
        data.extend_from_slice(&[b'a', 0, b'b', 0, 0, 0]);

        let mut r = reader(&data);
        let err = r.read_string().unwrap_err();
        assert!(matches!(err, NdrError::InvalidString(_)));
    }

    #[test]
    fn test_varying_string_roundtrip() {
        let mut writer = NdrWriter::new(TransferSyntax::Ndr);
        writer.write_varying_string("hello").unwrap();
        let bytes = writer.to_bytes();
        let mut r = reader(&bytes);
        assert_eq!(r.read_varying_string().unwrap(), "hello");
    }

    #[test]
    fn test_enum16_ndr64_out_of_range() {
        let mut data = Vec::new();
        data.extend_from_slice(&0x12345u32.to_le_bytes());
        let mut r =
            NdrReader::new(&data, TransferSyntax::Ndr64, NdrDataRepresentation::ndr()).unwrap();
        let err = r.read_enum16().unwrap_err();
        assert!(matches!(err, NdrError::InvalidEnumValue(0x12345)));
    }

    #[derive(Debug)]
    struct CountingHandle {
        id: u32,
        dups: Rc<Cell<usize>>,
    }

    impl SystemHandle for CountingHandle {
        fn duplicate(&self) -> io::Result<Box<dyn SystemHandle>> {
            self.dups.set(self.dups.get() + 1);
            Ok(Box::new(CountingHandle {
                id: self.id,
                dups: Rc::clone(&self.dups),
            }))
        }

        fn into_any(self: Box<Self>) -> Box<dyn Any> {
            self
        }
    }

    #[test]
    fn test_system_handle_duplicated_on_construction_and_claim() {
        let dups = Rc::new(Cell::new(0));
        let handle = CountingHandle {
            id: 77,
            dups: Rc::clone(&dups),
        };

        let mut writer = NdrWriter::new(TransferSyntax::Ndr);
        writer.write_system_handle(&handle, 0x001F_0000).unwrap();
        assert_eq!(writer.handles().len(), 1);
        assert_eq!(writer.handles()[0].desired_access, 0x001F_0000);
        let bytes = writer.to_bytes();

        let mut r = NdrReader::with_handles(
            &bytes,
            TransferSyntax::Ndr,
            NdrDataRepresentation::ndr(),
            &[&handle],
        )
        .unwrap();
        assert_eq!(dups.get(), 1); // duplicated into the reader's table

        let claimed: CountingHandle = r.read_system_handle().unwrap();
        assert_eq!(claimed.id, 77);
        assert_eq!(dups.get(), 2); // duplicated again on claim
    }

    #[test]
    fn test_invalid_handle_index() {
        let mut data = Vec::new();
        data.extend_from_slice(&5u32.to_le_bytes());
        let mut r = reader(&data);
        let err = r.read_system_handle::<CountingHandle>().unwrap_err();
        assert!(matches!(err, NdrError::InvalidHandleIndex(5)));
    }

    #[test]
    fn test_pipe_multiple_chunks_concatenated() {
        let mut data = Vec::new();
        data.extend_from_slice(&2u32.to_le_bytes());
        data.extend_from_slice(&[1, 2]);
        data.extend_from_slice(&[0, 0]); // padding to align the next count
        data.extend_from_slice(&1u32.to_le_bytes());
        data.push(3);
        data.extend_from_slice(&[0, 0, 0]); // padding
        data.extend_from_slice(&0u32.to_le_bytes());

        let mut r = reader(&data);
        assert_eq!(r.read_pipe::<u8>().unwrap(), vec![1, 2, 3]);
    }
}
