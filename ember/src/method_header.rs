//! Compact method metadata stored in front of a method's code.
//!
//! The header is read backward from the method's anchor (the first byte
//! after the header). The byte just below the anchor selects the shape:
//!
//! ```text
//! small  (leading < 0x80), two bytes, lowest address first:
//!     [lll ppppp] [0 sssss ll]
//!      locals low 3 | params 5   stack 5 | locals high 2
//!
//! large  (leading >= 0x80), walked from the anchor downward:
//!     flags      1 I T E        (0x80 marks the large form)
//!     max stack  varint
//!     locals     varint
//!     params     varint
//!     exception table size   varint, only with E
//!     type table size        varint, only with T
//! ```
//!
//! Below the header sit, in descending address order, the slot oop map
//! (one bit per parameter and local), the exception table and the type
//! table. Varints hold 7 bits per byte, least significant group first in
//! walking order; a byte with its high bit set continues into the next
//! byte walked.

use bitflags::bitflags;

use crate::{AddressType, Error, Result};

/// Largest count the small form can hold.
pub const SMALL_FORM_MAX: u32 = 31;

/// Pairing of the second half of a long or double in a local slot.
///
/// Parameters always pair upward (`slot + 1`). Locals pair upward only
/// when this is set; otherwise they pair downward (`slot - 1`).
pub const NORMAL_LOCAL_LONG_ORDERING: bool = false;

const MAX_VARINT_BYTES: usize = 5;

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct HeaderFlags: u8 {
        const EXCEPTION_TABLE = 1 << 0;
        const TYPE_TABLE = 1 << 1;
        const INTERPRETER_ONLY = 1 << 2;
        const LARGE = 1 << 7;
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Walk {
    Backward,
    Forward,
}

/// Reads header bytes one at a time from an anchor in a fixed direction.
#[derive(Debug)]
pub struct HeaderCursor<'a> {
    bytes: &'a [u8],
    anchor: usize,
    pos: usize,
    end: usize,
    walk: Walk,
}

impl<'a> HeaderCursor<'a> {
    /// Walks toward lower addresses starting just below `anchor`.
    pub fn backward(bytes: &'a [u8], anchor: usize) -> Self {
        Self {
            bytes,
            anchor,
            pos: anchor,
            end: 0,
            walk: Walk::Backward,
        }
    }

    /// Walks toward higher addresses over `bytes[start..end]`.
    pub fn forward(bytes: &'a [u8], start: usize, end: usize) -> Self {
        Self {
            bytes,
            anchor: start,
            pos: start,
            end,
            walk: Walk::Forward,
        }
    }

    pub fn walk(&self) -> Walk {
        self.walk
    }

    /// Index of the next byte boundary: for a backward cursor, the lowest
    /// byte consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn consumed(&self) -> usize {
        self.anchor.abs_diff(self.pos)
    }

    pub fn is_exhausted(&self) -> bool {
        match self.walk {
            Walk::Backward => self.pos == self.end,
            Walk::Forward => self.pos >= self.end,
        }
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let at = match self.walk {
            _ if self.is_exhausted() => None,
            Walk::Backward => Some(self.pos - 1),
            Walk::Forward => Some(self.pos),
        };
        let Some(byte) = at.and_then(|at| self.bytes.get(at).copied()) else {
            return Err(Error::format(format!(
                "method metadata runs out {} bytes from {}",
                self.consumed(),
                self.anchor
            )));
        };
        match self.walk {
            Walk::Backward => self.pos -= 1,
            Walk::Forward => self.pos += 1,
        }
        Ok(byte)
    }

    pub fn read_varint(&mut self) -> Result<u32> {
        let mut value = 0u64;
        for i in 0..MAX_VARINT_BYTES {
            let byte = self.read_u8()?;
            value |= ((byte & 0x7F) as u64) << (7 * i);
            if byte < 0x80 {
                return u32::try_from(value)
                    .map_err(|_| Error::format(format!("varint {value:#x} overflows 32 bits")));
            }
        }
        Err(Error::format("varint longer than 5 bytes"))
    }
}

fn push_varint(out: &mut Vec<u8>, mut value: u32) {
    loop {
        let low = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.push(low);
            return;
        }
        out.push(low | 0x80);
    }
}

/// A raw method: its bytes and the anchor its header hangs below.
#[derive(Debug, Copy, Clone)]
pub struct MethodRef<'a> {
    bytes: &'a [u8],
    anchor: usize,
}

impl<'a> MethodRef<'a> {
    pub fn new(bytes: &'a [u8], anchor: usize) -> Self {
        Self { bytes, anchor }
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn anchor(&self) -> usize {
        self.anchor
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ExceptionHandler {
    pub start_pc: u32,
    pub end_pc: u32,
    pub handler_pc: u32,
    pub catch_class: u32,
}

/// One entry of a type table: `slot` holds a value of class `ty`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TypeTableEntry {
    pub ty: AddressType,
    pub slot: u32,
}

fn typed_class(raw: u32) -> Result<AddressType> {
    use AddressType::*;
    match u8::try_from(raw).ok().and_then(AddressType::from_u8) {
        Some(ty @ (Address | Offset | UWord | Int | Float | Long | Double)) => Ok(ty),
        _ => Err(Error::format(format!("class id {raw} is not valid in a type table"))),
    }
}

/// Slot holding the second half of a double word value in `slot`.
pub fn paired_slot(slot: u32, parameters: u32, normal_ordering: bool) -> Option<u32> {
    if slot < parameters || normal_ordering {
        slot.checked_add(1)
    } else {
        slot.checked_sub(1)
    }
}

/// Decoded header of one method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodHeader {
    pub parameter_count: u32,
    pub local_count: u32,
    pub max_stack: u32,
    pub flags: HeaderFlags,
    pub exception_table_size: u32,
    pub type_table_size: u32,
    anchor: usize,
    header_start: usize,
}

impl MethodHeader {
    pub fn decode(method: MethodRef<'_>) -> Result<Self> {
        let mut cursor = HeaderCursor::backward(method.bytes, method.anchor);
        let leading = cursor.read_u8()?;

        let mut header = if leading & HeaderFlags::LARGE.bits() == 0 {
            let second = cursor.read_u8()?;
            Self {
                parameter_count: (second & 0x1F) as u32,
                local_count: (((leading & 0b11) << 3) | (second >> 5)) as u32,
                max_stack: (leading >> 2) as u32,
                flags: HeaderFlags::empty(),
                exception_table_size: 0,
                type_table_size: 0,
                anchor: method.anchor,
                header_start: 0,
            }
        } else {
            let flags = HeaderFlags::from_bits(leading).ok_or_else(|| {
                Error::format(format!("unknown method header flags {leading:#04x}"))
            })?;
            let max_stack = cursor.read_varint()?;
            let local_count = cursor.read_varint()?;
            let parameter_count = cursor.read_varint()?;
            let exception_table_size = if flags.contains(HeaderFlags::EXCEPTION_TABLE) {
                cursor.read_varint()?
            } else {
                0
            };
            let type_table_size = if flags.contains(HeaderFlags::TYPE_TABLE) {
                if !cfg!(feature = "type-tables") {
                    return Err(Error::format("type table present but type tables are disabled"));
                }
                cursor.read_varint()?
            } else {
                0
            };
            Self {
                parameter_count,
                local_count,
                max_stack,
                flags,
                exception_table_size,
                type_table_size,
                anchor: method.anchor,
                header_start: 0,
            }
        };
        header.header_start = cursor.position();
        if header.parameter_count.checked_add(header.local_count).is_none() {
            return Err(Error::format(format!(
                "{} parameters and {} locals overflow the slot count",
                header.parameter_count, header.local_count
            )));
        }
        header.type_table_offset()?;
        Ok(header)
    }

    pub fn is_large(&self) -> bool {
        self.flags.contains(HeaderFlags::LARGE)
    }

    pub fn is_interpreter_only(&self) -> bool {
        self.flags.contains(HeaderFlags::INTERPRETER_ONLY)
    }

    pub fn has_exception_table(&self) -> bool {
        self.flags.contains(HeaderFlags::EXCEPTION_TABLE)
    }

    pub fn has_type_table(&self) -> bool {
        self.flags.contains(HeaderFlags::TYPE_TABLE)
    }

    /// Parameters plus locals.
    pub fn slot_count(&self) -> u32 {
        self.parameter_count.saturating_add(self.local_count)
    }

    pub fn oop_map_len(&self) -> usize {
        (self.slot_count() as usize).div_ceil(8)
    }

    /// Bytes taken by the header fields alone.
    pub fn header_size(&self) -> usize {
        self.anchor - self.header_start
    }

    fn below(&self, base: usize, len: usize, what: &str) -> Result<usize> {
        base.checked_sub(len)
            .ok_or_else(|| Error::format(format!("{what} would start before the method")))
    }

    pub fn oop_map_offset(&self) -> Result<usize> {
        self.below(self.header_start, self.oop_map_len(), "oop map")
    }

    pub fn exception_table_offset(&self) -> Result<usize> {
        self.below(self.oop_map_offset()?, self.exception_table_size as usize, "exception table")
    }

    pub fn type_table_offset(&self) -> Result<usize> {
        self.below(self.exception_table_offset()?, self.type_table_size as usize, "type table")
    }

    /// Whether slot `index` holds a reference according to the oop map.
    pub fn is_reference_slot(&self, method: MethodRef<'_>, index: u32) -> Result<bool> {
        if index >= self.slot_count() {
            return Ok(false);
        }
        let at = self.oop_map_offset()? + (index as usize >> 3);
        Ok(method.bytes[at] & (1 << (index & 7)) != 0)
    }

    pub fn exception_handlers(&self, method: MethodRef<'_>) -> Result<Vec<ExceptionHandler>> {
        let start = self.exception_table_offset()?;
        let end = start + self.exception_table_size as usize;
        let mut cursor = HeaderCursor::forward(method.bytes, start, end);
        let mut handlers = Vec::new();
        while !cursor.is_exhausted() {
            handlers.push(ExceptionHandler {
                start_pc: cursor.read_varint()?,
                end_pc: cursor.read_varint()?,
                handler_pc: cursor.read_varint()?,
                catch_class: cursor.read_varint()?,
            });
        }
        Ok(handlers)
    }

    pub fn type_table(&self, method: MethodRef<'_>) -> Result<Vec<TypeTableEntry>> {
        let start = self.type_table_offset()?;
        let end = start + self.type_table_size as usize;
        let mut cursor = HeaderCursor::forward(method.bytes, start, end);
        let mut entries = Vec::new();
        while !cursor.is_exhausted() {
            let ty = typed_class(cursor.read_varint()?)?;
            let slot = cursor.read_varint()?;
            entries.push(TypeTableEntry { ty, slot });
        }
        Ok(entries)
    }

    /// Classify every parameter and local slot.
    pub fn type_map(
        &self,
        method: MethodRef<'_>,
        normal_ordering: bool,
    ) -> Result<Vec<AddressType>> {
        let mut types = (0..self.slot_count())
            .map(|i| {
                Ok(if self.is_reference_slot(method, i)? {
                    AddressType::Ref
                } else {
                    AddressType::Word
                })
            })
            .collect::<Result<Vec<_>>>()?;

        if !self.has_type_table() {
            return Ok(types);
        }
        for entry in self.type_table(method)? {
            let slot = entry.slot as usize;
            if slot >= types.len() {
                return Err(Error::format(format!(
                    "type table names slot {slot} of {}",
                    types.len()
                )));
            }
            types[slot] = entry.ty;
            if let Some(second) = entry.ty.second_half() {
                let pair = paired_slot(entry.slot, self.parameter_count, normal_ordering)
                    .map(|p| p as usize)
                    .filter(|&p| p < types.len())
                    .ok_or_else(|| {
                        Error::format(format!("{:?} in slot {slot} has no paired slot", entry.ty))
                    })?;
                types[pair] = second;
            }
        }
        Ok(types)
    }
}

pub fn decode_parameter_count(method: MethodRef<'_>) -> Result<u32> {
    Ok(MethodHeader::decode(method)?.parameter_count)
}

pub fn decode_local_count(method: MethodRef<'_>) -> Result<u32> {
    Ok(MethodHeader::decode(method)?.local_count)
}

pub fn decode_stack_count(method: MethodRef<'_>) -> Result<u32> {
    Ok(MethodHeader::decode(method)?.max_stack)
}

pub fn decode_oopmap_offset(method: MethodRef<'_>) -> Result<usize> {
    MethodHeader::decode(method)?.oop_map_offset()
}

pub fn decode_exception_table_offset(method: MethodRef<'_>) -> Result<usize> {
    MethodHeader::decode(method)?.exception_table_offset()
}

pub fn decode_exception_table_size(method: MethodRef<'_>) -> Result<u32> {
    Ok(MethodHeader::decode(method)?.exception_table_size)
}

pub fn decode_type_table_offset(method: MethodRef<'_>) -> Result<usize> {
    MethodHeader::decode(method)?.type_table_offset()
}

pub fn decode_type_table_size(method: MethodRef<'_>) -> Result<u32> {
    Ok(MethodHeader::decode(method)?.type_table_size)
}

pub fn is_interpreter_only(method: MethodRef<'_>) -> Result<bool> {
    Ok(MethodHeader::decode(method)?.is_interpreter_only())
}

pub fn decode_exception_table(method: MethodRef<'_>) -> Result<Vec<ExceptionHandler>> {
    MethodHeader::decode(method)?.exception_handlers(method)
}

pub fn decode_type_map(method: MethodRef<'_>) -> Result<Vec<AddressType>> {
    MethodHeader::decode(method)?.type_map(method, NORMAL_LOCAL_LONG_ORDERING)
}

/// Collects the metadata of one method and lays it out.
#[derive(Debug, Clone, Default)]
pub struct MethodHeaderBuilder {
    parameters: u32,
    locals: u32,
    max_stack: u32,
    references: Vec<u32>,
    handlers: Vec<ExceptionHandler>,
    typed: Vec<TypeTableEntry>,
    interpreter_only: bool,
}

impl MethodHeaderBuilder {
    pub fn new(parameters: u32, locals: u32, max_stack: u32) -> Self {
        Self {
            parameters,
            locals,
            max_stack,
            ..Default::default()
        }
    }

    /// Mark `slot` as holding a reference.
    pub fn reference(mut self, slot: u32) -> Self {
        self.references.push(slot);
        self
    }

    pub fn handler(mut self, handler: ExceptionHandler) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Record a precise type for `slot` in the type table.
    pub fn typed(mut self, slot: u32, ty: AddressType) -> Self {
        self.typed.push(TypeTableEntry { ty, slot });
        self
    }

    pub fn interpreter_only(mut self, yes: bool) -> Self {
        self.interpreter_only = yes;
        self
    }

    fn fits_small_form(&self) -> bool {
        self.parameters <= SMALL_FORM_MAX
            && self.locals <= SMALL_FORM_MAX
            && self.max_stack <= SMALL_FORM_MAX
            && self.handlers.is_empty()
            && self.typed.is_empty()
            && !self.interpreter_only
    }

    /// Header block in memory order. The anchor is the returned length;
    /// code follows it.
    pub fn build(&self) -> Result<Vec<u8>> {
        let slots = self
            .parameters
            .checked_add(self.locals)
            .ok_or_else(|| Error::format("slot count overflows"))?;

        let mut oop_map = vec![0u8; (slots as usize).div_ceil(8)];
        for &slot in &self.references {
            if slot >= slots {
                return Err(Error::format(format!("reference slot {slot} of {slots}")));
            }
            oop_map[slot as usize >> 3] |= 1 << (slot & 7);
        }

        if self.fits_small_form() {
            let leading = ((self.max_stack as u8) << 2) | ((self.locals as u8) >> 3);
            let second = ((self.locals as u8 & 0b111) << 5) | self.parameters as u8;
            oop_map.extend_from_slice(&[second, leading]);
            return Ok(oop_map);
        }

        let mut handlers = Vec::new();
        for h in &self.handlers {
            for v in [h.start_pc, h.end_pc, h.handler_pc, h.catch_class] {
                push_varint(&mut handlers, v);
            }
        }

        let mut types = Vec::new();
        if !self.typed.is_empty() && !cfg!(feature = "type-tables") {
            return Err(Error::format("type tables are disabled in this build"));
        }
        for entry in &self.typed {
            typed_class(entry.ty as u32)?;
            if entry.slot >= slots {
                return Err(Error::format(format!("typed slot {} of {slots}", entry.slot)));
            }
            push_varint(&mut types, entry.ty as u32);
            push_varint(&mut types, entry.slot);
        }

        let mut flags = HeaderFlags::LARGE;
        flags.set(HeaderFlags::EXCEPTION_TABLE, !handlers.is_empty());
        flags.set(HeaderFlags::TYPE_TABLE, !types.is_empty());
        flags.set(HeaderFlags::INTERPRETER_ONLY, self.interpreter_only);

        let mut walk = vec![flags.bits()];
        push_varint(&mut walk, self.max_stack);
        push_varint(&mut walk, self.locals);
        push_varint(&mut walk, self.parameters);
        if !handlers.is_empty() {
            push_varint(&mut walk, handlers.len() as u32);
        }
        if !types.is_empty() {
            push_varint(&mut walk, types.len() as u32);
        }
        walk.reverse();

        let mut out = types;
        out.extend_from_slice(&handlers);
        out.extend_from_slice(&oop_map);
        out.extend_from_slice(&walk);
        Ok(out)
    }
}
