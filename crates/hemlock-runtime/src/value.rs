//! Tagged universal value
//!
//! [`Value`] is a `#[repr(C, u8)]` sum type whose discriminant order matches
//! the tag numbering used by generated code. Primitive variants are carried
//! by copy; container variants hold a pointer to a reference-counted cell.
//!
//! Copying a Value never touches the count. Ownership is explicit: call
//! [`Value::retain`] to add a reference and [`Value::release`] to drop one,
//! or wrap the value in [`Owned`] to get RAII semantics.

use core::ffi::{CStr, c_char, c_void};
use core::mem::ManuallyDrop;
use core::ptr::NonNull;

use crate::array::ArrayCell;
use crate::buffer::BufferCell;
use crate::call::{BuiltinCell, FunctionCell};
use crate::channel::ChannelCell;
use crate::handle::{FileCell, SocketCell};
use crate::memory::{self, RcHeader, ReleaseList};
use crate::object::ObjectCell;
use crate::string::StrCell;
use crate::task::TaskCell;

// =============================================================================
// Tags
// =============================================================================

/// Discriminant of a [`Value`], in the numbering shared with generated code.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ValueTag {
    I8 = 0,
    I16 = 1,
    I32 = 2,
    I64 = 3,
    U8 = 4,
    U16 = 5,
    U32 = 6,
    U64 = 7,
    F32 = 8,
    F64 = 9,
    Bool = 10,
    String = 11,
    Rune = 12,
    Ptr = 13,
    Buffer = 14,
    Array = 15,
    Object = 16,
    File = 17,
    Function = 18,
    Builtin = 19,
    Task = 20,
    Channel = 21,
    Socket = 22,
    Null = 23,
}

impl ValueTag {
    /// The name reported by `typeof`.
    pub fn name(self) -> &'static str {
        match self {
            ValueTag::I8 => "i8",
            ValueTag::I16 => "i16",
            ValueTag::I32 => "i32",
            ValueTag::I64 => "i64",
            ValueTag::U8 => "u8",
            ValueTag::U16 => "u16",
            ValueTag::U32 => "u32",
            ValueTag::U64 => "u64",
            ValueTag::F32 => "f32",
            ValueTag::F64 => "f64",
            ValueTag::Bool => "bool",
            ValueTag::String => "string",
            ValueTag::Rune => "rune",
            ValueTag::Ptr => "ptr",
            ValueTag::Buffer => "buffer",
            ValueTag::Array => "array",
            ValueTag::Object => "object",
            ValueTag::File => "file",
            ValueTag::Function | ValueTag::Builtin => "function",
            ValueTag::Task => "task",
            ValueTag::Channel => "channel",
            ValueTag::Socket => "socket",
            ValueTag::Null => "null",
        }
    }

    /// Resolve a primitive type name as written in a type annotation,
    /// including the `integer`, `number` and `byte` aliases.
    pub fn from_name(name: &str) -> Option<Self> {
        let tag = match name {
            "i8" => ValueTag::I8,
            "i16" => ValueTag::I16,
            "i32" | "integer" => ValueTag::I32,
            "i64" => ValueTag::I64,
            "u8" | "byte" => ValueTag::U8,
            "u16" => ValueTag::U16,
            "u32" => ValueTag::U32,
            "u64" => ValueTag::U64,
            "f32" => ValueTag::F32,
            "f64" | "number" => ValueTag::F64,
            "bool" => ValueTag::Bool,
            "string" => ValueTag::String,
            "rune" => ValueTag::Rune,
            "ptr" => ValueTag::Ptr,
            "buffer" => ValueTag::Buffer,
            "array" => ValueTag::Array,
            "object" => ValueTag::Object,
            "file" => ValueTag::File,
            "function" => ValueTag::Function,
            "task" => ValueTag::Task,
            "channel" => ValueTag::Channel,
            "socket" => ValueTag::Socket,
            "null" => ValueTag::Null,
            _ => return None,
        };
        Some(tag)
    }

    pub(crate) fn from_u8(raw: u8) -> Option<Self> {
        if raw <= ValueTag::Null as u8 {
            // SAFETY: repr(u8) with contiguous discriminants 0..=23.
            Some(unsafe { core::mem::transmute::<u8, ValueTag>(raw) })
        } else {
            None
        }
    }

    pub fn is_integer(self) -> bool {
        matches!(
            self,
            ValueTag::I8
                | ValueTag::I16
                | ValueTag::I32
                | ValueTag::I64
                | ValueTag::U8
                | ValueTag::U16
                | ValueTag::U32
                | ValueTag::U64
        )
    }

    pub fn is_float(self) -> bool {
        matches!(self, ValueTag::F32 | ValueTag::F64)
    }

    pub fn is_numeric(self) -> bool {
        self.is_integer() || self.is_float()
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            ValueTag::I8 | ValueTag::I16 | ValueTag::I32 | ValueTag::I64
        )
    }

    /// Position in the promotion lattice: i8 < u8 < i16 < u16 < i32 < u32 <
    /// i64 < u64 < f32 < f64. Runes rank as i32.
    pub(crate) fn rank(self) -> Option<u8> {
        let rank = match self {
            ValueTag::I8 => 0,
            ValueTag::U8 => 1,
            ValueTag::I16 => 2,
            ValueTag::U16 => 3,
            ValueTag::I32 | ValueTag::Rune => 4,
            ValueTag::U32 => 5,
            ValueTag::I64 => 6,
            ValueTag::U64 => 7,
            ValueTag::F32 => 8,
            ValueTag::F64 => 9,
            _ => return None,
        };
        Some(rank)
    }

    /// Bit width of an integer tag.
    pub(crate) fn bits(self) -> u32 {
        match self {
            ValueTag::I8 | ValueTag::U8 => 8,
            ValueTag::I16 | ValueTag::U16 => 16,
            ValueTag::I32 | ValueTag::U32 | ValueTag::F32 | ValueTag::Rune => 32,
            _ => 64,
        }
    }
}

// =============================================================================
// Value
// =============================================================================

/// A runtime value.
#[repr(C, u8)]
#[derive(Clone, Copy, Debug)]
pub enum Value {
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Bool(bool),
    String(NonNull<StrCell>),
    Rune(u32),
    Ptr(*mut c_void),
    Buffer(NonNull<BufferCell>),
    Array(NonNull<ArrayCell>),
    Object(NonNull<ObjectCell>),
    File(NonNull<FileCell>),
    Function(NonNull<FunctionCell>),
    Builtin(NonNull<BuiltinCell>),
    Task(NonNull<TaskCell>),
    Channel(NonNull<ChannelCell>),
    Socket(NonNull<SocketCell>),
    Null,
}

// Cells are shared across worker threads; synchronization of their contents
// is the caller's responsibility (see the module docs of each container).
unsafe impl Send for Value {}
unsafe impl Sync for Value {}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

impl Value {
    // -------------------------------------------------------------------------
    // Constructors
    // -------------------------------------------------------------------------

    pub fn null() -> Self {
        Value::Null
    }

    pub fn rune(c: char) -> Self {
        Value::Rune(c as u32)
    }

    pub fn ptr(ptr: *mut c_void) -> Self {
        Value::Ptr(ptr)
    }

    /// A fresh string cell holding a copy of `text`.
    pub fn string_from(text: &str) -> Self {
        Value::string(text.to_owned())
    }

    /// A fresh string cell taking ownership of `text`.
    pub fn string(text: String) -> Self {
        Value::String(memory::alloc_cell(StrCell::new(text)))
    }

    /// A fresh, empty, untyped array.
    pub fn array() -> Self {
        Value::Array(memory::alloc_cell(ArrayCell::new(None)))
    }

    /// A fresh, empty array whose elements must carry `tag`.
    pub fn array_with_type(tag: ValueTag) -> Self {
        Value::Array(memory::alloc_cell(ArrayCell::new(Some(tag))))
    }

    /// A fresh array that takes ownership of `elems`.
    pub fn array_from(elems: Vec<Value>) -> Self {
        Value::Array(memory::alloc_cell(ArrayCell::from_vec(elems)))
    }

    /// A fresh, empty, anonymous object.
    pub fn object() -> Self {
        Value::Object(memory::alloc_cell(ObjectCell::new()))
    }

    /// A zero-filled buffer of `size` bytes.
    pub fn buffer(size: usize) -> Self {
        Value::Buffer(memory::alloc_cell(BufferCell::new(vec![0; size])))
    }

    /// A buffer that takes ownership of `bytes`.
    pub fn buffer_from(bytes: Vec<u8>) -> Self {
        Value::Buffer(memory::alloc_cell(BufferCell::new(bytes)))
    }

    // -------------------------------------------------------------------------
    // Tag inspection
    // -------------------------------------------------------------------------

    pub fn tag(&self) -> ValueTag {
        match self {
            Value::I8(_) => ValueTag::I8,
            Value::I16(_) => ValueTag::I16,
            Value::I32(_) => ValueTag::I32,
            Value::I64(_) => ValueTag::I64,
            Value::U8(_) => ValueTag::U8,
            Value::U16(_) => ValueTag::U16,
            Value::U32(_) => ValueTag::U32,
            Value::U64(_) => ValueTag::U64,
            Value::F32(_) => ValueTag::F32,
            Value::F64(_) => ValueTag::F64,
            Value::Bool(_) => ValueTag::Bool,
            Value::String(_) => ValueTag::String,
            Value::Rune(_) => ValueTag::Rune,
            Value::Ptr(_) => ValueTag::Ptr,
            Value::Buffer(_) => ValueTag::Buffer,
            Value::Array(_) => ValueTag::Array,
            Value::Object(_) => ValueTag::Object,
            Value::File(_) => ValueTag::File,
            Value::Function(_) => ValueTag::Function,
            Value::Builtin(_) => ValueTag::Builtin,
            Value::Task(_) => ValueTag::Task,
            Value::Channel(_) => ValueTag::Channel,
            Value::Socket(_) => ValueTag::Socket,
            Value::Null => ValueTag::Null,
        }
    }

    /// The `typeof` name of this value.
    pub fn type_name(&self) -> &'static str {
        self.tag().name()
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_bool(&self) -> bool {
        matches!(self, Value::Bool(_))
    }

    pub fn is_string(&self) -> bool {
        matches!(self, Value::String(_))
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Value::Array(_))
    }

    pub fn is_object(&self) -> bool {
        matches!(self, Value::Object(_))
    }

    pub fn is_function(&self) -> bool {
        matches!(self, Value::Function(_) | Value::Builtin(_))
    }

    pub fn is_numeric(&self) -> bool {
        self.tag().is_numeric()
    }

    pub fn is_integer(&self) -> bool {
        self.tag().is_integer()
    }

    pub fn is_float(&self) -> bool {
        self.tag().is_float()
    }

    /// Whether this value owns a reference to a heap cell.
    pub fn is_counted(&self) -> bool {
        self.header().is_some()
    }

    // -------------------------------------------------------------------------
    // Reference counting
    // -------------------------------------------------------------------------

    fn header(&self) -> Option<&RcHeader> {
        // SAFETY: a container Value always points at a live cell while the
        // caller holds a reference to it.
        unsafe {
            match *self {
                Value::String(p) => Some(&p.as_ref().header),
                Value::Buffer(p) => Some(&p.as_ref().header),
                Value::Array(p) => Some(&p.as_ref().header),
                Value::Object(p) => Some(&p.as_ref().header),
                Value::File(p) => Some(&p.as_ref().header),
                Value::Function(p) => Some(&p.as_ref().header),
                Value::Builtin(p) => Some(&p.as_ref().header),
                Value::Task(p) => Some(&p.as_ref().header),
                Value::Channel(p) => Some(&p.as_ref().header),
                Value::Socket(p) => Some(&p.as_ref().header),
                _ => None,
            }
        }
    }

    /// Current reference count, or 0 for primitive variants.
    pub fn refcount(&self) -> u32 {
        self.header().map_or(0, RcHeader::count)
    }

    /// Add one reference. No-op for primitive variants.
    pub fn retain(&self) {
        if let Some(header) = self.header() {
            header.increment();
        }
    }

    /// Drop one reference, freeing the cell and releasing its contents when
    /// this was the last one. No-op for primitive variants.
    pub fn release(self) {
        if !self.is_counted() {
            return;
        }
        let mut pending = ReleaseList::new();
        pending.push(self);
        memory::drain_release_list(&mut pending);
    }

    /// Release a single value, pushing anything its cell owned onto `out`.
    ///
    /// # Safety
    ///
    /// The caller must own one reference to `self`.
    pub(crate) unsafe fn release_into(self, out: &mut ReleaseList) {
        unsafe {
            match self {
                Value::String(p) => memory::release_cell(p, out),
                Value::Buffer(p) => memory::release_cell(p, out),
                Value::Array(p) => memory::release_cell(p, out),
                Value::Object(p) => memory::release_cell(p, out),
                Value::File(p) => memory::release_cell(p, out),
                Value::Function(p) => memory::release_cell(p, out),
                Value::Builtin(p) => memory::release_cell(p, out),
                Value::Task(p) => memory::release_cell(p, out),
                Value::Channel(p) => memory::release_cell(p, out),
                Value::Socket(p) => memory::release_cell(p, out),
                _ => {}
            }
        }
    }

    // -------------------------------------------------------------------------
    // Borrowed views
    // -------------------------------------------------------------------------

    /// Borrow the text of a string value.
    pub fn as_str(&self) -> Option<&str> {
        match *self {
            Value::String(p) => Some(unsafe { p.as_ref() }.as_str()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Value::Bool(b) => Some(b),
            _ => None,
        }
    }

    /// Integer payload widened to i64, for integer variants only.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::I8(v) => Some(v as i64),
            Value::I16(v) => Some(v as i64),
            Value::I32(v) => Some(v as i64),
            Value::I64(v) => Some(v),
            Value::U8(v) => Some(v as i64),
            Value::U16(v) => Some(v as i64),
            Value::U32(v) => Some(v as i64),
            Value::U64(v) => i64::try_from(v).ok(),
            _ => None,
        }
    }

    /// Numeric payload widened to f64, for numeric variants only.
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::I8(v) => Some(v as f64),
            Value::I16(v) => Some(v as f64),
            Value::I32(v) => Some(v as f64),
            Value::I64(v) => Some(v as f64),
            Value::U8(v) => Some(v as f64),
            Value::U16(v) => Some(v as f64),
            Value::U32(v) => Some(v as f64),
            Value::U64(v) => Some(v as f64),
            Value::F32(v) => Some(v as f64),
            Value::F64(v) => Some(v),
            _ => None,
        }
    }

    pub(crate) fn as_array_cell(&self) -> Option<&ArrayCell> {
        match *self {
            Value::Array(p) => Some(unsafe { p.as_ref() }),
            _ => None,
        }
    }

    pub(crate) fn as_object_cell(&self) -> Option<&ObjectCell> {
        match *self {
            Value::Object(p) => Some(unsafe { p.as_ref() }),
            _ => None,
        }
    }

    /// Address of the referenced cell, used for identity comparisons.
    pub(crate) fn cell_addr(&self) -> Option<usize> {
        let addr = match *self {
            Value::String(p) => p.as_ptr() as usize,
            Value::Buffer(p) => p.as_ptr() as usize,
            Value::Array(p) => p.as_ptr() as usize,
            Value::Object(p) => p.as_ptr() as usize,
            Value::File(p) => p.as_ptr() as usize,
            Value::Function(p) => p.as_ptr() as usize,
            Value::Builtin(p) => p.as_ptr() as usize,
            Value::Task(p) => p.as_ptr() as usize,
            Value::Channel(p) => p.as_ptr() as usize,
            Value::Socket(p) => p.as_ptr() as usize,
            _ => return None,
        };
        Some(addr)
    }
}

/// Equality as observed by `==`.
///
/// Null equals only null. Strings compare by bytes, numerics by value after
/// widening to f64, and every other cell kind by identity. Values of
/// unrelated kinds are never equal.
pub fn values_equal(left: Value, right: Value) -> bool {
    match (left, right) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::String(_), Value::String(_)) => left.as_str() == right.as_str(),
        (Value::Rune(a), Value::Rune(b)) => a == b,
        (Value::Ptr(a), Value::Ptr(b)) => a == b,
        _ => match (left.as_f64(), right.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => {
                left.tag() == right.tag()
                    && left.cell_addr().is_some()
                    && left.cell_addr() == right.cell_addr()
            }
        },
    }
}

// =============================================================================
// Owned
// =============================================================================

/// An owned reference to a Value: clone retains, drop releases.
#[derive(Debug)]
pub struct Owned(Value);

impl Owned {
    /// Take over one existing reference.
    pub fn new(value: Value) -> Self {
        Owned(value)
    }

    /// Add a reference and own it.
    pub fn retained(value: Value) -> Self {
        value.retain();
        Owned(value)
    }

    pub fn get(&self) -> Value {
        self.0
    }

    /// Give up ownership without releasing.
    pub fn into_raw(self) -> Value {
        let this = ManuallyDrop::new(self);
        this.0
    }
}

impl Clone for Owned {
    fn clone(&self) -> Self {
        Owned::retained(self.0)
    }
}

impl Drop for Owned {
    fn drop(&mut self) {
        self.0.release();
    }
}

impl Default for Owned {
    fn default() -> Self {
        Owned(Value::Null)
    }
}

// =============================================================================
// C ABI: constructors
// =============================================================================

/// Signature: `(i8) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_val_i8(v: i8) -> Value {
    Value::I8(v)
}

/// Signature: `(i16) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_val_i16(v: i16) -> Value {
    Value::I16(v)
}

/// Signature: `(i32) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_val_i32(v: i32) -> Value {
    Value::I32(v)
}

/// Signature: `(i64) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_val_i64(v: i64) -> Value {
    Value::I64(v)
}

/// Signature: `(u8) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_val_u8(v: u8) -> Value {
    Value::U8(v)
}

/// Signature: `(u16) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_val_u16(v: u16) -> Value {
    Value::U16(v)
}

/// Signature: `(u32) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_val_u32(v: u32) -> Value {
    Value::U32(v)
}

/// Signature: `(u64) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_val_u64(v: u64) -> Value {
    Value::U64(v)
}

/// Signature: `(f32) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_val_f32(v: f32) -> Value {
    Value::F32(v)
}

/// Signature: `(f64) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_val_f64(v: f64) -> Value {
    Value::F64(v)
}

/// Signature: `(i32) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_val_bool(v: i32) -> Value {
    Value::Bool(v != 0)
}

/// Invalid scalar values are replaced by U+FFFD.
///
/// Signature: `(u32) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_val_rune(codepoint: u32) -> Value {
    Value::Rune(char::from_u32(codepoint).map_or(0xFFFD, |c| c as u32))
}

/// Signature: `(ptr) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_val_ptr(ptr: *mut c_void) -> Value {
    Value::Ptr(ptr)
}

/// Signature: `() -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_val_null() -> Value {
    Value::Null
}

/// Copy a NUL-terminated UTF-8 string into a fresh string cell. Invalid
/// sequences are replaced by U+FFFD; a null pointer yields `""`.
///
/// Signature: `(ptr) -> Value`
///
/// # Safety
///
/// `text` must be null or point at a NUL-terminated byte string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn hml_val_string(text: *const c_char) -> Value {
    if text.is_null() {
        return Value::string(String::new());
    }
    let bytes = unsafe { CStr::from_ptr(text) }.to_bytes();
    Value::string(String::from_utf8_lossy(bytes).into_owned())
}

/// Copy `len` bytes of UTF-8 into a fresh string cell.
///
/// Signature: `(ptr, i64) -> Value`
///
/// # Safety
///
/// `data` must be valid for `len` bytes, or null with `len == 0`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn hml_val_string_len(data: *const u8, len: i64) -> Value {
    if data.is_null() || len <= 0 {
        return Value::string(String::new());
    }
    let bytes = unsafe { core::slice::from_raw_parts(data, len as usize) };
    Value::string(String::from_utf8_lossy(bytes).into_owned())
}

/// Signature: `() -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_val_array() -> Value {
    Value::array()
}

/// An array whose elements must carry `tag`. An unknown tag yields an
/// untyped array.
///
/// Signature: `(u8) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_val_array_typed(tag: u8) -> Value {
    match ValueTag::from_u8(tag) {
        Some(ValueTag::Null) | None => Value::array(),
        Some(tag) => Value::array_with_type(tag),
    }
}

/// Signature: `() -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_val_object() -> Value {
    Value::object()
}

/// A zero-filled buffer. Negative sizes yield an empty buffer.
///
/// Signature: `(i64) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_val_buffer(size: i64) -> Value {
    Value::buffer(size.max(0) as usize)
}

// =============================================================================
// C ABI: reference counting and predicates
// =============================================================================

/// Signature: `(ptr) -> ()`
///
/// # Safety
///
/// `value` must be null or point at a valid Value.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn hml_retain(value: *const Value) {
    if let Some(value) = unsafe { value.as_ref() } {
        value.retain();
    }
}

/// Release `*value` and overwrite it with null.
///
/// Signature: `(ptr) -> ()`
///
/// # Safety
///
/// `value` must be null or point at a valid Value owning one reference.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn hml_release(value: *mut Value) {
    if let Some(slot) = unsafe { value.as_mut() } {
        core::mem::take(slot).release();
    }
}

/// Fast path: returns without touching memory for primitive variants.
///
/// Signature: `(Value) -> ()`
#[unsafe(no_mangle)]
pub extern "C" fn hml_retain_if_needed(value: Value) {
    if value.is_counted() {
        value.retain();
    }
}

/// Fast path: returns without touching memory for primitive variants.
///
/// Signature: `(Value) -> ()`
#[unsafe(no_mangle)]
pub extern "C" fn hml_release_if_needed(value: Value) {
    if value.is_counted() {
        value.release();
    }
}

/// Signature: `(Value) -> u8`
#[unsafe(no_mangle)]
pub extern "C" fn hml_tag(value: Value) -> u8 {
    value.tag() as u8
}

/// Static, NUL-terminated `typeof` name.
///
/// Signature: `(Value) -> ptr`
#[unsafe(no_mangle)]
pub extern "C" fn hml_typeof_str(value: Value) -> *const c_char {
    let name: &'static CStr = match value.tag() {
        ValueTag::I8 => c"i8",
        ValueTag::I16 => c"i16",
        ValueTag::I32 => c"i32",
        ValueTag::I64 => c"i64",
        ValueTag::U8 => c"u8",
        ValueTag::U16 => c"u16",
        ValueTag::U32 => c"u32",
        ValueTag::U64 => c"u64",
        ValueTag::F32 => c"f32",
        ValueTag::F64 => c"f64",
        ValueTag::Bool => c"bool",
        ValueTag::String => c"string",
        ValueTag::Rune => c"rune",
        ValueTag::Ptr => c"ptr",
        ValueTag::Buffer => c"buffer",
        ValueTag::Array => c"array",
        ValueTag::Object => c"object",
        ValueTag::File => c"file",
        ValueTag::Function | ValueTag::Builtin => c"function",
        ValueTag::Task => c"task",
        ValueTag::Channel => c"channel",
        ValueTag::Socket => c"socket",
        ValueTag::Null => c"null",
    };
    name.as_ptr()
}

/// Signature: `(Value) -> i32`
#[unsafe(no_mangle)]
pub extern "C" fn hml_is_null(value: Value) -> i32 {
    value.is_null() as i32
}

/// Signature: `(Value) -> i32`
#[unsafe(no_mangle)]
pub extern "C" fn hml_is_numeric(value: Value) -> i32 {
    value.is_numeric() as i32
}

/// Signature: `(Value) -> i32`
#[unsafe(no_mangle)]
pub extern "C" fn hml_is_integer(value: Value) -> i32 {
    value.is_integer() as i32
}

/// Signature: `(Value) -> i32`
#[unsafe(no_mangle)]
pub extern "C" fn hml_is_string(value: Value) -> i32 {
    value.is_string() as i32
}

/// Signature: `(Value) -> i32`
#[unsafe(no_mangle)]
pub extern "C" fn hml_is_array(value: Value) -> i32 {
    value.is_array() as i32
}

/// Signature: `(Value) -> i32`
#[unsafe(no_mangle)]
pub extern "C" fn hml_is_object(value: Value) -> i32 {
    value.is_object() as i32
}

/// Signature: `(Value) -> i32`
#[unsafe(no_mangle)]
pub extern "C" fn hml_is_function(value: Value) -> i32 {
    value.is_function() as i32
}

/// Signature: `(Value, Value) -> i32`
#[unsafe(no_mangle)]
pub extern "C" fn hml_values_equal(left: Value, right: Value) -> i32 {
    values_equal(left, right) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_order_matches_abi() {
        assert_eq!(Value::I8(0).tag() as u8, 0);
        assert_eq!(Value::Bool(true).tag() as u8, 10);
        assert_eq!(Value::Rune(65).tag() as u8, 12);
        assert_eq!(Value::Null.tag() as u8, 23);
        assert_eq!(ValueTag::from_u8(18), Some(ValueTag::Function));
        assert_eq!(ValueTag::from_u8(24), None);
    }

    #[test]
    fn test_type_names() {
        assert_eq!(Value::I32(1).type_name(), "i32");
        assert_eq!(Value::Null.type_name(), "null");
        assert_eq!(Value::Ptr(core::ptr::null_mut()).type_name(), "ptr");
        let s = Value::string_from("x");
        assert_eq!(s.type_name(), "string");
        s.release();
        assert_eq!(ValueTag::from_name("integer"), Some(ValueTag::I32));
        assert_eq!(ValueTag::from_name("number"), Some(ValueTag::F64));
        assert_eq!(ValueTag::from_name("Point"), None);
    }

    #[test]
    fn test_retain_release_balances() {
        let s = Value::string_from("hello");
        assert_eq!(s.refcount(), 1);
        s.retain();
        assert_eq!(s.refcount(), 2);
        s.release();
        assert_eq!(s.refcount(), 1);
        assert_eq!(s.as_str(), Some("hello"));
        s.release();
    }

    #[test]
    fn test_primitives_are_not_counted() {
        let v = Value::I64(5);
        v.retain();
        v.release();
        assert_eq!(v.refcount(), 0);
        assert!(!v.is_counted());
    }

    #[test]
    fn test_release_frees_nested_contents() {
        let inner = Value::string_from("inner");
        let arr = Value::array();
        crate::array::push(arr, inner).unwrap();
        inner.release();
        assert_eq!(inner.refcount(), 1);
        let outer = Value::array();
        crate::array::push(outer, arr).unwrap();
        arr.release();
        assert_eq!(arr.refcount(), 1);
        outer.release();
    }

    #[test]
    fn test_deep_nesting_does_not_overflow() {
        let mut current = Value::array();
        for _ in 0..100_000 {
            let next = Value::array();
            crate::array::push(next, current).unwrap();
            current.release();
            current = next;
        }
        current.release();
    }

    #[test]
    fn test_values_equal() {
        assert!(values_equal(Value::Null, Value::Null));
        assert!(!values_equal(Value::Null, Value::I32(0)));
        assert!(values_equal(Value::I32(3), Value::F64(3.0)));
        assert!(values_equal(Value::U8(7), Value::I64(7)));
        assert!(!values_equal(Value::Bool(true), Value::I32(1)));
        assert!(!values_equal(Value::F64(f64::NAN), Value::F64(f64::NAN)));

        let a = Value::string_from("abc");
        let b = Value::string_from("abc");
        assert!(values_equal(a, b));
        a.release();
        b.release();

        let x = Value::array();
        let y = Value::array();
        assert!(values_equal(x, x));
        assert!(!values_equal(x, y));
        x.release();
        y.release();
    }

    #[test]
    fn test_owned_clone_and_drop() {
        let s = Value::string_from("owned");
        {
            let owned = Owned::new(s);
            let copy = owned.clone();
            assert_eq!(s.refcount(), 2);
            drop(copy);
            assert_eq!(s.refcount(), 1);
            let raw = owned.into_raw();
            assert_eq!(raw.refcount(), 1);
        }
        assert_eq!(s.refcount(), 1);
        s.release();
    }

    #[test]
    fn test_abi_release_clears_slot() {
        let mut v = Value::string_from("slot");
        unsafe { hml_release(&mut v) };
        assert!(v.is_null());
    }

    #[test]
    fn test_abi_typeof() {
        let name = unsafe { CStr::from_ptr(hml_typeof_str(Value::F32(1.0))) };
        assert_eq!(name.to_str().unwrap(), "f32");
    }
}
