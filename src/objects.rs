//! Typed surrogates for heap objects and field access.
//!
//! A [`MaxObject`] pairs a canonical reference with the class layout that
//! was valid when it was built. Surrogates are cached per logical reference
//! id and rebuilt when the reference's version changes, i.e. after the
//! object moved.
//!
//! Every field read re-checks the object's header, since the collector may
//! have moved the object since the last refresh. A mismatch triggers one
//! lazy re-resolution of the reference before the read fails.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use tracing::{debug, trace};

use crate::channel::{word_at, MemoryChannel};
use crate::classes::{ClassAccess, ClassActor, FieldActor};
use crate::error::{Error, Result};
use crate::heap_scheme::HeapScheme;
use crate::layout::{Kind, ARRAY_HEADER_SIZE, ARRAY_LENGTH_OFFSET, HUB_OFFSET};
use crate::reference::{ObjectStatus, RefId, ReferenceManager, RemoteReference};
use crate::types::VirtAddr;

/// Upper bound on array lengths; larger values mean the header is corrupt.
const MAX_ARRAY_LENGTH: u64 = 1 << 31;
/// Upper bound on the bytes copied out for one string.
const MAX_STRING_BYTES: u64 = 1 << 24;

/// Everything needed to interpret heap memory during one call.
pub struct HeapView<'a> {
    pub channel: &'a dyn MemoryChannel,
    pub scheme: &'a dyn HeapScheme,
    pub classes: &'a ClassAccess,
    pub references: &'a mut ReferenceManager,
}

impl HeapView<'_> {
    pub fn make_reference(&mut self, origin: VirtAddr) -> Result<Option<Arc<RemoteReference>>> {
        self.references
            .make_reference(self.channel, self.scheme, self.classes, origin)
    }
}

/// Surrogate for one object in the target heap.
#[derive(Debug, Clone)]
pub struct MaxObject {
    reference: Arc<RemoteReference>,
    class: Arc<ClassActor>,
    version: u64,
}

impl MaxObject {
    pub fn reference(&self) -> &Arc<RemoteReference> {
        &self.reference
    }

    pub fn class(&self) -> &Arc<ClassActor> {
        &self.class
    }

    pub fn origin(&self) -> VirtAddr {
        self.reference.origin()
    }

    pub fn status(&self) -> ObjectStatus {
        self.reference.status()
    }

    /// `true` once the object moved after this surrogate was built.
    pub fn is_stale(&self) -> bool {
        self.version != self.reference.version()
    }

    /// Address of the header to read: the copy while a collection has
    /// forwarded the object, the origin otherwise.
    fn header(&self) -> VirtAddr {
        header_of(&self.reference)
    }
}

impl PartialEq for MaxObject {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.reference, &other.reference)
    }
}

impl fmt::Display for MaxObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.class.name, self.reference)
    }
}

fn header_of(reference: &RemoteReference) -> VirtAddr {
    match (reference.status(), reference.forwarded_origin()) {
        (ObjectStatus::Forwarded, Some(copy)) => copy,
        _ => reference.origin(),
    }
}

/// Decoded value of a field or array element.
#[derive(Debug, Clone)]
pub enum Value {
    Boolean(bool),
    Byte(i8),
    Char(u16),
    Short(i16),
    Int(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    Word(u64),
    /// `None` for null, or for a pointer that does not denote a live object.
    Reference(Option<Arc<RemoteReference>>),
    Void,
}

impl Value {
    /// Decode a primitive of `kind` from little-endian `bytes`.
    ///
    /// References decode to their raw word; callers resolve them.
    fn decode_primitive(kind: Kind, bytes: &[u8]) -> Value {
        let mut buf = [0u8; 8];
        let n = bytes.len().min(8);
        buf[..n].copy_from_slice(&bytes[..n]);
        let raw = u64::from_le_bytes(buf);
        match kind {
            Kind::Boolean => Value::Boolean(raw & 0xff != 0),
            Kind::Byte => Value::Byte(raw as u8 as i8),
            Kind::Char => Value::Char(raw as u16),
            Kind::Short => Value::Short(raw as u16 as i16),
            Kind::Int => Value::Int(raw as u32 as i32),
            Kind::Float => Value::Float(f32::from_bits(raw as u32)),
            Kind::Long => Value::Long(raw as i64),
            Kind::Double => Value::Double(f64::from_bits(raw)),
            Kind::Word | Kind::Reference => Value::Word(raw),
            Kind::Void => Value::Void,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Boolean(b) => Some(b as i64),
            Value::Byte(v) => Some(v as i64),
            Value::Char(v) => Some(v as i64),
            Value::Short(v) => Some(v as i64),
            Value::Int(v) => Some(v as i64),
            Value::Long(v) => Some(v),
            Value::Word(v) => Some(v as i64),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<&Arc<RemoteReference>> {
        match self {
            Value::Reference(Some(r)) => Some(r),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Byte(a), Value::Byte(b)) => a == b,
            (Value::Char(a), Value::Char(b)) => a == b,
            (Value::Short(a), Value::Short(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Long(a), Value::Long(b)) => a == b,
            (Value::Double(a), Value::Double(b)) => a.to_bits() == b.to_bits(),
            (Value::Word(a), Value::Word(b)) => a == b,
            (Value::Reference(a), Value::Reference(b)) => match (a, b) {
                (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                (None, None) => true,
                _ => false,
            },
            (Value::Void, Value::Void) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Boolean(v) => write!(f, "{}", v),
            Value::Byte(v) => write!(f, "{}", v),
            Value::Char(v) => match char::from_u32(*v as u32) {
                Some(c) => write!(f, "'{}'", c),
                None => write!(f, "\\u{:04x}", v),
            },
            Value::Short(v) => write!(f, "{}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Long(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::Word(v) => write!(f, "0x{:x}", v),
            Value::Reference(Some(r)) => write!(f, "{}", r),
            Value::Reference(None) => f.write_str("null"),
            Value::Void => f.write_str("void"),
        }
    }
}

struct CachedObject {
    reference: Weak<RemoteReference>,
    class: Arc<ClassActor>,
    version: u64,
}

/// Object surrogate cache, keyed by logical reference id.
#[derive(Default)]
pub struct ObjectAccess {
    cache: HashMap<RefId, CachedObject>,
    epoch: u64,
}

impl ObjectAccess {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Surrogate for the object whose origin is `origin`.
    ///
    /// Returns `None` for garbage, uninitialized, or unreadable memory.
    pub fn find_object_at(
        &mut self,
        heap: &mut HeapView<'_>,
        origin: VirtAddr,
    ) -> Result<Option<MaxObject>> {
        let reference = match heap.make_reference(origin)? {
            Some(reference) => reference,
            None => return Ok(None),
        };
        if !reference.status().is_live() {
            return Ok(None);
        }
        self.surrogate(heap, reference)
    }

    /// Surrogate for a reference already obtained from the manager.
    pub fn surrogate(
        &mut self,
        heap: &HeapView<'_>,
        reference: Arc<RemoteReference>,
    ) -> Result<Option<MaxObject>> {
        let version = reference.version();
        if let Some(cached) = self.cache.get(&reference.id()) {
            if cached.version == version && cached.reference.strong_count() > 0 {
                return Ok(Some(MaxObject {
                    reference,
                    class: cached.class.clone(),
                    version,
                }));
            }
        }
        let hub = match heap.channel.read_word(header_of(&reference) + HUB_OFFSET) {
            Ok(hub) => VirtAddr(hub),
            Err(e) if e.is_unreadable() => return Ok(None),
            Err(e) => return Err(e),
        };
        let class = match heap.classes.find_by_hub(hub) {
            Some(class) => class.clone(),
            None => return Ok(None),
        };
        self.cache.insert(
            reference.id(),
            CachedObject {
                reference: Arc::downgrade(&reference),
                class: class.clone(),
                version,
            },
        );
        Ok(Some(MaxObject {
            reference,
            class,
            version,
        }))
    }

    /// Drop cache entries for references that died or are no longer held.
    pub fn update(&mut self, epoch: u64) -> usize {
        self.epoch = epoch;
        let before = self.cache.len();
        self.cache.retain(|_, cached| {
            cached
                .reference
                .upgrade()
                .map_or(false, |r| r.status().is_live() && r.version() == cached.version)
        });
        let dropped = before - self.cache.len();
        if dropped > 0 {
            debug!(dropped, remaining = self.cache.len(), "object cache updated");
        }
        dropped
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    pub fn read_field_value(
        &mut self,
        heap: &mut HeapView<'_>,
        object: &MaxObject,
        field_name: &str,
    ) -> Result<Value> {
        let field: FieldActor = object.class.find_field(field_name).cloned().ok_or_else(|| {
            Error::InvalidRequest(format!("{} has no field '{}'", object.class.name, field_name))
        })?;
        self.with_retry(heap, object, |heap, header| {
            read_value(heap, header + field.offset as u64, field.kind)
        })
    }

    pub fn array_length(&mut self, heap: &mut HeapView<'_>, object: &MaxObject) -> Result<u64> {
        if !object.class.is_array() {
            return Err(Error::InvalidRequest(format!("{} is not an array", object.class.name)));
        }
        self.with_retry(heap, object, |heap, header| array_length_at(heap.channel, header))
    }

    pub fn read_array_element(
        &mut self,
        heap: &mut HeapView<'_>,
        object: &MaxObject,
        index: u64,
    ) -> Result<Value> {
        let kind = object.class.element_kind.ok_or_else(|| {
            Error::InvalidRequest(format!("{} is not an array", object.class.name))
        })?;
        self.with_retry(heap, object, |heap, header| {
            let length = array_length_at(heap.channel, header)?;
            if index >= length {
                return Err(Error::InvalidRequest(format!(
                    "index {} out of bounds for length {}",
                    index, length
                )));
            }
            read_value(heap, header + ARRAY_HEADER_SIZE + index * kind.size() as u64, kind)
        })
    }

    /// Contents of a string object whose `value` field is a char or byte array.
    pub fn read_string(&mut self, heap: &mut HeapView<'_>, object: &MaxObject) -> Result<String> {
        let array = match self.read_field_value(heap, object, "value")? {
            Value::Reference(Some(reference)) => reference,
            Value::Reference(None) => return Ok(String::new()),
            other => {
                return Err(Error::InvalidRequest(format!(
                    "string value field holds {}",
                    other
                )))
            }
        };
        let array = self.surrogate(heap, array)?.ok_or_else(|| Error::InvalidAddress {
            addr: object.origin(),
            reason: "string contents are not a live array".into(),
        })?;
        let kind = array.class.element_kind.unwrap_or(Kind::Void);
        self.with_retry(heap, &array, |heap, header| {
            let length = array_length_at(heap.channel, header)?;
            let len = length
                .checked_mul(kind.size() as u64)
                .filter(|&len| len <= MAX_STRING_BYTES)
                .ok_or_else(|| Error::InvalidAddress {
                    addr: header,
                    reason: format!("string of {} elements is too long to read", length),
                })?;
            let bytes = heap.channel.read_bytes(header + ARRAY_HEADER_SIZE, len as usize)?;
            match kind {
                Kind::Char => {
                    let units: Vec<u16> = bytes
                        .chunks_exact(2)
                        .map(|c| u16::from_le_bytes([c[0], c[1]]))
                        .collect();
                    Ok(String::from_utf16_lossy(&units))
                }
                Kind::Byte => Ok(String::from_utf8_lossy(&bytes).into_owned()),
                other => Err(Error::InvalidRequest(format!(
                    "string backed by {} array",
                    other.name()
                ))),
            }
        })
    }

    /// Run `read` against the object's header; on a stale header, re-resolve
    /// the reference once and retry.
    fn with_retry<T>(
        &mut self,
        heap: &mut HeapView<'_>,
        object: &MaxObject,
        mut read: impl FnMut(&mut HeapView<'_>, VirtAddr) -> Result<T>,
    ) -> Result<T> {
        match checked_header(heap, object).and_then(|header| read(heap, header)) {
            Err(Error::StaleReference { origin }) => {
                trace!(%origin, "stale object header, re-resolving");
                let reference = object.reference.clone();
                if !heap
                    .references
                    .revalidate(heap.channel, heap.scheme, heap.classes, &reference)?
                {
                    return Err(Error::InvalidAddress {
                        addr: origin,
                        reason: "object is no longer live".into(),
                    });
                }
                match checked_header(heap, object).and_then(|header| read(heap, header)) {
                    Err(Error::StaleReference { origin }) => Err(Error::InvalidAddress {
                        addr: origin,
                        reason: "object header does not match its class".into(),
                    }),
                    other => other,
                }
            }
            other => other,
        }
    }
}

/// Current header address of `object`, verified against its class.
fn checked_header(heap: &HeapView<'_>, object: &MaxObject) -> Result<VirtAddr> {
    if object.status() == ObjectStatus::Dead {
        return Err(Error::StaleReference {
            origin: object.origin(),
        });
    }
    let header = object.header();
    let hub = heap.channel.read_word(header + HUB_OFFSET)?;
    if hub != object.class.hub.0 {
        return Err(Error::StaleReference { origin: header });
    }
    Ok(header)
}

/// Length word of the array at `header`, rejected when no real array could be that long.
fn array_length_at(channel: &dyn MemoryChannel, header: VirtAddr) -> Result<u64> {
    let length = channel.read_word(header + ARRAY_LENGTH_OFFSET)?;
    if length > MAX_ARRAY_LENGTH {
        return Err(Error::InvalidAddress {
            addr: header,
            reason: format!("corrupt array length {}", length),
        });
    }
    Ok(length)
}

fn read_value(heap: &mut HeapView<'_>, addr: VirtAddr, kind: Kind) -> Result<Value> {
    let bytes = heap.channel.read_bytes(addr, kind.size())?;
    if kind == Kind::Reference {
        let target = VirtAddr(word_at(&bytes, 0));
        let reference = heap.make_reference(target)?;
        if reference.is_none() && !target.is_null() {
            trace!(%target, "reference field does not point at a live object");
        }
        return Ok(Value::Reference(reference));
    }
    Ok(Value::decode_primitive(kind, &bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap_scheme::{MarkSweepScheme, SemiSpaceScheme};
    use crate::layout::{GcInfo, HeapPhase, HeapRegionKind, HeapRegionRecord};
    use crate::testing::{ClassSpec, ImageBuilder, SimMemory};

    const HEAP: u64 = 0x100000;

    struct Fixture {
        mem: SimMemory,
        classes: ClassAccess,
        scheme: Box<dyn HeapScheme>,
        refs: ReferenceManager,
        objects: ObjectAccess,
        foo_hub: VirtAddr,
    }

    impl Fixture {
        fn view(&mut self) -> (HeapView<'_>, &mut ObjectAccess) {
            (
                HeapView {
                    channel: &self.mem,
                    scheme: self.scheme.as_ref(),
                    classes: &self.classes,
                    references: &mut self.refs,
                },
                &mut self.objects,
            )
        }
    }

    /// `Foo { int count @16; Foo next @24 }` at HEAP, a `String` at HEAP+0x100.
    fn fixture() -> Fixture {
        let mut image = ImageBuilder::new();
        let foo_hub = image.add_class(
            ClassSpec::tuple("Foo")
                .field("count", Kind::Int)
                .ref_field("next", "Foo"),
        );
        let string_hub =
            image.add_class(ClassSpec::tuple("java.lang.String").ref_field("value", "char[]"));
        let chars_hub = image.add_class(ClassSpec::array("char[]", Kind::Char));
        let mut mem = image.memory();
        mem.map(VirtAddr(HEAP), 0x1000);

        mem.poke_word(VirtAddr(HEAP), foo_hub.0);
        mem.poke(VirtAddr(HEAP + 16), &42i32.to_le_bytes());
        mem.poke_word(VirtAddr(HEAP + 24), HEAP);

        mem.poke_word(VirtAddr(HEAP + 0x100), string_hub.0);
        mem.poke_word(VirtAddr(HEAP + 0x110), HEAP + 0x200);
        mem.poke_word(VirtAddr(HEAP + 0x200), chars_hub.0);
        mem.poke_word(VirtAddr(HEAP + 0x210), 2);
        mem.poke(VirtAddr(HEAP + 0x218), &[b'h', 0, b'i', 0]);

        let mut classes = ClassAccess::new();
        classes.update(&mem, image.class_registry()).unwrap();
        let mut scheme = MarkSweepScheme::default();
        scheme.update(
            &[HeapRegionRecord {
                start: VirtAddr(HEAP),
                size: 0x1000,
                top: VirtAddr(HEAP + 0x800),
                name: "heap".into(),
                kind: HeapRegionKind::MarkSweep,
            }],
            GcInfo::default(),
        );
        Fixture {
            mem,
            classes,
            scheme: Box::new(scheme),
            refs: ReferenceManager::new(),
            objects: ObjectAccess::new(),
            foo_hub,
        }
    }

    #[test]
    fn find_object_validates_header() {
        let mut f = fixture();
        let (mut heap, objects) = f.view();
        let foo = objects.find_object_at(&mut heap, VirtAddr(HEAP)).unwrap().unwrap();
        assert_eq!(foo.class().name, "Foo");
        assert!(objects.find_object_at(&mut heap, VirtAddr(HEAP + 8)).unwrap().is_none());
        assert!(objects.find_object_at(&mut heap, VirtAddr(0xdead0000)).unwrap().is_none());
        let again = objects.find_object_at(&mut heap, VirtAddr(HEAP)).unwrap().unwrap();
        assert_eq!(foo, again);
    }

    #[test]
    fn fields_decode_by_kind() {
        let mut f = fixture();
        let (mut heap, objects) = f.view();
        let foo = objects.find_object_at(&mut heap, VirtAddr(HEAP)).unwrap().unwrap();
        assert_eq!(objects.read_field_value(&mut heap, &foo, "count").unwrap(), Value::Int(42));
        let next = objects.read_field_value(&mut heap, &foo, "next").unwrap();
        assert!(Arc::ptr_eq(next.as_reference().unwrap(), foo.reference()));
        assert!(matches!(
            objects.read_field_value(&mut heap, &foo, "missing"),
            Err(Error::InvalidRequest(_))
        ));
    }

    #[test]
    fn strings_and_arrays() {
        let mut f = fixture();
        let (mut heap, objects) = f.view();
        let s = objects.find_object_at(&mut heap, VirtAddr(HEAP + 0x100)).unwrap().unwrap();
        assert_eq!(objects.read_string(&mut heap, &s).unwrap(), "hi");

        let chars = objects.find_object_at(&mut heap, VirtAddr(HEAP + 0x200)).unwrap().unwrap();
        assert_eq!(objects.array_length(&mut heap, &chars).unwrap(), 2);
        assert_eq!(
            objects.read_array_element(&mut heap, &chars, 1).unwrap(),
            Value::Char(b'i' as u16)
        );
        assert!(objects.read_array_element(&mut heap, &chars, 2).is_err());
    }

    #[test]
    fn freed_object_fails_after_retry() {
        let mut f = fixture();
        let foo = {
            let (mut heap, objects) = f.view();
            objects.find_object_at(&mut heap, VirtAddr(HEAP)).unwrap().unwrap()
        };
        // The collector frees the object and reuses its header word.
        f.mem.poke_word(VirtAddr(HEAP), 0);
        let (mut heap, objects) = f.view();
        let err = objects.read_field_value(&mut heap, &foo, "count").unwrap_err();
        assert!(matches!(err, Error::InvalidAddress { .. }));
        assert_eq!(foo.status(), ObjectStatus::Dead);
        assert_eq!(objects.update(1), 1);
    }

    fn semispaces(to: u64, from: u64, gc_count: u64) -> SemiSpaceScheme {
        let space = |start: u64, kind: HeapRegionKind| HeapRegionRecord {
            start: VirtAddr(start),
            size: 0x800,
            top: VirtAddr(start + 0x300),
            name: String::new(),
            kind,
        };
        let mut scheme = SemiSpaceScheme::default();
        scheme.update(
            &[space(to, HeapRegionKind::ToSpace), space(from, HeapRegionKind::FromSpace)],
            GcInfo {
                phase: HeapPhase::Mutating,
                gc_count,
            },
        );
        scheme
    }

    #[test]
    fn surrogate_rebuilt_after_version_change() {
        let mut f = fixture();
        f.scheme = Box::new(semispaces(HEAP, HEAP + 0x800, 0));
        let foo = {
            let (mut heap, objects) = f.view();
            objects.find_object_at(&mut heap, VirtAddr(HEAP)).unwrap().unwrap()
        };
        assert_eq!(foo.reference().version(), 0);

        // A collection copies Foo into the other semispace with a new count
        // and leaves a forwarding pointer in the old hub word.
        let copy = HEAP + 0x800;
        f.mem.poke_word(VirtAddr(copy), f.foo_hub.0);
        f.mem.poke(VirtAddr(copy + 16), &7i32.to_le_bytes());
        f.mem.poke_word(VirtAddr(copy + 24), copy);
        f.mem.poke_word(VirtAddr(HEAP), copy | 1);
        f.scheme = Box::new(semispaces(copy, HEAP, 1));

        let (mut heap, objects) = f.view();
        assert_eq!(objects.read_field_value(&mut heap, &foo, "count").unwrap(), Value::Int(7));
        assert_eq!(foo.origin(), VirtAddr(copy));
        assert!(foo.is_stale());

        assert_eq!(objects.update(1), 1, "cached surrogate of the old version dropped");
        let rebuilt = objects.find_object_at(&mut heap, VirtAddr(copy)).unwrap().unwrap();
        assert!(!rebuilt.is_stale());
        assert_eq!(rebuilt, foo);
        assert_eq!(objects.cached(), 1);
        assert_eq!(objects.read_field_value(&mut heap, &rebuilt, "count").unwrap(), Value::Int(7));
    }

    #[test]
    fn corrupt_array_length_is_an_error() {
        let mut f = fixture();
        let (s, chars) = {
            let (mut heap, objects) = f.view();
            (
                objects.find_object_at(&mut heap, VirtAddr(HEAP + 0x100)).unwrap().unwrap(),
                objects.find_object_at(&mut heap, VirtAddr(HEAP + 0x200)).unwrap().unwrap(),
            )
        };
        f.mem.poke_word(VirtAddr(HEAP + 0x210), u64::MAX);
        let (mut heap, objects) = f.view();
        assert!(matches!(
            objects.read_string(&mut heap, &s),
            Err(Error::InvalidAddress { .. })
        ));
        assert!(matches!(
            objects.read_array_element(&mut heap, &chars, u64::MAX - 1),
            Err(Error::InvalidAddress { .. })
        ));
        assert!(objects.array_length(&mut heap, &chars).is_err());
        drop(heap);

        // Plausible as an array, far too long to copy out as a string.
        f.mem.poke_word(VirtAddr(HEAP + 0x210), 1 << 30);
        let (mut heap, objects) = f.view();
        assert!(matches!(
            objects.read_string(&mut heap, &s),
            Err(Error::InvalidAddress { .. })
        ));
        assert_eq!(objects.array_length(&mut heap, &chars).unwrap(), 1 << 30);
    }

    #[test]
    fn primitive_decoding() {
        assert_eq!(Value::decode_primitive(Kind::Byte, &[0xff]), Value::Byte(-1));
        assert_eq!(Value::decode_primitive(Kind::Short, &[0xfe, 0xff]), Value::Short(-2));
        assert_eq!(Value::decode_primitive(Kind::Boolean, &[1]), Value::Boolean(true));
        assert_eq!(
            Value::decode_primitive(Kind::Double, &1.5f64.to_le_bytes()),
            Value::Double(1.5)
        );
        assert_eq!(Value::Int(-3).as_i64(), Some(-3));
        assert_eq!(Value::Reference(None).to_string(), "null");
    }
}
