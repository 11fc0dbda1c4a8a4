//! Local mirror of the VM's loaded-class registry.
//!
//! The registry in target memory only grows; each refresh decodes the
//! entries appended since the previous scan and never touches classes that
//! were already decoded, so surrogates built on them stay valid.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::channel::MemoryChannel;
use crate::error::{Error, Result};
use crate::layout::{read_pointers, read_table, ClassKind, ClassRecord, Kind, WORD_SIZE};
use crate::types::VirtAddr;

/// Result of looking up an entity that may not be loaded yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution<T> {
    Resolved(T),
    /// Not (yet) known to the VM; carries the name it was referred to by.
    Unresolved(String),
}

impl<T> Resolution<T> {
    pub fn is_resolved(&self) -> bool {
        matches!(self, Resolution::Resolved(_))
    }

    pub fn resolved(self) -> Option<T> {
        match self {
            Resolution::Resolved(value) => Some(value),
            Resolution::Unresolved(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldActor {
    pub name: String,
    pub type_name: String,
    pub kind: Kind,
    pub offset: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodActor {
    pub id: u64,
    pub name: String,
    /// Parameter list as written in source, e.g. `(int,java.lang.String)`.
    pub signature: String,
}

/// Decoded layout of one loaded class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassActor {
    pub id: u32,
    pub name: String,
    pub kind: ClassKind,
    pub record: VirtAddr,
    pub super_record: VirtAddr,
    pub hub: VirtAddr,
    pub instance_size: u64,
    pub element_kind: Option<Kind>,
    /// All instance fields, inherited ones included, in offset order.
    pub fields: Vec<FieldActor>,
    pub methods: Vec<MethodActor>,
    /// Method ids in dispatch order.
    pub vtable: Vec<u64>,
    /// Ids of implemented interfaces.
    pub itable: Vec<u32>,
}

impl ClassActor {
    fn from_record(record: ClassRecord) -> Self {
        let mut fields: Vec<FieldActor> = record
            .fields
            .into_iter()
            .map(|f| FieldActor {
                name: f.name,
                type_name: f.type_name,
                kind: f.kind,
                offset: f.offset,
            })
            .collect();
        fields.sort_by_key(|f| f.offset);
        ClassActor {
            id: record.id,
            name: record.name,
            kind: record.kind,
            record: record.address,
            super_record: record.super_class,
            hub: record.hub,
            instance_size: record.instance_size,
            element_kind: record.element_kind,
            fields,
            methods: record
                .methods
                .into_iter()
                .map(|m| MethodActor {
                    id: m.id,
                    name: m.name,
                    signature: m.signature,
                })
                .collect(),
            vtable: record.vtable,
            itable: record.itable,
        }
    }

    pub fn is_array(&self) -> bool {
        self.kind == ClassKind::Array
    }

    pub fn find_field(&self, name: &str) -> Option<&FieldActor> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Methods matching `name` and, when given, `signature`.
    pub fn find_methods<'a>(
        &'a self,
        name: &'a str,
        signature: Option<&'a str>,
    ) -> impl Iterator<Item = &'a MethodActor> + 'a {
        self.methods
            .iter()
            .filter(move |m| m.name == name && signature.map_or(true, |s| m.signature == s))
    }
}

/// A method named by class, method name, and optional signature, as used
/// by bytecode breakpoints before the class is loaded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodKey {
    pub class_name: String,
    pub method_name: String,
    pub signature: Option<String>,
}

impl MethodKey {
    /// Parse `pkg.Class.method(sig)`; the signature part is optional.
    pub fn parse(text: &str) -> std::result::Result<Self, String> {
        let text = text.trim();
        let (qualified, signature) = match text.find('(') {
            Some(open) => {
                // `(params)` optionally followed by a return type descriptor.
                let sig = &text[open..];
                let well_formed = sig.find(')').map_or(false, |close| {
                    !sig[1..close].contains('(') && !sig[close + 1..].contains(['(', ')'])
                });
                if !well_formed {
                    return Err(format!("malformed signature in '{}'", text));
                }
                let sig: String = sig.chars().filter(|c| !c.is_whitespace()).collect();
                (&text[..open], Some(sig))
            }
            None => (text, None),
        };
        let dot = qualified
            .rfind('.')
            .ok_or_else(|| format!("expected <class>.<method> in '{}'", text))?;
        let (class_name, method_name) = (&qualified[..dot], &qualified[dot + 1..]);
        if class_name.is_empty() || !class_name.split('.').all(is_identifier) {
            return Err(format!("malformed class name '{}'", class_name));
        }
        if !(is_identifier(method_name) || method_name == "<init>" || method_name == "<clinit>") {
            return Err(format!("malformed method name '{}'", method_name));
        }
        Ok(MethodKey {
            class_name: class_name.to_string(),
            method_name: method_name.to_string(),
            signature,
        })
    }

    pub fn matches(&self, class: &ClassActor, method: &MethodActor) -> bool {
        class.name == self.class_name
            && method.name == self.method_name
            && self.signature.as_deref().map_or(true, |s| s == method.signature)
    }
}

impl fmt::Display for MethodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.class_name, self.method_name)?;
        if let Some(sig) = &self.signature {
            f.write_str(sig)?;
        }
        Ok(())
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_' || c == '$')
}

/// Incrementally updated class registry mirror.
#[derive(Debug, Default)]
pub struct ClassAccess {
    scanned: u64,
    classes: Vec<Arc<ClassActor>>,
    by_record: HashMap<VirtAddr, Arc<ClassActor>>,
    by_hub: HashMap<VirtAddr, Arc<ClassActor>>,
    by_name: HashMap<String, Arc<ClassActor>>,
    by_id: HashMap<u32, Arc<ClassActor>>,
    /// Method id to holder and index into its method list.
    methods: HashMap<u64, (Arc<ClassActor>, usize)>,
}

impl ClassAccess {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode classes registered since the last update; returns them.
    pub fn update(
        &mut self,
        channel: &dyn MemoryChannel,
        registry: VirtAddr,
    ) -> Result<Vec<Arc<ClassActor>>> {
        let (count, entries) = read_table(channel, registry)?;
        if count < self.scanned {
            return Err(Error::CorruptBootImage(format!(
                "class registry shrank from {} to {} entries",
                self.scanned, count
            )));
        }
        if count == self.scanned {
            return Ok(Vec::new());
        }
        let pointers = read_pointers(
            channel,
            entries + self.scanned * WORD_SIZE,
            count - self.scanned,
        )?;
        // Decode the whole batch before committing any of it, so a failed
        // read leaves the mirror as it was and the next update retries.
        let added = pointers
            .into_iter()
            .map(|ptr| Ok(Arc::new(ClassActor::from_record(ClassRecord::read(channel, ptr)?))))
            .collect::<Result<Vec<_>>>()?;
        for actor in &added {
            trace!(class = %actor.name, hub = %actor.hub, "decoded class");
            self.insert(actor.clone());
        }
        self.scanned = count;
        debug!(added = added.len(), total = self.classes.len(), "class registry updated");
        Ok(added)
    }

    fn insert(&mut self, actor: Arc<ClassActor>) {
        for (index, method) in actor.methods.iter().enumerate() {
            self.methods.insert(method.id, (actor.clone(), index));
        }
        self.by_record.insert(actor.record, actor.clone());
        self.by_hub.insert(actor.hub, actor.clone());
        self.by_name.insert(actor.name.clone(), actor.clone());
        self.by_id.insert(actor.id, actor.clone());
        self.classes.push(actor);
    }

    pub fn classes(&self) -> &[Arc<ClassActor>] {
        &self.classes
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Class whose hub is at `hub`; this is how object headers are validated.
    pub fn find_by_hub(&self, hub: VirtAddr) -> Option<&Arc<ClassActor>> {
        self.by_hub.get(&hub)
    }

    pub fn is_hub(&self, word: u64) -> bool {
        self.by_hub.contains_key(&VirtAddr(word))
    }

    pub fn find_by_id(&self, id: u32) -> Option<&Arc<ClassActor>> {
        self.by_id.get(&id)
    }

    pub fn resolve(&self, name: &str) -> Resolution<Arc<ClassActor>> {
        match self.by_name.get(name) {
            Some(actor) => Resolution::Resolved(actor.clone()),
            None => Resolution::Unresolved(name.to_string()),
        }
    }

    pub fn super_class(&self, actor: &ClassActor) -> Option<Arc<ClassActor>> {
        if actor.super_record.is_null() {
            return None;
        }
        self.by_record.get(&actor.super_record).cloned()
    }

    /// Declared type of a reference field, if that class is loaded.
    pub fn field_type(&self, field: &FieldActor) -> Resolution<Arc<ClassActor>> {
        self.resolve(&field.type_name)
    }

    pub fn method(&self, id: u64) -> Option<(&Arc<ClassActor>, &MethodActor)> {
        self.methods
            .get(&id)
            .map(|(holder, index)| (holder, &holder.methods[*index]))
    }

    /// Ids of all loaded methods matching `key`.
    pub fn resolve_method(&self, key: &MethodKey) -> Resolution<Vec<u64>> {
        match self.by_name.get(&key.class_name) {
            Some(class) => Resolution::Resolved(
                class
                    .find_methods(&key.method_name, key.signature.as_deref())
                    .map(|m| m.id)
                    .collect(),
            ),
            None => Resolution::Unresolved(key.class_name.clone()),
        }
    }

    pub fn method_key(&self, id: u64) -> Option<MethodKey> {
        self.method(id).map(|(holder, method)| MethodKey {
            class_name: holder.name.clone(),
            method_name: method.name.clone(),
            signature: Some(method.signature.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ClassSpec, ImageBuilder};

    #[test]
    fn method_key_parsing() {
        let key = MethodKey::parse("com.acme.Foo.bar(int, java.lang.String)").unwrap();
        assert_eq!(key.class_name, "com.acme.Foo");
        assert_eq!(key.method_name, "bar");
        assert_eq!(key.signature.as_deref(), Some("(int,java.lang.String)"));
        assert_eq!(key.to_string(), "com.acme.Foo.bar(int,java.lang.String)");

        let any = MethodKey::parse("Foo.bar").unwrap();
        assert_eq!(any.signature, None);
        assert!(MethodKey::parse("Foo.<init>()").is_ok());

        let descriptor = MethodKey::parse("Foo.bar(I)V").unwrap();
        assert_eq!(descriptor.signature.as_deref(), Some("(I)V"));
        assert_eq!(descriptor.to_string(), "Foo.bar(I)V");
    }

    #[test]
    fn malformed_method_keys() {
        assert!(MethodKey::parse("bar()").is_err());
        assert!(MethodKey::parse(".bar()").is_err());
        assert!(MethodKey::parse("Foo.bar(").is_err());
        assert!(MethodKey::parse("Foo.9bar()").is_err());
        assert!(MethodKey::parse("Foo..bar()").is_err());
        assert!(MethodKey::parse("Foo.bar(int))").is_err());
        assert!(MethodKey::parse("Foo.bar(I)V)").is_err());
    }

    #[test]
    fn incremental_update_decodes_only_new_classes() {
        let mut image = ImageBuilder::new();
        image.add_class(ClassSpec::tuple("Object"));
        let mem = image.memory();

        let mut classes = ClassAccess::new();
        let registry = image.class_registry();
        let first = classes.update(&mem, registry).unwrap();
        assert_eq!(first.len(), 1);
        let object = classes.resolve("Object").resolved().unwrap();

        image.add_class(ClassSpec::tuple("Foo").method(7, "bar", "()").field("count", Kind::Int));
        let mem = image.memory();
        let second = classes.update(&mem, registry).unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].name, "Foo");
        assert!(Arc::ptr_eq(&classes.resolve("Object").resolved().unwrap(), &object));
        assert!(classes.update(&mem, registry).unwrap().is_empty());

        let key = MethodKey::parse("Foo.bar()").unwrap();
        assert_eq!(classes.resolve_method(&key), Resolution::Resolved(vec![7]));
        assert_eq!(classes.method_key(7), Some(key));
        assert!(classes.find_by_hub(second[0].hub).is_some());
        assert!(!classes.resolve("Missing").is_resolved());
    }

    #[test]
    fn failed_update_commits_nothing() {
        let mut image = ImageBuilder::new();
        image.add_class(ClassSpec::tuple("Object"));
        let registry = image.class_registry();
        let mut classes = ClassAccess::new();
        classes.update(&image.memory(), registry).unwrap();

        image.add_class(ClassSpec::tuple("Foo"));
        image.add_class(ClassSpec::tuple("Bar"));
        let mut mem = image.memory();
        let entries = VirtAddr(mem.read_word(registry + 8).unwrap());
        let bar_entry = entries + 2 * WORD_SIZE;
        let bar_record = mem.read_word(bar_entry).unwrap();
        mem.poke_word(bar_entry, 0xdead_0000);

        assert!(classes.update(&mem, registry).is_err());
        assert!(classes.update(&mem, registry).is_err());
        assert_eq!(classes.len(), 1);
        assert!(!classes.resolve("Foo").is_resolved());

        mem.poke_word(bar_entry, bar_record);
        let added = classes.update(&mem, registry).unwrap();
        assert_eq!(added.len(), 2);
        assert_eq!(classes.len(), 3);
        assert!(classes.update(&mem, registry).unwrap().is_empty());
        assert_eq!(classes.len(), 3);
    }

    #[test]
    fn unresolved_method_names_class() {
        let classes = ClassAccess::new();
        let key = MethodKey::parse("Foo.bar()").unwrap();
        assert_eq!(
            classes.resolve_method(&key),
            Resolution::Unresolved("Foo".to_string())
        );
    }
}
