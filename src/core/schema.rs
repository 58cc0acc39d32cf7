//! Purpose: Record descriptors and the name-keyed registry that caches them.
//! Exports: `Descriptor`, `FieldDescriptor`, `Registry`.
//! Role: Resolve schema names seen on the wire to one shared descriptor instance.
//! Invariants: A name maps to exactly one field list per registry; redefinition must match.
//! Invariants: Registry access is synchronized; descriptors are immutable once built.
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, OnceLock, RwLock};

use sha2::{Digest, Sha256};

use crate::core::error::{Error, ErrorKind};
use crate::core::value::FieldType;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FieldDescriptor {
    pub ty: FieldType,
    pub name: String,
}

#[derive(Debug)]
struct DescriptorInner {
    name: String,
    fields: Vec<FieldDescriptor>,
    fingerprint: u32,
}

/// Shared handle to an immutable schema. Clones point at the same definition.
#[derive(Clone)]
pub struct Descriptor {
    inner: Arc<DescriptorInner>,
}

impl Descriptor {
    /// Builds a descriptor outside any registry after validating names.
    pub fn new<N, F>(name: &str, fields: impl IntoIterator<Item = (N, F)>) -> Result<Self, Error>
    where
        N: AsRef<str>,
        F: AsRef<str>,
    {
        let fields = fields
            .into_iter()
            .map(|(ty, field)| {
                Ok(FieldDescriptor {
                    ty: FieldType::parse(ty.as_ref())?,
                    name: field.as_ref().to_string(),
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;
        Self::from_fields(name, fields)
    }

    pub fn from_fields(name: &str, fields: Vec<FieldDescriptor>) -> Result<Self, Error> {
        validate_name(name)?;
        let mut seen = HashSet::new();
        for field in &fields {
            validate_field_name(name, &field.name)?;
            if !seen.insert(field.name.as_str()) {
                return Err(Error::new(ErrorKind::Usage).with_message(format!(
                    "duplicate field `{}` in descriptor `{name}`",
                    field.name
                )));
            }
        }
        let fingerprint = fingerprint(name, &fields);
        Ok(Self {
            inner: Arc::new(DescriptorInner {
                name: name.to_string(),
                fields,
                fingerprint,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.inner.fields
    }

    pub fn fingerprint(&self) -> u32 {
        self.inner.fingerprint
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.inner.fields.iter().position(|field| field.name == name)
    }

    pub fn ptr_eq(&self, other: &Descriptor) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn same_layout(&self, other: &Descriptor) -> bool {
        self.inner.name == other.inner.name && self.inner.fields == other.inner.fields
    }
}

impl PartialEq for Descriptor {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || self.same_layout(other)
    }
}

impl Eq for Descriptor {}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("name", &self.inner.name)
            .field("fields", &self.inner.fields)
            .finish()
    }
}

fn validate_name(name: &str) -> Result<(), Error> {
    if name.is_empty() || name.chars().any(char::is_whitespace) {
        return Err(Error::new(ErrorKind::Usage)
            .with_message(format!("invalid descriptor name `{name}`"))
            .with_hint("Descriptor names are non-empty and contain no whitespace, e.g. `test/record`."));
    }
    Ok(())
}

fn validate_field_name(descriptor: &str, field: &str) -> Result<(), Error> {
    let mut chars = field.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
        }
        None => false,
    };
    if !valid {
        return Err(Error::new(ErrorKind::Usage).with_message(format!(
            "invalid field name `{field}` in descriptor `{descriptor}`"
        )));
    }
    Ok(())
}

fn fingerprint(name: &str, fields: &[FieldDescriptor]) -> u32 {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    for field in fields {
        hasher.update(b"\0");
        hasher.update(field.ty.name().as_bytes());
        hasher.update(b":");
        hasher.update(field.name.as_bytes());
    }
    let digest = hasher.finalize();
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

#[derive(Clone, Default)]
pub struct Registry {
    entries: Arc<RwLock<HashMap<String, Descriptor>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide registry used when no explicit registry is supplied.
    pub fn global() -> &'static Registry {
        static GLOBAL: OnceLock<Registry> = OnceLock::new();
        GLOBAL.get_or_init(Registry::new)
    }

    pub fn define<N, F>(
        &self,
        name: &str,
        fields: impl IntoIterator<Item = (N, F)>,
    ) -> Result<Descriptor, Error>
    where
        N: AsRef<str>,
        F: AsRef<str>,
    {
        self.insert(Descriptor::new(name, fields)?)
    }

    /// Registers a descriptor, or returns the cached one when the layout matches.
    pub fn insert(&self, descriptor: Descriptor) -> Result<Descriptor, Error> {
        if let Some(existing) = self.read_entries()?.get(descriptor.name()) {
            return reconcile(existing, descriptor);
        }
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        match entries.get(descriptor.name()) {
            Some(existing) => reconcile(existing, descriptor),
            None => {
                entries.insert(descriptor.name().to_string(), descriptor.clone());
                Ok(descriptor)
            }
        }
    }

    pub fn lookup(&self, name: &str) -> Result<Descriptor, Error> {
        self.read_entries()?.get(name).cloned().ok_or_else(|| {
            Error::new(ErrorKind::NotFound)
                .with_message(format!("unknown record descriptor `{name}`"))
        })
    }

    pub fn names(&self) -> Result<Vec<String>, Error> {
        let mut names = self.read_entries()?.keys().cloned().collect::<Vec<_>>();
        names.sort();
        Ok(names)
    }

    pub fn len(&self) -> usize {
        self.read_entries().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read_entries(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, Descriptor>>, Error> {
        self.entries.read().map_err(|_| poisoned())
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry").field("len", &self.len()).finish()
    }
}

fn reconcile(existing: &Descriptor, candidate: Descriptor) -> Result<Descriptor, Error> {
    if existing.same_layout(&candidate) {
        return Ok(existing.clone());
    }
    Err(Error::new(ErrorKind::Conflict)
        .with_message(format!(
            "descriptor `{}` is already defined with a different field set",
            existing.name()
        ))
        .with_hint("Use a new descriptor name for a changed schema."))
}

fn poisoned() -> Error {
    Error::new(ErrorKind::Internal).with_message("descriptor registry lock poisoned")
}

#[cfg(test)]
mod tests {
    use super::{Descriptor, Registry};
    use crate::core::error::ErrorKind;
    use std::thread;

    const FIELDS: [(&str, &str); 3] = [("string", "name"), ("string", "foo"), ("varint", "idx")];

    #[test]
    fn define_twice_returns_identical_descriptor() {
        let registry = Registry::new();
        let first = registry.define("test/record", FIELDS).expect("define");
        let second = registry.define("test/record", FIELDS).expect("redefine");
        assert!(first.ptr_eq(&second));
        assert!(registry.lookup("test/record").unwrap().ptr_eq(&first));
    }

    #[test]
    fn conflicting_redefinition_is_rejected() {
        let registry = Registry::new();
        registry.define("test/record", FIELDS).expect("define");
        let err = registry
            .define("test/record", [("string", "name")])
            .expect_err("conflict");
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn lookup_of_unknown_name_is_not_found() {
        let err = Registry::new().lookup("missing/record").expect_err("missing");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn duplicate_and_malformed_fields_are_rejected() {
        let err = Descriptor::new("a/b", [("string", "x"), ("varint", "x")]).expect_err("dup");
        assert_eq!(err.kind(), ErrorKind::Usage);
        assert!(Descriptor::new("a/b", [("string", "1x")]).is_err());
        assert!(Descriptor::new("a b", [("string", "x")]).is_err());
        assert!(Descriptor::new("a/b", [("decimal", "x")]).is_err());
    }

    #[test]
    fn fingerprint_tracks_layout() {
        let a = Descriptor::new("a/b", [("string", "x")]).unwrap();
        let b = Descriptor::new("a/b", [("string", "x")]).unwrap();
        let c = Descriptor::new("a/b", [("varint", "x")]).unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert_eq!(a, b);
        assert!(!a.ptr_eq(&b));
    }

    #[test]
    fn concurrent_definitions_converge() {
        let registry = Registry::new();
        let handles = (0..8)
            .map(|_| {
                let registry = registry.clone();
                thread::spawn(move || registry.define("test/record", FIELDS).expect("define"))
            })
            .collect::<Vec<_>>();
        let descriptors = handles
            .into_iter()
            .map(|handle| handle.join().expect("join"))
            .collect::<Vec<_>>();
        for descriptor in &descriptors[1..] {
            assert!(descriptor.ptr_eq(&descriptors[0]));
        }
        assert_eq!(registry.names().unwrap(), vec!["test/record".to_string()]);
    }
}
