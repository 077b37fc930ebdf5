//! Descriptive attributes with parent fallback
//!
//! Each asset keeps only its local overrides. Reading an attribute that is
//! not set locally defers to the parent at read time; nothing is copied when
//! a child is created.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, Weak};

use serde::de::DeserializeOwned;
use serde_json::Value;

/// Well-known attribute names.
pub mod names {
    pub const NAME: &str = "name";
    pub const DESCRIPTION: &str = "description";
    pub const ADDRESS: &str = "address";
    pub const OPERATOR: &str = "operator";
    pub const OPENING_TIMES: &str = "opening_times";
    pub const PAYMENT_OPTIONS: &str = "payment_options";

    pub const WELL_KNOWN: &[&str] = &[
        NAME,
        DESCRIPTION,
        ADDRESS,
        OPERATOR,
        OPENING_TIMES,
        PAYMENT_OPTIONS,
    ];
}

/// Anything an asset can inherit attribute values from.
pub trait AttributeSource: Send + Sync {
    fn attribute(&self, name: &str) -> Option<Value>;
}

/// Effective value of an attribute before and after a local change.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeChange {
    pub property: String,
    pub old: Option<Value>,
    pub new: Option<Value>,
}

pub struct AttributeStore {
    local: RwLock<HashMap<String, Value>>,
    parent: RwLock<Option<Weak<dyn AttributeSource>>>,
}

impl AttributeStore {
    pub fn new(parent: Option<Weak<dyn AttributeSource>>) -> Self {
        Self {
            local: RwLock::new(HashMap::new()),
            parent: RwLock::new(parent),
        }
    }

    /// Local override, else the parent's effective value.
    pub fn get(&self, name: &str) -> Option<Value> {
        self.get_local(name).or_else(|| self.inherited(name))
    }

    pub fn get_local(&self, name: &str) -> Option<Value> {
        self.local
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Typed read; a value of the wrong shape reads as `None`.
    pub fn get_as<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        self.get(name)
            .and_then(|value| serde_json::from_value(value).ok())
    }

    /// Set a local override. Returns `None` when the local value was already
    /// equal, in which case nothing changes and nothing should be emitted.
    ///
    /// The comparison is against the local override only: setting a value
    /// equal to the inherited one still pins it locally.
    pub fn set(&self, name: &str, value: Value) -> Option<AttributeChange> {
        let inherited = self.inherited(name);
        let mut local = self.local.write().unwrap_or_else(PoisonError::into_inner);

        if local.get(name) == Some(&value) {
            return None;
        }
        let previous = local.insert(name.to_string(), value.clone());

        Some(AttributeChange {
            property: name.to_string(),
            old: previous.or(inherited),
            new: Some(value),
        })
    }

    /// Drop the local override so reads fall back to the parent again.
    pub fn clear(&self, name: &str) -> Option<AttributeChange> {
        let removed = self
            .local
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)?;

        Some(AttributeChange {
            property: name.to_string(),
            old: Some(removed),
            new: self.inherited(name),
        })
    }

    pub fn local_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .local
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Forget the parent; used when the owning asset is unlinked.
    pub fn detach(&self) {
        *self.parent.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn inherited(&self, name: &str) -> Option<Value> {
        let parent = self
            .parent
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)?;
        parent.attribute(name)
    }
}
