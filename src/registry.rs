//! Backend construction by configured type name.
//!
//! A [`Registry`] maps a configuration `type` string to a constructor
//! for that backend. The registry is an explicit value built at process
//! startup and passed to whoever opens stores; there is no hidden
//! global registration state.
//!
//! # Example
//!
//! ```rust
//! use sortedkv::{Config, KeyValue, Registry};
//!
//! # fn main() -> Result<(), sortedkv::Error> {
//! let registry = Registry::with_default_backends();
//! let cfg = Config::parse(r#"{"type": "mem"}"#)?;
//! let kv = registry.open(&cfg)?;
//! kv.set("a", "1")?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::kv::KeyValue;
use crate::{kvfile, memkv, sledkv, sqlitekv};

/// A backend constructor: builds a store from its configuration.
pub type Constructor = fn(&Config) -> Result<Box<dyn KeyValue>>;

/// A named-constructor table for KeyValue backends.
#[derive(Default)]
pub struct Registry {
    ctors: HashMap<String, Constructor>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with every built-in backend registered:
    /// `mem`, `sled`, `sqlite`, and `kvfile`.
    pub fn with_default_backends() -> Self {
        let mut r = Self::new();
        r.register("mem", memkv::from_config);
        r.register("sled", sledkv::from_config);
        r.register("sqlite", sqlitekv::from_config);
        r.register("kvfile", kvfile::from_config);
        r
    }

    /// Registers a constructor under `name`.
    ///
    /// # Panics
    ///
    /// Panics if `name` is already registered. Registering the same
    /// type twice is a programmer error, caught at startup rather than
    /// at request time.
    pub fn register(&mut self, name: impl Into<String>, ctor: Constructor) {
        let name = name.into();
        if self.ctors.insert(name.clone(), ctor).is_some() {
            panic!("duplicate storage type registration: {:?}", name);
        }
    }

    /// Names of all registered backends, sorted.
    pub fn known_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.ctors.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    /// Opens a store from `cfg`.
    ///
    /// Reads the required `type` field, dispatches to the registered
    /// constructor, then validates that the configuration held no
    /// unknown fields. Constructor failures are wrapped with the type
    /// name.
    pub fn open(&self, cfg: &Config) -> Result<Box<dyn KeyValue>> {
        let type_name = cfg.required_string("type");
        if type_name.is_empty() {
            cfg.validate()?;
            return Err(Error::config("empty \"type\" field"));
        }

        let ctor = match self.ctors.get(&type_name) {
            Some(ctor) => *ctor,
            None => {
                return Err(Error::UnknownBackend {
                    requested: type_name,
                    known: self.known_types(),
                })
            }
        };

        let kv = ctor(cfg).map_err(|e| Error::Constructor {
            type_name: type_name.clone(),
            source: Box::new(e),
        })?;

        if let Err(e) = cfg.validate() {
            let _ = kv.close();
            return Err(e);
        }
        Ok(kv)
    }
}
