//! Typed configuration registry with change notification
//!
//! Process-wide `name -> ConfigVar<T>` lookup. The first lookup of a
//! name creates the variable, seeding it from the environment when a
//! `WEFT_`-prefixed override is present (`fiber.stack_size` reads
//! `WEFT_FIBER_STACK_SIZE`). Later lookups return the same variable.
//!
//! Consumers that cache a value install a listener and refresh their
//! cache when the value changes.

use std::any::Any;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use weft_core::env::env_get_opt;
use weft_core::werror;

/// Change listener: called with (old, new) after a successful `set`
pub type ConfigListener<T> = Arc<dyn Fn(&T, &T) + Send + Sync>;

/// One named, typed configuration value
pub struct ConfigVar<T> {
    name: String,
    description: String,
    value: RwLock<T>,
    listeners: RwLock<HashMap<u64, ConfigListener<T>>>,
    next_listener_id: AtomicU64,
}

impl<T> ConfigVar<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn new(name: &str, description: &str, value: T) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            description: description.to_string(),
            value: RwLock::new(value),
            listeners: RwLock::new(HashMap::new()),
            next_listener_id: AtomicU64::new(1),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Current value (cloned out)
    pub fn get(&self) -> T {
        self.value.read().clone()
    }

    /// Replace the value; listeners run when it actually changed
    pub fn set(&self, new: T) {
        let old = {
            let mut guard = self.value.write();
            if *guard == new {
                return;
            }
            std::mem::replace(&mut *guard, new.clone())
        };
        let listeners: Vec<ConfigListener<T>> =
            self.listeners.read().values().cloned().collect();
        for cb in listeners {
            cb(&old, &new);
        }
    }

    /// Register a change listener; returns an id for removal
    pub fn add_listener<F>(&self, cb: F) -> u64
    where
        F: Fn(&T, &T) + Send + Sync + 'static,
    {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().insert(id, Arc::new(cb));
        id
    }

    /// Remove a listener by id
    pub fn del_listener(&self, id: u64) {
        self.listeners.write().remove(&id);
    }
}

fn registry() -> &'static RwLock<HashMap<String, Arc<dyn Any + Send + Sync>>> {
    static REGISTRY: OnceLock<RwLock<HashMap<String, Arc<dyn Any + Send + Sync>>>> =
        OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Environment key for a dotted config name: `fiber.stack_size` ->
/// `WEFT_FIBER_STACK_SIZE`
fn env_key(name: &str) -> String {
    let mut key = String::from("WEFT_");
    for c in name.chars() {
        key.push(match c {
            '.' => '_',
            c => c.to_ascii_uppercase(),
        });
    }
    key
}

/// Look up a config variable, creating it on first use
///
/// The created value is `default`, or the parsed `WEFT_*` environment
/// override when one is set. A name looked up again under a different
/// type logs an error and yields a detached variable holding `default`.
pub fn lookup<T>(name: &str, default: T, description: &str) -> Arc<ConfigVar<T>>
where
    T: Clone + PartialEq + FromStr + Send + Sync + 'static,
{
    if let Some(existing) = registry().read().get(name) {
        match existing.clone().downcast::<ConfigVar<T>>() {
            Ok(var) => return var,
            Err(_) => {
                werror!("config lookup {}: existing var has another type", name);
                return ConfigVar::new(name, description, default);
            }
        }
    }

    let mut reg = registry().write();
    // Raced creation: re-check under the write lock
    if let Some(existing) = reg.get(name) {
        if let Ok(var) = existing.clone().downcast::<ConfigVar<T>>() {
            return var;
        }
        werror!("config lookup {}: existing var has another type", name);
        return ConfigVar::new(name, description, default);
    }

    let seed = env_get_opt::<T>(&env_key(name)).unwrap_or(default);
    let var = ConfigVar::new(name, description, seed);
    reg.insert(name.to_string(), var.clone() as Arc<dyn Any + Send + Sync>);
    var
}
