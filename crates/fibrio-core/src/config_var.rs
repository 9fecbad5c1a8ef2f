//! Named, typed, observable configuration variables
//!
//! A `ConfigVar<T>` is registered once under a dotted lowercase name
//! (`fiber.stack_size`) and shared by everything that looks it up. Values
//! can be changed at runtime; listeners observe every change as
//! `(old, new)`.
//!
//! Environment overrides use the key produced by [`env_key`]:
//! `fiber.stack_size` is overridden by `FIBRIO_FIBER_STACK_SIZE`.
//!
//! ```ignore
//! let timeout = Config::lookup("tcp.connect.timeout", 5000u64, "connect timeout ms")?;
//! timeout.add_listener(|old, new| kinfo!("timeout {} -> {}", old, new));
//! Config::set("tcp.connect.timeout", "3000")?;
//! ```

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};

use parking_lot::{Mutex, RwLock};

use crate::env::env_key;
use crate::error::ConfigError;

/// Type-erased view of a config variable
pub trait ConfigVarBase: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn type_name(&self) -> &'static str;

    /// Current value rendered with `Display`
    fn to_string_value(&self) -> String;

    /// Parse `value` and store it, notifying listeners on change
    fn from_str_value(&self, value: &str) -> Result<(), ConfigError>;
}

/// Values a `ConfigVar` can hold
pub trait ConfigValue: Clone + PartialEq + FromStr + Display + Send + Sync + 'static {}

impl<T> ConfigValue for T where T: Clone + PartialEq + FromStr + Display + Send + Sync + 'static {}

type Listener<T> = Arc<dyn Fn(&T, &T) + Send + Sync>;

/// A single named configuration value
pub struct ConfigVar<T: ConfigValue> {
    name: String,
    description: String,
    value: RwLock<T>,
    listeners: Mutex<BTreeMap<u64, Listener<T>>>,
    next_listener: AtomicU64,
}

impl<T: ConfigValue> ConfigVar<T> {
    fn new(name: &str, default: T, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            value: RwLock::new(default),
            listeners: Mutex::new(BTreeMap::new()),
            next_listener: AtomicU64::new(1),
        }
    }

    pub fn get_value(&self) -> T {
        self.value.read().clone()
    }

    /// Store `value`; listeners run after the store, outside any lock
    pub fn set_value(&self, value: T) {
        let old = {
            let mut guard = self.value.write();
            if *guard == value {
                return;
            }
            std::mem::replace(&mut *guard, value.clone())
        };

        let listeners: Vec<Listener<T>> = self.listeners.lock().values().cloned().collect();
        for cb in listeners {
            cb(&old, &value);
        }
    }

    /// Register a change listener, returning its id
    pub fn add_listener<F>(&self, f: F) -> u64
    where
        F: Fn(&T, &T) + Send + Sync + 'static,
    {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().insert(id, Arc::new(f));
        id
    }

    pub fn del_listener(&self, id: u64) -> bool {
        self.listeners.lock().remove(&id).is_some()
    }

    pub fn clear_listeners(&self) {
        self.listeners.lock().clear();
    }

    fn parse(&self, value: &str) -> Result<T, ConfigError> {
        value.trim().parse::<T>().map_err(|_| ConfigError::Parse {
            name: self.name.clone(),
            value: value.to_string(),
        })
    }
}

impl<T: ConfigValue> ConfigVarBase for ConfigVar<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn to_string_value(&self) -> String {
        self.value.read().to_string()
    }

    fn from_str_value(&self, value: &str) -> Result<(), ConfigError> {
        let parsed = self.parse(value)?;
        self.set_value(parsed);
        Ok(())
    }
}

struct Entry {
    base: Arc<dyn ConfigVarBase>,
    any: Arc<dyn Any + Send + Sync>,
}

static REGISTRY: LazyLock<RwLock<BTreeMap<String, Entry>>> =
    LazyLock::new(|| RwLock::new(BTreeMap::new()));

/// Process-wide registry of config variables
pub struct Config;

impl Config {
    /// Find or create the variable `name`
    ///
    /// A new variable starts at `default`, or at its environment override
    /// when one is set and parses. Looking up an existing name with a
    /// different `T` is an error.
    pub fn lookup<T: ConfigValue>(
        name: &str,
        default: T,
        description: &str,
    ) -> Result<Arc<ConfigVar<T>>, ConfigError> {
        validate_name(name)?;

        if let Some(existing) = Self::lookup_typed::<T>(name)? {
            return Ok(existing);
        }

        let mut registry = REGISTRY.write();
        // Lost a race with another creator
        if let Some(entry) = registry.get(name) {
            return downcast::<T>(name, entry);
        }

        let var = Arc::new(ConfigVar::new(name, default, description));
        if let Ok(raw) = std::env::var(env_key(name)) {
            match var.parse(&raw) {
                Ok(v) => *var.value.write() = v,
                Err(e) => crate::kwarn!(target: "system", "ignoring env override: {}", e),
            }
        }

        registry.insert(
            name.to_string(),
            Entry {
                base: var.clone(),
                any: var.clone(),
            },
        );
        Ok(var)
    }

    /// Existing variable `name` with value type `T`, if registered
    pub fn lookup_typed<T: ConfigValue>(
        name: &str,
    ) -> Result<Option<Arc<ConfigVar<T>>>, ConfigError> {
        let registry = REGISTRY.read();
        match registry.get(name) {
            Some(entry) => downcast::<T>(name, entry).map(Some),
            None => Ok(None),
        }
    }

    /// Type-erased lookup
    pub fn lookup_base(name: &str) -> Option<Arc<dyn ConfigVarBase>> {
        REGISTRY.read().get(name).map(|e| e.base.clone())
    }

    /// Set a registered variable from its string form
    pub fn set(name: &str, value: &str) -> Result<(), ConfigError> {
        let var = Self::lookup_base(name)
            .ok_or_else(|| ConfigError::InvalidName(name.to_string()))?;
        var.from_str_value(value)
    }

    /// Re-apply environment overrides to every registered variable
    ///
    /// Returns how many variables had an override set.
    pub fn load_from_env() -> Result<usize, ConfigError> {
        let vars: Vec<Arc<dyn ConfigVarBase>> =
            REGISTRY.read().values().map(|e| e.base.clone()).collect();

        let mut applied = 0;
        for var in vars {
            if let Ok(raw) = std::env::var(env_key(var.name())) {
                var.from_str_value(&raw)?;
                applied += 1;
            }
        }
        Ok(applied)
    }

    /// Visit every registered variable in name order
    pub fn visit<F: FnMut(&dyn ConfigVarBase)>(mut f: F) {
        let vars: Vec<Arc<dyn ConfigVarBase>> =
            REGISTRY.read().values().map(|e| e.base.clone()).collect();
        for var in vars {
            f(var.as_ref());
        }
    }
}

fn validate_name(name: &str) -> Result<(), ConfigError> {
    let ok = !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'.' || b == b'_');
    if ok {
        Ok(())
    } else {
        Err(ConfigError::InvalidName(name.to_string()))
    }
}

fn downcast<T: ConfigValue>(name: &str, entry: &Entry) -> Result<Arc<ConfigVar<T>>, ConfigError> {
    entry
        .any
        .clone()
        .downcast::<ConfigVar<T>>()
        .map_err(|_| ConfigError::TypeMismatch {
            name: name.to_string(),
            expected: std::any::type_name::<T>(),
            found: entry.base.type_name(),
        })
}
