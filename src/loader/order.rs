/*!
 * Module Load Order
 *
 * Decides whether a module is loaded from a native image, the builtin
 * implementation, or both in some order. Overrides come from external
 * configuration at startup; the first resolution for an application identity
 * freezes its overrides.
 */

use super::types::{LoadOrderError, LoadOrderResult};
use crate::core::inline_string::InlineString;
use ahash::RandomState;
use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

/// Load order policy for one module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadOrder {
    Invalid,
    Disabled,
    Native,
    Builtin,
    NativeBuiltin,
    BuiltinNative,
    Default,
}

impl LoadOrder {
    /// Parse an order string such as `n,b`, `builtin`, or `` (disabled)
    pub fn parse(text: &str) -> Option<Self> {
        let mut order = Vec::with_capacity(2);
        for part in text.split(',').map(str::trim) {
            let kind = match part.to_ascii_lowercase().as_str() {
                "" if text.trim().is_empty() => return Some(LoadOrder::Disabled),
                "d" | "disabled" => return Some(LoadOrder::Disabled),
                "n" | "native" => 'n',
                "b" | "builtin" => 'b',
                _ => return None,
            };
            if !order.contains(&kind) {
                order.push(kind);
            }
        }
        match order.as_slice() {
            ['n'] => Some(LoadOrder::Native),
            ['b'] => Some(LoadOrder::Builtin),
            ['n', 'b'] => Some(LoadOrder::NativeBuiltin),
            ['b', 'n'] => Some(LoadOrder::BuiltinNative),
            _ => None,
        }
    }

    /// Whether a native image is tried first
    pub fn prefers_native(self) -> bool {
        matches!(self, LoadOrder::Native | LoadOrder::NativeBuiltin)
    }
}

impl fmt::Display for LoadOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            LoadOrder::Invalid => "invalid",
            LoadOrder::Disabled => "disabled",
            LoadOrder::Native => "n",
            LoadOrder::Builtin => "b",
            LoadOrder::NativeBuiltin => "n,b",
            LoadOrder::BuiltinNative => "b,n",
            LoadOrder::Default => "default",
        };
        f.write_str(text)
    }
}

/// Normalize a module name or path to its lookup key: base name, lowercase, no `.dll`
pub fn module_key(name: &str) -> InlineString {
    let base = name.rsplit(['\\', '/']).next().unwrap_or(name);
    let lower = InlineString::lowercase(base);
    if let Some(stem) = lower.strip_suffix(".dll").filter(|stem| !stem.is_empty()) {
        return InlineString::from(stem);
    }
    lower
}

/// Process-wide load order table
pub struct LoadOrderRegistry {
    app_name: RwLock<Option<InlineString>>,
    global: DashMap<InlineString, LoadOrder, RandomState>,
    per_app: DashMap<(InlineString, InlineString), LoadOrder, RandomState>,
    locked_apps: DashSet<InlineString, RandomState>,
    resolved: DashMap<InlineString, LoadOrder, RandomState>,
    reports: DashMap<InlineString, u32, RandomState>,
}

impl LoadOrderRegistry {
    pub fn new() -> Self {
        Self {
            app_name: RwLock::new(None),
            global: DashMap::with_hasher(RandomState::new()),
            per_app: DashMap::with_hasher(RandomState::new()),
            locked_apps: DashSet::with_hasher(RandomState::new()),
            resolved: DashMap::with_hasher(RandomState::new()),
            reports: DashMap::with_hasher(RandomState::new()),
        }
    }

    /// Record the application identity used for per-application overrides
    pub fn set_app_name(&self, name: &str) -> LoadOrderResult<()> {
        let key = module_key(name);
        let mut app = self.app_name.write();
        if let Some(current) = app.as_ref() {
            if self.locked_apps.contains(current) && *current != key {
                return Err(LoadOrderError::AlreadyLocked {
                    app: current.clone(),
                });
            }
        }
        debug!(app = %key, "Load order application set");
        *app = Some(key);
        Ok(())
    }

    pub fn app_name(&self) -> Option<InlineString> {
        self.app_name.read().clone()
    }

    /// Set a per-application override
    ///
    /// Rejected once the application resolved any module, or once `module`
    /// itself has a cached resolution.
    pub fn set_override(&self, app: &str, module: &str, order: LoadOrder) -> LoadOrderResult<()> {
        let app = module_key(app);
        if self.locked_apps.contains(&app) {
            return Err(LoadOrderError::AlreadyLocked { app });
        }
        if order == LoadOrder::Invalid {
            return Err(LoadOrderError::InvalidOrder {
                entry: InlineString::from(module),
            });
        }
        let module = module_key(module);
        if self.resolved.contains_key(&module) {
            return Err(LoadOrderError::AlreadyResolved { module });
        }
        self.per_app.insert((app, module), order);
        Ok(())
    }

    /// Apply a global override string: `mod1,mod2=n,b;mod3=b;mod4=`
    pub fn parse_overrides(&self, text: &str) -> LoadOrderResult<usize> {
        let mut applied = 0;
        for entry in text.split(';').map(str::trim).filter(|e| !e.is_empty()) {
            let (modules, order) = entry.split_once('=').ok_or(LoadOrderError::InvalidOrder {
                entry: InlineString::from(entry),
            })?;
            let order = LoadOrder::parse(order).ok_or(LoadOrderError::InvalidOrder {
                entry: InlineString::from(entry),
            })?;
            for module in modules.split(',').map(str::trim).filter(|m| !m.is_empty()) {
                let key = module_key(module);
                if self.resolved.contains_key(&key) {
                    return Err(LoadOrderError::AlreadyResolved { module: key });
                }
                self.global.insert(key, order);
                applied += 1;
            }
        }
        debug!(count = applied, "Load order overrides applied");
        Ok(applied)
    }

    /// Resolve the load order for `module`
    ///
    /// The first resolution freezes the current application's overrides and
    /// is reported once; later calls return the cached answer.
    pub fn get_load_order(&self, module: &str) -> LoadOrder {
        let key = module_key(module);
        let app = self.app_name();
        if let Some(app) = app.as_ref() {
            self.locked_apps.insert(app.clone());
        }

        if let Some(order) = self.resolved.get(&key) {
            return *order;
        }

        let order = app
            .as_ref()
            .and_then(|app| self.per_app.get(&(app.clone(), key.clone())).map(|o| *o))
            .or_else(|| self.global.get(&key).map(|o| *o))
            .unwrap_or(LoadOrder::Default);

        let entry = self.resolved.entry(key.clone()).or_insert(order);
        let order = *entry;
        drop(entry);

        let mut count = self.reports.entry(key.clone()).or_insert(0);
        if *count == 0 {
            *count += 1;
            info!(module = %key, app = ?app, order = %order, "Module load order resolved");
        }
        order
    }

    /// How many times the policy for `module` has been reported
    pub fn resolution_reports(&self, module: &str) -> u32 {
        self.reports
            .get(&module_key(module))
            .map(|count| *count)
            .unwrap_or(0)
    }
}

impl Default for LoadOrderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_orders() {
        assert_eq!(LoadOrder::parse("n,b"), Some(LoadOrder::NativeBuiltin));
        assert_eq!(LoadOrder::parse("builtin, native"), Some(LoadOrder::BuiltinNative));
        assert_eq!(LoadOrder::parse("n"), Some(LoadOrder::Native));
        assert_eq!(LoadOrder::parse(""), Some(LoadOrder::Disabled));
        assert_eq!(LoadOrder::parse("d"), Some(LoadOrder::Disabled));
        assert_eq!(LoadOrder::parse("x"), None);
        assert_eq!(LoadOrder::parse("n,,b"), None);
    }

    #[test]
    fn test_module_key() {
        assert_eq!(module_key("C:\\windows\\system32\\KERNEL32.DLL").as_str(), "kernel32");
        assert_eq!(module_key("/usr/lib/comctl32.dll").as_str(), "comctl32");
        assert_eq!(module_key("app.exe").as_str(), "app.exe");
        assert_eq!(module_key(".dll").as_str(), ".dll");
    }

    #[test]
    fn test_global_overrides() {
        let registry = LoadOrderRegistry::new();
        assert_eq!(registry.parse_overrides("comctl32,shell32=n,b;mshtml=").unwrap(), 3);
        assert_eq!(registry.get_load_order("COMCTL32.dll"), LoadOrder::NativeBuiltin);
        assert_eq!(registry.get_load_order("mshtml"), LoadOrder::Disabled);
        assert_eq!(registry.get_load_order("user32"), LoadOrder::Default);
        assert!(registry.parse_overrides("broken").is_err());
    }

    #[test]
    fn test_per_app_takes_precedence() {
        let registry = LoadOrderRegistry::new();
        registry.parse_overrides("d3d9=b").unwrap();
        registry.set_app_name("game.exe").unwrap();
        registry
            .set_override("game.exe", "d3d9", LoadOrder::Native)
            .unwrap();
        assert_eq!(registry.get_load_order("d3d9.dll"), LoadOrder::Native);
    }
}
