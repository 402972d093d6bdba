//! Configuration of the instrumentation passes.
//!
//! A `Configuration` is built once, from defaults, a `ConfigurationBuilder`,
//! or JSON, and passed by reference to every pass. It is never mutated
//! afterwards.

use crate::Error;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::default;

/// Which allocator symbol table is recognized.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum AllocatorMode {
    /// The C and C++ runtime allocators.
    User,
    /// The kernel's `kmem` allocators.
    Kernel,
}

impl default::Default for AllocatorMode {
    fn default() -> AllocatorMode {
        AllocatorMode::User
    }
}

/// How the arguments of a recognized allocator are laid out.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum AllocatorKind {
    /// `(size)`
    Malloc,
    /// `(count, size)`
    Calloc,
    /// `(old_pointer, size)`
    Realloc,
}

const USER_ALLOCATORS: &[(&str, AllocatorKind)] = &[
    ("malloc", AllocatorKind::Malloc),
    ("calloc", AllocatorKind::Calloc),
    ("realloc", AllocatorKind::Realloc),
    ("_Znwm", AllocatorKind::Malloc),
    ("_Znam", AllocatorKind::Malloc),
];

const USER_DEALLOCATORS: &[&str] = &["free", "_ZdlPv", "_ZdaPv"];

const KERNEL_ALLOCATORS: &[(&str, AllocatorKind)] = &[
    ("kmem_malloc", AllocatorKind::Malloc),
    ("kmem_mallocz", AllocatorKind::Malloc),
    ("kmem_realloc", AllocatorKind::Realloc),
];

const KERNEL_DEALLOCATORS: &[&str] = &["kmem_free"];

/// Names of the runtime entry points injected code calls.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct RuntimeHooks {
    pub notify_malloc: String,
    pub notify_calloc: String,
    pub notify_realloc: String,
    pub notify_free: String,
    pub notify_global: String,
    pub notify_escape: String,
    pub guard_address: String,
    pub guard_callee_stack: String,
    pub pin_pointer: String,
}

impl default::Default for RuntimeHooks {
    fn default() -> RuntimeHooks {
        RuntimeHooks {
            notify_malloc: "carat_notify_malloc".to_string(),
            notify_calloc: "carat_notify_calloc".to_string(),
            notify_realloc: "carat_notify_realloc".to_string(),
            notify_free: "carat_notify_free".to_string(),
            notify_global: "carat_notify_global".to_string(),
            notify_escape: "carat_notify_escape".to_string(),
            guard_address: "carat_guard_address".to_string(),
            guard_callee_stack: "carat_guard_callee_stack".to_string(),
            pin_pointer: "carat_pin_pointer".to_string(),
        }
    }
}

impl RuntimeHooks {
    /// Every hook name.
    pub fn names(&self) -> [&str; 9] {
        [
            &self.notify_malloc,
            &self.notify_calloc,
            &self.notify_realloc,
            &self.notify_free,
            &self.notify_global,
            &self.notify_escape,
            &self.guard_address,
            &self.guard_callee_stack,
            &self.pin_pointer,
        ]
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names().contains(&name)
    }
}

/// Settings shared by every instrumentation pass.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct Configuration {
    globals: bool,
    mallocs: bool,
    frees: bool,
    escapes: bool,
    protection: bool,
    restriction: bool,
    verification: bool,
    optimize_guards: bool,
    allocator_mode: AllocatorMode,
    debug: bool,
    hooks: RuntimeHooks,
    global_init_function: String,
    skip_functions: BTreeSet<String>,
}

impl default::Default for Configuration {
    fn default() -> Configuration {
        Configuration {
            globals: true,
            mallocs: true,
            frees: true,
            escapes: true,
            protection: true,
            restriction: true,
            verification: true,
            optimize_guards: true,
            allocator_mode: AllocatorMode::User,
            debug: false,
            hooks: RuntimeHooks::default(),
            global_init_function: "main".to_string(),
            skip_functions: BTreeSet::new(),
        }
    }
}

impl Configuration {
    /// Create a configuration with every pass enabled.
    pub fn new() -> Configuration {
        Configuration::default()
    }

    /// Parse a configuration from JSON. Missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Configuration, Error> {
        Ok(serde_json::from_str(json)?)
    }

    /// Whether globals are registered with the runtime.
    pub fn globals(&self) -> bool {
        self.globals
    }

    /// Whether allocator calls are reported to the runtime.
    pub fn mallocs(&self) -> bool {
        self.mallocs
    }

    /// Whether deallocator calls are reported to the runtime.
    pub fn frees(&self) -> bool {
        self.frees
    }

    /// Whether pointer-valued stores are reported to the runtime.
    pub fn escapes(&self) -> bool {
        self.escapes
    }

    /// Whether memory accesses are guarded.
    pub fn protection(&self) -> bool {
        self.protection
    }

    /// Whether escaping calls get callee stack guards.
    pub fn restriction(&self) -> bool {
        self.restriction
    }

    /// Whether modules are verified before and after instrumentation.
    pub fn verification(&self) -> bool {
        self.verification
    }

    /// Whether guards may be hoisted out of loops. When `false`, every guard
    /// which is not redundant is placed at its access.
    pub fn optimize_guards(&self) -> bool {
        self.optimize_guards
    }

    pub fn allocator_mode(&self) -> AllocatorMode {
        self.allocator_mode
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    pub fn hooks(&self) -> &RuntimeHooks {
        &self.hooks
    }

    /// The function global registrations are placed in.
    pub fn global_init_function(&self) -> &str {
        &self.global_init_function
    }

    /// The allocator table for the configured mode.
    pub fn allocators(&self) -> &'static [(&'static str, AllocatorKind)] {
        match self.allocator_mode {
            AllocatorMode::User => USER_ALLOCATORS,
            AllocatorMode::Kernel => KERNEL_ALLOCATORS,
        }
    }

    /// The deallocator table for the configured mode.
    pub fn deallocators(&self) -> &'static [&'static str] {
        match self.allocator_mode {
            AllocatorMode::User => USER_DEALLOCATORS,
            AllocatorMode::Kernel => KERNEL_DEALLOCATORS,
        }
    }

    /// The kind of the allocator called `name`, if it is one.
    pub fn allocator(&self, name: &str) -> Option<AllocatorKind> {
        self.allocators()
            .iter()
            .find(|(allocator, _)| *allocator == name)
            .map(|(_, kind)| *kind)
    }

    pub fn is_deallocator(&self, name: &str) -> bool {
        self.deallocators().contains(&name)
    }

    /// Returns `true` for functions whose behavior the runtime understands:
    /// allocators, deallocators, runtime hooks and compiler intrinsics.
    pub fn is_known_function(&self, name: &str) -> bool {
        self.allocator(name).is_some()
            || self.is_deallocator(name)
            || self.hooks.contains(name)
            || name.starts_with("llvm.")
    }

    /// Returns `true` if the function called `name` may be instrumented.
    pub fn should_instrument(&self, name: &str) -> bool {
        !self.skip_functions.contains(name) && !self.hooks.contains(name)
    }
}

/// Create a `Configuration` with the builder pattern.
pub struct ConfigurationBuilder {
    configuration: Configuration,
}

impl ConfigurationBuilder {
    /// Create a new builder, starting from the defaults.
    pub fn new() -> ConfigurationBuilder {
        ConfigurationBuilder {
            configuration: Configuration::default(),
        }
    }

    pub fn disable_globals(mut self, disable: bool) -> ConfigurationBuilder {
        self.configuration.globals = !disable;
        self
    }

    pub fn disable_mallocs(mut self, disable: bool) -> ConfigurationBuilder {
        self.configuration.mallocs = !disable;
        self
    }

    pub fn disable_frees(mut self, disable: bool) -> ConfigurationBuilder {
        self.configuration.frees = !disable;
        self
    }

    pub fn disable_escapes(mut self, disable: bool) -> ConfigurationBuilder {
        self.configuration.escapes = !disable;
        self
    }

    pub fn disable_protection(mut self, disable: bool) -> ConfigurationBuilder {
        self.configuration.protection = !disable;
        self
    }

    pub fn disable_restriction(mut self, disable: bool) -> ConfigurationBuilder {
        self.configuration.restriction = !disable;
        self
    }

    pub fn disable_verification(mut self, disable: bool) -> ConfigurationBuilder {
        self.configuration.verification = !disable;
        self
    }

    /// Place every non-redundant guard at its access.
    pub fn fallback_only(mut self, fallback_only: bool) -> ConfigurationBuilder {
        self.configuration.optimize_guards = !fallback_only;
        self
    }

    pub fn allocator_mode(mut self, allocator_mode: AllocatorMode) -> ConfigurationBuilder {
        self.configuration.allocator_mode = allocator_mode;
        self
    }

    pub fn debug(mut self, debug: bool) -> ConfigurationBuilder {
        self.configuration.debug = debug;
        self
    }

    pub fn hooks(mut self, hooks: RuntimeHooks) -> ConfigurationBuilder {
        self.configuration.hooks = hooks;
        self
    }

    pub fn global_init_function<S>(mut self, name: S) -> ConfigurationBuilder
    where
        S: Into<String>,
    {
        self.configuration.global_init_function = name.into();
        self
    }

    /// Never instrument the function called `name`.
    pub fn skip_function<S>(mut self, name: S) -> ConfigurationBuilder
    where
        S: Into<String>,
    {
        self.configuration.skip_functions.insert(name.into());
        self
    }

    pub fn build(self) -> Configuration {
        self.configuration
    }
}

impl default::Default for ConfigurationBuilder {
    fn default() -> ConfigurationBuilder {
        ConfigurationBuilder::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocator_tables() {
        let user = Configuration::new();
        assert_eq!(user.allocator("calloc"), Some(AllocatorKind::Calloc));
        assert!(user.is_deallocator("_ZdlPv"));
        assert!(user.allocator("kmem_malloc").is_none());

        let kernel = ConfigurationBuilder::new()
            .allocator_mode(AllocatorMode::Kernel)
            .build();
        assert_eq!(kernel.allocator("kmem_realloc"), Some(AllocatorKind::Realloc));
        assert!(kernel.is_deallocator("kmem_free"));
        assert!(!kernel.is_deallocator("free"));
    }

    #[test]
    fn json_keeps_defaults() {
        let configuration =
            Configuration::from_json(r#"{ "escapes": false, "allocator_mode": "Kernel" }"#)
                .unwrap();
        assert!(!configuration.escapes());
        assert!(configuration.mallocs());
        assert_eq!(configuration.allocator_mode(), AllocatorMode::Kernel);
        assert_eq!(configuration.hooks(), &RuntimeHooks::default());
    }

    #[test]
    fn hooks_are_never_instrumented() {
        let configuration = ConfigurationBuilder::new().skip_function("boot").build();
        assert!(!configuration.should_instrument("boot"));
        assert!(!configuration.should_instrument("carat_guard_address"));
        assert!(configuration.should_instrument("main"));
        assert!(configuration.is_known_function("llvm.memcpy.p0.p0.i64"));
    }
}
