//! Scoped process environment overrides
//!
//! [`EnvScope`] sets a group of variables and puts every one of them back
//! when it is dropped, including during unwinding. A variable that did not
//! exist beforehand is removed again rather than left empty.
//!
//! The process environment is global. Only one scope may be active at a
//! time; the import lock is what guarantees that for import jobs.

use std::collections::BTreeMap;
use std::ffi::OsString;
use tracing::trace;

/// Guard restoring overridden environment variables on drop
#[must_use = "the overrides are reverted as soon as the scope is dropped"]
pub struct EnvScope {
    saved: Vec<(String, Option<OsString>)>,
}

impl EnvScope {
    /// Apply `vars`, returning a guard that restores the previous values
    ///
    /// A `None` value unsets the variable for the duration of the scope.
    pub fn apply<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, Option<V>)>,
        K: Into<String>,
        V: Into<OsString>,
    {
        let mut saved: Vec<(String, Option<OsString>)> = Vec::new();

        for (name, value) in vars {
            let name = name.into();
            // First recorded value wins if a name repeats
            if !saved.iter().any(|(n, _)| *n == name) {
                saved.push((name.clone(), std::env::var_os(&name)));
            }

            match value {
                Some(value) => {
                    let value: OsString = value.into();
                    trace!(var = %name, "Setting scoped environment variable");
                    // SAFETY: callers hold the import lock, which is the only
                    // writer of the process environment while a scope is open.
                    unsafe { std::env::set_var(&name, value) };
                }
                None => {
                    trace!(var = %name, "Unsetting scoped environment variable");
                    // SAFETY: as above.
                    unsafe { std::env::remove_var(&name) };
                }
            }
        }

        Self { saved }
    }

    /// Run `f` with `vars` applied, restoring them afterwards
    pub fn scoped<I, K, V, F, T>(vars: I, f: F) -> T
    where
        I: IntoIterator<Item = (K, Option<V>)>,
        K: Into<String>,
        V: Into<OsString>,
        F: FnOnce() -> T,
    {
        let _scope = Self::apply(vars);
        f()
    }

    /// Names of the variables this scope controls
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.saved.iter().map(|(name, _)| name.as_str())
    }
}

impl Drop for EnvScope {
    fn drop(&mut self) {
        for (name, previous) in self.saved.drain(..).rev() {
            match previous {
                // SAFETY: see `EnvScope::apply`.
                Some(value) => unsafe { std::env::set_var(&name, value) },
                None => unsafe { std::env::remove_var(&name) },
            }
        }
    }
}

/// Convert a plain `name -> value` map into scope overrides
pub fn overrides(vars: &BTreeMap<String, String>) -> impl Iterator<Item = (String, Option<String>)> + '_ {
    vars.iter().map(|(k, v)| (k.clone(), Some(v.clone())))
}
