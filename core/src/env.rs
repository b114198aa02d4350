//! Environment construction for child processes
//!
//! An [`EnvironmentList`] is an immutable, name-sorted list of variables.
//! It is built either from a snapshot of the current process environment or
//! from a caller-supplied base, and then patched with [`merge`].
//!
//! Ordering follows a [`CaseRule`]: names are compared by their case-folded
//! form first and by exact bytes second, so that names which are equal under
//! the rule always form one contiguous run.

use crate::{CoreError, Result};
use schema::EnvVar;
use std::cmp::Ordering;
use std::ffi::{CString, OsStr, OsString};
use std::os::unix::ffi::OsStrExt;
use tracing::debug;

/// How variable names are compared
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseRule {
    /// `Path` and `PATH` are different variables
    Sensitive,
    /// `Path` and `PATH` name the same variable (ASCII folding)
    Insensitive,
}

impl CaseRule {
    /// The rule of the host platform
    pub const fn platform() -> Self {
        if cfg!(windows) {
            CaseRule::Insensitive
        } else {
            CaseRule::Sensitive
        }
    }

    /// Whether two names refer to the same variable
    pub fn same_name(self, a: &OsStr, b: &OsStr) -> bool {
        match self {
            CaseRule::Sensitive => a == b,
            CaseRule::Insensitive => a.as_bytes().eq_ignore_ascii_case(b.as_bytes()),
        }
    }

    fn cmp_folded(self, a: &OsStr, b: &OsStr) -> Ordering {
        match self {
            CaseRule::Sensitive => a.as_bytes().cmp(b.as_bytes()),
            CaseRule::Insensitive => a
                .as_bytes()
                .iter()
                .map(u8::to_ascii_uppercase)
                .cmp(b.as_bytes().iter().map(u8::to_ascii_uppercase)),
        }
    }

    /// Total order used for sorting: folded name, then exact bytes
    pub fn cmp_names(self, a: &OsStr, b: &OsStr) -> Ordering {
        self.cmp_folded(a, b)
            .then_with(|| a.as_bytes().cmp(b.as_bytes()))
    }
}

/// One `name=value` pair. Names and values are raw bytes; nothing requires
/// them to be UTF-8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvEntry {
    name: OsString,
    value: OsString,
}

impl EnvEntry {
    /// Create a validated entry.
    ///
    /// The name must be non-empty and contain neither `=` nor NUL; the value
    /// must not contain NUL.
    pub fn new(name: impl Into<OsString>, value: impl Into<OsString>) -> Result<Self> {
        let name = name.into();
        let value = value.into();
        validate_name(&name)?;
        validate_value(&name, &value)?;
        Ok(Self { name, value })
    }

    /// Variable name
    pub fn name(&self) -> &OsStr {
        &self.name
    }

    /// Variable value
    pub fn value(&self) -> &OsStr {
        &self.value
    }

    /// `name=value` bytes without terminator
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.name.len() + self.value.len() + 1);
        out.extend_from_slice(self.name.as_bytes());
        out.push(b'=');
        out.extend_from_slice(self.value.as_bytes());
        out
    }
}

fn validate_name(name: &OsStr) -> Result<()> {
    let bytes = name.as_bytes();
    if bytes.is_empty() {
        return Err(CoreError::ValidationError(
            "environment variable name cannot be empty".to_string(),
        ));
    }
    if bytes.contains(&b'=') {
        return Err(CoreError::ValidationError(format!(
            "environment variable name {name:?} contains '='"
        )));
    }
    if bytes.contains(&0) {
        return Err(CoreError::ValidationError(format!(
            "environment variable name {name:?} contains a NUL byte"
        )));
    }
    Ok(())
}

fn validate_value(name: &OsStr, value: &OsStr) -> Result<()> {
    if value.as_bytes().contains(&0) {
        return Err(CoreError::ValidationError(format!(
            "environment variable {name:?}: value contains a NUL byte"
        )));
    }
    Ok(())
}

/// Sorted, immutable list of environment variables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentList {
    entries: Vec<EnvEntry>,
    rule: CaseRule,
}

impl EnvironmentList {
    /// An empty environment
    pub fn empty(rule: CaseRule) -> Self {
        Self {
            entries: Vec::new(),
            rule,
        }
    }

    /// Build a list from caller-supplied entries.
    ///
    /// Two entries naming the same variable under `rule` are rejected.
    pub fn from_entries(entries: impl IntoIterator<Item = EnvEntry>, rule: CaseRule) -> Result<Self> {
        let mut entries: Vec<EnvEntry> = entries.into_iter().collect();
        entries.sort_by(|a, b| rule.cmp_names(&a.name, &b.name));
        if let Some(pair) = entries
            .windows(2)
            .find(|pair| rule.same_name(&pair[0].name, &pair[1].name))
        {
            return Err(CoreError::ValidationError(format!(
                "environment variable {:?} specified more than once",
                pair[1].name
            )));
        }
        Ok(Self { entries, rule })
    }

    /// Build a base list from the option representation.
    ///
    /// Base entries must carry a value.
    pub fn from_vars(vars: &[EnvVar], rule: CaseRule) -> Result<Self> {
        let entries = vars
            .iter()
            .map(|var| match &var.value {
                Some(value) => EnvEntry::new(&var.name, value),
                None => Err(CoreError::ValidationError(format!(
                    "environment variable '{}': base entries need a value",
                    var.name
                ))),
            })
            .collect::<Result<Vec<_>>>()?;
        Self::from_entries(entries, rule)
    }

    /// Snapshot the live environment of this process.
    ///
    /// Entries are taken verbatim, byte for byte: names that collide under
    /// `rule` are all kept. Only entries `execve` could not carry (empty
    /// name, `=` in the name) are skipped.
    pub fn snapshot_current(rule: CaseRule) -> Self {
        let mut entries = Vec::new();
        // vars_os copies the whole block under std's environment lock
        for (name, value) in std::env::vars_os() {
            match EnvEntry::new(name, value) {
                Ok(entry) => entries.push(entry),
                Err(e) => debug!("Skipping environment entry: {}", e),
            }
        }
        entries.sort_by(|a, b| rule.cmp_names(&a.name, &b.name));
        Self { entries, rule }
    }

    /// Comparison rule of this list
    pub fn rule(&self) -> CaseRule {
        self.rule
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the list has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in sorted order
    pub fn iter(&self) -> impl Iterator<Item = &EnvEntry> {
        self.entries.iter()
    }

    /// Value of the first entry named `name`
    pub fn get(&self, name: impl AsRef<OsStr>) -> Option<&OsStr> {
        let (start, end) = self.run(name.as_ref());
        self.entries[start..end].first().map(|e| e.value.as_os_str())
    }

    /// Half-open index range of the entries matching `name`
    fn run(&self, name: &OsStr) -> (usize, usize) {
        let rule = self.rule;
        let start = self
            .entries
            .partition_point(|e| rule.cmp_folded(&e.name, name) == Ordering::Less);
        let end = start
            + self.entries[start..]
                .partition_point(|e| rule.cmp_folded(&e.name, name) != Ordering::Greater);
        (start, end)
    }

    /// Encoded `name=value` entries, in order
    pub fn to_block(&self) -> Vec<Vec<u8>> {
        self.entries.iter().map(EnvEntry::to_bytes).collect()
    }

    /// Entries as C strings for `execve`
    pub fn to_cstrings(&self) -> Result<Vec<CString>> {
        self.entries
            .iter()
            .map(|e| {
                CString::new(e.to_bytes()).map_err(|_| {
                    CoreError::ValidationError(format!(
                        "environment variable {:?} contains a NUL byte",
                        e.name
                    ))
                })
            })
            .collect()
    }
}

/// Apply `patch` to `base`, in order.
///
/// An entry without a value (or with an empty one) removes every variable
/// matching its name. Otherwise the first match is overwritten and any
/// further matches removed, or the entry is inserted at its sorted position.
/// All patch entries are validated before any is applied.
pub fn merge(base: &EnvironmentList, patch: &[EnvVar]) -> Result<EnvironmentList> {
    for var in patch {
        let name = OsStr::new(&var.name);
        validate_name(name)?;
        if let Some(value) = &var.value {
            validate_value(name, OsStr::new(value))?;
        }
    }

    let mut out = base.clone();
    for var in patch {
        let (start, end) = out.run(OsStr::new(&var.name));
        match var.value.as_deref() {
            None | Some("") => {
                out.entries.drain(start..end);
            }
            Some(value) => {
                let entry = EnvEntry {
                    name: OsString::from(&var.name),
                    value: OsString::from(value),
                };
                if start == end {
                    out.entries.insert(start, entry);
                } else {
                    out.entries[start] = entry;
                    out.entries.drain(start + 1..end);
                }
            }
        }
    }
    Ok(out)
}
