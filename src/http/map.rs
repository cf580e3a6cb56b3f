//! Header collection: a `name -> values[]` multimap keyed case-insensitively
//! but preserving the first-seen case of each name and insertion order of
//! its values, plus an optional accept/reject filter applied as fields are
//! collected.
//!
//! Grounded in the source's `xhttp_map`/`xhttp_tab` (a dedicated hash table
//! keyed by folded name, `strncasecmp`-verified on collision) and
//! `filter.c`'s block-list gate; here both ride on the crate's own
//! [`crate::hash::HashMap`] rather than a generated table type.

use crate::hash::HashMap;

/// Whether a configured name list is an allow-list or a deny-list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockMode {
    /// Only listed names are collected.
    Accept,
    /// Listed names are dropped; everything else is collected.
    Reject,
}

struct Group {
    /// The case as first observed for this name.
    name: Box<str>,
    values: Vec<Box<str>>,
}

/// A collected header or trailer set.
pub struct HeaderMap {
    groups: HashMap<Box<str>, Group>,
    block: Option<(Vec<Box<str>>, BlockMode)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        HeaderMap {
            groups: HashMap::with_capacity(16),
            block: None,
        }
    }

    /// Installs a block list: `mode == Accept` keeps only the named fields,
    /// `mode == Reject` drops them. Replaces any previously set list.
    pub fn block(&mut self, names: &[&str], mode: BlockMode) {
        let names = names.iter().map(|n| (*n).into()).collect();
        self.block = Some((names, mode));
    }

    fn allowed(&self, name: &str) -> bool {
        match &self.block {
            None => true,
            Some((names, mode)) => {
                let listed = names.iter().any(|n| n.eq_ignore_ascii_case(name));
                match mode {
                    BlockMode::Accept => listed,
                    BlockMode::Reject => !listed,
                }
            }
        }
    }

    /// Folds `name`, appends `value` to its group (creating one on first
    /// sight, in which case `name`'s exact case is kept as the group's
    /// display name). Returns `false` if the block list rejected `name`.
    pub fn insert(&mut self, name: &str, value: &str) -> bool {
        if !self.allowed(name) {
            return false;
        }
        let key: Box<str> = name.to_ascii_lowercase().into_boxed_str();
        let mut group = self
            .groups
            .remove(&key)
            .unwrap_or_else(|| Group {
                name: name.into(),
                values: Vec::new(),
            });
        group.values.push(value.into());
        self.groups.insert(key, group);
        true
    }

    /// All values collected for `name`, in insertion order, or `None` if
    /// the name was never seen.
    pub fn get(&mut self, name: &str) -> Option<&[Box<str>]> {
        let key: Box<str> = name.to_ascii_lowercase().into_boxed_str();
        self.groups.get(&key).map(|g| g.values.as_slice())
    }

    /// The exact case this name was first collected under.
    pub fn display_name(&mut self, name: &str) -> Option<&str> {
        let key: Box<str> = name.to_ascii_lowercase().into_boxed_str();
        self.groups.get(&key).map(|g| &*g.name)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Iterates every group as `(display name, values)`, in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Box<str>])> {
        self.groups.iter().map(|(_, g)| (&*g.name, g.values.as_slice()))
    }

    /// Drops every collected field while keeping the installed block list.
    pub fn clear(&mut self) {
        self.groups = HashMap::with_capacity(16);
    }
}

impl Default for HeaderMap {
    fn default() -> Self {
        HeaderMap::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preserves_first_seen_case_and_insertion_order() {
        let mut m = HeaderMap::new();
        assert!(m.insert("Set-Cookie", "a=1"));
        assert!(m.insert("set-cookie", "b=2"));
        assert_eq!(m.display_name("SET-COOKIE"), Some("Set-Cookie"));
        assert_eq!(
            m.get("set-cookie"),
            Some(&[Box::from("a=1"), Box::from("b=2")][..])
        );
    }

    #[test]
    fn reject_mode_drops_listed_names() {
        let mut m = HeaderMap::new();
        m.block(&["cookie", "authorization"], BlockMode::Reject);
        assert!(!m.insert("Cookie", "x"));
        assert!(m.insert("Host", "example.com"));
        assert_eq!(m.get("cookie"), None);
        assert_eq!(m.get("host"), Some(&[Box::from("example.com")][..]));
    }

    #[test]
    fn accept_mode_keeps_only_listed_names() {
        let mut m = HeaderMap::new();
        m.block(&["host"], BlockMode::Accept);
        assert!(m.insert("Host", "example.com"));
        assert!(!m.insert("Accept", "*/*"));
        assert_eq!(m.len(), 1);
    }
}
