// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Definition Registries
//!
//! Name-keyed stores of immutable definitions. A definition is copied into the registry
//! when first defined and shared through an `Arc` afterwards, so every component that
//! references a name holds the very same instance.

use std::{collections::BTreeMap, sync::Arc};

#[derive(Debug)]
pub struct Registry<T> {
    entries: BTreeMap<String, Arc<T>>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Registry {
            entries: BTreeMap::default(),
        }
    }
}

impl<T> Clone for Registry<T> {
    fn clone(&self) -> Self {
        Registry {
            entries: self.entries.clone(),
        }
    }
}

impl<T> Registry<T> {
    pub fn new() -> Registry<T> {
        Registry::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<T>> {
        self.entries.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Stores `value` under `name` unless the name is already defined.
    ///
    /// Returns the shared instance registered under `name` and whether it was created by
    /// this call.
    pub fn define(&mut self, name: &str, value: T) -> (Arc<T>, bool) {
        if let Some(existing) = self.entries.get(name) {
            return (existing.clone(), false);
        }

        let shared = Arc::new(value);
        self.entries.insert(name.to_owned(), shared.clone());
        (shared, true)
    }

    pub fn get_or_define_with(&mut self, name: &str, create: impl FnOnce() -> T) -> Arc<T> {
        if let Some(existing) = self.entries.get(name) {
            return existing.clone();
        }

        self.define(name, create()).0
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<T>)> {
        self.entries.iter().map(|(name, value)| (name.as_str(), value))
    }
}
