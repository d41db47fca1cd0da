//! User-declared resource bindings supplied to the next run.

use crate::model::{FileBlob, InputBinding};
use bytes::Bytes;
use std::collections::BTreeMap;

/// Partial update applied by [`InputRegistry::replace_at`].
#[derive(Debug, Clone, Default)]
pub struct BindingUpdate {
    pub resource: Option<String>,
    /// `Some(None)` detaches the file, `None` leaves it as is.
    pub file: Option<Option<FileBlob>>,
}

#[derive(Debug, Clone, Default)]
pub struct InputRegistry {
    bindings: Vec<InputBinding>,
}

impl InputRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bindings(&self) -> &[InputBinding] {
        &self.bindings
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn add(&mut self, binding: InputBinding) -> &[InputBinding] {
        self.bindings.push(binding);
        &self.bindings
    }

    /// Panics if `index` is out of range; callers only pass indices of listed rows.
    pub fn replace_at(&mut self, index: usize, update: BindingUpdate) -> &[InputBinding] {
        let len = self.bindings.len();
        let Some(binding) = self.bindings.get_mut(index) else {
            panic!("binding index {index} out of range (len {len})");
        };
        if let Some(resource) = update.resource {
            binding.resource = resource;
        }
        if let Some(file) = update.file {
            binding.file = file;
        }
        &self.bindings
    }

    pub fn remove_at(&mut self, index: usize) -> &[InputBinding] {
        if index < self.bindings.len() {
            self.bindings.remove(index);
        }
        &self.bindings
    }

    /// Owned copy of the current bindings, taken when a run starts.
    pub fn snapshot(&self) -> Vec<InputBinding> {
        self.bindings.clone()
    }
}

/// Resource map for `start`: bindings without a file are dropped and later
/// duplicates shadow earlier ones.
pub fn resources_for_start(bindings: &[InputBinding]) -> BTreeMap<String, Bytes> {
    let mut out = BTreeMap::new();
    for binding in bindings {
        match &binding.file {
            Some(file) => {
                out.insert(binding.resource.clone(), file.data.clone());
            }
            None => {
                tracing::debug!(resource = %binding.resource, "skipping binding without a file");
            }
        }
    }
    out
}
