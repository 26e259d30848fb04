use std::collections::HashMap;

use super::CollectorDescriptor;
use crate::{Error, Result};

/// Registered collectors, iterated in registration order.
#[derive(Debug, Default)]
pub struct CollectorRegistry {
    descriptors: Vec<CollectorDescriptor>,
    by_name: HashMap<String, usize>,
}

impl CollectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: CollectorDescriptor) -> Result<()> {
        if descriptor.name.trim().is_empty() {
            return Err(Error::validation("collector name must not be empty"));
        }
        if self.by_name.contains_key(&descriptor.name) {
            return Err(Error::validation(format!(
                "collector {} is already registered",
                descriptor.name
            )));
        }
        self.by_name
            .insert(descriptor.name.clone(), self.descriptors.len());
        self.descriptors.push(descriptor);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&CollectorDescriptor> {
        self.by_name
            .get(name)
            .map(|&idx| &self.descriptors[idx])
            .ok_or_else(|| Error::not_found("Collector", name))
    }

    pub fn iter(&self) -> impl Iterator<Item = &CollectorDescriptor> {
        self.descriptors.iter()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}
