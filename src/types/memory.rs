//! Memory allocator handles
//!
//! Raw channel data lives in memory owned by named allocators outside this
//! crate. Frames only carry a [`MemoryRef`] naming the allocator and block.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::{CoreError, Result};

/// Key of the allocator used when a publisher configures none
pub const DEFAULT_ALLOCATOR_KEY: &str = "";

/// Name under which the default allocator is exposed to publishers
pub const DEFAULT_ALLOCATOR_NAME: &str = "default";

/// A named memory allocator
pub trait MemoryAllocator: Send + Sync + 'static {
    /// Key identifying this allocator across processes
    fn key(&self) -> &str;
}

/// Allocator that only carries a key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedAllocator {
    key: String,
}

impl NamedAllocator {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

impl MemoryAllocator for NamedAllocator {
    fn key(&self) -> &str {
        &self.key
    }
}

/// Reference to a block owned by an allocator
#[derive(Clone)]
pub struct MemoryRef {
    allocator: Arc<dyn MemoryAllocator>,
    address: u64,
    size: usize,
}

impl MemoryRef {
    pub fn new(allocator: Arc<dyn MemoryAllocator>, address: u64, size: usize) -> Self {
        Self { allocator, address, size }
    }

    /// The allocator backing this block
    pub fn allocator(&self) -> &Arc<dyn MemoryAllocator> {
        &self.allocator
    }

    /// Key of the allocator backing this block
    pub fn allocator_key(&self) -> &str {
        self.allocator.key()
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl fmt::Debug for MemoryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryRef")
            .field("allocator", &self.allocator.key())
            .field("address", &format_args!("{:#x}", self.address))
            .field("size", &self.size)
            .finish()
    }
}

impl PartialEq for MemoryRef {
    fn eq(&self, other: &Self) -> bool {
        self.allocator.key() == other.allocator.key()
            && self.address == other.address
            && self.size == other.size
    }
}

/// Registry of allocators by key
#[derive(Clone)]
pub struct AllocatorRegistry {
    allocators: HashMap<String, Arc<dyn MemoryAllocator>>,
}

impl Default for AllocatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AllocatorRegistry {
    /// Create a registry holding only the default allocator
    pub fn new() -> Self {
        let mut allocators: HashMap<String, Arc<dyn MemoryAllocator>> = HashMap::new();
        allocators.insert(
            DEFAULT_ALLOCATOR_KEY.to_string(),
            Arc::new(NamedAllocator::new(DEFAULT_ALLOCATOR_KEY)),
        );
        Self { allocators }
    }

    /// Register an allocator under its own key, replacing any previous one
    pub fn register(&mut self, allocator: Arc<dyn MemoryAllocator>) {
        self.allocators.insert(allocator.key().to_string(), allocator);
    }

    /// Look up an allocator by key
    pub fn get(&self, key: &str) -> Result<Arc<dyn MemoryAllocator>> {
        self.allocators
            .get(key)
            .cloned()
            .ok_or_else(|| CoreError::not_found(format!("not found allocator key={}", key)))
    }
}

impl fmt::Debug for AllocatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&String> = self.allocators.keys().collect();
        keys.sort();
        f.debug_struct("AllocatorRegistry").field("keys", &keys).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Cause;

    #[test]
    fn registry_resolves_registered_and_default_allocators() {
        let mut registry = AllocatorRegistry::new();
        registry.register(Arc::new(NamedAllocator::new("shm")));

        assert_eq!(registry.get("shm").unwrap().key(), "shm");
        assert_eq!(registry.get(DEFAULT_ALLOCATOR_KEY).unwrap().key(), DEFAULT_ALLOCATOR_KEY);
        assert_eq!(registry.get("missing").err().map(|e| e.cause()), Some(Cause::NotFound));
    }

    #[test]
    fn memory_refs_compare_by_allocator_key_and_block() {
        let shm: Arc<dyn MemoryAllocator> = Arc::new(NamedAllocator::new("shm"));
        let a = MemoryRef::new(Arc::clone(&shm), 0x1000, 64);
        let b = MemoryRef::new(Arc::new(NamedAllocator::new("shm")), 0x1000, 64);
        let c = MemoryRef::new(shm, 0x2000, 64);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(format!("{:?}", a).contains("0x1000"));
    }
}
