use crate::{Error, Result};

/// A fixed-capacity arena. Handles are indices and stay valid until the pool is reset.
#[derive(Debug)]
pub struct Pool<T> {
    items: Vec<T>,
    capacity: usize,
}

impl<T> Pool<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn alloc(&mut self, item: T) -> Result<usize> {
        if self.items.len() >= self.capacity {
            return Err(Error::AllocationExhausted);
        }
        self.items.push(item);
        Ok(self.items.len() - 1)
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    /// Free slots left.
    pub fn available(&self) -> usize {
        self.capacity - self.items.len()
    }

    pub fn get(&self, handle: usize) -> Option<&T> {
        self.items.get(handle)
    }

    pub fn get_mut(&mut self, handle: usize) -> Option<&mut T> {
        self.items.get_mut(handle)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn reset(&mut self) {
        self.items.clear();
    }
}

impl<T> std::ops::Index<usize> for Pool<T> {
    type Output = T;

    fn index(&self, handle: usize) -> &T {
        &self.items[handle]
    }
}

impl<T> std::ops::IndexMut<usize> for Pool<T> {
    fn index_mut(&mut self, handle: usize) -> &mut T {
        &mut self.items[handle]
    }
}
