use parking_lot::Mutex;
use std::sync::Arc;

/// A simple object pool for reusing buffers and reducing allocations.
pub struct Pool<T> {
    items: Arc<Mutex<Vec<T>>>,
    factory: Arc<dyn Fn() -> T + Send + Sync>,
    reset: Arc<dyn Fn(&mut T) + Send + Sync>,
    max_size: usize,
}

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            items: Arc::clone(&self.items),
            factory: Arc::clone(&self.factory),
            reset: Arc::clone(&self.reset),
            max_size: self.max_size,
        }
    }
}

impl<T> Pool<T> {
    /// Create a new pool with the given factory function and max size.
    pub fn new<F, R>(factory: F, reset: R, max_size: usize) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
        R: Fn(&mut T) + Send + Sync + 'static,
    {
        Self {
            items: Arc::new(Mutex::new(Vec::with_capacity(max_size))),
            factory: Arc::new(factory),
            reset: Arc::new(reset),
            max_size,
        }
    }

    /// Get an item from the pool or create a new one.
    pub fn get(&self) -> PooledItem<T> {
        let item = {
            let mut items = self.items.lock();
            items.pop()
        };

        let item = item.unwrap_or_else(|| (self.factory)());

        PooledItem {
            item: Some(item),
            pool: self.clone(),
        }
    }

    /// Return an item to the pool.
    fn put(&self, mut item: T) {
        (self.reset)(&mut item);

        let mut items = self.items.lock();
        if items.len() < self.max_size {
            items.push(item);
        }
    }
}

/// A pooled item that returns itself to the pool when dropped.
pub struct PooledItem<T> {
    item: Option<T>,
    pool: Pool<T>,
}

impl<T> std::ops::Deref for PooledItem<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.item.as_ref().unwrap()
    }
}

impl<T> std::ops::DerefMut for PooledItem<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.item.as_mut().unwrap()
    }
}

impl<T> Drop for PooledItem<T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.pool.put(item);
        }
    }
}

/// Buffer pool for session I/O buffers. Each session checks out two buffers
/// (client-side and remote-side) of the configured capacity instead of
/// allocating fresh ones per connection, and returns them, cleared, on drop.
pub struct BufferPool {
    pool: Pool<Vec<u8>>,
}

impl BufferPool {
    pub fn new(buffer_capacity: usize, max_buffers: usize) -> Self {
        let pool = Pool::new(
            move || Vec::with_capacity(buffer_capacity),
            |buf| buf.clear(),
            max_buffers,
        );

        Self { pool }
    }

    pub fn get(&self) -> PooledItem<Vec<u8>> {
        self.pool.get()
    }
}

impl Clone for BufferPool {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_returned_buffers() {
        let pool = BufferPool::new(1024, 10);

        let mut buf1 = pool.get();
        buf1.extend_from_slice(b"test");
        assert_eq!(&buf1[..4], b"test");
        let capacity = buf1.capacity();
        drop(buf1);

        let buf2 = pool.get();
        assert_eq!(buf2.len(), 0);
        assert_eq!(buf2.capacity(), capacity);
    }
}
