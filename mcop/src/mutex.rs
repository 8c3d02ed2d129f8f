use std::cell::UnsafeCell;

/// Interior mutability for data whose exclusive access is guaranteed by a
/// protocol outside the type, such as a chunk slot owned by whoever holds the
/// matching semaphore permit. `lock` does not synchronize anything.
#[derive(Debug)]
pub struct UnsafeMutex<T> {
    data: UnsafeCell<T>,
}

impl<T> UnsafeMutex<T> {
    pub fn new(data: T) -> Self {
        UnsafeMutex {
            data: UnsafeCell::new(data),
        }
    }

    #[allow(clippy::mut_from_ref)]
    pub fn lock(&self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }

    /// Shared view, for the side that owns the data under the protocol.
    pub fn get(&self) -> &T {
        unsafe { &*self.data.get() }
    }
}

unsafe impl<T: Send> Send for UnsafeMutex<T> {}
unsafe impl<T: Send> Sync for UnsafeMutex<T> {}
