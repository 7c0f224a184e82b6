//! Fallible allocation
//!
//! Allocators return `None` and log when memory runs out. They never
//! abort the process.

/// Allocate `size` zeroed bytes
///
/// May sleep, so it's for process context only. See [`alloc_atomic`] for
/// an allocation that's usable from atomic context.
pub fn alloc(size: usize) -> Option<Box<[u8]>> {
    super::might_sleep();
    allocate(size)
}

/// Allocate `size` bytes without sleeping
///
/// Usable from atomic context. The returned memory is zeroed.
pub fn alloc_atomic(size: usize) -> Option<Box<[u8]>> {
    allocate(size)
}

fn allocate(size: usize) -> Option<Box<[u8]>> {
    let mut bytes = Vec::new();
    if bytes.try_reserve_exact(size).is_err() {
        error!("Cannot allocate memory: {} bytes", size);
        return None;
    }
    bytes.resize(size, 0);
    Some(bytes.into_boxed_slice())
}

/// Move `value` into a fresh heap allocation
///
/// Returns `None`, and logs, if there's no memory for `T`.
pub fn try_box<T>(value: T) -> Option<Box<T>> {
    let mut slot: Vec<T> = Vec::new();
    if slot.try_reserve_exact(1).is_err() {
        error!(
            "Cannot allocate memory for {}",
            core::any::type_name::<T>()
        );
        return None;
    }
    slot.push(value);
    // Length and capacity are both one, so this doesn't reallocate
    let boxed: Box<[T]> = slot.into_boxed_slice();
    let raw = Box::into_raw(boxed) as *mut T;
    // Safety: the slice holds exactly one initialized T, and a one-element
    // slice has the same layout as T.
    Some(unsafe { Box::from_raw(raw) })
}

#[cfg(test)]
mod tests {
    use super::{alloc, alloc_atomic, try_box};

    #[test]
    fn zeroed() {
        let bytes = alloc(64).unwrap();
        assert_eq!(bytes.len(), 64);
        assert!(bytes.iter().all(|&b| b == 0));
        let bytes = alloc_atomic(3).unwrap();
        assert_eq!(&*bytes, &[0, 0, 0]);
    }

    #[test]
    fn empty() {
        assert_eq!(alloc(0).unwrap().len(), 0);
    }

    #[test]
    fn exhaustion_is_none() {
        assert!(alloc_atomic(usize::MAX).is_none());
    }

    #[test]
    fn boxed() {
        let value = try_box([7u32; 4]).unwrap();
        assert_eq!(*value, [7; 4]);
    }
}
