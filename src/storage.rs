use serde::{Deserialize, Serialize};

pub use handle::Handle;
mod handle {
    use super::*;

    /// Slice descriptor for a block of memory stored within the matching Storage
    /// or device allocation. Handles are computed once and stay valid for the
    /// lifetime of the engine that created them.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Handle {
        start: usize,
        end: usize,
    }

    impl Handle {
        pub(super) fn new(start: usize, end: usize) -> Self {
            Self { start, end }
        }

        pub fn start(&self) -> usize {
            self.start
        }

        pub fn end(&self) -> usize {
            self.end
        }

        pub fn len(&self) -> usize {
            self.end - self.start
        }

        pub fn is_empty(&self) -> bool {
            self.start == self.end
        }
    }
}

pub use allocator::Allocator;
mod allocator {
    use super::*;

    /// Lays out consecutive blocks of a flat arena.
    #[derive(Debug, Clone, Default)]
    pub struct Allocator {
        len: usize,
    }

    impl Allocator {
        pub fn new() -> Self {
            Default::default()
        }

        pub fn allocate(&mut self, len: usize) -> Handle {
            let handle = Handle::new(self.len, self.len + len);
            self.len += len;
            handle
        }

        /// Total length of everything allocated so far.
        pub fn len(&self) -> usize {
            self.len
        }

        pub fn is_empty(&self) -> bool {
            self.len == 0
        }

        /// Zeroed storage large enough for every handle handed out.
        pub fn finish(&self) -> Storage {
            Storage::zeroed(self.len)
        }
    }
}

pub use storage::Storage;
mod storage {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub struct Storage {
        storage: Box<[f32]>,
    }

    impl Storage {
        pub fn zeroed(len: usize) -> Self {
            Self {
                storage: vec![0.; len].into_boxed_slice(),
            }
        }

        pub fn get(&self, handle: Handle) -> &[f32] {
            &self.storage[handle.start()..handle.end()]
        }

        pub fn get_mut(&mut self, handle: Handle) -> &mut [f32] {
            &mut self.storage[handle.start()..handle.end()]
        }

        /// Borrow two blocks at once. `lower` has to end before `upper` starts.
        pub fn split_pair(&mut self, lower: Handle, upper: Handle) -> (&mut [f32], &mut [f32]) {
            assert!(
                lower.end() <= upper.start(),
                "Overlapping or unordered handles: {:?} and {:?}",
                lower,
                upper
            );
            let (head, tail) = self.storage.split_at_mut(upper.start());
            (&mut head[lower.start()..lower.end()], &mut tail[..upper.len()])
        }

        /// Get a reference to the raw contents of the storage
        pub fn raw(&self) -> &[f32] {
            &self.storage
        }

        /// Get a mutable reference to the raw contents of the storage
        pub fn raw_mut(&mut self) -> &mut [f32] {
            &mut self.storage
        }
    }
}
