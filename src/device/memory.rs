use crate::error::DeviceError;

use std::{collections::HashMap, fmt, marker::PhantomData, mem};

/// Raw contents of one device allocation.
#[doc(hidden)]
#[derive(Debug, Clone)]
pub enum Allocation {
    F32(Vec<f32>),
    U32(Vec<u32>),
}

/// Element type of an allocation.
#[doc(hidden)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    F32,
    U32,
}

impl Allocation {
    pub(crate) fn len(&self) -> usize {
        match self {
            Allocation::F32(data) => data.len(),
            Allocation::U32(data) => data.len(),
        }
    }
}

mod private {
    pub trait Sealed {}
    impl Sealed for f32 {}
    impl Sealed for u32 {}
}

/// Element types that can live in device memory.
pub trait DeviceElement: Copy + Default + fmt::Debug + Send + 'static + private::Sealed {
    #[doc(hidden)]
    const KIND: ElementKind;
    #[doc(hidden)]
    fn wrap(data: Vec<Self>) -> Allocation;
    #[doc(hidden)]
    fn view(alloc: &Allocation) -> Option<&[Self]>;
    #[doc(hidden)]
    fn view_mut(alloc: &mut Allocation) -> Option<&mut [Self]>;
}

macro_rules! impl_element {
    ($t:ty, $variant:ident) => {
        impl DeviceElement for $t {
            const KIND: ElementKind = ElementKind::$variant;

            fn wrap(data: Vec<Self>) -> Allocation {
                Allocation::$variant(data)
            }

            fn view(alloc: &Allocation) -> Option<&[Self]> {
                match alloc {
                    Allocation::$variant(data) => Some(data),
                    _ => None,
                }
            }

            fn view_mut(alloc: &mut Allocation) -> Option<&mut [Self]> {
                match alloc {
                    Allocation::$variant(data) => Some(data),
                    _ => None,
                }
            }
        }
    };
}

impl_element!(f32, F32);
impl_element!(u32, U32);

/// Handle to a region of a device allocation. Sub-buffers share the
/// allocation of the buffer they were created from.
pub struct Buffer<T> {
    id: usize,
    offset: usize,
    len: usize,
    phantom: PhantomData<fn() -> T>,
}

impl<T> Clone for Buffer<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Buffer<T> {}

impl<T> PartialEq for Buffer<T> {
    fn eq(&self, other: &Self) -> bool {
        (self.id, self.offset, self.len) == (other.id, other.offset, other.len)
    }
}

impl<T> Eq for Buffer<T> {}

impl<T> fmt::Debug for Buffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.id)
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

impl<T> Buffer<T> {
    pub(super) fn from_raw(id: usize, offset: usize, len: usize) -> Self {
        Self {
            id,
            offset,
            len,
            phantom: PhantomData,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Offset in elements from the start of the allocation.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// A region of this buffer, `offset` is relative to the start of `self`.
    pub fn sub_buffer(&self, offset: usize, len: usize) -> Result<Buffer<T>, DeviceError> {
        if offset + len > self.len {
            return Err(DeviceError::OutOfBounds {
                offset,
                size: len,
                len: self.len,
            });
        }
        Ok(Buffer::from_raw(self.id, self.offset + offset, len))
    }
}

#[derive(Debug)]
enum Slot {
    Live(Allocation),
    /// Temporarily taken out while a command writes to it.
    Busy,
}

/// Pool of device allocations with an optional capacity limit, counted in elements.
#[derive(Debug)]
pub(crate) struct Memory {
    slots: HashMap<usize, Slot>,
    next_id: usize,
    in_use: usize,
    limit: Option<usize>,
}

fn region<'a, T: DeviceElement>(
    alloc: &'a Allocation,
    buffer: &Buffer<T>,
) -> Result<&'a [T], DeviceError> {
    let data = T::view(alloc).ok_or(DeviceError::TypeMismatch(buffer.id))?;
    let len = data.len();
    data.get(buffer.offset..buffer.offset + buffer.len)
        .ok_or(DeviceError::OutOfBounds {
            offset: buffer.offset,
            size: buffer.len,
            len,
        })
}

fn region_mut<'a, T: DeviceElement>(
    alloc: &'a mut Allocation,
    buffer: &Buffer<T>,
) -> Result<&'a mut [T], DeviceError> {
    let data = T::view_mut(alloc).ok_or(DeviceError::TypeMismatch(buffer.id))?;
    let len = data.len();
    data.get_mut(buffer.offset..buffer.offset + buffer.len)
        .ok_or(DeviceError::OutOfBounds {
            offset: buffer.offset,
            size: buffer.len,
            len,
        })
}

impl Memory {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            slots: HashMap::new(),
            next_id: 0,
            in_use: 0,
            limit,
        }
    }

    pub fn in_use(&self) -> usize {
        self.in_use
    }

    pub fn live(&self) -> usize {
        self.slots.len()
    }

    pub fn allocate<T: DeviceElement>(&mut self, len: usize) -> Result<Buffer<T>, DeviceError> {
        if let Some(limit) = self.limit {
            if self.in_use + len > limit {
                return Err(DeviceError::OutOfMemory {
                    requested: len,
                    in_use: self.in_use,
                    limit,
                });
            }
        }
        let id = self.next_id;
        self.next_id += 1;
        self.in_use += len;
        self.slots
            .insert(id, Slot::Live(T::wrap(vec![T::default(); len])));
        Ok(Buffer::from_raw(id, 0, len))
    }

    pub fn release<T: DeviceElement>(&mut self, buffer: Buffer<T>) -> Result<(), DeviceError> {
        let len = match self.slots.get(&buffer.id) {
            Some(Slot::Live(alloc)) => alloc.len(),
            Some(Slot::Busy) => return Err(DeviceError::Aliased(buffer.id)),
            None => return Err(DeviceError::InvalidBuffer(buffer.id)),
        };
        if buffer.offset != 0 || buffer.len != len {
            return Err(DeviceError::ReleaseSubBuffer(buffer.id));
        }
        self.slots.remove(&buffer.id);
        self.in_use -= len;
        Ok(())
    }

    fn take(&mut self, id: usize) -> Result<Allocation, DeviceError> {
        match self.slots.get_mut(&id) {
            Some(slot) => match mem::replace(slot, Slot::Busy) {
                Slot::Live(alloc) => Ok(alloc),
                Slot::Busy => Err(DeviceError::Aliased(id)),
            },
            None => Err(DeviceError::InvalidBuffer(id)),
        }
    }

    fn restore(&mut self, id: usize, alloc: Allocation) {
        self.slots.insert(id, Slot::Live(alloc));
    }

    pub fn view<T: DeviceElement>(&self, buffer: Buffer<T>) -> Result<&[T], DeviceError> {
        match self.slots.get(&buffer.id) {
            Some(Slot::Live(alloc)) => region(alloc, &buffer),
            Some(Slot::Busy) => Err(DeviceError::Aliased(buffer.id)),
            None => Err(DeviceError::InvalidBuffer(buffer.id)),
        }
    }

    /// Run `f` with exclusive access to the region behind `buffer`. Every
    /// other allocation stays readable through the memory passed to `f`.
    pub fn with_mut<T, R, F>(&mut self, buffer: Buffer<T>, f: F) -> Result<R, DeviceError>
    where
        T: DeviceElement,
        F: FnOnce(&Memory, &mut [T]) -> Result<R, DeviceError>,
    {
        let mut alloc = self.take(buffer.id)?;
        let result = match region_mut(&mut alloc, &buffer) {
            Ok(data) => f(self, data),
            Err(e) => Err(e),
        };
        self.restore(buffer.id, alloc);
        result
    }

    /// Same as [with_mut](Self::with_mut) for two regions in different allocations.
    pub fn with_mut2<A, B, R, F>(
        &mut self,
        first: Buffer<A>,
        second: Buffer<B>,
        f: F,
    ) -> Result<R, DeviceError>
    where
        A: DeviceElement,
        B: DeviceElement,
        F: FnOnce(&Memory, &mut [A], &mut [B]) -> Result<R, DeviceError>,
    {
        let mut a = self.take(first.id)?;
        let mut b = match self.take(second.id) {
            Ok(b) => b,
            Err(e) => {
                self.restore(first.id, a);
                return Err(e);
            }
        };
        let result = match (region_mut(&mut a, &first), region_mut(&mut b, &second)) {
            (Ok(x), Ok(y)) => f(self, x, y),
            (Err(e), _) | (_, Err(e)) => Err(e),
        };
        self.restore(first.id, a);
        self.restore(second.id, b);
        result
    }

    /// Copy host data into a region. `data` must hold exactly `buffer.len()` elements.
    pub fn write<T: DeviceElement>(&mut self, buffer: Buffer<T>, data: &[T]) -> Result<(), DeviceError> {
        self.with_mut(buffer, |_, region| {
            region.copy_from_slice(data);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn limit_and_release() {
        let mut memory = Memory::new(Some(10));
        let a = memory.allocate::<f32>(6).unwrap();
        assert_matches!(
            memory.allocate::<u32>(5),
            Err(DeviceError::OutOfMemory {
                requested: 5,
                in_use: 6,
                limit: 10
            })
        );
        let sub = a.sub_buffer(2, 2).unwrap();
        assert_matches!(memory.release(sub), Err(DeviceError::ReleaseSubBuffer(_)));
        memory.release(a).unwrap();
        assert_eq!(memory.in_use(), 0);
        assert_matches!(memory.release(a), Err(DeviceError::InvalidBuffer(_)));
        assert_matches!(memory.view(a), Err(DeviceError::InvalidBuffer(_)));
    }

    #[test]
    fn sub_buffers_share_memory() {
        let mut memory = Memory::new(None);
        let a = memory.allocate::<f32>(4).unwrap();
        memory.write(a.sub_buffer(1, 2).unwrap(), &[5., 6.]).unwrap();
        assert_eq!(memory.view(a).unwrap(), &[0., 5., 6., 0.]);
        assert_matches!(a.sub_buffer(3, 2), Err(DeviceError::OutOfBounds { .. }));
    }

    #[test]
    fn aliasing_and_types() {
        let mut memory = Memory::new(None);
        let a = memory.allocate::<f32>(2).unwrap();
        let b = memory.allocate::<u32>(2).unwrap();
        let result = memory.with_mut(a, |memory, _| memory.view(a).map(|_| ()));
        assert_matches!(result, Err(DeviceError::Aliased(_)));
        assert_matches!(memory.with_mut2(a, a, |_, _, _| Ok(())), Err(DeviceError::Aliased(_)));

        let wrong = Buffer::<f32>::from_raw(b.id(), 0, 2);
        assert_matches!(memory.view(wrong), Err(DeviceError::TypeMismatch(_)));
        // failed commands leave every allocation usable
        assert!(memory.view(a).is_ok());
        assert!(memory.view(b).is_ok());
    }
}
