use crate::error::ConfigError;
use serde::{Deserialize, Serialize};

use std::{fmt, ops::Range, sync::Arc};

/// Dimensions of a tensor, outermost first. For batched data the first
/// dimension is the example count and the rest is the per-example shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    pub fn new<T: Into<Vec<usize>>>(dims: T) -> Self {
        Self { dims: dims.into() }
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Number of elements described by the shape.
    pub fn size(&self) -> usize {
        self.dims.iter().product()
    }

    /// Size of the outermost dimension.
    pub fn length(&self) -> usize {
        self.dims.first().copied().unwrap_or(1)
    }

    /// The shape with its outermost dimension removed.
    pub fn slice(&self) -> Shape {
        Shape::new(self.dims.get(1..).unwrap_or(&[]).to_vec())
    }

    /// The shape with `length` prepended as the new outermost dimension.
    pub fn with_length(&self, length: usize) -> Shape {
        let mut dims = Vec::with_capacity(self.dims.len() + 1);
        dims.push(length);
        dims.extend_from_slice(&self.dims);
        Shape::new(dims)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.dims)
    }
}

impl From<usize> for Shape {
    fn from(size: usize) -> Self {
        Shape::new(vec![size])
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Shape::new(dims)
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Shape::new(dims.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Shape::new(dims.to_vec())
    }
}

/// How a tensor holds on to its elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// The tensor exclusively owns its buffer.
    Owned,
    /// A view into memory owned elsewhere, bound to the source's lifetime.
    Borrowed,
    /// A reference counted section of a shared buffer.
    Shared,
}

#[derive(Debug, Clone)]
enum Data<'a, T> {
    Owned(Vec<T>),
    Borrowed(&'a [T]),
    Shared(Arc<[T]>, Range<usize>),
}

/// A dense row-major tensor with an explicit ownership tag.
#[derive(Debug, Clone)]
pub struct Tensor<'a, T = f32> {
    shape: Shape,
    data: Data<'a, T>,
}

fn check_size(shape: &Shape, received: usize) -> Result<(), ConfigError> {
    if shape.size() != received {
        return Err(ConfigError::TensorSize {
            shape: shape.dims().to_vec(),
            expected: shape.size(),
            received,
        });
    }
    Ok(())
}

impl<T> Tensor<'static, T> {
    pub fn new<S: Into<Shape>>(shape: S, data: Vec<T>) -> Result<Self, ConfigError> {
        let shape = shape.into();
        check_size(&shape, data.len())?;
        Ok(Self {
            shape,
            data: Data::Owned(data),
        })
    }

    /// Moves the elements behind a reference count so that sections of the
    /// tensor can outlive any borrow of it.
    pub fn into_shared(self) -> Self
    where
        T: Clone,
    {
        let data = match self.data {
            Data::Owned(vec) => {
                let len = vec.len();
                Data::Shared(Arc::from(vec), 0..len)
            }
            Data::Borrowed(slice) => Data::Shared(Arc::from(slice), 0..slice.len()),
            shared @ Data::Shared(..) => shared,
        };
        Self {
            shape: self.shape,
            data,
        }
    }
}

impl<T: Clone + Default> Tensor<'static, T> {
    pub fn zeroed<S: Into<Shape>>(shape: S) -> Self {
        let shape = shape.into();
        let data = vec![T::default(); shape.size()];
        Self {
            shape,
            data: Data::Owned(data),
        }
    }
}

impl<'a, T> Tensor<'a, T> {
    pub fn borrowed<S: Into<Shape>>(shape: S, data: &'a [T]) -> Result<Self, ConfigError> {
        let shape = shape.into();
        check_size(&shape, data.len())?;
        Ok(Self {
            shape,
            data: Data::Borrowed(data),
        })
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Number of examples, the size of the outermost dimension.
    pub fn length(&self) -> usize {
        self.shape.length()
    }

    pub fn ownership(&self) -> Ownership {
        match self.data {
            Data::Owned(_) => Ownership::Owned,
            Data::Borrowed(_) => Ownership::Borrowed,
            Data::Shared(..) => Ownership::Shared,
        }
    }

    pub fn as_slice(&self) -> &[T] {
        match &self.data {
            Data::Owned(vec) => vec,
            Data::Borrowed(slice) => slice,
            Data::Shared(arc, range) => &arc[range.clone()],
        }
    }

    /// Mutable access is only granted to exclusively owned tensors.
    pub fn as_mut_slice(&mut self) -> Option<&mut [T]> {
        match &mut self.data {
            Data::Owned(vec) => Some(vec),
            _ => None,
        }
    }

    /// Elements of the example at `index`.
    pub fn item(&self, index: usize) -> Option<&[T]> {
        let stride = self.shape.slice().size();
        self.as_slice().get(index * stride..(index + 1) * stride)
    }

    /// A borrowed view of the whole tensor.
    pub fn view(&self) -> Tensor<'_, T> {
        Tensor {
            shape: self.shape.clone(),
            data: Data::Borrowed(self.as_slice()),
        }
    }

    /// Examples `start..end` as a new tensor. Sections of shared tensors stay
    /// shared, everything else is borrowed.
    pub fn section(&self, start: usize, end: usize) -> Result<Tensor<'_, T>, ConfigError> {
        let length = self.length();
        if start > end || end > length || self.shape.rank() == 0 {
            return Err(ConfigError::Section { start, end, length });
        }
        let stride = self.shape.slice().size();
        let mut dims = self.shape.dims().to_vec();
        dims[0] = end - start;
        let data = match &self.data {
            Data::Shared(arc, range) => Data::Shared(
                Arc::clone(arc),
                range.start + start * stride..range.start + end * stride,
            ),
            _ => Data::Borrowed(&self.as_slice()[start * stride..end * stride]),
        };
        Ok(Tensor {
            shape: Shape::new(dims),
            data,
        })
    }

    pub fn reshape<S: Into<Shape>>(self, shape: S) -> Result<Self, ConfigError> {
        let shape = shape.into();
        check_size(&shape, self.shape.size())?;
        Ok(Self {
            shape,
            data: self.data,
        })
    }

    pub fn to_owned(&self) -> Tensor<'static, T>
    where
        T: Clone,
    {
        Tensor {
            shape: self.shape.clone(),
            data: Data::Owned(self.as_slice().to_vec()),
        }
    }

    pub fn into_vec(self) -> Vec<T>
    where
        T: Clone,
    {
        match self.data {
            Data::Owned(vec) => vec,
            Data::Borrowed(slice) => slice.to_vec(),
            Data::Shared(arc, range) => arc[range].to_vec(),
        }
    }
}
