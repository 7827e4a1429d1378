//! OpenCL implementation of the device. The program in `kernels.cl` is built
//! for the first device of the first platform when the context is created.

use super::{
    kernels::Kernel,
    memory::{Allocation, Buffer, ElementKind},
};
use crate::error::DeviceError;

use ocl::{core as cl, Device, OclPrm, Platform, Program, Queue};
use tracing::debug;

use std::{collections::HashMap, convert::TryFrom};

pub(crate) const SOURCE: &str = include_str!("kernels.cl");

fn unavailable<E: ToString>(e: E) -> DeviceError {
    DeviceError::Unavailable(e.to_string())
}

fn runtime(e: ocl::Error) -> DeviceError {
    DeviceError::Runtime(e.to_string())
}

#[derive(Debug)]
enum ClBuffer {
    F32(ocl::Buffer<f32>),
    U32(ocl::Buffer<u32>),
}

#[derive(Debug)]
struct Slot {
    /// Requested length. OpenCL buffers can't be empty, so the buffer itself may be longer.
    len: usize,
    buffer: ClBuffer,
}

#[derive(Debug)]
enum Arg<'a> {
    F32(&'a ocl::Buffer<f32>),
    U32(&'a ocl::Buffer<u32>),
    Uint(u32),
    Float(f32),
}

/// Collects the arguments of one launch in the order `kernels.cl` declares them.
struct Args<'a> {
    device: &'a ClDevice,
    kernel: &'static str,
    args: Vec<Arg<'a>>,
}

impl<'a> Args<'a> {
    fn region<T>(&self, buffer: &Buffer<T>) -> Result<&'a Slot, DeviceError> {
        let slot = self.device.slot(buffer.id())?;
        if buffer.offset() + buffer.len() > slot.len {
            return Err(DeviceError::OutOfBounds {
                offset: buffer.offset(),
                size: buffer.len(),
                len: slot.len,
            });
        }
        Ok(slot)
    }

    fn f32(mut self, buffer: Buffer<f32>) -> Result<Self, DeviceError> {
        match &self.region(&buffer)?.buffer {
            ClBuffer::F32(data) => self.args.push(Arg::F32(data)),
            ClBuffer::U32(_) => return Err(DeviceError::TypeMismatch(buffer.id())),
        }
        self.uint(buffer.offset())
    }

    fn u32(mut self, buffer: Buffer<u32>) -> Result<Self, DeviceError> {
        match &self.region(&buffer)?.buffer {
            ClBuffer::U32(data) => self.args.push(Arg::U32(data)),
            ClBuffer::F32(_) => return Err(DeviceError::TypeMismatch(buffer.id())),
        }
        self.uint(buffer.offset())
    }

    fn uint(mut self, value: usize) -> Result<Self, DeviceError> {
        let value = u32::try_from(value).map_err(|_| DeviceError::InvalidArguments {
            kernel: self.kernel,
            reason: format!("{} does not fit a 32 bit index", value),
        })?;
        self.args.push(Arg::Uint(value));
        Ok(self)
    }

    fn float(mut self, value: f32) -> Self {
        self.args.push(Arg::Float(value));
        self
    }

    /// Enqueue the kernel over `work` items. Empty dispatches are skipped.
    fn enqueue(self, work: usize) -> Result<(), DeviceError> {
        if work == 0 {
            return Ok(());
        }
        let mut builder = ocl::Kernel::builder();
        builder
            .program(&self.device.program)
            .name(self.kernel)
            .queue(self.device.queue.clone())
            .global_work_size(work);
        for arg in &self.args {
            match *arg {
                Arg::F32(buffer) => builder.arg(buffer),
                Arg::U32(buffer) => builder.arg(buffer),
                Arg::Uint(value) => builder.arg(value),
                Arg::Float(value) => builder.arg(value),
            };
        }
        let kernel = builder.build().map_err(runtime)?;
        unsafe { kernel.enq() }.map_err(runtime)
    }
}

fn write_region<T: OclPrm>(
    buffer: &ocl::Buffer<T>,
    offset: usize,
    data: &[T],
    len: usize,
) -> Result<(), DeviceError> {
    if offset + data.len() > len {
        return Err(DeviceError::OutOfBounds {
            offset,
            size: data.len(),
            len,
        });
    }
    if data.is_empty() {
        return Ok(());
    }
    buffer.write(data).offset(offset).enq().map_err(runtime)
}

fn read_region<T: OclPrm>(
    buffer: &ocl::Buffer<T>,
    offset: usize,
    size: usize,
    len: usize,
) -> Result<Vec<T>, DeviceError> {
    if offset + size > len {
        return Err(DeviceError::OutOfBounds { offset, size, len });
    }
    let mut data = vec![T::default(); size];
    if size > 0 {
        buffer.read(&mut data).offset(offset).enq().map_err(runtime)?;
    }
    Ok(data)
}

#[derive(Debug)]
pub(crate) struct ClDevice {
    queue: Queue,
    program: Program,
    slots: HashMap<usize, Slot>,
    next_id: usize,
    in_use: usize,
    limit: Option<usize>,
}

impl ClDevice {
    pub fn new(limit: Option<usize>) -> Result<Self, DeviceError> {
        Self::with_source(limit, SOURCE)
    }

    /// Fails with [DeviceError::Unavailable] without a usable device and with
    /// [DeviceError::Build] if the program does not compile.
    pub fn with_source(limit: Option<usize>, source: &str) -> Result<Self, DeviceError> {
        let platform = cl::get_platform_ids()
            .map_err(unavailable)?
            .into_iter()
            .next()
            .map(Platform::new)
            .ok_or_else(|| unavailable("no OpenCL platform found"))?;
        let device = Device::first(platform).map_err(unavailable)?;
        let context = ocl::Context::builder()
            .platform(platform)
            .devices(device)
            .build()
            .map_err(unavailable)?;
        let queue = Queue::new(&context, device, None).map_err(unavailable)?;
        let program = Program::builder()
            .src(source)
            .devices(device)
            .build(&context)
            .map_err(|e| DeviceError::Build(e.to_string()))?;

        debug!(
            device = %device.name().unwrap_or_default(),
            "built OpenCL program"
        );
        Ok(Self {
            queue,
            program,
            slots: HashMap::new(),
            next_id: 0,
            in_use: 0,
            limit,
        })
    }

    pub fn in_use(&self) -> usize {
        self.in_use
    }

    pub fn live(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, id: usize) -> Result<&Slot, DeviceError> {
        self.slots.get(&id).ok_or(DeviceError::InvalidBuffer(id))
    }

    pub fn allocate<T>(&mut self, kind: ElementKind, len: usize) -> Result<Buffer<T>, DeviceError> {
        if let Some(limit) = self.limit {
            if self.in_use + len > limit {
                return Err(DeviceError::OutOfMemory {
                    requested: len,
                    in_use: self.in_use,
                    limit,
                });
            }
        }
        let buffer = match kind {
            ElementKind::F32 => ClBuffer::F32(
                ocl::Buffer::<f32>::builder()
                    .queue(self.queue.clone())
                    .len(len.max(1))
                    .fill_val(0.)
                    .build()
                    .map_err(runtime)?,
            ),
            ElementKind::U32 => ClBuffer::U32(
                ocl::Buffer::<u32>::builder()
                    .queue(self.queue.clone())
                    .len(len.max(1))
                    .fill_val(0)
                    .build()
                    .map_err(runtime)?,
            ),
        };
        let id = self.next_id;
        self.next_id += 1;
        self.in_use += len;
        self.slots.insert(id, Slot { len, buffer });
        Ok(Buffer::from_raw(id, 0, len))
    }

    pub fn release<T>(&mut self, buffer: Buffer<T>) -> Result<(), DeviceError> {
        let len = self.slot(buffer.id())?.len;
        if buffer.offset() != 0 || buffer.len() != len {
            return Err(DeviceError::ReleaseSubBuffer(buffer.id()));
        }
        self.slots.remove(&buffer.id());
        self.in_use -= len;
        Ok(())
    }

    pub fn write(&self, id: usize, offset: usize, data: &Allocation) -> Result<(), DeviceError> {
        let slot = self.slot(id)?;
        match (&slot.buffer, data) {
            (ClBuffer::F32(buffer), Allocation::F32(data)) => write_region(buffer, offset, data, slot.len),
            (ClBuffer::U32(buffer), Allocation::U32(data)) => write_region(buffer, offset, data, slot.len),
            _ => Err(DeviceError::TypeMismatch(id)),
        }
    }

    /// Blocking copy of a region to the host.
    pub fn read<T>(&self, buffer: Buffer<T>) -> Result<Allocation, DeviceError> {
        let slot = self.slot(buffer.id())?;
        let (offset, size) = (buffer.offset(), buffer.len());
        Ok(match &slot.buffer {
            ClBuffer::F32(data) => Allocation::F32(read_region(data, offset, size, slot.len)?),
            ClBuffer::U32(data) => Allocation::U32(read_region(data, offset, size, slot.len)?),
        })
    }

    pub fn flush(&self) -> Result<(), DeviceError> {
        self.queue.flush().map_err(runtime)
    }

    pub fn finish(&self) -> Result<(), DeviceError> {
        self.queue.finish().map_err(runtime)
    }

    fn args(&self, kernel: &Kernel) -> Args<'_> {
        Args {
            device: self,
            kernel: kernel.name(),
            args: Vec::new(),
        }
    }

    /// Enqueue `kernel` without waiting for it.
    pub fn launch(&self, kernel: &Kernel) -> Result<(), DeviceError> {
        kernel.validate()?;
        let args = self.args(kernel);
        match *kernel {
            Kernel::Fill { buffer, value } => args.f32(buffer)?.float(value).enqueue(buffer.len()),
            Kernel::DenseForward { input, params, output, in_size, out_size, count } => args
                .f32(input)?
                .f32(params)?
                .f32(output)?
                .uint(in_size)?
                .uint(out_size)?
                .enqueue(count * out_size),
            Kernel::DenseBackPropagate { output_error, params, input_error, in_size, out_size, count } => args
                .f32(output_error)?
                .f32(params)?
                .f32(input_error)?
                .uint(in_size)?
                .uint(out_size)?
                .enqueue(count * in_size),
            Kernel::DenseDerivatives { input, output_error, derivatives, in_size, out_size, count } => args
                .f32(input)?
                .f32(output_error)?
                .f32(derivatives)?
                .uint(in_size)?
                .uint(out_size)?
                .uint(count)?
                .enqueue((in_size + 1) * out_size),
            Kernel::SigmoidForward { input, output } => {
                args.f32(input)?.f32(output)?.enqueue(input.len())
            }
            Kernel::SigmoidBackPropagate { input, output_error, input_error } => args
                .f32(input)?
                .f32(output_error)?
                .f32(input_error)?
                .enqueue(input.len()),
            Kernel::MseDerivatives { output, target, output_error } => args
                .f32(output)?
                .f32(target)?
                .f32(output_error)?
                .enqueue(output.len()),
            Kernel::MseTotalError { output, target, errors, size, count } => args
                .f32(output)?
                .f32(target)?
                .f32(errors)?
                .uint(size)?
                .enqueue(count),
            Kernel::LabelError { output, labels, output_error, size, count } => args
                .f32(output)?
                .u32(labels)?
                .f32(output_error)?
                .uint(size)?
                .enqueue(size * count),
            Kernel::Classify { output, classes, size, count } => args
                .f32(output)?
                .u32(classes)?
                .uint(size)?
                .enqueue(count),
            Kernel::GradientStep { params, derivatives, scale } => args
                .f32(params)?
                .f32(derivatives)?
                .float(scale)
                .enqueue(params.len()),
            Kernel::AdamUpdate { params, derivatives, state, scale, beta1, beta2, epsilon } => args
                .f32(params)?
                .f32(derivatives)?
                .f32(state)?
                .uint(params.len())?
                .float(scale)
                .float(beta1)
                .float(beta2)
                .float(epsilon)
                .enqueue(params.len()),
            Kernel::AdamUpdateBetas { powers, beta1, beta2 } => {
                args.f32(powers)?.float(beta1).float(beta2).enqueue(1)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    // Hosts without an OpenCL runtime report Unavailable, which is what
    // drives the host fallback. With a runtime these check real builds.

    #[test]
    fn program_builds_or_device_is_unavailable() {
        match ClDevice::new(None) {
            Ok(device) => assert_eq!(device.live(), 0),
            Err(e) => assert_matches!(e, DeviceError::Unavailable(_)),
        }
    }

    #[test]
    fn broken_program_is_a_build_error() {
        match ClDevice::with_source(None, "__kernel void broken(") {
            Err(DeviceError::Unavailable(_)) => {}
            other => assert_matches!(other, Err(DeviceError::Build(_))),
        }
    }

    #[test]
    fn kernels_run_on_the_device() {
        let mut device = match ClDevice::new(None) {
            Ok(device) => device,
            Err(_) => return,
        };
        let input = device.allocate::<f32>(ElementKind::F32, 2).unwrap();
        let params = device.allocate::<f32>(ElementKind::F32, 6).unwrap();
        let output = device.allocate::<f32>(ElementKind::F32, 4).unwrap();
        device.write(input.id(), 0, &Allocation::F32(vec![-1., 1.])).unwrap();
        device
            .write(params.id(), 0, &Allocation::F32(vec![2., -1., 1., 3., -2., 4.]))
            .unwrap();

        let output = output.sub_buffer(2, 2).unwrap();
        device
            .launch(&Kernel::DenseForward { input, params, output, in_size: 2, out_size: 2, count: 1 })
            .unwrap();
        device.finish().unwrap();
        assert_matches!(device.read(output).unwrap(), Allocation::F32(data) if data == vec![4., 5.]);
    }
}
