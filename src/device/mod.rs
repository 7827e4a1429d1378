//! Accelerator runtime. A [Context] owns the device memory and one in-order
//! command queue. Enqueued commands are only recorded. [Context::flush] submits
//! them without waiting, and a sync point ([Context::finish] or a blocking
//! [Context::read_buffer]) waits for them and reports the first failure.
//!
//! Two devices sit behind the same API: an OpenCL device, available with the
//! `opencl` feature, and a software device that runs the same kernels on the
//! calling thread.

pub mod kernels;
mod memory;
#[cfg(feature = "opencl")]
mod opencl;

pub use kernels::Kernel;
pub use memory::{Buffer, DeviceElement};

use self::memory::{Allocation, Memory};
use crate::error::DeviceError;

use serde::{Deserialize, Serialize};
use tracing::trace;

use std::collections::{HashMap, VecDeque};

/// Number of examples one kernel dispatch processes at most.
pub const DEFAULT_SUB_BATCH_CAPACITY: usize = 128;

/// Which device a [Context] runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeviceKind {
    /// Runs every kernel on the calling thread.
    #[cfg_attr(not(feature = "opencl"), default)]
    Software,
    /// First device of the first OpenCL platform.
    #[cfg_attr(feature = "opencl", default)]
    OpenCl,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceOptions {
    pub device: DeviceKind,
    pub sub_batch_capacity: usize,
    /// Total device memory in elements, unlimited if None.
    pub memory_limit: Option<usize>,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            device: DeviceKind::default(),
            sub_batch_capacity: DEFAULT_SUB_BATCH_CAPACITY,
            memory_limit: None,
        }
    }
}

impl DeviceOptions {
    /// Default options on the software device.
    pub fn software() -> Self {
        Self {
            device: DeviceKind::Software,
            ..Default::default()
        }
    }
}

#[derive(Debug)]
enum Command {
    Write { id: usize, offset: usize, data: Allocation },
    Kernel(Kernel),
}

#[derive(Debug)]
enum Device {
    Software(Memory),
    #[cfg(feature = "opencl")]
    OpenCl(opencl::ClDevice),
}

#[cfg(feature = "opencl")]
fn open_cl(options: &DeviceOptions) -> Result<Device, DeviceError> {
    Ok(Device::OpenCl(opencl::ClDevice::new(options.memory_limit)?))
}

#[cfg(not(feature = "opencl"))]
fn open_cl(_: &DeviceOptions) -> Result<Device, DeviceError> {
    Err(DeviceError::Unavailable(
        "built without the `opencl` feature".to_owned(),
    ))
}

#[derive(Debug)]
pub struct Context {
    options: DeviceOptions,
    device: Device,
    queue: VecDeque<Command>,
    /// First failure since the last sync point.
    failed: Option<DeviceError>,
    launches: HashMap<&'static str, usize>,
}

impl Context {
    pub fn new(options: DeviceOptions) -> Result<Self, DeviceError> {
        if options.sub_batch_capacity == 0 {
            return Err(DeviceError::InvalidOptions(
                "sub-batch capacity must be at least 1".to_owned(),
            ));
        }
        let device = match options.device {
            DeviceKind::Software => Device::Software(Memory::new(options.memory_limit)),
            DeviceKind::OpenCl => open_cl(&options)?,
        };
        Ok(Self {
            options,
            device,
            queue: VecDeque::new(),
            failed: None,
            launches: HashMap::new(),
        })
    }

    pub fn options(&self) -> &DeviceOptions {
        &self.options
    }

    pub fn kind(&self) -> DeviceKind {
        self.options.device
    }

    pub fn sub_batch_capacity(&self) -> usize {
        self.options.sub_batch_capacity
    }

    /// Allocate zero-filled device memory.
    pub fn create_buffer<T: DeviceElement>(&mut self, len: usize) -> Result<Buffer<T>, DeviceError> {
        match &mut self.device {
            Device::Software(memory) => memory.allocate(len),
            #[cfg(feature = "opencl")]
            Device::OpenCl(device) => device.allocate(T::KIND, len),
        }
    }

    pub fn release_buffer<T: DeviceElement>(&mut self, buffer: Buffer<T>) -> Result<(), DeviceError> {
        match &mut self.device {
            Device::Software(memory) => memory.release(buffer),
            #[cfg(feature = "opencl")]
            Device::OpenCl(device) => device.release(buffer),
        }
    }

    /// Record a copy of `data` into `buffer`. The host slice may be reused as
    /// soon as this returns.
    pub fn enqueue_write<T: DeviceElement>(&mut self, buffer: Buffer<T>, data: &[T]) -> Result<(), DeviceError> {
        if data.len() != buffer.len() {
            return Err(DeviceError::InvalidArguments {
                kernel: "write",
                reason: format!("{} elements written to a buffer of {}", data.len(), buffer.len()),
            });
        }
        self.queue.push_back(Command::Write {
            id: buffer.id(),
            offset: buffer.offset(),
            data: T::wrap(data.to_vec()),
        });
        Ok(())
    }

    pub fn enqueue_fill(&mut self, buffer: Buffer<f32>, value: f32) {
        self.enqueue_kernel(Kernel::Fill { buffer, value });
    }

    pub fn enqueue_kernel(&mut self, kernel: Kernel) {
        self.queue.push_back(Command::Kernel(kernel));
    }

    /// Number of recorded commands not yet submitted.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Hand every recorded command to the device. A failure discards the rest
    /// of the queue and is kept until the next sync point.
    fn submit(&mut self) {
        if self.failed.is_some() {
            self.abort_queue();
            return;
        }
        while let Some(command) = self.queue.pop_front() {
            if let Err(e) = self.execute(command) {
                trace!(error = %e, "command failed");
                self.failed = Some(e);
                self.abort_queue();
                return;
            }
        }
    }

    /// Submit everything recorded so far without waiting for it.
    pub fn flush(&mut self) {
        trace!(pending = self.queue.len(), "flushing command queue");
        self.submit();
        self.sync_device(false);
    }

    /// Block until every enqueued command has executed. Reports the first
    /// failure since the previous sync point.
    pub fn finish(&mut self) -> Result<(), DeviceError> {
        trace!(pending = self.queue.len(), "finishing command queue");
        self.submit();
        self.sync_device(true);
        match self.failed.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Flush, or with `wait` finish, the OpenCL queue. Submitting already
    /// executed everything on the software device.
    #[cfg(feature = "opencl")]
    fn sync_device(&mut self, wait: bool) {
        if let Device::OpenCl(device) = &self.device {
            let result = if wait { device.finish() } else { device.flush() };
            if let Err(e) = result {
                self.failed.get_or_insert(e);
            }
        }
    }

    #[cfg(not(feature = "opencl"))]
    fn sync_device(&mut self, _wait: bool) {}

    fn abort_queue(&mut self) {
        if !self.queue.is_empty() {
            trace!(dropped = self.queue.len(), "discarding queued commands");
        }
        self.queue.clear();
    }

    /// Drop every command that has not been submitted, along with any failure
    /// waiting for a sync point.
    pub fn abort(&mut self) {
        self.abort_queue();
        self.failed = None;
    }

    fn execute(&mut self, command: Command) -> Result<(), DeviceError> {
        match (&mut self.device, command) {
            (Device::Software(memory), Command::Write { id, offset, data }) => match data {
                Allocation::F32(data) => memory.write(Buffer::<f32>::from_raw(id, offset, data.len()), &data),
                Allocation::U32(data) => memory.write(Buffer::<u32>::from_raw(id, offset, data.len()), &data),
            },
            (Device::Software(memory), Command::Kernel(kernel)) => {
                trace!(kernel = kernel.name(), "executing kernel");
                kernel.execute(memory)?;
                *self.launches.entry(kernel.name()).or_insert(0) += 1;
                Ok(())
            }
            #[cfg(feature = "opencl")]
            (Device::OpenCl(device), Command::Write { id, offset, data }) => device.write(id, offset, &data),
            #[cfg(feature = "opencl")]
            (Device::OpenCl(device), Command::Kernel(kernel)) => {
                trace!(kernel = kernel.name(), "enqueueing kernel");
                device.launch(&kernel)?;
                *self.launches.entry(kernel.name()).or_insert(0) += 1;
                Ok(())
            }
        }
    }

    /// Blocking read: waits for the queue, then copies the region to the host.
    pub fn read_buffer<T: DeviceElement>(&mut self, buffer: Buffer<T>) -> Result<Vec<T>, DeviceError> {
        self.finish()?;
        match &self.device {
            Device::Software(memory) => Ok(memory.view(buffer)?.to_vec()),
            #[cfg(feature = "opencl")]
            Device::OpenCl(device) => {
                let data = device.read(buffer)?;
                T::view(&data)
                    .map(<[T]>::to_vec)
                    .ok_or(DeviceError::TypeMismatch(buffer.id()))
            }
        }
    }

    /// How many times a kernel has been handed to the device on this context.
    pub fn launches(&self, kernel: &str) -> usize {
        self.launches.get(kernel).copied().unwrap_or(0)
    }

    pub fn live_buffers(&self) -> usize {
        match &self.device {
            Device::Software(memory) => memory.live(),
            #[cfg(feature = "opencl")]
            Device::OpenCl(device) => device.live(),
        }
    }

    /// Device memory in use, in elements.
    pub fn memory_in_use(&self) -> usize {
        match &self.device {
            Device::Software(memory) => memory.in_use(),
            #[cfg(feature = "opencl")]
            Device::OpenCl(device) => device.in_use(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn context() -> Context {
        Context::new(DeviceOptions::software()).unwrap()
    }

    #[test]
    fn commands_wait_for_submission() {
        let mut context = context();
        let buffer = context.create_buffer::<f32>(3).unwrap();
        context.enqueue_write(buffer, &[1., 2., 3.]).unwrap();
        context.enqueue_fill(buffer.sub_buffer(2, 1).unwrap(), 9.);
        assert_eq!(context.pending(), 2);
        assert_eq!(context.launches("fill"), 0);

        context.flush();
        assert_eq!(context.pending(), 0);
        assert_eq!(context.launches("fill"), 1);
        assert_eq!(context.read_buffer(buffer).unwrap(), vec![1., 2., 9.]);
    }

    #[test]
    fn flushed_commands_do_not_accumulate() {
        let mut context = context();
        let buffer = context.create_buffer::<f32>(4).unwrap();
        for i in 0..100_000 {
            context.enqueue_fill(buffer, i as f32);
            context.flush();
            assert_eq!(context.pending(), 0);
        }
        assert_eq!(context.read_buffer(buffer).unwrap(), vec![99_999.; 4]);
        assert_eq!(context.launches("fill"), 100_000);
    }

    fn aliased_label_error(context: &mut Context, buffer: Buffer<f32>) {
        let labels = context.create_buffer::<u32>(1).unwrap();
        context.enqueue_write(labels, &[1]).unwrap();
        context.enqueue_kernel(Kernel::LabelError {
            output: buffer,
            labels,
            output_error: buffer,
            size: 2,
            count: 1,
        });
    }

    #[test]
    fn failed_finish_discards_queue() {
        let mut context = context();
        let buffer = context.create_buffer::<f32>(2).unwrap();
        aliased_label_error(&mut context, buffer);
        context.enqueue_fill(buffer, 1.);
        assert_matches!(context.finish(), Err(DeviceError::Aliased(_)));
        assert_eq!(context.pending(), 0);
        assert_eq!(context.read_buffer(buffer).unwrap(), vec![0., 0.]);
    }

    #[test]
    fn flush_failure_is_reported_at_sync_point() {
        let mut context = context();
        let buffer = context.create_buffer::<f32>(2).unwrap();
        aliased_label_error(&mut context, buffer);
        context.flush();

        // commands recorded after the failure are dropped
        context.enqueue_fill(buffer, 1.);
        context.flush();
        assert_eq!(context.pending(), 0);
        assert_eq!(context.launches("fill"), 0);

        assert_matches!(context.finish(), Err(DeviceError::Aliased(_)));
        // reported once
        context.finish().unwrap();
        context.enqueue_fill(buffer, 1.);
        assert_eq!(context.read_buffer(buffer).unwrap(), vec![1., 1.]);
    }

    #[test]
    fn abort_clears_held_failure() {
        let mut context = context();
        let buffer = context.create_buffer::<f32>(2).unwrap();
        aliased_label_error(&mut context, buffer);
        context.flush();
        context.abort();
        context.finish().unwrap();
    }

    #[test]
    fn invalid_options() {
        let options = DeviceOptions {
            sub_batch_capacity: 0,
            ..DeviceOptions::software()
        };
        assert_matches!(Context::new(options), Err(DeviceError::InvalidOptions(_)));
    }

    #[cfg(not(feature = "opencl"))]
    #[test]
    fn opencl_needs_the_feature() {
        let options = DeviceOptions {
            device: DeviceKind::OpenCl,
            ..Default::default()
        };
        assert_eq!(DeviceOptions::default().device, DeviceKind::Software);
        assert_matches!(Context::new(options), Err(DeviceError::Unavailable(_)));
    }
}
