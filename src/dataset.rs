//! Readers for the IDX image and label files the MNIST digits ship in, and a
//! private little-endian cache of an already decoded dataset.

use crate::tensor::Tensor;

use anyhow::{ensure, Context};
use tracing::debug;

use std::{
    fs::File,
    io::{self, BufReader, BufWriter, Read, Write},
    path::Path,
};

pub const IMAGE_MAGIC: u32 = 0x0803;
pub const LABEL_MAGIC: u32 = 0x0801;

/// Side length of every cached image.
pub const IMAGE_SIDE: usize = 28;

pub const TRAIN_IMAGES: &str = "train-images.idx3-ubyte";
pub const TRAIN_LABELS: &str = "train-labels.idx1-ubyte";
pub const TEST_IMAGES: &str = "t10k-images.idx3-ubyte";
pub const TEST_LABELS: &str = "t10k-labels.idx1-ubyte";

fn read_u32_be<R: Read>(reader: &mut R) -> io::Result<u32> {
    let mut bytes = [0; 4];
    reader.read_exact(&mut bytes)?;
    Ok(u32::from_be_bytes(bytes))
}

fn read_u32_le<R: Read>(reader: &mut R) -> io::Result<u32> {
    let mut bytes = [0; 4];
    reader.read_exact(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

/// Product of header dimensions, failing instead of wrapping.
fn checked_len(dims: &[usize]) -> anyhow::Result<usize> {
    dims.iter()
        .try_fold(1usize, |len, &d| len.checked_mul(d))
        .with_context(|| format!("Dimensions {:?} are too large", dims))
}

/// Read exactly `len` bytes. The buffer only grows with the data actually
/// present, so a lying header cannot allocate more than the stream holds.
fn read_bytes<R: Read>(reader: &mut R, len: usize) -> anyhow::Result<Vec<u8>> {
    let mut bytes = Vec::new();
    reader.by_ref().take(len as u64).read_to_end(&mut bytes)?;
    ensure!(bytes.len() == len, "Expected {} bytes, found {}", len, bytes.len());
    Ok(bytes)
}

/// Decode an IDX image file into a `[count, rows, cols]` tensor with pixels scaled to [0, 1].
pub fn read_images<R: Read>(mut reader: R) -> anyhow::Result<Tensor<'static, f32>> {
    let magic = read_u32_be(&mut reader).context("Missing image header")?;
    ensure!(magic == IMAGE_MAGIC, "Bad image magic number {:#06x}", magic);
    let count = read_u32_be(&mut reader)? as usize;
    let rows = read_u32_be(&mut reader)? as usize;
    let cols = read_u32_be(&mut reader)? as usize;

    let len = checked_len(&[count, rows, cols])?;
    let pixels = read_bytes(&mut reader, len)
        .with_context(|| format!("Expected {} images of {}x{}", count, rows, cols))?;
    let data = pixels.into_iter().map(|p| p as f32 / 255.).collect();
    Ok(Tensor::new([count, rows, cols], data)?)
}

/// Decode an IDX label file into a `[count]` tensor.
pub fn read_labels<R: Read>(mut reader: R) -> anyhow::Result<Tensor<'static, u32>> {
    let magic = read_u32_be(&mut reader).context("Missing label header")?;
    ensure!(magic == LABEL_MAGIC, "Bad label magic number {:#06x}", magic);
    let count = read_u32_be(&mut reader)? as usize;

    let labels = read_bytes(&mut reader, count).with_context(|| format!("Expected {} labels", count))?;
    Ok(Tensor::new([count], labels.into_iter().map(u32::from).collect())?)
}

fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<BufReader<File>> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    Ok(BufReader::new(file))
}

pub fn load_images<P: AsRef<Path>>(path: P) -> anyhow::Result<Tensor<'static, f32>> {
    read_images(open(&path)?).with_context(|| format!("Failed to read {}", path.as_ref().display()))
}

pub fn load_labels<P: AsRef<Path>>(path: P) -> anyhow::Result<Tensor<'static, u32>> {
    read_labels(open(&path)?).with_context(|| format!("Failed to read {}", path.as_ref().display()))
}

/// Training and test split of the digits.
#[derive(Debug, Clone)]
pub struct MnistData {
    pub train_images: Tensor<'static, f32>,
    pub train_labels: Tensor<'static, u32>,
    pub test_images: Tensor<'static, f32>,
    pub test_labels: Tensor<'static, u32>,
}

impl MnistData {
    /// Load the four standard IDX files from `dir`.
    pub fn load<P: AsRef<Path>>(dir: P) -> anyhow::Result<Self> {
        let dir = dir.as_ref();
        let data = Self {
            train_images: load_images(dir.join(TRAIN_IMAGES))?,
            train_labels: load_labels(dir.join(TRAIN_LABELS))?,
            test_images: load_images(dir.join(TEST_IMAGES))?,
            test_labels: load_labels(dir.join(TEST_LABELS))?,
        };
        data.check()?;
        debug!(
            train = data.train_images.length(),
            test = data.test_images.length(),
            "loaded idx dataset"
        );
        Ok(data)
    }

    fn check(&self) -> anyhow::Result<()> {
        ensure!(
            self.train_images.length() == self.train_labels.length(),
            "{} training images but {} labels",
            self.train_images.length(),
            self.train_labels.length()
        );
        ensure!(
            self.test_images.length() == self.test_labels.length(),
            "{} test images but {} labels",
            self.test_images.length(),
            self.test_labels.length()
        );
        Ok(())
    }

    /// Write the cache format: for every tensor a little-endian `u32` example
    /// count followed by the raw little-endian elements, in the order train
    /// images, test images, train labels, test labels.
    pub fn write_cache<W: Write>(&self, mut writer: W) -> anyhow::Result<()> {
        for images in [&self.train_images, &self.test_images] {
            ensure!(
                images.shape().slice().dims() == [IMAGE_SIDE, IMAGE_SIDE],
                "Only {0}x{0} images can be cached, got {1}",
                IMAGE_SIDE,
                images.shape()
            );
            writer.write_all(&(images.length() as u32).to_le_bytes())?;
            for x in images.as_slice() {
                writer.write_all(&x.to_le_bytes())?;
            }
        }
        for labels in [&self.train_labels, &self.test_labels] {
            writer.write_all(&(labels.length() as u32).to_le_bytes())?;
            for l in labels.as_slice() {
                writer.write_all(&l.to_le_bytes())?;
            }
        }
        writer.flush()?;
        Ok(())
    }

    pub fn read_cache<R: Read>(mut reader: R) -> anyhow::Result<Self> {
        let mut images = || -> anyhow::Result<Tensor<'static, f32>> {
            let count = read_u32_le(&mut reader).context("Missing image count")? as usize;
            let len = checked_len(&[count, IMAGE_SIDE, IMAGE_SIDE, 4])?;
            let bytes = read_bytes(&mut reader, len).context("Truncated image data")?;
            let data = bytes
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();
            Ok(Tensor::new([count, IMAGE_SIDE, IMAGE_SIDE], data)?)
        };
        let train_images = images()?;
        let test_images = images()?;

        let mut labels = || -> anyhow::Result<Tensor<'static, u32>> {
            let count = read_u32_le(&mut reader).context("Missing label count")? as usize;
            let len = checked_len(&[count, 4])?;
            let bytes = read_bytes(&mut reader, len).context("Truncated label data")?;
            let data = bytes
                .chunks_exact(4)
                .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();
            Ok(Tensor::new([count], data)?)
        };
        let train_labels = labels()?;
        let test_labels = labels()?;

        let data = Self {
            train_images,
            train_labels,
            test_images,
            test_labels,
        };
        data.check()?;
        Ok(data)
    }

    pub fn dump_cache<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
        self.write_cache(BufWriter::new(file))
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    pub fn load_cache<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        Self::read_cache(open(&path)?).with_context(|| format!("Failed to read {}", path.as_ref().display()))
    }
}
