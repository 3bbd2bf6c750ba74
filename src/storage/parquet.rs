//! Parquet I/O for buffer and matrix persistence
//!
//! Every record is a single row holding the layout fields next to the raw
//! padded payload, so a buffer is restored without re-padding.
//!
//! # Format
//!
//! A [`PitchedBuffer`] is one single-row file:
//! - `version`, `width`, `height`, `padded_width`, `element_size`
//! - `host_pitch`, `host_stride`
//! - `device_pitch`, `device_stride` (informational, ignored on load)
//! - `payload`: raw `padded_width * height` elements, row-major
//!
//! A [`SparseMatrix`] is stored as:
//! - `{path}_matrix.parquet`: (version, dimension, `num_entries`, `row_sorted`)
//! - `{path}_entries.parquet`, `{path}_start_indices.parquet`: buffer records
//!   (omitted for an empty matrix)
//!
//! Loaded buffers are never resident; device content has to be re-established
//! with an explicit upload.

use super::{Edge, PitchedBuffer, SortOrder, SparseMatrix};
use crate::device::SharedDevice;
use anyhow::{anyhow, bail, Context, Result};
use arrow::array::{ArrayRef, BinaryArray, BooleanArray, UInt32Array, UInt64Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use bytemuck::Pod;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::arrow_writer::ArrowWriter;
use parquet::file::properties::WriterProperties;
use std::fs::File;
use std::mem::size_of;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Record layout version written by this crate
pub const RECORD_VERSION: u32 = 1;

impl<T: Pod> PitchedBuffer<T> {
    /// Write buffer record to a Parquet file
    ///
    /// # Errors
    ///
    /// Returns error if file I/O fails or Arrow conversion fails
    #[allow(clippy::unused_async)] // Async API for future I/O operations
    pub async fn write_parquet<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.write_record(path.as_ref())
    }

    /// Read buffer record from a Parquet file (host-only)
    ///
    /// # Errors
    ///
    /// Returns error if the file doesn't exist, was written with another
    /// version or element type, or the payload size doesn't match the layout
    #[allow(clippy::unused_async)] // Async API for future I/O operations
    pub async fn read_parquet<P: AsRef<Path>>(backend: SharedDevice, path: P) -> Result<Self> {
        Self::read_record(backend, path.as_ref())
    }

    fn write_record(&self, path: &Path) -> Result<()> {
        // Device fields are informational only
        let (device_pitch, device_stride) = if self.is_on_device() {
            (self.device_pitch(), self.device_stride())
        } else {
            (0, 0)
        };

        let payload: &[u8] = if size_of::<T>() == 0 {
            &[]
        } else {
            bytemuck::cast_slice(self.host_data())
        };

        let fields = BufferFields {
            version: RECORD_VERSION,
            width: u32::try_from(self.width())?,
            height: u32::try_from(self.height())?,
            padded_width: u32::try_from(self.padded_width())?,
            element_size: u32::try_from(size_of::<T>())?,
            host_pitch: u64::try_from(self.host_pitch())?,
            host_stride: u64::try_from(self.host_stride())?,
            device_pitch: u64::try_from(device_pitch)?,
            device_stride: u64::try_from(device_stride)?,
        };
        let batch = fields.to_batch(payload)?;
        write_batch(path, &batch)?;

        debug!(path = %path.display(), bytes = payload.len(), "wrote buffer record");
        Ok(())
    }

    fn read_record(backend: SharedDevice, path: &Path) -> Result<Self> {
        let batch = read_single_row(path)?;

        let version = u32_column(&batch, "version")?;
        if version != RECORD_VERSION {
            bail!("Unsupported buffer record version {version} in {}", path.display());
        }

        let element_size = u32_column(&batch, "element_size")? as usize;
        if element_size != size_of::<T>() {
            bail!(
                "Element size mismatch in {}: record has {element_size} bytes, expected {}",
                path.display(),
                size_of::<T>()
            );
        }

        let width = u32_column(&batch, "width")? as usize;
        let height = u32_column(&batch, "height")? as usize;
        let padded_width = u32_column(&batch, "padded_width")? as usize;

        let payload = batch
            .column_by_name("payload")
            .context("Missing payload column")?
            .as_any()
            .downcast_ref::<BinaryArray>()
            .context("Invalid payload column type")?
            .value(0);

        let elements = padded_width
            .checked_mul(height)
            .with_context(|| format!("Buffer layout overflows in {}", path.display()))?;
        let expected = elements
            .checked_mul(element_size)
            .with_context(|| format!("Buffer layout overflows in {}", path.display()))?;
        if payload.len() != expected {
            bail!(
                "Payload size mismatch in {}: {} bytes, expected {expected}",
                path.display(),
                payload.len()
            );
        }

        if padded_width < width {
            bail!(
                "Padded width {padded_width} below width {width} in {}",
                path.display()
            );
        }

        // Bounded by the payload length for non-zero-sized elements
        let mut host = vec![T::zeroed(); elements];
        if element_size > 0 {
            bytemuck::cast_slice_mut(&mut host).copy_from_slice(payload);
        }

        let buffer = Self::from_parts(backend, width, height, padded_width, host)
            .ok_or_else(|| anyhow!("Invalid buffer layout in {}", path.display()))?;

        // Informational host fields must agree with the layout
        let host_pitch = u64_column(&batch, "host_pitch")?;
        let host_stride = u64_column(&batch, "host_stride")?;
        if host_pitch != u64::try_from(buffer.host_pitch())?
            || host_stride != u64::try_from(buffer.host_stride())?
        {
            warn!(
                path = %path.display(),
                host_pitch,
                host_stride,
                "stored host pitch/stride disagree with layout, using layout"
            );
        }

        Ok(buffer)
    }
}

impl SparseMatrix {
    /// Write matrix to Parquet files
    ///
    /// Creates `{path}_matrix.parquet` and, unless the matrix is empty,
    /// `{path}_entries.parquet` and `{path}_start_indices.parquet`.
    ///
    /// # Errors
    ///
    /// Returns error if file I/O fails or Arrow conversion fails
    pub async fn write_parquet<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let base_path = path.as_ref();

        self.write_header(base_path)?;

        if let (Some(entries), Some(starts)) = (self.entries(), self.start_indices()) {
            entries
                .write_parquet(component_path(base_path, "entries"))
                .await?;
            starts
                .write_parquet(component_path(base_path, "start_indices"))
                .await?;
        }

        Ok(())
    }

    /// Read matrix from Parquet files and upload it to `backend`
    ///
    /// A failed upload is reported and leaves the matrix host-only.
    ///
    /// # Errors
    ///
    /// Returns error if files are missing or the stored index is corrupt
    pub async fn read_parquet<P: AsRef<Path>>(backend: SharedDevice, path: P) -> Result<Self> {
        let base_path = path.as_ref();

        let (dimension, num_entries, order) = Self::read_header(base_path)?;
        if num_entries == 0 || dimension == 0 {
            return Ok(Self::empty(backend, dimension, order));
        }

        let entries = PitchedBuffer::<Edge>::read_parquet(
            Arc::clone(&backend),
            component_path(base_path, "entries"),
        )
        .await?;
        let starts = PitchedBuffer::<i32>::read_parquet(
            Arc::clone(&backend),
            component_path(base_path, "start_indices"),
        )
        .await?;

        if entries.width() != num_entries || starts.width() != dimension {
            bail!(
                "Matrix header ({num_entries} entries, dimension {dimension}) disagrees with buffers ({} entries, dimension {})",
                entries.width(),
                starts.width()
            );
        }

        let mut matrix = Self::from_parts(backend, entries, starts, order)
            .with_context(|| format!("Corrupt matrix in {}", base_path.display()))?;

        if let Err(e) = matrix.upload() {
            warn!(error = %e, "loaded sparse matrix left host-only");
        }

        Ok(matrix)
    }

    fn write_header(&self, base_path: &Path) -> Result<()> {
        let schema = Arc::new(Schema::new(vec![
            Field::new("version", DataType::UInt32, false),
            Field::new("dimension", DataType::UInt64, false),
            Field::new("num_entries", DataType::UInt64, false),
            Field::new("row_sorted", DataType::Boolean, false),
        ]));

        let columns: Vec<ArrayRef> = vec![
            Arc::new(UInt32Array::from(vec![RECORD_VERSION])),
            Arc::new(UInt64Array::from(vec![u64::try_from(self.dimension())?])),
            Arc::new(UInt64Array::from(vec![u64::try_from(self.num_entries())?])),
            Arc::new(BooleanArray::from(vec![self.is_row_sorted()])),
        ];

        let batch = RecordBatch::try_new(schema, columns)
            .context("Failed to create matrix RecordBatch")?;
        write_batch(&component_path(base_path, "matrix"), &batch)
    }

    fn read_header(base_path: &Path) -> Result<(usize, usize, SortOrder)> {
        let header_path = component_path(base_path, "matrix");
        let batch = read_single_row(&header_path)?;

        let version = u32_column(&batch, "version")?;
        if version != RECORD_VERSION {
            bail!(
                "Unsupported matrix record version {version} in {}",
                header_path.display()
            );
        }

        let dimension = usize::try_from(u64_column(&batch, "dimension")?)?;
        let num_entries = usize::try_from(u64_column(&batch, "num_entries")?)?;
        let row_sorted = batch
            .column_by_name("row_sorted")
            .context("Missing row_sorted column")?
            .as_any()
            .downcast_ref::<BooleanArray>()
            .context("Invalid row_sorted column type")?
            .value(0);

        let order = if row_sorted {
            SortOrder::RowMajor
        } else {
            SortOrder::ColumnMajor
        };

        Ok((dimension, num_entries, order))
    }
}

/// Layout fields of a buffer record
struct BufferFields {
    version: u32,
    width: u32,
    height: u32,
    padded_width: u32,
    element_size: u32,
    host_pitch: u64,
    host_stride: u64,
    device_pitch: u64,
    device_stride: u64,
}

impl BufferFields {
    fn to_batch(&self, payload: &[u8]) -> Result<RecordBatch> {
        let schema = Arc::new(Schema::new(vec![
            Field::new("version", DataType::UInt32, false),
            Field::new("width", DataType::UInt32, false),
            Field::new("height", DataType::UInt32, false),
            Field::new("padded_width", DataType::UInt32, false),
            Field::new("element_size", DataType::UInt32, false),
            Field::new("host_pitch", DataType::UInt64, false),
            Field::new("host_stride", DataType::UInt64, false),
            Field::new("device_pitch", DataType::UInt64, false),
            Field::new("device_stride", DataType::UInt64, false),
            Field::new("payload", DataType::Binary, false),
        ]));

        let columns: Vec<ArrayRef> = vec![
            Arc::new(UInt32Array::from(vec![self.version])),
            Arc::new(UInt32Array::from(vec![self.width])),
            Arc::new(UInt32Array::from(vec![self.height])),
            Arc::new(UInt32Array::from(vec![self.padded_width])),
            Arc::new(UInt32Array::from(vec![self.element_size])),
            Arc::new(UInt64Array::from(vec![self.host_pitch])),
            Arc::new(UInt64Array::from(vec![self.host_stride])),
            Arc::new(UInt64Array::from(vec![self.device_pitch])),
            Arc::new(UInt64Array::from(vec![self.device_stride])),
            Arc::new(BinaryArray::from(vec![payload])),
        ];

        RecordBatch::try_new(schema, columns).context("Failed to create buffer RecordBatch")
    }
}

fn component_path(base_path: &Path, component: &str) -> std::path::PathBuf {
    format!("{}_{component}.parquet", base_path.display()).into()
}

fn write_batch(path: &Path, batch: &RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;

    let props = WriterProperties::builder()
        .set_compression(parquet::basic::Compression::ZSTD(
            parquet::basic::ZstdLevel::try_new(3)?,
        ))
        .build();

    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
    writer.write(batch)?;
    writer.close()?;

    Ok(())
}

fn read_single_row(path: &Path) -> Result<RecordBatch> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;

    let mut reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;
    let batch = reader
        .next()
        .transpose()?
        .with_context(|| format!("Empty record file {}", path.display()))?;

    if batch.num_rows() != 1 {
        bail!(
            "Expected a single record in {}, found {}",
            path.display(),
            batch.num_rows()
        );
    }

    Ok(batch)
}

fn u32_column(batch: &RecordBatch, name: &str) -> Result<u32> {
    let column = batch
        .column_by_name(name)
        .with_context(|| format!("Missing {name} column"))?
        .as_any()
        .downcast_ref::<UInt32Array>()
        .with_context(|| format!("Invalid {name} column type"))?;
    Ok(column.value(0))
}

fn u64_column(batch: &RecordBatch, name: &str) -> Result<u64> {
    let column = batch
        .column_by_name(name)
        .with_context(|| format!("Missing {name} column"))?
        .as_any()
        .downcast_ref::<UInt64Array>()
        .with_context(|| format!("Invalid {name} column type"))?;
    Ok(column.value(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::EmulatedDevice;
    use crate::storage::BuildOptions;
    use tempfile::tempdir;

    fn device() -> SharedDevice {
        Arc::new(EmulatedDevice::new())
    }

    #[tokio::test]
    async fn test_buffer_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("buffer.parquet");

        let data: Vec<f32> = (0..15).map(|i| i as f32 * 0.5).collect();
        let mut buffer = PitchedBuffer::from_slice(device(), 5, 3, &data);
        buffer.upload().unwrap();
        buffer.write_parquet(&path).await.unwrap();

        let loaded = PitchedBuffer::<f32>::read_parquet(device(), &path)
            .await
            .unwrap();

        assert_eq!(loaded.width(), 5);
        assert_eq!(loaded.height(), 3);
        assert_eq!(loaded.padded_width(), buffer.padded_width());
        assert_eq!(loaded.host_pitch(), buffer.host_pitch());
        assert_eq!(loaded.host_data(), buffer.host_data());
        assert!(!loaded.is_on_device());
    }

    #[tokio::test]
    async fn test_element_size_checked() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("buffer.parquet");

        let buffer = PitchedBuffer::<u16>::from_slice(device(), 2, 1, &[1, 2]);
        buffer.write_parquet(&path).await.unwrap();

        let result = PitchedBuffer::<u32>::read_parquet(device(), &path).await;
        assert!(result.is_err());
    }

    fn corrupt_fields(width: u32, height: u32, padded_width: u32) -> BufferFields {
        BufferFields {
            version: RECORD_VERSION,
            width,
            height,
            padded_width,
            element_size: 4,
            host_pitch: 0,
            host_stride: 0,
            device_pitch: 0,
            device_stride: 0,
        }
    }

    #[tokio::test]
    async fn test_oversized_layout_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("buffer.parquet");

        // 2^31 * 2^31 * 4 wraps to 0 and would match the empty payload
        let batch = corrupt_fields(8, 1 << 31, 1 << 31).to_batch(&[]).unwrap();
        write_batch(&path, &batch).unwrap();

        let result = PitchedBuffer::<f32>::read_parquet(device(), &path).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_padded_width_below_width_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("buffer.parquet");

        let batch = corrupt_fields(16, 1, 8).to_batch(&[0; 32]).unwrap();
        write_batch(&path, &batch).unwrap();

        let result = PitchedBuffer::<f32>::read_parquet(device(), &path).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_missing_file() {
        let dir = tempdir().unwrap();
        let result = PitchedBuffer::<u32>::read_parquet(device(), dir.path().join("nope")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_matrix_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("affinity");

        let edges = vec![
            Edge::new(0, 2, 4.0),
            Edge::new(1, 0, 2.0),
            Edge::new(0, 1, 6.0),
        ];
        let matrix = SparseMatrix::new(
            device(),
            edges,
            3,
            BuildOptions::default()
                .with_order(SortOrder::ColumnMajor)
                .with_normalization(2.0),
        )
        .unwrap();
        matrix.write_parquet(&path).await.unwrap();

        let loaded = SparseMatrix::read_parquet(device(), &path).await.unwrap();

        assert_eq!(loaded.order(), SortOrder::ColumnMajor);
        assert_eq!(loaded.dimension(), 3);
        assert_eq!(loaded.num_entries(), 3);
        assert!(loaded.iter().eq(matrix.iter()));
        assert!(loaded.is_on_device());
    }

    #[tokio::test]
    async fn test_empty_matrix_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty");

        let matrix = SparseMatrix::new(device(), Vec::new(), 5, BuildOptions::default()).unwrap();
        matrix.write_parquet(&path).await.unwrap();

        assert!(!dir.path().join("empty_entries.parquet").exists());

        let loaded = SparseMatrix::read_parquet(device(), &path).await.unwrap();
        assert_eq!(loaded.num_entries(), 0);
        assert_eq!(loaded.dimension(), 5);
        assert!(loaded.entries().is_none());
    }
}
