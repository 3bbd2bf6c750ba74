//! Sorted sparse affinity matrix
//!
//! Built once from a batch of weighted edges. Entries are kept in one flat
//! array sorted by the active key (row or column); a per-key start index
//! points at the first entry of each key.
//!
//! # Layout
//!
//! ```text
//! edges: (0,2,4.0) (1,0,2.0) (0,1,6.0)   N = 3, divisor = 2, row-major
//!
//!   entries:       [(0,1,3.0), (0,2,2.0), (1,0,1.0)]
//!   start_indices: [0, 2, -1]              // key 2 has no entries
//! ```
//!
//! Both arrays live in [`PitchedBuffer`]s (one row each) and are uploaded
//! after construction so device kernels can index them directly.

use super::pitched::{BufferError, PitchedBuffer};
use crate::device::SharedDevice;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Weighted edge between two keys
///
/// 16 bytes, laid out like a `float4`/`vec4<u32>` slot on the device.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Edge {
    /// Row key
    pub row: u32,
    /// Column key
    pub col: u32,
    /// Weight
    pub weight: f32,
    _padding: u32,
}

impl Edge {
    /// Create edge `row → col` with `weight`
    #[must_use]
    pub const fn new(row: u32, col: u32, weight: f32) -> Self {
        Self {
            row,
            col,
            weight,
            _padding: 0,
        }
    }

    /// Key this edge is sorted by under `order`
    #[must_use]
    pub const fn key(&self, order: SortOrder) -> u32 {
        match order {
            SortOrder::RowMajor => self.row,
            SortOrder::ColumnMajor => self.col,
        }
    }
}

impl From<(u32, u32, f32)> for Edge {
    fn from((row, col, weight): (u32, u32, f32)) -> Self {
        Self::new(row, col, weight)
    }
}

/// Which key the entries are sorted and indexed by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SortOrder {
    /// Sorted by row key
    #[default]
    RowMajor,
    /// Sorted by column key
    ColumnMajor,
}

impl SortOrder {
    /// The other order
    #[must_use]
    pub const fn flipped(self) -> Self {
        match self {
            Self::RowMajor => Self::ColumnMajor,
            Self::ColumnMajor => Self::RowMajor,
        }
    }

    /// Whether this is [`SortOrder::RowMajor`]
    #[must_use]
    pub const fn is_row_major(self) -> bool {
        matches!(self, Self::RowMajor)
    }
}

/// Construction settings for [`SparseMatrix::new`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BuildOptions {
    /// Sort/index key
    pub order: SortOrder,
    /// Every weight is divided by this value
    pub normalization: f32,
    /// Caller guarantees the edges are already sorted by `order`
    pub presorted: bool,
    /// Upload both buffers after construction
    pub upload: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            order: SortOrder::RowMajor,
            normalization: 1.0,
            presorted: false,
            upload: true,
        }
    }
}

impl BuildOptions {
    /// Set sort order
    #[must_use]
    pub const fn with_order(mut self, order: SortOrder) -> Self {
        self.order = order;
        self
    }

    /// Set normalization divisor
    #[must_use]
    pub const fn with_normalization(mut self, divisor: f32) -> Self {
        self.normalization = divisor;
        self
    }

    /// Mark input as already sorted
    #[must_use]
    pub const fn with_presorted(mut self, presorted: bool) -> Self {
        self.presorted = presorted;
        self
    }

    /// Enable/disable the upload after construction
    #[must_use]
    pub const fn with_upload(mut self, upload: bool) -> Self {
        self.upload = upload;
        self
    }
}

/// Sparse matrix construction errors
#[derive(Debug, Error)]
pub enum SparseMatrixError {
    /// Normalization divisor is zero or not finite
    #[error("Invalid normalization divisor {0}")]
    InvalidNormalization(f32),

    /// Edge key outside `0..dimension`
    #[error("Edge ({row}, {col}) out of range for dimension {dimension}")]
    KeyOutOfRange {
        /// Row key
        row: u32,
        /// Column key
        col: u32,
        /// Matrix dimension
        dimension: usize,
    },

    /// Entry count or dimension does not fit the `i32` start indices
    #[error("Matrix too large: {entries} entries, dimension {dimension}")]
    TooLarge {
        /// Entry count
        entries: usize,
        /// Matrix dimension
        dimension: usize,
    },

    /// Input flagged as presorted is out of order
    #[error("Edges not sorted by active key at position {position}")]
    NotSorted {
        /// First position whose key is smaller than its predecessor's
        position: usize,
    },

    /// Start index does not point at the first entry of its key
    #[error("Corrupt start index for key {key}")]
    CorruptIndex {
        /// Offending key
        key: usize,
    },

    /// Buffer operation failed
    #[error(transparent)]
    Buffer(#[from] BufferError),
}

/// Sparse affinity matrix (sorted entries + per-key start indices)
///
/// Immutable after construction. A differently sorted view is obtained with
/// [`SparseMatrix::from_matrix`], which always builds a new instance.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use trueno_affinity::{BuildOptions, Edge, EmulatedDevice, SharedDevice, SparseMatrix};
///
/// let device: SharedDevice = Arc::new(EmulatedDevice::new());
/// let edges = vec![Edge::new(0, 2, 4.0), Edge::new(1, 0, 2.0), Edge::new(0, 1, 6.0)];
///
/// let matrix = SparseMatrix::new(
///     device,
///     edges,
///     3,
///     BuildOptions::default().with_normalization(2.0),
/// )
/// .unwrap();
///
/// assert_eq!(matrix.start_index(0), Some(0));
/// assert_eq!(matrix.start_index(1), Some(2));
/// assert_eq!(matrix.start_index(2), None);
/// assert_eq!(matrix.entries_for(0).len(), 2);
/// assert!(matrix.is_on_device());
/// ```
#[derive(Debug)]
pub struct SparseMatrix {
    /// 1 x `num_entries`, sorted by active key
    entries: Option<PitchedBuffer<Edge>>,

    /// 1 x `dimension`, -1 for keys without entries
    start_indices: Option<PitchedBuffer<i32>>,

    order: SortOrder,
    dimension: usize,
    num_entries: usize,
    backend: SharedDevice,
}

impl SparseMatrix {
    /// Build matrix from `edges` over keys `0..dimension`
    ///
    /// Empty input or a zero dimension yields an empty matrix without
    /// buffers. A failed upload is reported and leaves the matrix host-only.
    ///
    /// # Errors
    ///
    /// Returns error if the divisor is zero/non-finite, a key is out of range,
    /// the matrix exceeds `i32` indexing, or presorted input is out of order.
    pub fn new(
        backend: SharedDevice,
        edges: Vec<Edge>,
        dimension: usize,
        options: BuildOptions,
    ) -> Result<Self, SparseMatrixError> {
        Self::build(
            backend,
            edges,
            dimension,
            options.order,
            Some(options.normalization),
            options.presorted,
            options.upload,
        )
    }

    /// Build matrix from any edge source
    ///
    /// # Errors
    ///
    /// See [`SparseMatrix::new`].
    pub fn from_edges<I, E>(
        backend: SharedDevice,
        edges: I,
        dimension: usize,
        options: BuildOptions,
    ) -> Result<Self, SparseMatrixError>
    where
        I: IntoIterator<Item = E>,
        E: Into<Edge>,
    {
        Self::new(
            backend,
            edges.into_iter().map(Into::into).collect(),
            dimension,
            options,
        )
    }

    /// Copy `source`, re-sorting by the other key when `flip` is set
    ///
    /// Weights are copied as stored (normalization is not applied again).
    /// The copy gets its own device allocations.
    ///
    /// # Errors
    ///
    /// Returns error if a host copy fails (cannot happen for well-formed
    /// sources).
    pub fn from_matrix(source: &Self, flip: bool) -> Result<Self, SparseMatrixError> {
        let order = if flip {
            source.order.flipped()
        } else {
            source.order
        };
        let backend = Arc::clone(&source.backend);

        let (Some(src_entries), Some(src_starts)) = (&source.entries, &source.start_indices) else {
            return Ok(Self::empty(backend, source.dimension, order));
        };

        if flip {
            let edges = src_entries.host_row(0).unwrap_or_default().to_vec();
            return Self::build(backend, edges, source.dimension, order, None, false, true);
        }

        let mut entries = PitchedBuffer::new(Arc::clone(&backend), source.num_entries, 1);
        let mut start_indices = PitchedBuffer::new(Arc::clone(&backend), source.dimension, 1);
        src_entries.copy_into(&mut entries, false)?;
        src_starts.copy_into(&mut start_indices, false)?;

        let mut matrix = Self {
            entries: Some(entries),
            start_indices: Some(start_indices),
            order,
            dimension: source.dimension,
            num_entries: source.num_entries,
            backend,
        };
        matrix.upload_or_report();
        Ok(matrix)
    }

    /// Copy sorted by the other key
    ///
    /// # Errors
    ///
    /// See [`SparseMatrix::from_matrix`].
    pub fn resorted(&self) -> Result<Self, SparseMatrixError> {
        Self::from_matrix(self, true)
    }

    /// Reassemble a matrix from persisted buffers, checking the index
    #[cfg_attr(not(feature = "storage"), allow(dead_code))]
    pub(crate) fn from_parts(
        backend: SharedDevice,
        entries: PitchedBuffer<Edge>,
        start_indices: PitchedBuffer<i32>,
        order: SortOrder,
    ) -> Result<Self, SparseMatrixError> {
        let matrix = Self {
            num_entries: entries.width(),
            dimension: start_indices.width(),
            entries: Some(entries),
            start_indices: Some(start_indices),
            order,
            backend,
        };
        matrix.check_invariants()?;
        Ok(matrix)
    }

    /// Matrix without entries or buffers
    #[must_use]
    pub fn empty(backend: SharedDevice, dimension: usize, order: SortOrder) -> Self {
        Self {
            entries: None,
            start_indices: None,
            order,
            dimension,
            num_entries: 0,
            backend,
        }
    }

    fn build(
        backend: SharedDevice,
        mut edges: Vec<Edge>,
        dimension: usize,
        order: SortOrder,
        normalization: Option<f32>,
        presorted: bool,
        upload: bool,
    ) -> Result<Self, SparseMatrixError> {
        if edges.is_empty() || dimension == 0 {
            return Ok(Self::empty(backend, dimension, order));
        }

        if let Some(divisor) = normalization.filter(|d| !d.is_finite() || *d == 0.0) {
            return Err(SparseMatrixError::InvalidNormalization(divisor));
        }

        let limit = i32::MAX as usize;
        if edges.len() > limit || dimension > limit {
            return Err(SparseMatrixError::TooLarge {
                entries: edges.len(),
                dimension,
            });
        }

        if let Some(edge) = edges
            .iter()
            .find(|e| e.row as usize >= dimension || e.col as usize >= dimension)
        {
            return Err(SparseMatrixError::KeyOutOfRange {
                row: edge.row,
                col: edge.col,
                dimension,
            });
        }

        if presorted {
            if let Some(position) = edges
                .windows(2)
                .position(|w| w[1].key(order) < w[0].key(order))
            {
                return Err(SparseMatrixError::NotSorted {
                    position: position + 1,
                });
            }
        } else {
            let other = order.flipped();
            edges.sort_by_key(|e| (e.key(order), e.key(other)));
        }

        let mut entries = PitchedBuffer::<Edge>::new(Arc::clone(&backend), edges.len(), 1);
        let mut start_indices = PitchedBuffer::<i32>::new(Arc::clone(&backend), dimension, 1);
        start_indices.set_value(-1, false)?;

        // Ordered scan: a key starts wherever it differs from its predecessor
        let mut previous: Option<u32> = None;
        for (position, edge) in edges.iter().enumerate() {
            let weight = normalization.map_or(edge.weight, |divisor| edge.weight / divisor);
            if let Some(slot) = entries.host_at_mut(position, 0) {
                *slot = Edge::new(edge.row, edge.col, weight);
            }

            let key = edge.key(order);
            if previous != Some(key) {
                let start = i32::try_from(position).map_err(|_| SparseMatrixError::TooLarge {
                    entries: edges.len(),
                    dimension,
                })?;
                if let Some(slot) = start_indices.host_at_mut(key as usize, 0) {
                    *slot = start;
                }
                previous = Some(key);
            }
        }

        debug!(
            entries = edges.len(),
            dimension,
            order = ?order,
            "built sparse matrix"
        );

        let mut matrix = Self {
            entries: Some(entries),
            start_indices: Some(start_indices),
            order,
            dimension,
            num_entries: edges.len(),
            backend,
        };
        if upload {
            matrix.upload_or_report();
        }
        Ok(matrix)
    }

    fn upload_or_report(&mut self) {
        if let Err(e) = self.upload() {
            warn!(error = %e, "sparse matrix left host-only");
        }
    }

    /// Upload both buffers (no-op for an empty matrix)
    ///
    /// # Errors
    ///
    /// Returns the first buffer error; the other buffer is still attempted.
    pub fn upload(&mut self) -> Result<(), BufferError> {
        let entries = self.entries.as_mut().map_or(Ok(()), PitchedBuffer::upload);
        let starts = self
            .start_indices
            .as_mut()
            .map_or(Ok(()), PitchedBuffer::upload);
        entries.and(starts)
    }

    /// Refresh host copies from the device (no-op for an empty matrix)
    ///
    /// # Errors
    ///
    /// Returns the first buffer error.
    pub fn download(&mut self) -> Result<(), BufferError> {
        if let Some(entries) = self.entries.as_mut() {
            entries.download()?;
        }
        if let Some(starts) = self.start_indices.as_mut() {
            starts.download()?;
        }
        Ok(())
    }

    /// Free device memory of both buffers
    pub fn release_device(&mut self) {
        if let Some(entries) = self.entries.as_mut() {
            entries.release();
        }
        if let Some(starts) = self.start_indices.as_mut() {
            starts.release();
        }
    }

    /// Whether both buffers are resident (false for an empty matrix)
    #[must_use]
    pub fn is_on_device(&self) -> bool {
        matches!(
            (&self.entries, &self.start_indices),
            (Some(e), Some(s)) if e.is_on_device() && s.is_on_device()
        )
    }

    /// Sorted entries buffer (`None` when empty)
    #[must_use]
    pub const fn entries(&self) -> Option<&PitchedBuffer<Edge>> {
        self.entries.as_ref()
    }

    /// Start-index buffer (`None` when empty)
    #[must_use]
    pub const fn start_indices(&self) -> Option<&PitchedBuffer<i32>> {
        self.start_indices.as_ref()
    }

    /// Number of stored entries
    #[must_use]
    pub const fn num_entries(&self) -> usize {
        self.num_entries
    }

    /// Number of keys (rows = columns)
    #[must_use]
    pub const fn dimension(&self) -> usize {
        self.dimension
    }

    /// Active sort order
    #[must_use]
    pub const fn order(&self) -> SortOrder {
        self.order
    }

    /// Whether entries are sorted by row
    #[must_use]
    pub const fn is_row_sorted(&self) -> bool {
        self.order.is_row_major()
    }

    /// Backend the buffers allocate on
    #[must_use]
    pub const fn backend(&self) -> &SharedDevice {
        &self.backend
    }

    /// Position of the first entry with `key`, `None` if the key has none
    #[must_use]
    pub fn start_index(&self, key: u32) -> Option<usize> {
        let start = *self.start_indices.as_ref()?.host_at(key as usize, 0)?;
        usize::try_from(start).ok()
    }

    /// All entries with `key` (contiguous in the sorted array)
    #[must_use]
    pub fn entries_for(&self, key: u32) -> &[Edge] {
        let Some(start) = self.start_index(key) else {
            return &[];
        };

        let tail = self.as_slice().get(start..).unwrap_or_default();
        let len = tail
            .iter()
            .position(|e| e.key(self.order) != key)
            .unwrap_or(tail.len());
        &tail[..len]
    }

    /// Entries in sorted order
    pub fn iter(&self) -> impl Iterator<Item = &Edge> + '_ {
        self.as_slice().iter()
    }

    /// Keys that have at least one entry, ascending
    pub fn keys(&self) -> impl Iterator<Item = u32> + '_ {
        let dimension = u32::try_from(self.dimension).unwrap_or(u32::MAX);
        (0..dimension).filter(move |&key| self.start_index(key).is_some())
    }

    /// Verify sort order and start indices against the entries
    ///
    /// # Errors
    ///
    /// Returns `NotSorted` or `CorruptIndex` describing the first violation.
    pub fn check_invariants(&self) -> Result<(), SparseMatrixError> {
        let entries = self.as_slice();
        if let Some(position) = entries
            .windows(2)
            .position(|w| w[1].key(self.order) < w[0].key(self.order))
        {
            return Err(SparseMatrixError::NotSorted {
                position: position + 1,
            });
        }

        let Some(starts) = self.start_indices.as_ref().and_then(|s| s.host_row(0)) else {
            return Ok(());
        };

        // Every key present in the entries starts where it first appears
        let mut previous: Option<u32> = None;
        for (position, edge) in entries.iter().enumerate() {
            let key = edge.key(self.order);
            if previous == Some(key) {
                continue;
            }
            previous = Some(key);

            if key as usize >= self.dimension {
                return Err(SparseMatrixError::CorruptIndex {
                    key: self.dimension,
                });
            }
            let start = starts.get(key as usize).copied();
            if start.and_then(|s| usize::try_from(s).ok()) != Some(position) {
                return Err(SparseMatrixError::CorruptIndex { key: key as usize });
            }
        }

        // Every other slot is -1
        for (key, &start) in starts.iter().enumerate() {
            if start == -1 {
                continue;
            }
            let first = usize::try_from(start).ok().filter(|&p| {
                entries.get(p).is_some_and(|e| e.key(self.order) as usize == key)
                    && (p == 0 || entries[p - 1].key(self.order) as usize != key)
            });
            if first.is_none() {
                return Err(SparseMatrixError::CorruptIndex { key });
            }
        }

        Ok(())
    }

    fn as_slice(&self) -> &[Edge] {
        self.entries
            .as_ref()
            .and_then(|e| e.host_row(0))
            .unwrap_or_default()
    }
}

impl Clone for SparseMatrix {
    /// Same-order copy with fresh buffers
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
            start_indices: self.start_indices.clone(),
            order: self.order,
            dimension: self.dimension,
            num_entries: self.num_entries,
            backend: Arc::clone(&self.backend),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::EmulatedDevice;

    fn device() -> SharedDevice {
        Arc::new(EmulatedDevice::new())
    }

    fn sample_edges() -> Vec<Edge> {
        vec![
            Edge::new(0, 2, 4.0),
            Edge::new(1, 0, 2.0),
            Edge::new(0, 1, 6.0),
        ]
    }

    fn starts(matrix: &SparseMatrix) -> Vec<i32> {
        matrix.start_indices().unwrap().host_row(0).unwrap().to_vec()
    }

    fn entries(matrix: &SparseMatrix) -> Vec<(u32, u32, f32)> {
        matrix.iter().map(|e| (e.row, e.col, e.weight)).collect()
    }

    #[test]
    fn test_edge_layout() {
        assert_eq!(std::mem::size_of::<Edge>(), 16);
        assert_eq!(Edge::from((1, 2, 0.5)), Edge::new(1, 2, 0.5));
    }

    #[test]
    fn test_row_major_build() {
        let matrix = SparseMatrix::new(
            device(),
            sample_edges(),
            3,
            BuildOptions::default().with_normalization(2.0),
        )
        .unwrap();

        assert_eq!(matrix.num_entries(), 3);
        assert_eq!(matrix.dimension(), 3);
        assert!(matrix.is_row_sorted());
        assert_eq!(
            entries(&matrix),
            vec![(0, 1, 3.0), (0, 2, 2.0), (1, 0, 1.0)]
        );
        assert_eq!(starts(&matrix), vec![0, 2, -1]);
        assert!(matrix.is_on_device());
    }

    #[test]
    fn test_column_major_build() {
        let matrix = SparseMatrix::new(
            device(),
            sample_edges(),
            3,
            BuildOptions::default().with_order(SortOrder::ColumnMajor),
        )
        .unwrap();

        assert!(!matrix.is_row_sorted());
        assert_eq!(
            entries(&matrix),
            vec![(1, 0, 2.0), (0, 1, 6.0), (0, 2, 4.0)]
        );
        assert_eq!(starts(&matrix), vec![0, 1, 2]);
    }

    #[test]
    fn test_empty_input() {
        let matrix = SparseMatrix::new(device(), Vec::new(), 3, BuildOptions::default()).unwrap();

        assert_eq!(matrix.num_entries(), 0);
        assert_eq!(matrix.dimension(), 3);
        assert!(matrix.entries().is_none());
        assert!(matrix.start_indices().is_none());
        assert_eq!(matrix.start_index(0), None);
        assert!(matrix.entries_for(1).is_empty());
        assert_eq!(matrix.iter().count(), 0);
        assert_eq!(matrix.keys().count(), 0);
        assert!(!matrix.is_on_device());
        matrix.check_invariants().unwrap();
    }

    #[test]
    fn test_zero_dimension_is_empty() {
        let matrix = SparseMatrix::new(device(), sample_edges(), 0, BuildOptions::default()).unwrap();
        assert_eq!(matrix.num_entries(), 0);
        assert!(matrix.entries().is_none());
    }

    #[test]
    fn test_key_out_of_range() {
        let err = SparseMatrix::new(
            device(),
            vec![Edge::new(0, 3, 1.0)],
            3,
            BuildOptions::default(),
        )
        .unwrap_err();

        assert!(matches!(
            err,
            SparseMatrixError::KeyOutOfRange {
                row: 0,
                col: 3,
                dimension: 3
            }
        ));
    }

    #[test]
    fn test_invalid_normalization() {
        for divisor in [0.0, f32::NAN, f32::INFINITY] {
            let result = SparseMatrix::new(
                device(),
                sample_edges(),
                3,
                BuildOptions::default().with_normalization(divisor),
            );
            assert!(matches!(
                result,
                Err(SparseMatrixError::InvalidNormalization(_))
            ));
        }
    }

    #[test]
    fn test_presorted_input_kept_in_order() {
        let edges = vec![
            Edge::new(0, 2, 1.0),
            Edge::new(0, 1, 1.0),
            Edge::new(2, 0, 1.0),
        ];
        let matrix = SparseMatrix::new(
            device(),
            edges,
            3,
            BuildOptions::default().with_presorted(true),
        )
        .unwrap();

        // No re-sort: ties keep caller order
        assert_eq!(
            entries(&matrix),
            vec![(0, 2, 1.0), (0, 1, 1.0), (2, 0, 1.0)]
        );
        assert_eq!(starts(&matrix), vec![0, -1, 2]);
    }

    #[test]
    fn test_presorted_flag_checked() {
        let result = SparseMatrix::new(
            device(),
            sample_edges(),
            3,
            BuildOptions::default().with_presorted(true),
        );
        assert!(matches!(
            result,
            Err(SparseMatrixError::NotSorted { position: 2 })
        ));
    }

    #[test]
    fn test_duplicate_edges_kept() {
        let edges = vec![
            Edge::new(1, 1, 1.0),
            Edge::new(0, 0, 5.0),
            Edge::new(1, 1, 2.0),
        ];
        let matrix = SparseMatrix::new(device(), edges, 2, BuildOptions::default()).unwrap();

        assert_eq!(matrix.num_entries(), 3);
        assert_eq!(
            matrix
                .entries_for(1)
                .iter()
                .map(|e| e.weight)
                .collect::<Vec<_>>(),
            vec![1.0, 2.0]
        );
    }

    #[test]
    fn test_entries_for_and_keys() {
        let matrix = SparseMatrix::new(device(), sample_edges(), 3, BuildOptions::default()).unwrap();

        assert_eq!(
            matrix.entries_for(0),
            &[Edge::new(0, 1, 6.0), Edge::new(0, 2, 4.0)]
        );
        assert_eq!(matrix.entries_for(1), &[Edge::new(1, 0, 2.0)]);
        assert!(matrix.entries_for(2).is_empty());
        assert!(matrix.entries_for(99).is_empty());
        assert_eq!(matrix.keys().collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn test_upload_skipped() {
        let matrix = SparseMatrix::new(
            device(),
            sample_edges(),
            3,
            BuildOptions::default().with_upload(false),
        )
        .unwrap();
        assert!(!matrix.is_on_device());
    }

    #[test]
    fn test_from_matrix_same_order() {
        let source = SparseMatrix::new(
            device(),
            sample_edges(),
            3,
            BuildOptions::default().with_normalization(2.0),
        )
        .unwrap();
        let copy = SparseMatrix::from_matrix(&source, false).unwrap();

        assert_eq!(copy.order(), source.order());
        assert_eq!(copy.num_entries(), source.num_entries());
        assert_eq!(entries(&copy), entries(&source));
        assert_eq!(starts(&copy), starts(&source));
        assert!(copy.is_on_device());
        assert_ne!(
            copy.entries().unwrap().device_ptr(),
            source.entries().unwrap().device_ptr()
        );
    }

    #[test]
    fn test_from_matrix_flipped_keeps_weights() {
        let source = SparseMatrix::new(
            device(),
            sample_edges(),
            3,
            BuildOptions::default().with_normalization(2.0),
        )
        .unwrap();
        let flipped = source.resorted().unwrap();

        assert_eq!(flipped.order(), SortOrder::ColumnMajor);
        assert_eq!(
            entries(&flipped),
            vec![(1, 0, 1.0), (0, 1, 3.0), (0, 2, 2.0)]
        );
        assert_eq!(starts(&flipped), vec![0, 1, 2]);
        flipped.check_invariants().unwrap();
    }

    #[test]
    fn test_from_empty_matrix_flips_order() {
        let source = SparseMatrix::new(device(), Vec::new(), 4, BuildOptions::default()).unwrap();
        let flipped = source.resorted().unwrap();

        assert_eq!(flipped.order(), SortOrder::ColumnMajor);
        assert_eq!(flipped.dimension(), 4);
        assert_eq!(flipped.num_entries(), 0);
    }

    #[test]
    fn test_download_after_release_fails() {
        let mut matrix =
            SparseMatrix::new(device(), sample_edges(), 3, BuildOptions::default()).unwrap();

        matrix.download().unwrap();
        matrix.release_device();
        assert!(!matrix.is_on_device());
        assert!(matches!(matrix.download(), Err(BufferError::NotResident)));
    }

    #[test]
    fn test_check_invariants_detects_corruption() {
        let backend = device();
        let entries = PitchedBuffer::from_slice(
            Arc::clone(&backend),
            2,
            1,
            &[Edge::new(0, 1, 1.0), Edge::new(1, 0, 1.0)],
        );
        let starts = PitchedBuffer::from_slice(Arc::clone(&backend), 2, 1, &[0, 0]);

        let err = SparseMatrix::from_parts(backend, entries, starts, SortOrder::RowMajor)
            .unwrap_err();
        assert!(matches!(err, SparseMatrixError::CorruptIndex { key: 1 }));
    }

    #[test]
    fn test_check_invariants_detects_stale_start() {
        let backend = device();
        let entries = PitchedBuffer::from_slice(
            Arc::clone(&backend),
            2,
            1,
            &[Edge::new(0, 1, 1.0), Edge::new(0, 2, 1.0)],
        );
        // Key 2 has no entries but points into key 0's run
        let starts = PitchedBuffer::from_slice(Arc::clone(&backend), 3, 1, &[0, -1, 1]);

        let err = SparseMatrix::from_parts(backend, entries, starts, SortOrder::RowMajor)
            .unwrap_err();
        assert!(matches!(err, SparseMatrixError::CorruptIndex { key: 2 }));
    }

    #[test]
    fn test_check_invariants_large_matrix() {
        // One entry per key; a per-key rescan would be quadratic here
        let n = 200_000u32;
        let edges = (0..n).map(|key| Edge::new(key, n - 1 - key, 1.0)).collect();
        let matrix = SparseMatrix::new(
            device(),
            edges,
            n as usize,
            BuildOptions::default().with_upload(false),
        )
        .unwrap();

        matrix.check_invariants().unwrap();
        let flipped = matrix.resorted().unwrap();
        flipped.check_invariants().unwrap();
    }

    #[test]
    fn test_clone_is_independent() {
        let matrix = SparseMatrix::new(device(), sample_edges(), 3, BuildOptions::default()).unwrap();
        let copy = matrix.clone();

        assert_eq!(entries(&copy), entries(&matrix));
        assert!(copy.is_on_device());
        assert_ne!(
            copy.start_indices().unwrap().device_ptr(),
            matrix.start_indices().unwrap().device_ptr()
        );
    }
}
