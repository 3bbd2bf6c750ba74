//! Property-based tests for trueno-affinity
//!
//! Verifies padding, transfer and sparse index invariants hold for arbitrary
//! shapes and edge batches

use proptest::prelude::*;
use std::sync::Arc;
use trueno_affinity::{
    BuildOptions, Edge, EmulatedDevice, PitchedBuffer, SharedDevice, SortOrder, SparseMatrix,
    ROW_ALIGNMENT_BYTES,
};

fn device() -> SharedDevice {
    Arc::new(EmulatedDevice::new())
}

// Property: padded rows are 32-byte aligned and minimal
proptest! {
    #[test]
    fn prop_padding_invariant(width in 1usize..200, height in 1usize..8) {
        let u8s = PitchedBuffer::<u8>::new(device(), width, height);
        let f64s = PitchedBuffer::<f64>::new(device(), width, height);
        let edges = PitchedBuffer::<Edge>::new(device(), width, height);

        for (padded, pitch, element) in [
            (u8s.padded_width(), u8s.host_pitch(), 1),
            (f64s.padded_width(), f64s.host_pitch(), 8),
            (edges.padded_width(), edges.host_pitch(), 16),
        ] {
            prop_assert!(padded >= width);
            prop_assert_eq!(pitch, padded * element);
            prop_assert_eq!(pitch % ROW_ALIGNMENT_BYTES, 0);
            // Minimal: one fewer alignment unit would no longer cover the row
            let unit = ROW_ALIGNMENT_BYTES / element;
            prop_assert!(padded - unit < width);
        }
    }
}

// Property: set_value + upload + download reproduces the value everywhere
proptest! {
    #[test]
    fn prop_set_value_round_trip(
        width in 1usize..64,
        height in 1usize..6,
        value in any::<i32>(),
    ) {
        let mut buffer = PitchedBuffer::<i32>::new(device(), width, height);
        buffer.set_value(value, true).unwrap();
        buffer.set_value(0, false).unwrap();

        buffer.download().unwrap();
        for y in 0..height {
            prop_assert!(buffer.host_row(y).unwrap().iter().all(|&v| v == value));
        }
    }
}

// Property: copy_into transfers every logical element regardless of pitch
proptest! {
    #[test]
    fn prop_copy_into_preserves_content(
        width in 1usize..40,
        height in 1usize..6,
        seed in any::<u16>(),
    ) {
        let data: Vec<u16> = (0..width * height)
            .map(|i| seed.wrapping_add(i as u16))
            .collect();
        let src = PitchedBuffer::from_slice(device(), width, height, &data);
        let mut dst = PitchedBuffer::<u16>::new(device(), width, height);

        src.copy_into(&mut dst, true).unwrap();
        dst.set_value(0, false).unwrap();
        dst.download().unwrap();

        for y in 0..height {
            for x in 0..width {
                prop_assert_eq!(dst.host_at(x, y), Some(&data[y * width + x]));
            }
        }
    }
}

// Property: entries are sorted and start indices point at each key's first entry
proptest! {
    #[test]
    fn prop_build_valid_index(
        (dimension, edges) in prop_edge_batch(1u32..30, 0usize..80),
        column_major in any::<bool>(),
    ) {
        let order = if column_major { SortOrder::ColumnMajor } else { SortOrder::RowMajor };
        let matrix = SparseMatrix::new(
            device(),
            edges.clone(),
            dimension,
            BuildOptions::default().with_order(order),
        )
        .unwrap();

        prop_assert_eq!(matrix.num_entries(), edges.len());
        prop_assert!(matrix.check_invariants().is_ok());

        let sorted: Vec<_> = matrix.iter().copied().collect();
        for key in 0..dimension as u32 {
            let expected = edges.iter().filter(|e| e.key(order) == key).count();
            prop_assert_eq!(matrix.entries_for(key).len(), expected);

            match matrix.start_index(key) {
                Some(start) => {
                    prop_assert_eq!(sorted[start].key(order), key);
                    prop_assert!(start == 0 || sorted[start - 1].key(order) < key);
                }
                None => prop_assert_eq!(expected, 0),
            }
        }
    }
}

// Property: row → column → row reproduces the multiset with identical weights
proptest! {
    #[test]
    fn prop_resort_idempotent(
        (dimension, edges) in prop_edge_batch(1u32..20, 0usize..60),
        divisor in 0.5f32..8.0,
    ) {
        let rows = SparseMatrix::new(
            device(),
            edges,
            dimension,
            BuildOptions::default().with_normalization(divisor),
        )
        .unwrap();
        let cols = rows.resorted().unwrap();
        let back = cols.resorted().unwrap();

        prop_assert!(cols.check_invariants().is_ok());
        prop_assert!(back.is_row_sorted());

        let bits = |m: &SparseMatrix| {
            let mut v: Vec<_> = m.iter().map(|e| (e.row, e.col, e.weight.to_bits())).collect();
            v.sort_unstable();
            v
        };
        prop_assert_eq!(bits(&back), bits(&rows));
        prop_assert_eq!(bits(&cols), bits(&rows));

        for key in 0..dimension as u32 {
            prop_assert_eq!(back.start_index(key), rows.start_index(key));
        }
    }
}

// Property: presorted input matches the sorting path
proptest! {
    #[test]
    fn prop_presorted_matches_sorted(
        (dimension, mut edges) in prop_edge_batch(1u32..20, 0usize..60),
    ) {
        edges.sort_by_key(|e| (e.row, e.col));

        let sorted = SparseMatrix::new(
            device(),
            edges.clone(),
            dimension,
            BuildOptions::default(),
        )
        .unwrap();
        let presorted = SparseMatrix::new(
            device(),
            edges,
            dimension,
            BuildOptions::default().with_presorted(true),
        )
        .unwrap();

        let sorted: Vec<_> = sorted.iter().copied().collect();
        let presorted: Vec<_> = presorted.iter().copied().collect();
        prop_assert_eq!(sorted, presorted);
    }
}

/// Dimension plus an edge batch whose keys are all below it
fn prop_edge_batch(
    dimension: impl Strategy<Value = u32>,
    num_edges: impl Strategy<Value = usize>,
) -> impl Strategy<Value = (usize, Vec<Edge>)> {
    (dimension, num_edges).prop_flat_map(|(dimension, n)| {
        let edges = prop::collection::vec(
            (0..dimension, 0..dimension, 0.0..100.0f32)
                .prop_map(|(row, col, weight)| Edge::new(row, col, weight)),
            0..=n,
        );
        (Just(dimension as usize), edges)
    })
}

#[cfg(test)]
mod unit_tests {
    use super::*;

    #[test]
    fn test_empty_matrix_invariants() {
        let matrix = SparseMatrix::new(device(), Vec::new(), 5, BuildOptions::default()).unwrap();

        assert!(matrix.check_invariants().is_ok());
        assert_eq!(matrix.keys().count(), 0);
    }

    #[test]
    fn test_duplicate_edges_are_kept() {
        let edges = vec![Edge::new(1, 1, 2.0); 3];
        let matrix = SparseMatrix::new(device(), edges, 2, BuildOptions::default()).unwrap();

        assert_eq!(matrix.entries_for(1).len(), 3);
        assert_eq!(matrix.start_index(1), Some(0));
        assert_eq!(matrix.start_index(0), None);
    }
}
