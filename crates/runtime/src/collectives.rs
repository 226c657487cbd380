//! Collectives over the per-core copies of one activation.
//!
//! Each function takes one array per core, in core order, and leaves every
//! core with its post-collective value.

use anyhow::{ensure, Result};
use ndarray::{concatenate, s, Array2, ArrayView2, Axis};
use std::ops::Range;
use tpforge_ir::split_range;

fn sum(parts: &[Array2<f32>]) -> Result<Array2<f32>> {
    let first = parts.first().map(Array2::dim).unwrap_or((0, 0));
    let mut total = Array2::<f32>::zeros(first);
    for (core, part) in parts.iter().enumerate() {
        ensure!(
            part.dim() == first,
            "core {} contributes {:?}, expected {:?}",
            core,
            part.dim(),
            first
        );
        total += part;
    }
    Ok(total)
}

/// Element-wise sum; every core receives the full result.
pub fn all_reduce(parts: &mut [Array2<f32>]) -> Result<()> {
    let total = sum(parts)?;
    for part in parts.iter_mut() {
        part.assign(&total);
    }
    Ok(())
}

/// Row chunk `core` owns out of `rows`.
pub fn row_chunk(rows: usize, tp_degree: usize, core: usize) -> Range<usize> {
    split_range(rows, tp_degree, core)
}

/// Element-wise sum; core `i` receives row chunk `i` of the result.
pub fn reduce_scatter_rows(parts: &mut [Array2<f32>]) -> Result<()> {
    let total = sum(parts)?;
    let tp = parts.len();
    for (core, part) in parts.iter_mut().enumerate() {
        let rows = row_chunk(total.nrows(), tp, core);
        *part = total.slice(s![rows, ..]).to_owned();
    }
    Ok(())
}

/// Each core keeps its own row chunk of a replicated activation.
pub fn scatter_rows(parts: &mut [Array2<f32>]) {
    let tp = parts.len();
    for (core, part) in parts.iter_mut().enumerate() {
        let rows = row_chunk(part.nrows(), tp, core);
        *part = part.slice(s![rows, ..]).to_owned();
    }
}

fn gather(parts: &mut [Array2<f32>], axis: Axis) -> Result<()> {
    let views: Vec<ArrayView2<'_, f32>> = parts.iter().map(Array2::view).collect();
    let full = concatenate(axis, &views)?;
    for part in parts.iter_mut() {
        *part = full.clone();
    }
    Ok(())
}

/// Concatenates row chunks in core order.
pub fn all_gather_rows(parts: &mut [Array2<f32>]) -> Result<()> {
    gather(parts, Axis(0))
}

/// Concatenates column shards in core order.
pub fn all_gather_columns(parts: &mut [Array2<f32>]) -> Result<()> {
    gather(parts, Axis(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn all_reduce_sums_partials() {
        let mut parts = vec![array![[1.0, 2.0]], array![[10.0, 20.0]], array![[0.5, 0.5]]];
        all_reduce(&mut parts).unwrap();
        for part in &parts {
            assert_eq!(part, &array![[11.5, 22.5]]);
        }
    }

    #[test]
    fn reduce_scatter_then_gather_equals_all_reduce() {
        let make = || {
            (0..4)
                .map(|c| Array2::from_shape_fn((6, 3), |(i, j)| (c * 100 + i * 3 + j) as f32))
                .collect::<Vec<_>>()
        };
        let mut reduced = make();
        all_reduce(&mut reduced).unwrap();

        let mut scattered = make();
        reduce_scatter_rows(&mut scattered).unwrap();
        assert_eq!(scattered[0].nrows(), 2);
        assert_eq!(scattered[3].nrows(), 1);
        all_gather_rows(&mut scattered).unwrap();
        assert_eq!(scattered, reduced);
    }

    #[test]
    fn single_row_scatter_leaves_empty_chunks() {
        let mut parts = vec![Array2::<f32>::ones((1, 4)); 4];
        scatter_rows(&mut parts);
        assert_eq!(parts[0].nrows(), 1);
        assert!(parts[1..].iter().all(|p| p.nrows() == 0));
        all_gather_rows(&mut parts).unwrap();
        assert!(parts.iter().all(|p| p.dim() == (1, 4)));
    }

    #[test]
    fn column_gather_orders_by_core() {
        let mut parts = vec![array![[1.0, 2.0]], array![[3.0]]];
        all_gather_columns(&mut parts).unwrap();
        assert_eq!(parts[1], array![[1.0, 2.0, 3.0]]);
    }

    #[test]
    fn mismatched_shapes_are_rejected() {
        let mut parts = vec![Array2::<f32>::zeros((2, 2)), Array2::<f32>::zeros((3, 2))];
        assert!(all_reduce(&mut parts).is_err());
    }
}
