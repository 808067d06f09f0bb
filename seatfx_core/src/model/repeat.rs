//! Whole-tensor repetition used to align representation and treatment rows.

use ndarray::{concatenate, Array, Axis, RemoveAxis, Slice};

use crate::error::{EffectError, EffectResult};

/// How representation rows and treatment rows are reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowAlignment {
    Same,
    /// The representation is repeated `copies` times.
    TileRepresentation { copies: usize, rows: usize },
    /// Treatment, outcome and mean are repeated `copies` times.
    TileTreatment { copies: usize },
}

/// Decides the alignment for `representation_rows` against `treatment_rows`.
///
/// The smaller side is tiled when the larger is an exact multiple of it.
pub fn align_rows(representation_rows: usize, treatment_rows: usize) -> EffectResult<RowAlignment> {
    let (n, t) = (representation_rows, treatment_rows);
    if n == t {
        return Ok(RowAlignment::Same);
    }
    if n > 0 && t > n && t % n == 0 {
        return Ok(RowAlignment::TileRepresentation {
            copies: t / n,
            rows: n,
        });
    }
    if t > 0 && n > t && n % t == 0 {
        return Ok(RowAlignment::TileTreatment { copies: n / t });
    }
    Err(EffectError::shape_mismatch(
        format!("row counts that divide each other (representation {})", n),
        t,
        "treatment fusion",
    ))
}

/// Stacks `copies` copies of `x` along the first axis.
pub fn tile_rows<D: RemoveAxis>(x: &Array<f32, D>, copies: usize) -> EffectResult<Array<f32, D>> {
    if copies <= 1 {
        return Ok(x.clone());
    }
    let views = vec![x.view(); copies];
    concatenate(Axis(0), &views)
        .map_err(|err| EffectError::shape_mismatch(x.shape(), err.to_string(), "row tiling"))
}

/// Inverse of [`tile_rows`] for gradients: sums the `copies` blocks of `rows` rows.
pub fn fold_rows<D: RemoveAxis>(x: &Array<f32, D>, rows: usize) -> EffectResult<Array<f32, D>> {
    let total = x.len_of(Axis(0));
    if rows == 0 || total % rows != 0 {
        return Err(EffectError::shape_mismatch(
            format!("a multiple of {}", rows),
            total,
            "row folding",
        ));
    }
    let mut folded = x.slice_axis(Axis(0), Slice::from(0..rows)).to_owned();
    for block in 1..total / rows {
        folded += &x.slice_axis(Axis(0), Slice::from(block * rows..(block + 1) * rows));
    }
    Ok(folded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn alignment_rules() {
        assert_eq!(align_rows(4, 4).unwrap(), RowAlignment::Same);
        assert_eq!(
            align_rows(1, 4).unwrap(),
            RowAlignment::TileRepresentation { copies: 4, rows: 1 }
        );
        assert_eq!(
            align_rows(6, 2).unwrap(),
            RowAlignment::TileTreatment { copies: 3 }
        );
        assert!(matches!(
            align_rows(4, 3),
            Err(EffectError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn tiling_repeats_whole_tensor() {
        let x = array![[1.0, 2.0], [3.0, 4.0]];
        let tiled = tile_rows(&x, 2).unwrap();
        assert_eq!(tiled, array![[1.0, 2.0], [3.0, 4.0], [1.0, 2.0], [3.0, 4.0]]);
    }

    #[test]
    fn folding_sums_tiles() {
        let x = array![[1.0], [2.0], [10.0], [20.0]];
        assert_eq!(fold_rows(&x, 2).unwrap(), array![[11.0], [22.0]]);
        assert!(fold_rows(&x, 3).is_err());
    }
}
