use ndarray::{Array, ArrayBase, Axis, Data, Dimension, IxDyn, Zip};

use super::error::{shape_mismatch, CapsError, Result};

/// Epsilon de stabilité numérique sous la racine du squash.
pub const EPSILON: f32 = 1e-7;

/// Nombre d'axes exigé par le softmax conjoint du routage convolutif.
pub const JOINT_SOFTMAX_AXES: usize = 3;

fn check_axis(axis: Axis, ndim: usize) -> Result<()> {
    if axis.index() >= ndim {
        return Err(CapsError::InvalidAxis {
            axis: axis.index(),
            ndim,
        });
    }
    Ok(())
}

/// Squash d'une capsule le long de `axis`.
///
/// Chaque vecteur `v` devient `‖v‖²/(1+‖v‖²) · v/‖v‖`: même direction,
/// longueur dans [0, 1). Le vecteur nul reste nul.
pub fn squash<S, D>(data: &ArrayBase<S, D>, axis: Axis) -> Result<Array<f32, D>>
where
    S: Data<Elem = f32>,
    D: Dimension,
{
    check_axis(axis, data.ndim())?;
    Ok(squash_along(data, axis))
}

/// `squash` sans contrôle, pour des axes connus valides.
pub(crate) fn squash_along<S, D>(data: &ArrayBase<S, D>, axis: Axis) -> Array<f32, D>
where
    S: Data<Elem = f32>,
    D: Dimension,
{
    let mut result = data.to_owned();
    for mut lane in result.lanes_mut(axis) {
        let square_sum: f32 = lane.iter().map(|v| v * v).sum();
        let squash_factor = square_sum / (1.0 + square_sum);
        let factor = squash_factor / (square_sum + EPSILON).sqrt();
        lane.mapv_inplace(|v| v * factor);
    }
    result
}

/// Produit vecteur-jacobienne du squash.
///
/// Avec `s = ‖x‖²` et `y = f(s)·x`: `∂L/∂x = f(s)·g + 2·f'(s)·⟨x, g⟩·x`.
pub fn squash_backward<S1, S2, D>(data: &ArrayBase<S1, D>, grad: &ArrayBase<S2, D>, axis: Axis) -> Result<Array<f32, D>>
where
    S1: Data<Elem = f32>,
    S2: Data<Elem = f32>,
    D: Dimension,
{
    check_axis(axis, data.ndim())?;
    if data.shape() != grad.shape() {
        return Err(shape_mismatch(format!(
            "gradient {:?} pour une entrée {:?}",
            grad.shape(),
            data.shape()
        )));
    }

    let mut result = Array::zeros(data.raw_dim());
    Zip::from(result.lanes_mut(axis))
        .and(data.lanes(axis))
        .and(grad.lanes(axis))
        .for_each(|mut out, x, g| {
            let s: f32 = x.dot(&x);
            let root = (s + EPSILON).sqrt();
            let factor = s / ((1.0 + s) * root);
            let derivative = 1.0 / ((1.0 + s) * (1.0 + s) * root) - s / (2.0 * (1.0 + s) * root * root * root);
            let projection = 2.0 * derivative * x.dot(&g);
            Zip::from(&mut out)
                .and(&x)
                .and(&g)
                .for_each(|o, &xv, &gv| *o = factor * gv + projection * xv);
        });
    Ok(result)
}

/// Softmax sur un ensemble explicite d'axes.
///
/// Calcule `exp(x) / Σ exp(x)` où la somme porte sur tous les `axes` à la
/// fois (keepdims). Le max est soustrait avant l'exponentielle, ce qui ne
/// change pas le résultat.
pub fn softmax<S, D>(data: &ArrayBase<S, D>, axes: &[usize]) -> Result<Array<f32, D>>
where
    S: Data<Elem = f32>,
    D: Dimension,
{
    let ndim = data.ndim();
    if axes.is_empty() {
        return Err(CapsError::InvalidSoftmaxAxes {
            expected: 1,
            got: 0,
        });
    }
    for (i, &axis) in axes.iter().enumerate() {
        if axis >= ndim || axes[..i].contains(&axis) {
            return Err(CapsError::InvalidAxis { axis, ndim });
        }
    }
    if data.is_empty() {
        return Ok(data.to_owned());
    }

    // Axes normalisés en dernier, puis vue 2D (lignes = groupes normalisés)
    let order: Vec<usize> = (0..ndim)
        .filter(|axis| !axes.contains(axis))
        .chain(axes.iter().copied())
        .collect();
    let permuted = data.view().into_dyn().permuted_axes(IxDyn(&order));
    let permuted_shape = permuted.shape().to_vec();
    let inner: usize = axes.iter().map(|&axis| data.shape()[axis]).product();
    let outer = data.len() / inner;

    let mut rows = permuted
        .as_standard_layout()
        .into_owned()
        .into_shape_with_order((outer, inner))?;
    for mut row in rows.rows_mut() {
        let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row /= sum;
    }

    let mut inverse = vec![0; ndim];
    for (position, &axis) in order.iter().enumerate() {
        inverse[axis] = position;
    }
    let restored = rows
        .into_shape_with_order(IxDyn(&permuted_shape))?
        .permuted_axes(IxDyn(&inverse));
    Ok(restored.into_dimensionality::<D>()?)
}

/// Softmax conjoint sur exactement trois axes (routage convolutif).
pub fn joint_softmax<S, D>(data: &ArrayBase<S, D>, axes: &[usize]) -> Result<Array<f32, D>>
where
    S: Data<Elem = f32>,
    D: Dimension,
{
    if axes.len() != JOINT_SOFTMAX_AXES {
        return Err(CapsError::InvalidSoftmaxAxes {
            expected: JOINT_SOFTMAX_AXES,
            got: axes.len(),
        });
    }
    softmax(data, axes)
}

/// Produit vecteur-jacobienne du softmax sur `axes`, à partir de sa sortie:
/// `∂L/∂x = y ⊙ (g − Σ_axes y ⊙ g)`.
pub fn softmax_backward<S1, S2, D>(output: &ArrayBase<S1, D>, grad: &ArrayBase<S2, D>, axes: &[usize]) -> Result<Array<f32, D>>
where
    S1: Data<Elem = f32>,
    S2: Data<Elem = f32>,
    D: Dimension,
{
    let ndim = output.ndim();
    if axes.is_empty() {
        return Err(CapsError::InvalidSoftmaxAxes {
            expected: 1,
            got: 0,
        });
    }
    for &axis in axes {
        check_axis(Axis(axis), ndim)?;
    }
    if output.shape() != grad.shape() {
        return Err(shape_mismatch(format!(
            "gradient {:?} pour un softmax {:?}",
            grad.shape(),
            output.shape()
        )));
    }

    let y = output.view().into_dyn();
    let g = grad.view().into_dyn();
    let mut sorted = axes.to_vec();
    sorted.sort_unstable_by(|a, b| b.cmp(a));
    let mut dot = &y * &g;
    for axis in sorted {
        dot = dot.sum_axis(Axis(axis)).insert_axis(Axis(axis));
    }
    let result = &y * &(&g - &dot);
    Ok(result.into_dimensionality::<D>()?)
}
