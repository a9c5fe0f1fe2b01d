use ndarray::{Array1, Array2, Array3, ArrayD, ArrayView1, ArrayView2, ArrayView3, ArrayViewD, Axis, Ix2, Zip};

use super::config::MarginLossConfig;
use super::error::{shape_mismatch, Result};

/// Trait pour les fonctions de perte
pub trait LossFunction: Send + Sync {
    /// Perte moyenne sur le batch.
    fn compute(&self, y_true: &ArrayViewD<f32>, y_pred: &ArrayViewD<f32>) -> Result<f32>;

    /// Gradient de `compute` par rapport à `y_pred`.
    fn gradient(&self, y_true: &ArrayViewD<f32>, y_pred: &ArrayViewD<f32>) -> Result<ArrayD<f32>>;
}

fn same_shape(y_true: &[usize], y_pred: &[usize]) -> Result<()> {
    if y_true != y_pred {
        return Err(shape_mismatch(format!(
            "y_true {y_true:?} et y_pred {y_pred:?} diffèrent"
        )));
    }
    Ok(())
}

/// Longueur de chaque capsule de sortie: (batch, caps, caps_dims) → (batch, caps).
pub fn capsule_lengths(capsules: &ArrayView3<f32>) -> Array2<f32> {
    capsules.map_axis(Axis(2), |capsule| capsule.dot(&capsule).sqrt())
}

/// ∂L/∂capsules à partir de ∂L/∂longueurs: `g · v / ‖v‖`, nul pour une
/// capsule nulle.
pub fn capsule_lengths_backward(capsules: &ArrayView3<f32>, grad_lengths: &ArrayView2<f32>) -> Result<Array3<f32>> {
    let (batch, caps, _) = capsules.dim();
    if grad_lengths.dim() != (batch, caps) {
        return Err(shape_mismatch(format!(
            "gradient {:?} pour des longueurs {:?}",
            grad_lengths.shape(),
            (batch, caps)
        )));
    }
    let mut grad = capsules.to_owned();
    Zip::from(grad.lanes_mut(Axis(2)))
        .and(grad_lengths)
        .for_each(|mut capsule, &g| {
            let length = capsule.dot(&capsule).sqrt();
            let scale = if length > 0.0 { g / length } else { 0.0 };
            capsule.mapv_inplace(|v| v * scale);
        });
    Ok(grad)
}

/// Margin Loss pour CapsNet (Sabour et al., 2017)
///
/// `y_pred` contient des longueurs de capsules (batch, num_caps), `y_true`
/// un encodage one-hot de même forme.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarginLoss {
    pub positive_margin: f32, // m+ = 0.9
    pub negative_margin: f32, // m- = 0.1
    pub down_weighting: f32,  // λ = 0.5
}

impl Default for MarginLoss {
    fn default() -> Self {
        MarginLossConfig::default().into()
    }
}

impl From<MarginLossConfig> for MarginLoss {
    fn from(config: MarginLossConfig) -> Self {
        Self::new(config.positive_margin, config.negative_margin, config.down_weighting)
    }
}

impl MarginLoss {
    pub fn new(positive_margin: f32, negative_margin: f32, down_weighting: f32) -> Self {
        Self {
            positive_margin,
            negative_margin,
            down_weighting,
        }
    }

    /// Perte par exemple: moyenne sur les classes de
    /// `T·max(0, m+ − ‖v‖)² + λ·(1 − T)·max(0, ‖v‖ − m-)²`.
    pub fn per_example(&self, y_true: &ArrayView2<f32>, y_pred: &ArrayView2<f32>) -> Result<Array1<f32>> {
        same_shape(y_true.shape(), y_pred.shape())?;
        let mut terms = Array2::zeros(y_pred.raw_dim());
        Zip::from(&mut terms)
            .and(y_true)
            .and(y_pred)
            .for_each(|term, &t, &length| {
                let p_err = (self.positive_margin - length).max(0.0);
                let n_err = (length - self.negative_margin).max(0.0);
                *term = t * p_err * p_err + self.down_weighting * (1.0 - t) * n_err * n_err;
            });
        terms
            .mean_axis(Axis(1))
            .ok_or_else(|| shape_mismatch("aucune classe"))
    }

    /// Gradient de la perte moyenne sur le batch par rapport aux longueurs.
    pub fn length_gradient(&self, y_true: &ArrayView2<f32>, y_pred: &ArrayView2<f32>) -> Result<Array2<f32>> {
        same_shape(y_true.shape(), y_pred.shape())?;
        let (batch_size, num_caps) = y_pred.dim();
        let scale = 1.0 / (batch_size * num_caps).max(1) as f32;
        let mut grad = Array2::zeros(y_pred.raw_dim());
        Zip::from(&mut grad)
            .and(y_true)
            .and(y_pred)
            .for_each(|g, &t, &length| {
                let p_err = (self.positive_margin - length).max(0.0);
                let n_err = (length - self.negative_margin).max(0.0);
                *g = scale * (-2.0 * t * p_err + 2.0 * self.down_weighting * (1.0 - t) * n_err);
            });
        Ok(grad)
    }
}

impl LossFunction for MarginLoss {
    fn compute(&self, y_true: &ArrayViewD<f32>, y_pred: &ArrayViewD<f32>) -> Result<f32> {
        let y_true = y_true.view().into_dimensionality::<Ix2>()?;
        let y_pred = y_pred.view().into_dimensionality::<Ix2>()?;
        let losses = self.per_example(&y_true, &y_pred)?;
        Ok(losses.mean().unwrap_or(0.0))
    }

    fn gradient(&self, y_true: &ArrayViewD<f32>, y_pred: &ArrayViewD<f32>) -> Result<ArrayD<f32>> {
        let y_true = y_true.view().into_dimensionality::<Ix2>()?;
        let y_pred = y_pred.view().into_dimensionality::<Ix2>()?;
        Ok(self.length_gradient(&y_true, &y_pred)?.into_dyn())
    }
}

/// Perte de reconstruction: erreur quadratique moyenne.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ReconstructionLoss;

impl LossFunction for ReconstructionLoss {
    fn compute(&self, y_true: &ArrayViewD<f32>, y_pred: &ArrayViewD<f32>) -> Result<f32> {
        same_shape(y_true.shape(), y_pred.shape())?;
        let diff = y_true - y_pred;
        Ok(diff.mapv(|x| x * x).mean().unwrap_or(0.0))
    }

    fn gradient(&self, y_true: &ArrayViewD<f32>, y_pred: &ArrayViewD<f32>) -> Result<ArrayD<f32>> {
        same_shape(y_true.shape(), y_pred.shape())?;
        let n = y_pred.len().max(1) as f32;
        Ok((y_pred - y_true) * (2.0 / n))
    }
}

/// Indice du premier maximum d'une ligne.
pub fn argmax(row: &ArrayView1<f32>) -> usize {
    row.iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(best, max), (i, &v)| if v > max { (i, v) } else { (best, max) })
        .0
}

/// Part des exemples dont la capsule la plus longue est la bonne classe.
pub fn accuracy(y_true: &ArrayView2<f32>, y_pred: &ArrayView2<f32>) -> Result<f32> {
    same_shape(y_true.shape(), y_pred.shape())?;
    let batch_size = y_true.nrows();
    if batch_size == 0 {
        return Ok(0.0);
    }
    let correct = y_true
        .rows()
        .into_iter()
        .zip(y_pred.rows())
        .filter(|(t, p)| argmax(t) == argmax(p))
        .count();
    Ok(correct as f32 / batch_size as f32)
}
