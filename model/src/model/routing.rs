use ndarray::{Array, Array3, Array4, Array5, Array6, ArrayView, ArrayView4, ArrayView6, Axis, Dimension, Ix3, Ix4, Ix5, Ix6};
use serde::{Deserialize, Serialize};

use super::activations::{joint_softmax, softmax, softmax_backward, squash_along, squash_backward};
use super::error::{shape_mismatch, CapsError, Result};

/// Axes normalisés par le routage convolutif: (rows, cols, caps_filters)
/// des logits (batch, rows, cols, caps_filters, input_caps_filters).
pub const CONV_COUPLING_AXES: [usize; 3] = [1, 2, 3];

/// Axe normalisé par le routage dense: les capsules de sortie des logits
/// (batch, input_caps, caps).
pub const DENSE_COUPLING_AXIS: usize = 2;

/// Une paramétrisation du routage par accord.
///
/// La stratégie connaît la forme des logits, les axes de normalisation et
/// les contractions; `DynamicRouting` ne fait qu'enchaîner les étapes.
/// Les méthodes `*_backward` sont les produits vecteur-jacobienne des
/// étapes correspondantes.
pub trait RoutingStrategy {
    type LogitDim: Dimension;
    type OutputDim: Dimension;
    type PredictionDim: Dimension;

    /// Logits initiaux, tous nuls.
    fn zero_logits(&self) -> Array<f32, Self::LogitDim>;

    /// Coefficients de couplage (softmax des logits).
    fn coupling(&self, logits: &Array<f32, Self::LogitDim>) -> Result<Array<f32, Self::LogitDim>>;

    /// Somme des prédictions pondérée par le couplage, avant squash.
    fn weighted_sum(&self, coupling: &Array<f32, Self::LogitDim>) -> Array<f32, Self::OutputDim>;

    /// Axe des caps_dims dans la sortie.
    fn capsule_axis(&self) -> Axis;

    /// Somme pondérée puis squash sur caps_dims.
    fn aggregate(&self, coupling: &Array<f32, Self::LogitDim>) -> Array<f32, Self::OutputDim> {
        squash_along(&self.weighted_sum(coupling), self.capsule_axis())
    }

    /// Produit scalaire entre chaque prédiction et la sortie routée.
    fn agreement(&self, routed: &Array<f32, Self::OutputDim>) -> Array<f32, Self::LogitDim>;

    fn coupling_backward(
        &self,
        coupling: &Array<f32, Self::LogitDim>,
        grad: &Array<f32, Self::LogitDim>,
    ) -> Result<Array<f32, Self::LogitDim>>;

    /// Renvoie (∂L/∂couplage, ∂L/∂prédictions).
    fn weighted_sum_backward(
        &self,
        coupling: &Array<f32, Self::LogitDim>,
        grad: &Array<f32, Self::OutputDim>,
    ) -> (Array<f32, Self::LogitDim>, Array<f32, Self::PredictionDim>);

    /// Renvoie (∂L/∂sortie routée, ∂L/∂prédictions).
    fn agreement_backward(
        &self,
        routed: &Array<f32, Self::OutputDim>,
        grad: &Array<f32, Self::LogitDim>,
    ) -> (Array<f32, Self::OutputDim>, Array<f32, Self::PredictionDim>);
}

/// Enchaînement des étapes de routage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoutingSchedule {
    /// `n` fois: couplage, agrégation, accord. `n` squash.
    Standard,
    /// Une agrégation préalable, puis `n` fois: accord, couplage,
    /// agrégation. `n + 1` squash.
    WarmUp,
}

impl RoutingSchedule {
    /// Nombre d'agrégations (donc de squash) pour `iterations` itérations.
    pub fn aggregation_steps(self, iterations: usize) -> usize {
        match self {
            RoutingSchedule::Standard => iterations,
            RoutingSchedule::WarmUp => iterations + 1,
        }
    }
}

/// État intermédiaire d'une agrégation, conservé pour la rétropropagation.
struct RoutingStep<L: Dimension, O: Dimension> {
    coupling: Array<f32, L>,
    weighted: Array<f32, O>,
    routed: Array<f32, O>,
}

/// Routage dynamique par accord.
///
/// Les logits sont créés à chaque appel de `route` et n'y survivent pas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DynamicRouting {
    iterations: usize,
    schedule: RoutingSchedule,
}

impl DynamicRouting {
    pub fn new(iterations: usize, schedule: RoutingSchedule) -> Result<Self> {
        if iterations == 0 {
            return Err(CapsError::InvalidRoutingIterations(iterations));
        }
        Ok(Self {
            iterations,
            schedule,
        })
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn schedule(&self) -> RoutingSchedule {
        self.schedule
    }

    pub fn aggregation_steps(&self) -> usize {
        self.schedule.aggregation_steps(self.iterations)
    }

    pub fn route<S: RoutingStrategy>(&self, strategy: &S) -> Result<Array<f32, S::OutputDim>> {
        let mut logits = strategy.zero_logits();

        match self.schedule {
            RoutingSchedule::Standard => {
                let mut routed = None;
                for _ in 0..self.iterations {
                    let coupling = strategy.coupling(&logits)?;
                    let output = strategy.aggregate(&coupling);
                    logits += &strategy.agreement(&output);
                    routed = Some(output);
                }
                routed.ok_or(CapsError::InvalidRoutingIterations(self.iterations))
            }
            RoutingSchedule::WarmUp => {
                let mut routed = strategy.aggregate(&strategy.coupling(&logits)?);
                for _ in 0..self.iterations {
                    logits += &strategy.agreement(&routed);
                    routed = strategy.aggregate(&strategy.coupling(&logits)?);
                }
                Ok(routed)
            }
        }
    }

    /// Les deux calendriers se ramènent à `aggregation_steps()` agrégations,
    /// séparées par une mise à jour des logits. L'accord final du calendrier
    /// standard n'influence pas la sortie et n'est pas rejoué.
    fn trace<S: RoutingStrategy>(&self, strategy: &S) -> Result<Vec<RoutingStep<S::LogitDim, S::OutputDim>>> {
        let steps = self.aggregation_steps();
        let mut logits = strategy.zero_logits();
        let mut trace: Vec<RoutingStep<S::LogitDim, S::OutputDim>> = Vec::with_capacity(steps);
        for _ in 0..steps {
            if let Some(previous) = trace.last() {
                logits += &strategy.agreement(&previous.routed);
            }
            let coupling = strategy.coupling(&logits)?;
            let weighted = strategy.weighted_sum(&coupling);
            let routed = squash_along(&weighted, strategy.capsule_axis());
            trace.push(RoutingStep {
                coupling,
                weighted,
                routed,
            });
        }
        Ok(trace)
    }

    /// Rétropropagation à travers toutes les itérations de routage, logits
    /// compris: renvoie ∂L/∂prédictions à partir de ∂L/∂sortie.
    pub fn route_backward<S: RoutingStrategy>(
        &self,
        strategy: &S,
        grad_output: &ArrayView<f32, S::OutputDim>,
    ) -> Result<Array<f32, S::PredictionDim>> {
        let trace = self.trace(strategy)?;
        let last = trace.last().ok_or(CapsError::InvalidRoutingIterations(self.iterations))?;
        if last.routed.shape() != grad_output.shape() {
            return Err(shape_mismatch(format!(
                "gradient {:?} pour une sortie routée {:?}",
                grad_output.shape(),
                last.routed.shape()
            )));
        }

        let mut grad_prediction: Option<Array<f32, S::PredictionDim>> = None;
        let mut accumulate = |grad: Array<f32, S::PredictionDim>| {
            grad_prediction = Some(match grad_prediction.take() {
                Some(total) => total + &grad,
                None => grad,
            });
        };

        // Gradient des logits qui suivent l'étape courante
        let mut grad_logits: Option<Array<f32, S::LogitDim>> = None;
        for step in trace.iter().rev() {
            let grad_routed = match &grad_logits {
                None => grad_output.to_owned(),
                Some(grad_agreement) => {
                    let (grad_routed, grad_pred) = strategy.agreement_backward(&step.routed, grad_agreement);
                    accumulate(grad_pred);
                    grad_routed
                }
            };
            let grad_weighted = squash_backward(&step.weighted, &grad_routed, strategy.capsule_axis())?;
            let (grad_coupling, grad_pred) = strategy.weighted_sum_backward(&step.coupling, &grad_weighted);
            accumulate(grad_pred);
            let grad_step_logits = strategy.coupling_backward(&step.coupling, &grad_coupling)?;
            // logits_{k+1} = logits_k + accord_k
            grad_logits = Some(match grad_logits {
                Some(next) => next + &grad_step_logits,
                None => grad_step_logits,
            });
        }

        grad_prediction.ok_or(CapsError::InvalidRoutingIterations(self.iterations))
    }
}

/// Routage capsule-vers-capsule convolutif, indépendant par position.
///
/// Prédictions: (batch, rows, cols, input_caps_filters, caps_filters, caps_dims).
pub struct ConvRouting<'a> {
    prediction: ArrayView6<'a, f32>,
}

impl<'a> ConvRouting<'a> {
    pub fn new(prediction: ArrayView6<'a, f32>) -> Self {
        Self { prediction }
    }

    /// (b, r, c, s, t) ⊗ (b, r, c, s, u) -> (b, r, c, t, s, u)
    fn outer(weights: &Array5<f32>, vectors: &Array5<f32>) -> Array6<f32> {
        let weights = weights.view().permuted_axes([0, 1, 2, 4, 3]).insert_axis(Axis(5));
        let vectors = vectors.view().insert_axis(Axis(3));
        &weights * &vectors
    }
}

impl RoutingStrategy for ConvRouting<'_> {
    type LogitDim = Ix5;
    type OutputDim = Ix5;
    type PredictionDim = Ix6;

    fn zero_logits(&self) -> Array5<f32> {
        let (batch, rows, cols, input_caps_filters, caps_filters, _) = self.prediction.dim();
        Array5::zeros((batch, rows, cols, caps_filters, input_caps_filters))
    }

    fn coupling(&self, logits: &Array5<f32>) -> Result<Array5<f32>> {
        joint_softmax(logits, &CONV_COUPLING_AXES)
    }

    fn weighted_sum(&self, coupling: &Array5<f32>) -> Array5<f32> {
        // (b, r, c, s, t) -> (b, r, c, t, s, 1)
        let weights = coupling
            .view()
            .permuted_axes([0, 1, 2, 4, 3])
            .insert_axis(Axis(5));
        (&self.prediction * &weights).sum_axis(Axis(3))
    }

    fn capsule_axis(&self) -> Axis {
        Axis(4)
    }

    fn agreement(&self, routed: &Array5<f32>) -> Array5<f32> {
        // (b, r, c, s, u) -> (b, r, c, 1, s, u)
        let routed = routed.view().insert_axis(Axis(3));
        (&self.prediction * &routed)
            .sum_axis(Axis(5))
            .permuted_axes([0, 1, 2, 4, 3])
    }

    fn coupling_backward(&self, coupling: &Array5<f32>, grad: &Array5<f32>) -> Result<Array5<f32>> {
        softmax_backward(coupling, grad, &CONV_COUPLING_AXES)
    }

    fn weighted_sum_backward(&self, coupling: &Array5<f32>, grad: &Array5<f32>) -> (Array5<f32>, Array6<f32>) {
        (self.agreement(grad), Self::outer(coupling, grad))
    }

    fn agreement_backward(&self, routed: &Array5<f32>, grad: &Array5<f32>) -> (Array5<f32>, Array6<f32>) {
        (self.weighted_sum(grad), Self::outer(grad, routed))
    }
}

/// Routage dense sur tout l'axe des capsules d'entrée.
///
/// Prédictions: (batch, input_caps, caps, caps_dims).
pub struct DenseRouting<'a> {
    prediction: ArrayView4<'a, f32>,
}

impl<'a> DenseRouting<'a> {
    pub fn new(prediction: ArrayView4<'a, f32>) -> Self {
        Self { prediction }
    }

    /// (b, i, j) ⊗ (b, j, d) -> (b, i, j, d)
    fn outer(weights: &Array3<f32>, vectors: &Array3<f32>) -> Array4<f32> {
        &weights.view().insert_axis(Axis(3)) * &vectors.view().insert_axis(Axis(1))
    }
}

impl RoutingStrategy for DenseRouting<'_> {
    type LogitDim = Ix3;
    type OutputDim = Ix3;
    type PredictionDim = Ix4;

    fn zero_logits(&self) -> Array3<f32> {
        let (batch, input_caps, caps, _) = self.prediction.dim();
        Array3::zeros((batch, input_caps, caps))
    }

    fn coupling(&self, logits: &Array3<f32>) -> Result<Array3<f32>> {
        softmax(logits, &[DENSE_COUPLING_AXIS])
    }

    fn weighted_sum(&self, coupling: &Array3<f32>) -> Array3<f32> {
        let weights = coupling.view().insert_axis(Axis(3));
        (&self.prediction * &weights).sum_axis(Axis(1))
    }

    fn capsule_axis(&self) -> Axis {
        Axis(2)
    }

    fn agreement(&self, routed: &Array3<f32>) -> Array3<f32> {
        let routed = routed.view().insert_axis(Axis(1));
        (&self.prediction * &routed).sum_axis(Axis(3))
    }

    fn coupling_backward(&self, coupling: &Array3<f32>, grad: &Array3<f32>) -> Result<Array3<f32>> {
        softmax_backward(coupling, grad, &[DENSE_COUPLING_AXIS])
    }

    fn weighted_sum_backward(&self, coupling: &Array3<f32>, grad: &Array3<f32>) -> (Array3<f32>, Array4<f32>) {
        (self.agreement(grad), Self::outer(coupling, grad))
    }

    fn agreement_backward(&self, routed: &Array3<f32>, grad: &Array3<f32>) -> (Array3<f32>, Array4<f32>) {
        (self.weighted_sum(grad), Self::outer(grad, routed))
    }
}
