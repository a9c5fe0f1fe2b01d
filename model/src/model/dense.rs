use ndarray::linalg::{general_mat_mul, general_mat_vec_mul};
use ndarray::{s, Array, Array3, Array4, ArrayView3, ArrayView5, Axis, Ix3, Ix5};
use ndarray_rand::rand_distr::Normal;
use ndarray_rand::RandomExt;
use rand::RngCore;
use rayon::prelude::*;
use tracing::debug;

use super::capsule::CapsuleRoutingLayer;
use super::config::{CapsDenseConfig, LayerConfig};
use super::error::{expect_rank, invalid_config, shape_mismatch, CapsError, Result};
use super::parameter::{LayerGradients, Parameter};
use super::routing::{DenseRouting, DynamicRouting, RoutingSchedule};

/// Écart-type de l'initialisation normale des matrices de transformation.
pub const WEIGHT_STDDEV: f32 = 0.05;

struct CapsDenseWeights {
    input_caps: usize,
    input_caps_dims: usize,
    /// (1, input_caps, caps, caps_dims, input_caps_dims)
    w: Parameter,
}

/// Couche de capsules dense.
///
/// Chaque capsule d'entrée est reliée à chaque capsule de sortie par une
/// matrice apprise `caps_dims × input_caps_dims`. Le routage fait une
/// agrégation initiale avant ses `routing_iter` itérations, soit
/// `routing_iter + 1` squash (contrairement à `CapsConv`).
pub struct CapsDense {
    config: CapsDenseConfig,
    routing: DynamicRouting,
    weights: Option<CapsDenseWeights>,
}

impl CapsDense {
    pub fn new(config: CapsDenseConfig) -> Result<Self> {
        config.validate()?;
        let routing = DynamicRouting::new(config.routing_iter, RoutingSchedule::WarmUp)?;
        Ok(Self {
            config,
            routing,
            weights: None,
        })
    }

    pub fn from_config(config: &LayerConfig) -> Result<Self> {
        match config {
            LayerConfig::CapsDense(c) => Self::new(CapsDenseConfig::new(c.caps, c.caps_dims, c.routing_iter)),
            other => Err(CapsError::InvalidConfig(format!(
                "CapsDense attendu, reçu {}",
                other.class_name()
            ))),
        }
    }

    pub fn config(&self) -> &CapsDenseConfig {
        &self.config
    }

    /// Matrices de transformation, si la couche est construite.
    pub fn transform(&self) -> Option<&Parameter> {
        self.weights.as_ref().map(|w| &w.w)
    }

    fn built_for(&self, inputs: &ArrayView5<f32>) -> Result<&CapsDenseWeights> {
        let weights = self.weights.as_ref().ok_or(CapsError::NotBuilt("CapsDense"))?;
        let (_, rows, cols, filters, dims) = inputs.dim();
        if rows * cols * filters != weights.input_caps || dims != weights.input_caps_dims {
            return Err(shape_mismatch(format!(
                "CapsDense construite pour {} capsules de dimension {}, reçu {}x{}x{} de dimension {dims}",
                weights.input_caps, weights.input_caps_dims, rows, cols, filters
            )));
        }
        Ok(weights)
    }

    /// Prédictions û[b, i, j] = W[i, j] · u[b, i], forme (batch, input_caps, caps, caps_dims).
    fn predict(&self, weights: &CapsDenseWeights, inputs: &ArrayView5<f32>) -> Result<Array4<f32>> {
        let batch_size = inputs.dim().0;
        let flat = inputs.to_shape((batch_size, weights.input_caps, weights.input_caps_dims))?;
        let capsules = flat.view();
        let w = weights
            .w
            .value()
            .view()
            .into_dimensionality::<Ix5>()?
            .index_axis_move(Axis(0), 0);

        let mut prediction = Array4::zeros((batch_size, weights.input_caps, self.config.caps, self.config.caps_dims));

        // Même matrice pour tout le batch
        prediction
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(b, mut out_batch)| {
                for i in 0..weights.input_caps {
                    let u = capsules.slice(s![b, i, ..]);
                    for j in 0..self.config.caps {
                        let mut u_hat = out_batch.slice_mut(s![i, j, ..]);
                        general_mat_vec_mul(1.0, &w.slice(s![i, j, .., ..]), &u, 0.0, &mut u_hat);
                    }
                }
            });

        Ok(prediction)
    }
}

impl CapsuleRoutingLayer for CapsDense {
    type OutputDim = Ix3;

    fn build_with_rng(&mut self, input_shape: &[usize], rng: &mut dyn RngCore) -> Result<()> {
        expect_rank(input_shape, 5)?;
        let input_caps = input_shape[1] * input_shape[2] * input_shape[3];
        let input_caps_dims = input_shape[4];
        if input_caps == 0 || input_caps_dims == 0 {
            return Err(shape_mismatch(format!("capsules d'entrée vides: {input_shape:?}")));
        }

        let normal = Normal::new(0.0, WEIGHT_STDDEV).map_err(|e| invalid_config(e.to_string()))?;
        let shape = (1, input_caps, self.config.caps, self.config.caps_dims, input_caps_dims);
        let w = Array::random_using(shape, normal, rng);

        debug!(
            input = ?input_shape,
            input_caps,
            input_caps_dims,
            caps = self.config.caps,
            caps_dims = self.config.caps_dims,
            "CapsDense construite"
        );

        self.config.input_caps = Some(input_caps);
        self.config.input_caps_dims = Some(input_caps_dims);
        self.weights = Some(CapsDenseWeights {
            input_caps,
            input_caps_dims,
            w: Parameter::new("caps_dense/w", w.into_dyn()),
        });
        Ok(())
    }

    fn is_built(&self) -> bool {
        self.weights.is_some()
    }

    /// (batch, rows, cols, input_caps_filters, input_caps_dims) → (batch, caps, caps_dims)
    fn call(&self, inputs: &ArrayView5<f32>) -> Result<Array3<f32>> {
        let weights = self.built_for(inputs)?;
        let prediction = self.predict(weights, inputs)?;
        self.routing.route(&DenseRouting::new(prediction.view()))
    }

    /// ∂W[i, j] = Σ_b ∂û[b, i, j] ⊗ u[b, i] et ∂u[b, i] = Σ_j W[i, j]ᵀ · ∂û[b, i, j],
    /// où ∂û traverse l'agrégation initiale et chaque itération.
    fn backward(&self, inputs: &ArrayView5<f32>, grad_output: &ArrayView3<f32>) -> Result<LayerGradients<Ix5>> {
        let weights = self.built_for(inputs)?;
        let prediction = self.predict(weights, inputs)?;
        let grad_prediction = self
            .routing
            .route_backward(&DenseRouting::new(prediction.view()), grad_output)?;

        let batch_size = inputs.dim().0;
        let flat = inputs.to_shape((batch_size, weights.input_caps, weights.input_caps_dims))?;
        let capsules = flat.view();
        let w = weights
            .w
            .value()
            .view()
            .into_dimensionality::<Ix5>()?
            .index_axis_move(Axis(0), 0);

        let mut grad_capsules = Array3::zeros((batch_size, weights.input_caps, weights.input_caps_dims));
        let grad_w = grad_capsules
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .map(|(b, mut grad_batch)| {
                let mut grad_w = Array4::<f32>::zeros(w.raw_dim());
                for i in 0..weights.input_caps {
                    let u = capsules.slice(s![b, i, ..]);
                    for j in 0..self.config.caps {
                        let g = grad_prediction.slice(s![b, i, j, ..]);
                        general_mat_mul(
                            1.0,
                            &g.view().insert_axis(Axis(1)),
                            &u.view().insert_axis(Axis(0)),
                            1.0,
                            &mut grad_w.slice_mut(s![i, j, .., ..]),
                        );
                        general_mat_vec_mul(1.0, &w.slice(s![i, j, .., ..]).t(), &g, 1.0, &mut grad_batch.slice_mut(s![i, ..]));
                    }
                }
                grad_w
            })
            .reduce(|| Array4::zeros(w.raw_dim()), |a, b| a + b);

        Ok(LayerGradients {
            input: grad_capsules.into_shape_with_order(inputs.raw_dim())?,
            params: vec![grad_w.insert_axis(Axis(0)).into_dyn()],
        })
    }

    fn output_shape(&self, input_shape: &[usize]) -> Result<Vec<usize>> {
        expect_rank(input_shape, 5)?;
        Ok(vec![input_shape[0], self.config.caps, self.config.caps_dims])
    }

    fn get_config(&self) -> LayerConfig {
        LayerConfig::CapsDense(self.config.clone())
    }

    fn routing(&self) -> &DynamicRouting {
        &self.routing
    }

    fn parameters(&self) -> Vec<&Parameter> {
        self.weights.iter().map(|w| &w.w).collect()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        self.weights.iter_mut().map(|w| &mut w.w).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::activations::squash;
    use ndarray::{Array1, Array5};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn capsule_input(shape: (usize, usize, usize, usize, usize)) -> Array5<f32> {
        Array5::from_shape_fn(shape, |(b, r, c, f, d)| {
            (((b * 29 + r * 11 + c * 5 + f * 3 + d) % 17) as f32 - 8.0) * 0.04
        })
    }

    fn built(caps: usize, caps_dims: usize, routing_iter: usize, input_shape: &[usize]) -> CapsDense {
        let mut layer = CapsDense::new(CapsDenseConfig::new(caps, caps_dims, routing_iter)).unwrap();
        layer
            .build_with_rng(input_shape, &mut StdRng::seed_from_u64(42))
            .unwrap();
        layer
    }

    #[test]
    fn test_mnist_like_scenario() {
        let layer = built(10, 16, 3, &[2, 6, 6, 8, 8]);
        let output = layer.call(&capsule_input((2, 6, 6, 8, 8)).view()).unwrap();
        assert_eq!(output.dim(), (2, 10, 16));
        assert!(output.iter().all(|v| v.is_finite()));
        for capsule in output.lanes(Axis(2)) {
            assert!(capsule.dot(&capsule).sqrt() < 1.0);
        }
    }

    #[test]
    fn test_weight_shape() {
        let layer = built(10, 16, 3, &[2, 6, 6, 8, 8]);
        assert_eq!(layer.transform().unwrap().shape(), &[1, 288, 10, 16, 8]);
    }

    #[test]
    fn test_build_requires_rank_five() {
        let mut layer = CapsDense::new(CapsDenseConfig::new(10, 16, 3)).unwrap();
        assert!(matches!(
            layer.build(&[2, 1152, 8]),
            Err(CapsError::RankMismatch { expected: 5, got: 3 })
        ));
    }

    #[test]
    fn test_call_before_build() {
        let layer = CapsDense::new(CapsDenseConfig::new(10, 16, 3)).unwrap();
        let input = capsule_input((1, 2, 2, 2, 4));
        assert!(matches!(layer.call(&input.view()), Err(CapsError::NotBuilt("CapsDense"))));
    }

    #[test]
    fn test_zero_iterations_rejected() {
        assert!(matches!(
            CapsDense::new(CapsDenseConfig::new(10, 16, 0)),
            Err(CapsError::InvalidRoutingIterations(0))
        ));
    }

    #[test]
    fn test_single_iteration_squashes_twice() {
        let layer = built(2, 2, 1, &[1, 1, 3, 1, 2]);
        assert_eq!(layer.routing().schedule(), RoutingSchedule::WarmUp);
        assert_eq!(layer.routing().aggregation_steps(), 2);

        let input = capsule_input((1, 1, 3, 1, 2)).mapv(|v| v * 50.0);
        let output = layer.call(&input.view()).unwrap();
        let prediction = layer.predict(layer.weights.as_ref().unwrap(), &input.view()).unwrap();
        let squash_vec = |v: Array1<f32>| squash(&v, Axis(0)).unwrap();

        // Agrégation initiale, couplage uniforme sur les 2 capsules de sortie
        let first: Vec<Array1<f32>> = (0..2)
            .map(|j| squash_vec(prediction.slice(s![0, .., j, ..]).sum_axis(Axis(0)) * 0.5))
            .collect();
        // Une itération: accord, softmax par capsule d'entrée, agrégation
        let mut second = vec![Array1::<f32>::zeros(2); 2];
        for i in 0..3 {
            let logits: Vec<f32> = (0..2).map(|j| { let p: ndarray::ArrayView1<f32> = prediction.slice(s![0, i, j, ..]); p.dot(&first[j]) }).collect();
            let total: f32 = logits.iter().map(|l| l.exp()).sum();
            for j in 0..2 {
                second[j] = &second[j] + &(prediction.slice(s![0, i, j, ..]).to_owned() * (logits[j].exp() / total));
            }
        }
        let second: Vec<Array1<f32>> = second.into_iter().map(squash_vec).collect();

        for j in 0..2 {
            for d in 0..2 {
                assert!((output[[0, j, d]] - second[j][d]).abs() < 1e-5);
            }
        }
        let single_squash_gap: f32 = (0..2)
            .map(|j| (&output.slice(s![0, j, ..]) - &first[j]).mapv(f32::abs).sum())
            .sum();
        assert!(single_squash_gap > 1e-4);
    }

    fn coeff(index: &[usize]) -> f32 {
        let flat: usize = index.iter().enumerate().map(|(k, i)| (2 * k + 3) * i).sum();
        (flat % 7) as f32 * 0.3 - 0.9
    }

    fn weighted_sum(output: &Array3<f32>) -> f32 {
        output.indexed_iter().map(|((b, j, d), v)| v * coeff(&[b, j, d])).sum()
    }

    #[test]
    fn test_backward_matches_finite_difference() {
        let mut layer = built(3, 2, 2, &[2, 1, 2, 2, 3]);
        let input = capsule_input((2, 1, 2, 2, 3)).mapv(|v| v * 10.0);
        let grad_output = Array3::from_shape_fn((2, 3, 2), |(b, j, d)| coeff(&[b, j, d]));
        let grads = layer.backward(&input.view(), &grad_output.view()).unwrap();
        assert_eq!(grads.input.dim(), input.dim());
        assert_eq!(grads.params[0].shape(), &[1, 4, 3, 2, 3]);

        let h = 1e-2;
        for index in [[0, 0, 0, 0, 0], [0, 0, 1, 1, 2], [1, 0, 1, 0, 1]] {
            let (mut plus, mut minus) = (input.clone(), input.clone());
            plus[index] += h;
            minus[index] -= h;
            let numeric = (weighted_sum(&layer.call(&plus.view()).unwrap())
                - weighted_sum(&layer.call(&minus.view()).unwrap()))
                / (2.0 * h);
            let analytic = grads.input[index];
            assert!((analytic - numeric).abs() < 3e-3 + 2e-2 * numeric.abs(), "{index:?}: {analytic} vs {numeric}");
        }

        for index in [[0, 0, 0, 0, 0], [0, 2, 1, 1, 2], [0, 3, 2, 0, 1]] {
            layer.parameters_mut()[0].nudge(&index, h);
            let up = weighted_sum(&layer.call(&input.view()).unwrap());
            layer.parameters_mut()[0].nudge(&index, -2.0 * h);
            let down = weighted_sum(&layer.call(&input.view()).unwrap());
            layer.parameters_mut()[0].nudge(&index, h);
            let numeric = (up - down) / (2.0 * h);
            let analytic = grads.params[0][index.as_slice()];
            assert!((analytic - numeric).abs() < 3e-3 + 2e-2 * numeric.abs(), "{index:?}: {analytic} vs {numeric}");
        }
    }

    #[test]
    fn test_backward_requires_build() {
        let layer = CapsDense::new(CapsDenseConfig::new(3, 2, 1)).unwrap();
        let input = capsule_input((1, 1, 2, 2, 3));
        let grad = Array3::<f32>::zeros((1, 3, 2));
        assert!(matches!(
            layer.backward(&input.view(), &grad.view()),
            Err(CapsError::NotBuilt("CapsDense"))
        ));
    }

    #[test]
    fn test_batch_size_is_free_after_build() {
        let layer = built(3, 4, 2, &[1, 2, 2, 3, 5]);
        let output = layer.call(&capsule_input((4, 2, 2, 3, 5)).view()).unwrap();
        assert_eq!(output.dim(), (4, 3, 4));
    }

    #[test]
    fn test_rejects_other_input_capsules() {
        let layer = built(3, 4, 2, &[1, 2, 2, 3, 5]);
        let input = capsule_input((1, 3, 2, 3, 5));
        assert!(matches!(layer.call(&input.view()), Err(CapsError::ShapeMismatch(_))));
    }

    #[test]
    fn test_prediction_is_per_pair_matrix_product() {
        let layer = built(2, 3, 1, &[1, 1, 2, 1, 4]);
        let input = capsule_input((1, 1, 2, 1, 4));
        let weights = layer.weights.as_ref().unwrap();
        let prediction = layer.predict(weights, &input.view()).unwrap();
        assert_eq!(prediction.dim(), (1, 2, 2, 3));

        let w = layer.transform().unwrap().value();
        let (i, j, k) = (1, 0, 2);
        let expected: f32 = (0..4).map(|l| w[[0, i, j, k, l]] * input[[0, 0, i, 0, l]]).sum();
        assert!((prediction[[0, i, j, k]] - expected).abs() < 1e-6);
    }

    #[test]
    fn test_same_input_same_output() {
        let layer = built(4, 6, 3, &[2, 3, 3, 4, 5]);
        let input = capsule_input((2, 3, 3, 4, 5));
        assert_eq!(layer.call(&input.view()).unwrap(), layer.call(&input.view()).unwrap());
    }

    #[test]
    fn test_config_serialisation_round_trip() {
        let layer = built(10, 16, 3, &[2, 6, 6, 8, 8]);
        let json = serde_json::to_value(layer.get_config()).unwrap();
        assert_eq!(json["config"]["caps"], 10);
        assert_eq!(json["config"]["caps_dims"], 16);
        assert_eq!(json["config"]["routing_iter"], 3);
        assert_eq!(json["config"]["input_caps"], 288);
        assert_eq!(json["config"]["input_caps_dims"], 8);

        let config: LayerConfig = serde_json::from_value(json).unwrap();
        let restored = CapsDense::from_config(&config).unwrap();
        assert!(!restored.is_built());
        assert_eq!(restored.config().caps, 10);
        assert_eq!(restored.routing().iterations(), 3);
    }
}
