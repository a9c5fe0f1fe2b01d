use std::collections::HashMap;

use ndarray::{ArrayD, Zip};
use tracing::debug;

use super::error::{invalid_config, Result};
use super::parameter::{ParamId, Parameter};

/// Trait pour les optimiseurs
///
/// Le gradient vient de l'appelant (typiquement `CapsNet::gradients`); l'état interne (vélocité,
/// moments) est indexé par `ParamId`.
pub trait Optimizer: Send + Sync {
    fn step(&mut self, param: &mut Parameter, grad: &ArrayD<f32>) -> Result<()>;
    fn get_lr(&self) -> f32;
    fn set_lr(&mut self, lr: f32);
    /// Oublie l'état accumulé pour tous les paramètres.
    fn reset(&mut self);

    fn step_all(&mut self, params: Vec<&mut Parameter>, grads: &[ArrayD<f32>]) -> Result<()> {
        if params.len() != grads.len() {
            return Err(invalid_config(format!(
                "{} paramètres pour {} gradients",
                params.len(),
                grads.len()
            )));
        }
        for (param, grad) in params.into_iter().zip(grads) {
            self.step(param, grad)?;
        }
        Ok(())
    }
}

fn check_lr(lr: f32) -> Result<()> {
    if !(lr.is_finite() && lr > 0.0) {
        return Err(invalid_config(format!("learning rate invalide: {lr}")));
    }
    Ok(())
}

/// Optimiseur SGD avec momentum
pub struct Sgd {
    learning_rate: f32,
    momentum: f32,
    velocity: HashMap<ParamId, ArrayD<f32>>,
}

impl Sgd {
    pub fn new(learning_rate: f32, momentum: f32) -> Result<Self> {
        check_lr(learning_rate)?;
        if !(0.0..1.0).contains(&momentum) {
            return Err(invalid_config(format!("momentum hors de [0, 1): {momentum}")));
        }
        Ok(Self {
            learning_rate,
            momentum,
            velocity: HashMap::new(),
        })
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, param: &mut Parameter, grad: &ArrayD<f32>) -> Result<()> {
        param.check_gradient(grad)?;
        let velocity = self
            .velocity
            .entry(param.id())
            .or_insert_with(|| ArrayD::zeros(grad.raw_dim()));

        // v = momentum * v - lr * grad
        let (momentum, lr) = (self.momentum, self.learning_rate);
        Zip::from(&mut *velocity)
            .and(grad)
            .for_each(|v, &g| *v = momentum * *v - lr * g);

        // param += v
        param.update(grad, |mut value, _| value += &*velocity)
    }

    fn get_lr(&self) -> f32 {
        self.learning_rate
    }

    fn set_lr(&mut self, lr: f32) {
        self.learning_rate = lr;
    }

    fn reset(&mut self) {
        self.velocity.clear();
    }
}

struct AdamState {
    timestep: i32,
    m: ArrayD<f32>,
    v: ArrayD<f32>,
}

/// Optimiseur Adam
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    states: HashMap<ParamId, AdamState>,
}

impl Default for Adam {
    fn default() -> Self {
        Self {
            learning_rate: 0.001,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            states: HashMap::new(),
        }
    }
}

impl Adam {
    pub fn new(learning_rate: f32, beta1: f32, beta2: f32, epsilon: f32) -> Result<Self> {
        check_lr(learning_rate)?;
        for (name, beta) in [("beta1", beta1), ("beta2", beta2)] {
            if !(0.0..1.0).contains(&beta) {
                return Err(invalid_config(format!("{name} hors de [0, 1): {beta}")));
            }
        }
        if epsilon <= 0.0 {
            return Err(invalid_config(format!("epsilon doit être > 0: {epsilon}")));
        }
        Ok(Self {
            learning_rate,
            beta1,
            beta2,
            epsilon,
            states: HashMap::new(),
        })
    }
}

impl Optimizer for Adam {
    fn step(&mut self, param: &mut Parameter, grad: &ArrayD<f32>) -> Result<()> {
        param.check_gradient(grad)?;
        let state = self.states.entry(param.id()).or_insert_with(|| {
            debug!(param = %param.id(), name = param.name(), "Adam: nouvel état");
            AdamState {
                timestep: 0,
                m: ArrayD::zeros(grad.raw_dim()),
                v: ArrayD::zeros(grad.raw_dim()),
            }
        });
        state.timestep += 1;

        let (beta1, beta2) = (self.beta1, self.beta2);
        // m_t = beta1 * m + (1 - beta1) * g ; v_t = beta2 * v + (1 - beta2) * g²
        Zip::from(&mut state.m)
            .and(&mut state.v)
            .and(grad)
            .for_each(|m, v, &g| {
                *m = beta1 * *m + (1.0 - beta1) * g;
                *v = beta2 * *v + (1.0 - beta2) * g * g;
            });

        // Correction du biais
        let m_correction = 1.0 - beta1.powi(state.timestep);
        let v_correction = 1.0 - beta2.powi(state.timestep);
        let (lr, epsilon) = (self.learning_rate, self.epsilon);

        param.update(grad, |mut value, _| {
            Zip::from(&mut value)
                .and(&state.m)
                .and(&state.v)
                .for_each(|p, &m, &v| {
                    let m_hat = m / m_correction;
                    let v_hat = v / v_correction;
                    *p -= lr * m_hat / (v_hat.sqrt() + epsilon);
                });
        })
    }

    fn get_lr(&self) -> f32 {
        self.learning_rate
    }

    fn set_lr(&mut self, lr: f32) {
        self.learning_rate = lr;
    }

    fn reset(&mut self) {
        self.states.clear();
    }
}
