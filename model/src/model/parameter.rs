use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use ndarray::{Array, ArrayD, ArrayViewD, ArrayViewMutD, Dimension};
use serde::{Deserialize, Serialize};

use super::error::{shape_mismatch, Result};

static NEXT_PARAM_ID: AtomicU64 = AtomicU64::new(0);

/// Identifiant unique d'un paramètre, stable pendant toute sa durée de vie.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParamId(u64);

impl fmt::Display for ParamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "param#{}", self.0)
    }
}

/// Résultat d'une rétropropagation de couche: gradient par rapport à
/// l'entrée et gradients des paramètres, dans l'ordre de `parameters()`.
#[derive(Debug, Clone)]
pub struct LayerGradients<D: Dimension> {
    pub input: Array<f32, D>,
    pub params: Vec<ArrayD<f32>>,
}

/// Poids entraînable d'une couche.
///
/// La forme est figée à la création: la lecture passe par `value()`,
/// l'écriture uniquement par `update`, utilisée par les optimiseurs.
pub struct Parameter {
    id: ParamId,
    name: String,
    value: ArrayD<f32>,
}

impl fmt::Debug for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Parameter(id={}, name={}, shape={:?})",
            self.id,
            self.name,
            self.value.shape()
        )
    }
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: ArrayD<f32>) -> Self {
        Self {
            id: ParamId(NEXT_PARAM_ID.fetch_add(1, Ordering::Relaxed)),
            name: name.into(),
            value,
        }
    }

    pub fn id(&self) -> ParamId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> &[usize] {
        self.value.shape()
    }

    pub fn value(&self) -> &ArrayD<f32> {
        &self.value
    }

    /// Vérifie qu'un gradient a exactement la forme du paramètre.
    pub fn check_gradient(&self, grad: &ArrayD<f32>) -> Result<()> {
        if grad.shape() != self.value.shape() {
            return Err(shape_mismatch(format!(
                "gradient {:?} pour le paramètre {} de forme {:?}",
                grad.shape(),
                self.name,
                self.value.shape()
            )));
        }
        Ok(())
    }

    /// Applique une mise à jour en place à partir d'un gradient.
    ///
    /// La fermeture reçoit une vue mutable: elle ne peut pas changer la forme.
    pub fn update<F>(&mut self, grad: &ArrayD<f32>, apply: F) -> Result<()>
    where
        F: FnOnce(ArrayViewMutD<'_, f32>, ArrayViewD<'_, f32>),
    {
        self.check_gradient(grad)?;
        apply(self.value.view_mut(), grad.view());
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn nudge(&mut self, index: &[usize], delta: f32) {
        self.value[index] += delta;
    }
}
