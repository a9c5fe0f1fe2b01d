use thiserror::Error;

pub type Result<T> = std::result::Result<T, CapsError>;

/// Erreurs de préconditions des couches de capsules.
///
/// Toutes sont fatales: l'appelant doit corriger sa configuration.
#[derive(Debug, Error)]
pub enum CapsError {
    #[error("Tenseur de rang {expected} attendu, rang {got} reçu")]
    RankMismatch { expected: usize, got: usize },

    #[error("Le routage dynamique exige au moins 1 itération, reçu {0}")]
    InvalidRoutingIterations(usize),

    #[error("Softmax conjoint: {expected} axes attendus, {got} reçus")]
    InvalidSoftmaxAxes { expected: usize, got: usize },

    #[error("Axe {axis} invalide pour un tenseur de rang {ndim}")]
    InvalidAxis { axis: usize, ndim: usize },

    #[error("La couche {0} doit être construite (build) avant l'appel")]
    NotBuilt(&'static str),

    #[error("Forme incompatible: {0}")]
    ShapeMismatch(String),

    #[error("Configuration invalide: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),
}

pub(crate) fn shape_mismatch(message: impl Into<String>) -> CapsError {
    CapsError::ShapeMismatch(message.into())
}

pub(crate) fn invalid_config(message: impl Into<String>) -> CapsError {
    CapsError::InvalidConfig(message.into())
}

/// Vérifie le rang d'une forme d'entrée.
pub(crate) fn expect_rank(shape: &[usize], expected: usize) -> Result<()> {
    if shape.len() != expected {
        return Err(CapsError::RankMismatch {
            expected,
            got: shape.len(),
        });
    }
    Ok(())
}
