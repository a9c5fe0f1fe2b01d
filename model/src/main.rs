use std::error::Error;
use std::fs;

use capsnet::model::loss::argmax;
use capsnet::{accuracy, capsule_lengths, Adam, LossFunction, MarginLoss, ModelBuilder, NetworkConfig, Optimizer};
use ndarray::{Array2, Array4};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;
use tracing_subscriber::EnvFilter;

const BATCH_SIZE: usize = 4;
const SEED: u64 = 42;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("capsnet=info")))
        .init();

    // Configuration JSON optionnelle, sinon le CapsNet MNIST par défaut
    let config = match std::env::args().nth(1) {
        Some(path) => {
            info!(%path, "lecture de la configuration");
            serde_json::from_str::<NetworkConfig>(&fs::read_to_string(&path)?)?
        }
        None => NetworkConfig::default(),
    };

    let mut model = ModelBuilder::new()
        .with_network_config(config)
        .with_seed(SEED)
        .build()?;

    for (i, layer) in model.summary().iter().enumerate() {
        info!(index = i, layer = %serde_json::to_string(layer)?, "résumé");
    }

    let mut rng = StdRng::seed_from_u64(SEED);
    let (rows, cols, channels) = model.config().input_shape;
    let images = Array4::random_using((BATCH_SIZE, rows, cols, channels), Uniform::new(0.0f32, 1.0), &mut rng);

    let output = model.forward(&images.view())?;
    let lengths = capsule_lengths(&output.view());
    info!(shape = ?output.shape(), "sortie des capsules");

    let num_classes = model.num_classes();
    let mut labels = Array2::<f32>::zeros((BATCH_SIZE, num_classes));
    for mut row in labels.rows_mut() {
        row[rng.gen_range(0..num_classes)] = 1.0;
    }

    let predictions: Vec<usize> = lengths.rows().into_iter().map(|row| argmax(&row)).collect();
    let loss = MarginLoss::from(model.config().loss).compute(&labels.view().into_dyn(), &lengths.view().into_dyn())?;
    info!(
        ?predictions,
        loss,
        accuracy = accuracy(&labels.view(), &lengths.view())?,
        "évaluation sur étiquettes aléatoires"
    );

    // Un pas d'Adam sur les gradients rétropropagés à travers le routage
    let gradients = model.gradients(&images.view(), &labels.view())?;
    let mut optimizer = Adam::new(0.01, 0.9, 0.999, 1e-8)?;
    optimizer.step_all(model.parameters_mut(), &gradients.params)?;
    let after = model.evaluate(&images.view(), &labels.view())?;
    info!(before = gradients.loss, after = after.loss, "pas d'optimisation");

    Ok(())
}
