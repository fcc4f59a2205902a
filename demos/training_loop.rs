//! # Training loop — RepMet on a free embedding table
//!
//! Every example owns a trainable 2-D embedding, a stand-in for the output of
//! a network. Three classes start out overlapping; class 2 is bimodal, so
//! one centroid per class cannot describe it but two can.
//!
//! Each epoch:
//!
//! ```text
//! every 5 epochs: update_clusters(all embeddings)   # fresh centroids
//! for each mini-batch:
//!     loss → backward → SGD on the batch embeddings and on the centroids
//! ```
//!
//! The printout shows the loss falling and accuracy rising as the classes
//! separate.
//!
//! ## Running this example
//!
//! ```
//! cargo run --example training_loop
//! ```

use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use repmet_core::{Label, LossFormulation, Matrix, RepMetConfig, RepMetLoss};

const PER_MODE: usize = 40;
const BATCH: usize = 24;
const EPOCHS: usize = 30;
const LEARNING_RATE: f32 = 0.05;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut rng = ChaCha8Rng::seed_from_u64(2024);

    // (class, mode centre)
    let modes: [(Label, [f32; 2]); 4] = [
        (0, [0.0, 0.0]),
        (1, [1.0, 0.5]),
        (2, [-1.0, 1.0]),
        (2, [2.0, -0.5]),
    ];
    let mut rows = Vec::new();
    let mut labels = Vec::new();
    for &(label, centre) in &modes {
        for _ in 0..PER_MODE {
            rows.push([
                centre[0] + rng.random_range(-0.6f32..0.6),
                centre[1] + rng.random_range(-0.6f32..0.6),
            ]);
            labels.push(label);
        }
    }
    let mut table = Matrix::from_rows(&rows)?;
    let n = table.rows();

    let config = RepMetConfig::new(2, 2)
        .with_margin(1.0)
        .with_formulation(LossFormulation::Combined)
        .with_seed(7);
    let mut repmet = RepMetLoss::new(config)?;

    println!("epoch | loss    | accuracy | variance");
    println!("------+---------+----------+---------");

    let mut order: Vec<usize> = (0..n).collect();
    for epoch in 0..EPOCHS {
        if epoch % 5 == 0 {
            let report = repmet.update_clusters(&table, &labels)?;
            println!(
                "      re-clustered: generation {}, inertia {:.3}",
                report.generation,
                report.inertia()
            );
        }

        order.shuffle(&mut rng);

        let mut epoch_loss = 0.0;
        let mut epoch_acc = 0.0;
        let mut batches = 0;
        for chunk in order.chunks(BATCH) {
            let batch = table.select_rows(chunk);
            let batch_labels: Vec<Label> = chunk.iter().map(|&i| labels[i]).collect();

            let out = repmet.loss(&batch, &batch_labels)?;
            let grads = repmet.backward(&batch, &out)?;
            repmet.step(LEARNING_RATE);

            for (row, &i) in chunk.iter().enumerate() {
                for (v, &g) in table.row_mut(i).iter_mut().zip(grads.embeddings.row(row)) {
                    *v -= LEARNING_RATE * g * chunk.len() as f32;
                }
            }

            epoch_loss += out.total_loss;
            epoch_acc += out.accuracy;
            batches += 1;
        }

        println!(
            "{:>5} | {:>7.4} | {:>8.3} | {:.3}",
            epoch,
            epoch_loss / batches as f32,
            epoch_acc / batches as f32,
            repmet.avg_variance().unwrap_or(0.0),
        );
    }

    if let Some(centroids) = repmet.centroids() {
        println!();
        for (row, class) in centroids.values().iter_rows().zip(centroids.classes()) {
            println!("class {class}: ({:+.3}, {:+.3})", row[0], row[1]);
        }
    }
    Ok(())
}
