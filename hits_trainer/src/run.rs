use anyhow::{Context, Result};
use hits::{
    arch::DualResNet,
    checkpoint,
    dataset::Trajectories,
    loss::CompositeLoss,
    training::{Trainer, generate_rng},
};
use ndarray::{Axis, s};

use crate::config::RunConfig;

/// Trains a model as described by `config`, resuming from its checkpoint when there's one.
pub fn run(config: RunConfig) -> Result<()> {
    let trajectories = Trajectories::load(&config.data)
        .with_context(|| format!("couldn't load trajectories from {}", config.data.display()))?;
    let dataset = trajectories.prepare(config.dt, config.step_size, config.n_horizons)?;

    let train_config = config.train_config();
    let mut model = match checkpoint::try_load(&config.checkpoint) {
        Some(model) => model,
        None => {
            log::info!("starting from a freshly initialized model");
            let mut rng = generate_rng(train_config.seed);
            DualResNet::new(config.model_config(), &mut rng)?
        }
    };

    model
        .check_data_info(&dataset)
        .context("the checkpoint doesn't match the data")?;

    let loss = CompositeLoss::new(config.table()?);
    let mut trainer = Trainer::adam(train_config, model.num_params());
    let report = trainer.train(&mut model, &dataset, &loss)?;

    log::info!(
        "{:?} after {} iterations, best validation loss {:.4e}",
        report.state,
        report.epochs,
        report.best_loss
    );

    let Some(n_steps) = config.forecast_steps else {
        return Ok(());
    };

    let test = &trajectories.test;
    let available = test.len_of(Axis(1)).saturating_sub(1);
    if n_steps > available {
        log::warn!("test trajectories only hold {available} steps, forecasting those");
    }
    let n_steps = n_steps.min(available);

    let best = checkpoint::try_load(&config.checkpoint).unwrap_or(model);
    let preds = best.multiscale_forecast(test.slice(s![.., 0, ..]), n_steps)?;
    let truth = test.slice(s![.., 1..=n_steps, ..]);

    let mse = (&preds - &truth).mapv(|e| e * e).mean().unwrap_or_default();
    log::info!("multiscale forecast of {n_steps} steps, test mse {mse:.4e}");

    Ok(())
}
