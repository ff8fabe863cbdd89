//! Build both models from demos/model.toml and evaluate them on a random batch.
//!
//! cargo run --example classify_events [path/to/model.toml]
use anyhow::Result;
use arraynet::{init_logging, CnnRnnModel, EventBatch, ModelConfig, MvcnnModel, Runner, Scope};
use log::info;
use ndarray::{s, Array1, Array2, Array3, Array5};
use rand::Rng;

fn random_events(config: &ModelConfig, events: usize) -> EventBatch {
    let mut rng = rand::thread_rng();
    let [w, l, d] = config.image_shape;
    let t = config.num_telescopes as usize;
    let mut telescope_data = Array5::from_shape_fn((events, t, w as usize, l as usize, d as usize), |_| {
        rng.gen_range(0.0f32..1.0)
    });
    let mut telescope_triggers = Array2::ones((events, t));
    for event in 0..events {
        // any subset of telescopes may trigger, in any order
        for telescope in 0..t {
            if rng.gen_bool(0.4) {
                telescope_data.slice_mut(s![event, telescope, .., .., ..]).fill(0.0);
                telescope_triggers[[event, telescope]] = 0.0;
            }
        }
    }
    let telescope_positions =
        Array3::from_shape_fn((events, t, config.num_auxiliary_inputs as usize), |_| rng.gen_range(-100.0f32..100.0));
    let classes = config.num_gamma_hadron_classes as i32;
    let gamma_hadron_labels = Array1::from_shape_fn(events, |_| rng.gen_range(0..classes));
    EventBatch {
        telescope_data,
        telescope_triggers,
        telescope_positions,
        gamma_hadron_labels,
    }
}

fn main() -> Result<()> {
    let path = std::env::args().nth(1).unwrap_or_else(|| "demos/model.toml".to_string());
    let config = ModelConfig::load(&path)?;
    init_logging(&config)?;

    let mut batch = random_events(&config, 8);
    batch.sort_triggered_first(config.sequence_length_source);
    info!("triggered telescopes per event: {:?}", batch.triggered_counts());

    let mut scope = Scope::new_root_scope();
    let cnn_rnn = Runner::new(CnnRnnModel::new(&config, &mut scope)?, config.clone(), &scope)?;
    let evaluation = cnn_rnn.evaluate(&batch)?;
    info!("cnn_rnn loss {:?}", evaluation.scalar("loss"));
    info!("cnn_rnn logits {:?}", evaluation.float("logits"));

    let mut scope = Scope::new_root_scope();
    let mvcnn = Runner::new(MvcnnModel::new(&config, &mut scope)?, config.clone(), &scope)?;
    let evaluation = mvcnn.evaluate(&batch)?;
    info!(
        "mvcnn loss {:?} accuracy {:?}",
        evaluation.scalar("loss"),
        evaluation.scalar("accuracy")
    );
    info!("mvcnn classes {:?}", evaluation.int("classes"));
    Ok(())
}
