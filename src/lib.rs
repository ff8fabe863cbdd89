//! arraynet: gamma/hadron classifiers for imaging atmospheric Cherenkov telescope arrays,
//! built as TensorFlow graphs. Every event triggers some subset of the array's telescopes;
//! untriggered telescopes arrive as all-zero images. Two architectures turn that variable
//! number of telescopes into a single class prediction with fixed-size tensor operations:
//!
//! * [`models::CnnRnnModel`]: a shared CNN embeds every telescope, the telescope positions are
//!   appended, and an attention-wrapped layer normalized LSTM runs across the telescopes. Each
//!   event's sequence stops at its count of triggered telescopes and the output at that last
//!   valid step is gathered back out of the padded unroll.
//! * [`models::MvcnnModel`]: a shared CNN per view, an element-wise max across views, two
//!   dropout-regularized fully connected layers and the classifier.
//!
//! Both share one parameter set across telescopes: layers create their variables once and are
//! applied once per telescope.
//!
//! ```ignore
//! let config = ModelConfig::load("model.toml")?;
//! init_logging(&config)?;
//! let mut scope = Scope::new_root_scope();
//! let model = CnnRnnModel::new(&config, &mut scope)?;
//! let runner = Runner::new(model, config, &scope)?;
//! let evaluation = runner.evaluate(&batch)?;
//! ```

pub mod activations;
pub mod backbones;
pub mod config;
pub mod embedding;
pub mod head;
pub mod layers;
pub mod masking;
pub mod models;
pub mod outputs;
pub mod rnn;
pub mod runner;

pub use config::{CnnBlockKind, ModelConfig, SequenceLengthSource};
pub use models::{ArrayModel, CnnRnnModel, MvcnnModel};
pub use runner::{EventBatch, Evaluation, Runner};
pub use tensorflow::Scope;

/// Send log output to stderr at the configured level.
pub fn init_logging(config: &ModelConfig) -> anyhow::Result<()> {
    simple_logging::log_to_stderr(config.level_filter()?);
    Ok(())
}
