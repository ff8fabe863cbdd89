//! Host-side event batches and a session that evaluates a built model on them.
use std::collections::HashMap;

use anyhow::{anyhow, bail, ensure, Result};
use log::{debug, warn};
use ndarray::{Array1, Array2, Array3, Array5, ArrayD, Axis, IxDyn};
use tensorflow::DataType;
use tensorflow::Output;
use tensorflow::Scope;
use tensorflow::Session;
use tensorflow::SessionOptions;
use tensorflow::SessionRunArgs;
use tensorflow::Status;
use tensorflow::Tensor;
use tensorflow::TensorType;

use crate::config::{ModelConfig, SequenceLengthSource};
use crate::masking::{host_triggered_counts, is_triggered_first, used_flags};
use crate::models::ArrayModel;

trait TfResultExt<T> {
    fn tf_context(self, what: &str) -> Result<T>;
}

impl<T> TfResultExt<T> for std::result::Result<T, Status> {
    fn tf_context(self, what: &str) -> Result<T> {
        self.map_err(|status| anyhow!("{}: {}", what, status))
    }
}

/// One batch of events as dense host arrays. Untriggered telescopes carry
/// all-zero images.
#[derive(Debug, Clone)]
pub struct EventBatch {
    /// (batch, telescope, width, length, depth)
    pub telescope_data: Array5<f32>,
    /// (batch, telescope) 0/1 flags
    pub telescope_triggers: Array2<f32>,
    /// (batch, telescope, aux)
    pub telescope_positions: Array3<f32>,
    /// (batch) class ids
    pub gamma_hadron_labels: Array1<i32>,
}

impl EventBatch {
    pub fn len(&self) -> usize {
        self.telescope_data.len_of(Axis(0))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn triggered_counts(&self) -> Vec<usize> {
        host_triggered_counts(self.telescope_data.view())
    }

    /// Check the batch against the configuration and the ordering the
    /// recurrent aggregator relies on: in every event, no telescope with data
    /// may follow one without.
    pub fn validate(&self, config: &ModelConfig) -> Result<()> {
        let batch = self.len();
        let t = config.num_telescopes as usize;
        let [w, l, d] = config.image_shape;
        let expected = [batch, t, w as usize, l as usize, d as usize];
        ensure!(
            self.telescope_data.shape() == &expected[..],
            "telescope_data has shape {:?}, expected {:?}",
            self.telescope_data.shape(),
            expected
        );
        ensure!(
            self.telescope_triggers.shape() == &[batch, t][..],
            "telescope_triggers has shape {:?}, expected {:?}",
            self.telescope_triggers.shape(),
            [batch, t]
        );
        let aux = config.num_auxiliary_inputs as usize;
        ensure!(
            self.telescope_positions.shape() == &[batch, t, aux][..],
            "telescope_positions has shape {:?}, expected {:?}",
            self.telescope_positions.shape(),
            [batch, t, aux]
        );
        ensure!(
            self.gamma_hadron_labels.len() == batch,
            "{} labels for {} events",
            self.gamma_hadron_labels.len(),
            batch
        );
        let classes = config.num_gamma_hadron_classes as i32;
        if let Some(bad) = self.gamma_hadron_labels.iter().find(|l| **l < 0 || **l >= classes) {
            bail!("label {} outside [0, {})", bad, classes);
        }
        if let Some(bad) = self.telescope_triggers.iter().find(|f| **f != 0.0 && **f != 1.0) {
            bail!("trigger flag {} is neither 0 nor 1", bad);
        }
        for event in 0..batch {
            let used = self.used_telescopes(event, config.sequence_length_source);
            if !is_triggered_first(&used) {
                bail!(
                    "event {} has a triggered telescope after an untriggered one ({:?}); \
                     reorder with sort_triggered_first",
                    event,
                    used
                );
            }
            if !used.iter().any(|u| *u) {
                warn!("event {} has no triggered telescopes", event);
            }
        }
        Ok(())
    }

    /// Which of an event's telescopes count as triggered under `source`.
    fn used_telescopes(&self, event: usize, source: SequenceLengthSource) -> Vec<bool> {
        match source {
            SequenceLengthSource::Pixels => used_flags(self.telescope_data.index_axis(Axis(0), event)),
            SequenceLengthSource::Triggers => self
                .telescope_triggers
                .index_axis(Axis(0), event)
                .iter()
                .map(|flag| *flag != 0.0)
                .collect(),
        }
    }

    /// Stable reorder of each event's telescopes so the triggered ones under
    /// `source` come first. Images, trigger flags and positions move together.
    pub fn sort_triggered_first(&mut self, source: SequenceLengthSource) {
        for event in 0..self.len() {
            let used = self.used_telescopes(event, source);
            let mut order: Vec<usize> = (0..used.len()).collect();
            order.sort_by_key(|t| !used[*t]);
            if order.iter().enumerate().all(|(i, t)| i == *t) {
                continue;
            }
            let images = self.telescope_data.index_axis(Axis(0), event).select(Axis(0), &order);
            self.telescope_data.index_axis_mut(Axis(0), event).assign(&images);
            let triggers = self.telescope_triggers.index_axis(Axis(0), event).select(Axis(0), &order);
            self.telescope_triggers.index_axis_mut(Axis(0), event).assign(&triggers);
            let positions = self.telescope_positions.index_axis(Axis(0), event).select(Axis(0), &order);
            self.telescope_positions.index_axis_mut(Axis(0), event).assign(&positions);
        }
    }
}

fn to_tensor<T: TensorType + Copy, D: ndarray::Dimension>(array: &ndarray::Array<T, D>) -> Result<Tensor<T>> {
    let dims: Vec<u64> = array.shape().iter().map(|d| *d as u64).collect();
    let values: Vec<T> = array.iter().copied().collect();
    Tensor::new(&dims).with_values(&values).tf_context("building input tensor")
}

fn to_array<T: TensorType + Clone>(tensor: &Tensor<T>) -> Result<ArrayD<T>> {
    let dims: Vec<usize> = tensor.dims().iter().map(|d| *d as usize).collect();
    Ok(ArrayD::from_shape_vec(IxDyn(&dims), tensor.to_vec())?)
}

/// A fetched output, widened to one float and one integer representation.
#[derive(Debug, Clone, PartialEq)]
pub enum Fetched {
    Float(ArrayD<f32>),
    Int(ArrayD<i64>),
}

/// Named outputs of one run.
#[derive(Debug, Clone, Default)]
pub struct Evaluation {
    pub values: HashMap<String, Fetched>,
}

impl Evaluation {
    pub fn float(&self, name: &str) -> Option<&ArrayD<f32>> {
        match self.values.get(name) {
            Some(Fetched::Float(array)) => Some(array),
            _ => None,
        }
    }

    pub fn int(&self, name: &str) -> Option<&ArrayD<i64>> {
        match self.values.get(name) {
            Some(Fetched::Int(array)) => Some(array),
            _ => None,
        }
    }

    /// A rank-0 float output such as `loss` or `accuracy`.
    pub fn scalar(&self, name: &str) -> Option<f32> {
        self.float(name).and_then(|array| array.iter().next().copied())
    }
}

/// Owns the session for one model and evaluates batches against it.
pub struct Runner<M: ArrayModel> {
    model: M,
    config: ModelConfig,
    session: Session,
}

impl<M: ArrayModel> Runner<M> {
    /// Open a session on the scope's graph and initialize every model variable.
    pub fn new(model: M, config: ModelConfig, scope: &Scope) -> Result<Runner<M>> {
        let session = Session::new(&SessionOptions::new(), &scope.graph()).tf_context("creating session")?;
        let mut run_args = SessionRunArgs::new();
        let variables = model.variables();
        for var in &variables {
            run_args.add_target(&var.initializer());
        }
        session.run(&mut run_args).tf_context("initializing variables")?;
        debug!("initialized {} variables", variables.len());
        Ok(Runner { model, config, session })
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Evaluate every named output of the model.
    pub fn evaluate(&self, batch: &EventBatch) -> Result<Evaluation> {
        let outputs = self.model.outputs();
        let names = outputs.names();
        self.run(batch, &names)
    }

    /// Validate and feed `batch`, then fetch the requested outputs by name.
    pub fn run(&self, batch: &EventBatch, names: &[&str]) -> Result<Evaluation> {
        batch.validate(&self.config)?;
        let outputs = self.model.outputs();
        let mut requested: Vec<(&str, Output)> = Vec::with_capacity(names.len());
        for name in names {
            let output = outputs
                .get(name)
                .ok_or_else(|| anyhow!("model has no output named {:?}", name))?;
            requested.push((*name, output.clone()));
        }

        let data = to_tensor(&batch.telescope_data)?;
        let triggers = to_tensor(&batch.telescope_triggers)?;
        let positions = to_tensor(&batch.telescope_positions)?;
        let labels = to_tensor(&batch.gamma_hadron_labels)?;

        let inputs = self.model.inputs();
        let mut run_args = SessionRunArgs::new();
        run_args.add_feed(&inputs.telescope_data, 0, &data);
        run_args.add_feed(&inputs.telescope_triggers, 0, &triggers);
        run_args.add_feed(&inputs.telescope_positions, 0, &positions);
        run_args.add_feed(&inputs.gamma_hadron_labels, 0, &labels);
        let tokens: Vec<_> = requested
            .iter()
            .map(|(_, output)| run_args.request_fetch(&output.operation, output.index))
            .collect();
        debug!("running {} events for {:?}", batch.len(), names);
        self.session.run(&mut run_args).tf_context("evaluating batch")?;

        let mut evaluation = Evaluation::default();
        for ((name, output), token) in requested.iter().zip(tokens) {
            let fetched = match output.operation.output_type(output.index as usize) {
                DataType::Float => Fetched::Float(to_array(&run_args.fetch::<f32>(token).tf_context(name)?)?),
                DataType::Int32 => Fetched::Int(to_array(&run_args.fetch::<i32>(token).tf_context(name)?)?.mapv(i64::from)),
                DataType::Int64 => Fetched::Int(to_array(&run_args.fetch::<i64>(token).tf_context(name)?)?),
                other => bail!("output {:?} has unsupported type {:?}", name, other),
            };
            evaluation.values.insert(name.to_string(), fetched);
        }
        Ok(evaluation)
    }
}
