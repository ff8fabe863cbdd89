use log::info;
use tensorflow::Output;
use tensorflow::Scope;
use tensorflow::Status;
use tensorflow::Variable;

use super::{ArrayModel, ModelInputs};
use crate::config::ModelConfig;
use crate::embedding::{augmented_embeddings, TelescopeEncoder};
use crate::head::{one_hot_labels, softmax_cross_entropy, ClassifierHead};
use crate::masking::{select_final_outputs, sequence_lengths};
use crate::outputs::Outputs;
use crate::rnn::AttentionLstm;

/// CNN per telescope, attention LSTM across telescopes, softmax classifier.
///
/// Telescopes are fed in index order and the LSTM stops at each event's count
/// of triggered telescopes, so triggered telescopes must come first in every
/// event (see [`crate::runner::EventBatch::validate`]).
pub struct CnnRnnModel {
    inputs: ModelInputs,
    encoder: TelescopeEncoder,
    rnn: AttentionLstm,
    head: ClassifierHead,
    /// (batch) int32 triggered telescope counts
    pub sequence_lengths: Output,
    /// (batch, lstm_size) output at each event's last valid step
    pub last_output: Output,
    pub logits: Output,
    pub loss: Output,
}

impl CnnRnnModel {
    pub fn new(config: &ModelConfig, scope: &mut Scope) -> Result<CnnRnnModel, Status> {
        let mut scope = scope.new_sub_scope("cnn_rnn");
        let scope = &mut scope;
        let inputs = ModelInputs::new(config, scope)?;
        let telescope_data: Output = inputs.telescope_data.clone().into();
        let telescope_triggers: Output = inputs.telescope_triggers.clone().into();

        let lengths = sequence_lengths(
            config.sequence_length_source,
            telescope_data.clone(),
            telescope_triggers.clone(),
            scope,
        )?;

        let encoder = TelescopeEncoder::new(config, scope)?;
        let embeddings = augmented_embeddings(
            &encoder,
            telescope_data,
            telescope_triggers,
            inputs.telescope_positions.clone().into(),
            config.num_telescopes,
            scope,
        )?;

        let rnn = AttentionLstm::new(
            config.augmented_embedding_size(),
            config.lstm_size,
            config.num_telescopes,
            config.forget_bias,
            scope,
        )?;
        let (outputs, _final_state) = rnn.unroll(embeddings, lengths.clone(), config.num_telescopes, scope)?;
        let last_output = select_final_outputs(
            outputs,
            lengths.clone(),
            config.num_telescopes,
            rnn.output_size(),
            scope,
        )?;

        let head = ClassifierHead::new(rnn.output_size(), config.num_gamma_hadron_classes, scope)?;
        let logits = head.apply(last_output.clone(), scope)?;
        let onehot = one_hot_labels(
            inputs.gamma_hadron_labels.clone(),
            config.num_gamma_hadron_classes,
            scope,
        )?;
        let loss = softmax_cross_entropy(logits.clone(), onehot, scope)?;

        let model = CnnRnnModel {
            inputs,
            encoder,
            rnn,
            head,
            sequence_lengths: lengths,
            last_output,
            logits,
            loss,
        };
        info!(
            "built cnn_rnn model: {} block, {} telescopes, lstm {}, {} variables",
            config.cnn_block,
            config.num_telescopes,
            config.lstm_size,
            model.variables().len()
        );
        Ok(model)
    }
}

impl ArrayModel for CnnRnnModel {
    fn inputs(&self) -> &ModelInputs {
        &self.inputs
    }

    fn outputs(&self) -> Outputs {
        crate::out! {
            default "logits" => self.logits.clone(),
            "loss" => self.loss.clone(),
            "sequence_lengths" => self.sequence_lengths.clone(),
            "last_output" => self.last_output.clone(),
        }
    }

    fn variables(&self) -> Vec<Variable> {
        let mut vars = self.encoder.variables();
        vars.extend(self.rnn.variables());
        vars.extend(self.head.variables());
        vars
    }
}
