use log::{info, warn};
use tensorflow::ops;
use tensorflow::Output;
use tensorflow::Scope;
use tensorflow::Status;
use tensorflow::Variable;

use super::{ArrayModel, ModelInputs};
use crate::activations;
use crate::backbones::{cnn_block, CnnBlock};
use crate::config::ModelConfig;
use crate::embedding::telescope_slice;
use crate::head::{
    accuracy, one_hot_labels, sigmoid_cross_entropy, sigmoid_predictions, softmax_cross_entropy,
    softmax_predictions, ClassifierHead, Predictions,
};
use crate::layers::{dropout, flatten, stack, Dense};
use crate::outputs::Outputs;

/// Element-wise maximum over equally shaped (batch, feature) views.
pub fn max_pool_views(views: Vec<Output>, scope: &mut Scope) -> Result<Output, Status> {
    let stacked = stack(views, 0, scope)?;
    Ok(ops::max(
        stacked,
        ops::constant(0i32, scope)?,
        &mut scope.with_op_name("reduced_features"),
    )?
    .into())
}

/// Multi-view CNN: one shared backbone per view, max pooling across views,
/// two dropout-regularized fully connected layers, then the classifier.
///
/// Dropout is always on, including when the graph is only evaluated, so two
/// runs over the same batch generally differ.
pub struct MvcnnModel {
    inputs: ModelInputs,
    backbone: Box<dyn CnnBlock>,
    fc6: Dense,
    fc7: Dense,
    head: ClassifierHead,
    pub logits: Output,
    pub loss: Output,
    pub accuracy: Output,
    pub predictions: Predictions,
}

impl MvcnnModel {
    pub fn new(config: &ModelConfig, scope: &mut Scope) -> Result<MvcnnModel, Status> {
        let mut scope = scope.new_sub_scope("mvcnn");
        let scope = &mut scope;
        let inputs = ModelInputs::new(config, scope)?;
        let backbone = cnn_block(config.cnn_block, config.image_shape, scope)?;

        let mut views = Vec::with_capacity(config.num_telescopes as usize);
        for index in 0..config.num_telescopes {
            let mut scope = scope.new_sub_scope("view");
            let image = telescope_slice(inputs.telescope_data.clone().into(), index, &mut scope)?;
            let trigger = telescope_slice(inputs.telescope_triggers.clone().into(), index, &mut scope)?;
            let features = backbone.apply(image, trigger, &mut scope)?;
            views.push(flatten(features, backbone.flat_size(), &mut scope)?);
        }

        let mut classifier = scope.new_sub_scope("classifier");
        let scope = &mut classifier;
        let reduced = max_pool_views(views, scope)?;

        warn!(
            "mvcnn dropout (rate {}) is applied on every run, not only while training",
            config.dropout_rate
        );
        let fc6 = Dense::new(backbone.flat_size(), config.fc_units, true, scope)?;
        let x = fc6.apply(reduced, &*activations::relu(), scope)?;
        let x = dropout(x, config.dropout_rate, scope)?;
        let fc7 = Dense::new(config.fc_units, config.fc_units, true, scope)?;
        let x = fc7.apply(x, &*activations::relu(), scope)?;
        let x = dropout(x, config.dropout_rate, scope)?;
        let head = ClassifierHead::new(config.fc_units, config.num_gamma_hadron_classes, scope)?;
        let logits = head.apply(x, scope)?;

        let labels: Output = inputs.gamma_hadron_labels.clone().into();
        let onehot = one_hot_labels(labels.clone(), config.num_gamma_hadron_classes, scope)?;
        let (loss, predictions) = if config.num_gamma_hadron_classes == 2 {
            (
                sigmoid_cross_entropy(logits.clone(), onehot, scope)?,
                sigmoid_predictions(logits.clone(), scope)?,
            )
        } else {
            (
                softmax_cross_entropy(logits.clone(), onehot, scope)?,
                softmax_predictions(logits.clone(), scope)?,
            )
        };
        let accuracy = accuracy(predictions.classes.clone(), labels, scope)?;

        let model = MvcnnModel {
            inputs,
            backbone,
            fc6,
            fc7,
            head,
            logits,
            loss,
            accuracy,
            predictions,
        };
        info!(
            "built mvcnn model: {} block, {} views, {} variables",
            config.cnn_block,
            config.num_telescopes,
            model.variables().len()
        );
        Ok(model)
    }
}

impl ArrayModel for MvcnnModel {
    fn inputs(&self) -> &ModelInputs {
        &self.inputs
    }

    fn outputs(&self) -> Outputs {
        crate::out! {
            default "logits" => self.logits.clone(),
            "loss" => self.loss.clone(),
            "accuracy" => self.accuracy.clone(),
            "classes" => self.predictions.classes.clone(),
            "probabilities" => self.predictions.probabilities.clone(),
        }
    }

    fn variables(&self) -> Vec<Variable> {
        let mut vars = self.backbone.variables();
        vars.extend(self.fc6.variables());
        vars.extend(self.fc7.variables());
        vars.extend(self.head.variables());
        vars
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::known_shape;
    use tensorflow::DataType;
    use tensorflow::Session;
    use tensorflow::SessionOptions;
    use tensorflow::SessionRunArgs;
    use tensorflow::Tensor;

    #[test]
    fn max_pooling_ignores_view_order() {
        let mut scope = Scope::new_root_scope();
        let mut views = vec![];
        for name in ["v0", "v1", "v2"] {
            views.push(
                ops::Placeholder::new()
                    .dtype(DataType::Float)
                    .shape(known_shape(&[2, 4]))
                    .build(&mut scope.with_op_name(name))
                    .unwrap(),
            );
        }
        let forward: Vec<Output> = views.iter().map(|view| view.clone().into()).collect();
        let shuffled: Vec<Output> = [2, 0, 1].iter().map(|i| views[*i].clone().into()).collect();
        let a = max_pool_views(forward, &mut scope).unwrap();
        let b = max_pool_views(shuffled, &mut scope).unwrap();

        let session = Session::new(&SessionOptions::new(), &scope.graph()).unwrap();
        let data = [
            Tensor::<f32>::new(&[2, 4]).with_values(&[1.0, 5.0, -2.0, 0.0, 3.0, 3.0, 3.0, 3.0]).unwrap(),
            Tensor::<f32>::new(&[2, 4]).with_values(&[4.0, -1.0, -3.0, 0.5, 0.0, 9.0, 1.0, 2.0]).unwrap(),
            Tensor::<f32>::new(&[2, 4]).with_values(&[2.0, 2.0, -1.0, 0.2, 1.0, 1.0, 7.0, 1.0]).unwrap(),
        ];
        let mut run = SessionRunArgs::new();
        for (view, tensor) in views.iter().zip(data.iter()) {
            run.add_feed(view, 0, tensor);
        }
        let fa = run.request_fetch(&a.operation, a.index);
        let fb = run.request_fetch(&b.operation, b.index);
        session.run(&mut run).unwrap();
        let a: Tensor<f32> = run.fetch(fa).unwrap();
        let b: Tensor<f32> = run.fetch(fb).unwrap();
        assert_eq!(a.dims(), &[2, 4]);
        assert_eq!(a.to_vec(), b.to_vec());
        assert_eq!(a.to_vec(), vec![4.0, 5.0, -1.0, 0.5, 3.0, 9.0, 7.0, 3.0]);
    }
}
