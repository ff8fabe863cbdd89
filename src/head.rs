//! Classification head: logits, one-hot labels, cross-entropy losses,
//! predictions and accuracy.
use tensorflow::ops;
use tensorflow::DataType;
use tensorflow::Output;
use tensorflow::Scope;
use tensorflow::Status;
use tensorflow::Variable;

use crate::activations;
use crate::layers::{stack, Dense};

/// Linear projection to class logits.
pub struct ClassifierHead {
    logits: Dense,
}

impl ClassifierHead {
    pub fn new(input_size: u64, num_classes: u64, scope: &mut Scope) -> Result<ClassifierHead, Status> {
        let mut scope = scope.new_sub_scope("logits");
        Ok(ClassifierHead {
            logits: Dense::new(input_size, num_classes, true, &mut scope)?,
        })
    }

    pub fn apply<O: Into<Output>>(&self, input: O, scope: &mut Scope) -> Result<Output, Status> {
        self.logits.apply(input, &*activations::identity(), scope)
    }

    pub fn variables(&self) -> Vec<Variable> {
        self.logits.variables()
    }
}

/// (batch, num_classes) float one-hot rows for int32 class ids.
pub fn one_hot_labels<O: Into<Output>>(labels: O, num_classes: u64, scope: &mut Scope) -> Result<Output, Status> {
    Ok(ops::one_hot(
        labels,
        ops::constant(num_classes as i32, scope)?,
        ops::constant(1f32, scope)?,
        ops::constant(0f32, scope)?,
        scope,
    )?
    .into())
}

/// Mean over events of the softmax cross-entropy.
pub fn softmax_cross_entropy(logits: Output, onehot_labels: Output, scope: &mut Scope) -> Result<Output, Status> {
    let per_event = ops::softmax_cross_entropy_with_logits(logits, onehot_labels, scope)?;
    Ok(ops::mean(
        Output {
            operation: per_event,
            index: 0,
        },
        ops::constant(0i32, scope)?,
        &mut scope.with_op_name("loss"),
    )?
    .into())
}

/// Mean over every logit entry of the sigmoid cross-entropy, computed in the
/// overflow-safe form `max(x, 0) - x * z + log(1 + exp(-|x|))`.
pub fn sigmoid_cross_entropy(logits: Output, onehot_labels: Output, scope: &mut Scope) -> Result<Output, Status> {
    let positive = ops::relu(logits.clone(), scope)?;
    let matched = ops::multiply(logits.clone(), onehot_labels, scope)?;
    let soft = ops::log1p(
        ops::exp(ops::neg(ops::abs(logits, scope)?, scope)?, scope)?,
        scope,
    )?;
    let elementwise = ops::add(ops::sub(positive, matched, scope)?, soft, scope)?;
    Ok(ops::mean(
        elementwise,
        ops::constant(&[0i32, 1][..], scope)?,
        &mut scope.with_op_name("loss"),
    )?
    .into())
}

/// Argmax class ids and class probabilities.
#[derive(Clone)]
pub struct Predictions {
    /// (batch) int64
    pub classes: Output,
    /// softmax: (batch, num_classes); sigmoid pair: (2, batch, num_classes)
    pub probabilities: Output,
}

pub fn argmax_classes(logits: Output, scope: &mut Scope) -> Result<Output, Status> {
    Ok(ops::arg_max(logits, ops::constant(1i32, scope)?, &mut scope.with_op_name("classes"))?.into())
}

pub fn softmax_predictions(logits: Output, scope: &mut Scope) -> Result<Predictions, Status> {
    Ok(Predictions {
        classes: argmax_classes(logits.clone(), scope)?,
        probabilities: ops::softmax(logits, &mut scope.with_op_name("softmax_tensor"))?.into(),
    })
}

/// Binary predictions with the probability pair `[sigmoid(x), 1 - sigmoid(x)]`
/// stacked on a new leading axis.
pub fn sigmoid_predictions(logits: Output, scope: &mut Scope) -> Result<Predictions, Status> {
    let p = ops::sigmoid(logits.clone(), scope)?;
    let q = ops::sub(ops::constant(1f32, scope)?, p.clone(), scope)?;
    Ok(Predictions {
        classes: argmax_classes(logits, scope)?,
        probabilities: stack(vec![p.into(), q.into()], 0, &mut scope.with_op_name("probabilities"))?,
    })
}

/// Fraction of events whose predicted class equals the int32 label.
pub fn accuracy(classes: Output, labels: Output, scope: &mut Scope) -> Result<Output, Status> {
    let classes = ops::Cast::new().DstT(DataType::Int32).build(classes, scope)?;
    let hits = ops::Cast::new()
        .DstT(DataType::Float)
        .build(ops::equal(classes, labels, scope)?, scope)?;
    Ok(ops::mean(hits, ops::constant(0i32, scope)?, &mut scope.with_op_name("accuracy"))?.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::known_shape;
    use tensorflow::Operation;
    use tensorflow::Session;
    use tensorflow::SessionOptions;
    use tensorflow::SessionRunArgs;
    use tensorflow::Tensor;

    fn logits_graph(rows: u64, classes: u64) -> (Scope, Operation, Operation) {
        let mut scope = Scope::new_root_scope();
        let logits = ops::Placeholder::new()
            .dtype(DataType::Float)
            .shape(known_shape(&[rows, classes]))
            .build(&mut scope.with_op_name("logits_in"))
            .unwrap();
        let labels = ops::Placeholder::new()
            .dtype(DataType::Int32)
            .shape(known_shape(&[rows]))
            .build(&mut scope.with_op_name("labels_in"))
            .unwrap();
        (scope, logits, labels)
    }

    fn fetch_scalar(session: &Session, target: &Output, feeds: &[(&Operation, &Tensor<f32>)], labels: (&Operation, &Tensor<i32>)) -> f32 {
        let mut run = SessionRunArgs::new();
        for &(op, tensor) in feeds {
            run.add_feed(op, 0, tensor);
        }
        run.add_feed(labels.0, 0, labels.1);
        let fetch = run.request_fetch(&target.operation, target.index);
        session.run(&mut run).unwrap();
        let value: Tensor<f32> = run.fetch(fetch).unwrap();
        value[0]
    }

    #[test]
    fn one_hot_then_argmax_recovers_labels() {
        let mut scope = Scope::new_root_scope();
        let ids = [0i32, 3, 1, 4, 2, 2];
        let labels = ops::constant(&ids[..], &mut scope).unwrap();
        let onehot = one_hot_labels(labels, 5, &mut scope).unwrap();
        let classes = argmax_classes(onehot, &mut scope).unwrap();
        let session = Session::new(&SessionOptions::new(), &scope.graph()).unwrap();
        let mut run = SessionRunArgs::new();
        let fetch = run.request_fetch(&classes.operation, classes.index);
        session.run(&mut run).unwrap();
        let classes: Tensor<i64> = run.fetch(fetch).unwrap();
        assert_eq!(classes.to_vec(), ids.iter().map(|i| *i as i64).collect::<Vec<_>>());
    }

    #[test]
    fn softmax_loss_falls_as_correct_logit_rises() {
        let (mut scope, logits, labels) = logits_graph(1, 3);
        let onehot = one_hot_labels(labels.clone(), 3, &mut scope).unwrap();
        let loss = softmax_cross_entropy(logits.clone().into(), onehot, &mut scope).unwrap();
        let session = Session::new(&SessionOptions::new(), &scope.graph()).unwrap();
        let label = Tensor::<i32>::new(&[1]).with_values(&[1]).unwrap();

        let mut previous = f32::INFINITY;
        for correct in [-3.0f32, -1.0, 0.0, 0.5, 2.0, 4.0] {
            let feed = Tensor::<f32>::new(&[1, 3]).with_values(&[0.3, correct, -0.7]).unwrap();
            let value = fetch_scalar(&session, &loss, &[(&logits, &feed)], (&labels, &label));
            assert!(value >= 0.0);
            assert!(value < previous, "{} not below {}", value, previous);
            previous = value;
        }
    }

    #[test]
    fn sigmoid_loss_is_non_negative() {
        let (mut scope, logits, labels) = logits_graph(2, 2);
        let onehot = one_hot_labels(labels.clone(), 2, &mut scope).unwrap();
        let loss = sigmoid_cross_entropy(logits.clone().into(), onehot, &mut scope).unwrap();
        let session = Session::new(&SessionOptions::new(), &scope.graph()).unwrap();
        let label = Tensor::<i32>::new(&[2]).with_values(&[0, 1]).unwrap();
        for values in [[0.0f32, 0.0, 0.0, 0.0], [50.0, -50.0, -50.0, 50.0], [-9.0, 3.0, 1.5, -2.0]] {
            let feed = Tensor::<f32>::new(&[2, 2]).with_values(&values).unwrap();
            let value = fetch_scalar(&session, &loss, &[(&logits, &feed)], (&labels, &label));
            assert!(value >= 0.0 && value.is_finite());
        }
    }

    #[test]
    fn accuracy_and_probability_pair() {
        let (mut scope, logits, labels) = logits_graph(4, 2);
        let predictions = sigmoid_predictions(logits.clone().into(), &mut scope).unwrap();
        let acc = accuracy(predictions.classes.clone(), labels.clone().into(), &mut scope).unwrap();
        let session = Session::new(&SessionOptions::new(), &scope.graph()).unwrap();
        let feed = Tensor::<f32>::new(&[4, 2])
            .with_values(&[2.0, -1.0, 0.0, 1.0, 3.0, 0.5, -2.0, -1.0])
            .unwrap();
        // predicted classes are 0, 1, 0, 1
        let label = Tensor::<i32>::new(&[4]).with_values(&[0, 1, 1, 1]).unwrap();
        let value = fetch_scalar(&session, &acc, &[(&logits, &feed)], (&labels, &label));
        assert!((value - 0.75).abs() < 1e-6);

        let mut run = SessionRunArgs::new();
        run.add_feed(&logits, 0, &feed);
        let probs = &predictions.probabilities;
        let fetch = run.request_fetch(&probs.operation, probs.index);
        session.run(&mut run).unwrap();
        let probs: Tensor<f32> = run.fetch(fetch).unwrap();
        assert_eq!(probs.dims(), &[2, 4, 2]);
        for k in 0..8 {
            assert!((probs[k] + probs[k + 8] - 1.0).abs() < 1e-6);
        }
    }
}
