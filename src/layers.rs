//! Parameter-owning layers and the stateless helpers around them.
//!
//! Every layer creates its variables exactly once in `new` and can then be
//! applied to any number of inputs with `apply`. Applying a layer twice never
//! creates new variables, which is how telescopes share a single parameter set.
use tensorflow::ops;
use tensorflow::Code;
use tensorflow::DataType;
use tensorflow::Output;
use tensorflow::Scope;
use tensorflow::Shape;
use tensorflow::Status;
use tensorflow::Tensor;
use tensorflow::Variable;

use crate::activations::Activation;

const LAYER_NORM_EPSILON: f32 = 1e-12;

/// Spatial size of a SAME padded convolution or pool with the given stride.
pub fn same_padding_size(size: u64, stride: u64) -> u64 {
    (size + stride - 1) / stride
}

/// Fully known static shape.
pub fn known_shape(dims: &[u64]) -> Shape {
    Shape::from(Some(dims.iter().map(|d| Some(*d as i64)).collect::<Vec<_>>()))
}

/// He-scaled normal weights for a parameter of the given shape.
fn normal_weights(shape: &[u64], fan_in: u64, name: &str, scope: &mut Scope) -> Result<Variable, Status> {
    let dims: Vec<i64> = shape.iter().map(|d| *d as i64).collect();
    let w_shape = ops::constant(&dims[..], scope)?;
    let stddev = ops::constant((2.0 / fan_in.max(1) as f32).sqrt(), scope)?;
    Variable::builder()
        .initial_value(ops::multiply(
            ops::RandomStandardNormal::new()
                .dtype(DataType::Float)
                .build(w_shape, scope)?,
            stddev,
            scope,
        )?)
        .data_type(DataType::Float)
        .shape(known_shape(shape))
        .build(&mut scope.with_op_name(name))
}

fn filled(size: u64, value: f32, name: &str, scope: &mut Scope) -> Result<Variable, Status> {
    Variable::builder()
        .const_initial_value(Tensor::<f32>::new(&[size]).with_values(&vec![value; size as usize])?)
        .build(&mut scope.with_op_name(name))
}

/// A standard fully connected layer with an optional bias term.
pub struct Dense {
    w: Variable,
    b: Option<Variable>,
    output_size: u64,
}

impl Dense {
    pub fn new(input_size: u64, output_size: u64, use_bias: bool, scope: &mut Scope) -> Result<Dense, Status> {
        let mut scope = scope.new_sub_scope("dense");
        let scope = &mut scope;
        let w = normal_weights(&[input_size, output_size], input_size, "w", scope)?;
        let b = if use_bias {
            Some(filled(output_size, 0.0, "b", scope)?)
        } else {
            None
        };
        Ok(Dense { w, b, output_size })
    }

    pub fn output_size(&self) -> u64 {
        self.output_size
    }

    /// `input` must be rank 2: (batch, input_size).
    pub fn apply<O: Into<Output>>(&self, input: O, activation: &Activation, scope: &mut Scope) -> Result<Output, Status> {
        let mut out: Output = ops::mat_mul(input, self.w.output().clone(), scope)?.into();
        if let Some(b) = &self.b {
            out = ops::bias_add(out, b.output().clone(), scope)?.into();
        }
        activation(out, scope)
    }

    pub fn variables(&self) -> Vec<Variable> {
        let mut vars = vec![self.w.clone()];
        vars.extend(self.b.iter().cloned());
        vars
    }
}

/// 2D convolution over NHWC input with SAME padding and a bias term.
pub struct Conv2d {
    filter: Variable,
    bias: Variable,
    stride: u64,
}

impl Conv2d {
    pub fn new(kernel: u64, in_channels: u64, filters: u64, stride: u64, scope: &mut Scope) -> Result<Conv2d, Status> {
        let mut scope = scope.new_sub_scope("conv2d");
        let scope = &mut scope;
        let filter = normal_weights(
            &[kernel, kernel, in_channels, filters],
            kernel * kernel * in_channels,
            "filter",
            scope,
        )?;
        let bias = filled(filters, 0.0, "bias", scope)?;
        Ok(Conv2d { filter, bias, stride })
    }

    pub fn apply<O: Into<Output>>(&self, input: O, activation: &Activation, scope: &mut Scope) -> Result<Output, Status> {
        let s = self.stride as i64;
        let conv = ops::Conv2D::new()
            .strides(vec![1, s, s, 1])
            .padding("SAME")
            .build(input, self.filter.output().clone(), scope)?;
        let out = ops::bias_add(conv, self.bias.output().clone(), scope)?;
        activation(out.into(), scope)
    }

    pub fn variables(&self) -> Vec<Variable> {
        vec![self.filter.clone(), self.bias.clone()]
    }
}

/// Depthwise 3x3 style convolution (channel multiplier 1) with SAME padding.
pub struct DepthwiseConv2d {
    filter: Variable,
    bias: Variable,
    stride: u64,
}

impl DepthwiseConv2d {
    pub fn new(kernel: u64, channels: u64, stride: u64, scope: &mut Scope) -> Result<DepthwiseConv2d, Status> {
        let mut scope = scope.new_sub_scope("depthwise");
        let scope = &mut scope;
        let filter = normal_weights(&[kernel, kernel, channels, 1], kernel * kernel, "filter", scope)?;
        let bias = filled(channels, 0.0, "bias", scope)?;
        Ok(DepthwiseConv2d { filter, bias, stride })
    }

    pub fn apply<O: Into<Output>>(&self, input: O, activation: &Activation, scope: &mut Scope) -> Result<Output, Status> {
        let s = self.stride as i64;
        let conv = ops::DepthwiseConv2dNative::new()
            .strides(vec![1, s, s, 1])
            .padding("SAME")
            .build(input, self.filter.output().clone(), scope)?;
        let out = ops::bias_add(conv, self.bias.output().clone(), scope)?;
        activation(out.into(), scope)
    }

    pub fn variables(&self) -> Vec<Variable> {
        vec![self.filter.clone(), self.bias.clone()]
    }
}

/// Layer normalization over the last axis with a learned gain and shift.
pub struct LayerNorm {
    gain: Variable,
    shift: Variable,
}

impl LayerNorm {
    pub fn new(units: u64, scope: &mut Scope) -> Result<LayerNorm, Status> {
        let mut scope = scope.new_sub_scope("layer_norm");
        let scope = &mut scope;
        Ok(LayerNorm {
            gain: filled(units, 1.0, "gain", scope)?,
            shift: filled(units, 0.0, "shift", scope)?,
        })
    }

    pub fn apply<O: Into<Output>>(&self, input: O, scope: &mut Scope) -> Result<Output, Status> {
        let input = input.into();
        let axis = ops::constant(&[-1i32][..], scope)?;
        let mean = ops::Mean::new().keep_dims(true).build(input.clone(), axis.clone(), scope)?;
        let centered = ops::sub(input, mean, scope)?;
        let variance = ops::Mean::new()
            .keep_dims(true)
            .build(ops::square(centered.clone(), scope)?, axis, scope)?;
        let inv_std = ops::rsqrt(
            ops::add(variance, ops::constant(LAYER_NORM_EPSILON, scope)?, scope)?,
            scope,
        )?;
        let normed = ops::multiply(centered, inv_std, scope)?;
        let scaled = ops::multiply(normed, self.gain.output().clone(), scope)?;
        Ok(ops::add(scaled, self.shift.output().clone(), scope)?.into())
    }

    pub fn variables(&self) -> Vec<Variable> {
        vec![self.gain.clone(), self.shift.clone()]
    }
}

/// SAME padded max pooling with a square window.
pub fn max_pool<O: Into<Output>>(input: O, size: u64, stride: u64, scope: &mut Scope) -> Result<Output, Status> {
    let (k, s) = (size as i64, stride as i64);
    Ok(ops::MaxPool::new()
        .ksize(vec![1, k, k, 1])
        .strides(vec![1, s, s, 1])
        .padding("SAME")
        .build(input, scope)?
        .into())
}

/// Reshape to (batch, flat_size).
pub fn flatten<O: Into<Output>>(input: O, flat_size: u64, scope: &mut Scope) -> Result<Output, Status> {
    let shape = ops::constant(&[-1i32, flat_size as i32][..], scope)?;
    Ok(ops::reshape(input, shape, scope)?.into())
}

/// Inverted dropout. There is no training switch: the mask is sampled on every run.
pub fn dropout<O: Into<Output>>(input: O, rate: f32, scope: &mut Scope) -> Result<Output, Status> {
    let input = input.into();
    let keep = 1.0 - rate;
    let noise = ops::RandomUniform::new()
        .dtype(DataType::Float)
        .build(ops::shape(input.clone(), scope)?, scope)?;
    let mask = ops::floor(ops::add(noise, ops::constant(keep, scope)?, scope)?, scope)?;
    let scaled = ops::div(input, ops::constant(keep, scope)?, scope)?;
    Ok(ops::multiply(scaled, mask, scope)?.into())
}

fn list_dtype(values: &[Output], op_type: &str) -> Result<DataType, Status> {
    match values.first() {
        Some(first) => Ok(first.operation.output_type(first.index as usize)),
        None => Err(Status::new_set_lossy(
            Code::InvalidArgument,
            &format!("{} needs at least one input", op_type),
        )),
    }
}

/// Concatenate `values` along `axis`.
pub fn concat(values: Vec<Output>, axis: i32, scope: &mut Scope) -> Result<Output, Status> {
    let dtype = list_dtype(&values, "ConcatV2")?;
    let axis = ops::constant(axis, scope)?;
    let name = scope.get_unique_name_for_op("ConcatV2");
    let mut graph = scope.graph_mut();
    let mut op = graph.new_operation("ConcatV2", &name)?;
    op.add_input_list(&values);
    op.add_input(axis);
    op.set_attr_int("N", values.len() as i64)?;
    op.set_attr_type("T", dtype)?;
    op.set_attr_type("Tidx", DataType::Int32)?;
    let concat = op.finish()?;
    Ok(concat.into())
}

/// Stack equally shaped `values` on a new `axis`.
pub fn stack(values: Vec<Output>, axis: i64, scope: &mut Scope) -> Result<Output, Status> {
    let dtype = list_dtype(&values, "Pack")?;
    let name = scope.get_unique_name_for_op("Pack");
    let mut graph = scope.graph_mut();
    let mut op = graph.new_operation("Pack", &name)?;
    op.add_input_list(&values);
    op.set_attr_int("N", values.len() as i64)?;
    op.set_attr_type("T", dtype)?;
    op.set_attr_int("axis", axis)?;
    let packed = op.finish()?;
    Ok(packed.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activations;
    use tensorflow::Session;
    use tensorflow::SessionOptions;
    use tensorflow::SessionRunArgs;

    #[test]
    fn same_padding_rounds_up() {
        assert_eq!(same_padding_size(2, 4), 1);
        assert_eq!(same_padding_size(240, 4), 60);
        assert_eq!(same_padding_size(7, 2), 4);
        assert_eq!(same_padding_size(1, 2), 1);
    }

    #[test]
    fn dense_reuses_its_variables() {
        let mut scope = Scope::new_root_scope();
        let dense = Dense::new(4, 3, true, &mut scope).unwrap();
        let input = ops::Placeholder::new()
            .dtype(DataType::Float)
            .shape([2u64, 4])
            .build(&mut scope.with_op_name("input"))
            .unwrap();
        let first = dense.apply(input.clone(), &*activations::relu(), &mut scope).unwrap();
        let second = dense.apply(input.clone(), &*activations::relu(), &mut scope).unwrap();
        assert_eq!(dense.variables().len(), 2);

        let session = Session::new(&SessionOptions::new(), &scope.graph()).unwrap();
        let mut init = SessionRunArgs::new();
        for var in dense.variables() {
            init.add_target(&var.initializer());
        }
        session.run(&mut init).unwrap();

        let data = Tensor::<f32>::new(&[2, 4])
            .with_values(&[1.0, -2.0, 3.0, 0.5, 0.0, 1.0, 1.0, 1.0])
            .unwrap();
        let mut run = SessionRunArgs::new();
        run.add_feed(&input, 0, &data);
        let a = run.request_fetch(&first.operation, first.index);
        let b = run.request_fetch(&second.operation, second.index);
        session.run(&mut run).unwrap();
        let a: Tensor<f32> = run.fetch(a).unwrap();
        let b: Tensor<f32> = run.fetch(b).unwrap();
        assert_eq!(a.dims(), &[2, 3]);
        assert_eq!(a.to_vec(), b.to_vec());
    }

    fn fetch_f32(scope: &Scope, out: &Output) -> Tensor<f32> {
        let session = Session::new(&SessionOptions::new(), &scope.graph()).unwrap();
        let mut run = SessionRunArgs::new();
        let fetch = run.request_fetch(&out.operation, out.index);
        session.run(&mut run).unwrap();
        run.fetch(fetch).unwrap()
    }

    #[test]
    fn concat_and_stack_take_lists() {
        let mut scope = Scope::new_root_scope();
        let a: Output = ops::constant(
            Tensor::<f32>::new(&[2, 1]).with_values(&[1.0, 2.0]).unwrap(),
            &mut scope,
        )
        .unwrap()
        .into();
        let b: Output = ops::constant(
            Tensor::<f32>::new(&[2, 1]).with_values(&[3.0, 4.0]).unwrap(),
            &mut scope,
        )
        .unwrap()
        .into();
        let joined = concat(vec![a.clone(), b.clone(), a.clone()], 1, &mut scope).unwrap();
        let stacked = stack(vec![a, b], 0, &mut scope).unwrap();

        let joined = fetch_f32(&scope, &joined);
        assert_eq!(joined.dims(), &[2, 3]);
        assert_eq!(joined.to_vec(), vec![1.0, 3.0, 1.0, 2.0, 4.0, 2.0]);
        let stacked = fetch_f32(&scope, &stacked);
        assert_eq!(stacked.dims(), &[2, 2, 1]);
        assert_eq!(stacked.to_vec(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn empty_lists_are_rejected() {
        let mut scope = Scope::new_root_scope();
        assert!(concat(vec![], 0, &mut scope).is_err());
        assert!(stack(vec![], 0, &mut scope).is_err());
    }

    #[test]
    fn layer_norm_centers_rows() {
        let mut scope = Scope::new_root_scope();
        let norm = LayerNorm::new(4, &mut scope).unwrap();
        let input = ops::constant(
            Tensor::<f32>::new(&[1, 4]).with_values(&[1.0, 2.0, 3.0, 4.0]).unwrap(),
            &mut scope,
        )
        .unwrap();
        let out = norm.apply(input, &mut scope).unwrap();
        let session = Session::new(&SessionOptions::new(), &scope.graph()).unwrap();
        let mut init = SessionRunArgs::new();
        for var in norm.variables() {
            init.add_target(&var.initializer());
        }
        session.run(&mut init).unwrap();
        let mut run = SessionRunArgs::new();
        let fetch = run.request_fetch(&out.operation, out.index);
        session.run(&mut run).unwrap();
        let out: Tensor<f32> = run.fetch(fetch).unwrap();
        let sum: f32 = out.iter().sum();
        assert!(sum.abs() < 1e-4);
        assert!(out[0] < out[3]);
    }
}
