//! The array-level recurrent aggregator: a layer normalized LSTM cell wrapped
//! with attention over a window of its most recent outputs, unrolled over the
//! telescope axis with per-event sequence lengths.
use log::debug;
use tensorflow::ops;
use tensorflow::DataType;
use tensorflow::Output;
use tensorflow::Scope;
use tensorflow::Status;
use tensorflow::Variable;

use crate::activations;
use crate::layers::{concat, stack, Dense, LayerNorm};

/// Hidden and cell state of the LSTM.
#[derive(Clone)]
pub struct LstmState {
    pub c: Output,
    pub h: Output,
}

/// Basic LSTM with layer normalization on each gate and on the new cell state.
pub struct LayerNormLstmCell {
    kernel: Dense,
    gate_norms: Vec<LayerNorm>,
    state_norm: LayerNorm,
    units: u64,
    forget_bias: f32,
}

impl LayerNormLstmCell {
    pub fn new(input_size: u64, units: u64, forget_bias: f32, scope: &mut Scope) -> Result<LayerNormLstmCell, Status> {
        let mut scope = scope.new_sub_scope("layer_norm_lstm");
        let scope = &mut scope;
        let kernel = Dense::new(input_size + units, 4 * units, false, scope)?;
        let mut gate_norms = Vec::with_capacity(4);
        for _ in 0..4 {
            gate_norms.push(LayerNorm::new(units, scope)?);
        }
        let state_norm = LayerNorm::new(units, scope)?;
        Ok(LayerNormLstmCell {
            kernel,
            gate_norms,
            state_norm,
            units,
            forget_bias,
        })
    }

    pub fn units(&self) -> u64 {
        self.units
    }

    /// One step. Returns the cell output (the new `h`) and the new state.
    pub fn step(&self, input: Output, state: &LstmState, scope: &mut Scope) -> Result<(Output, LstmState), Status> {
        let args = concat(vec![input, state.h.clone()], 1, scope)?;
        let gates = self.kernel.apply(args, &*activations::identity(), scope)?;
        let split = ops::Split::new()
            .num_split(4)
            .build(ops::constant(1i32, scope)?, gates, scope)?;
        let mut normed = Vec::with_capacity(4);
        for (k, norm) in self.gate_norms.iter().enumerate() {
            normed.push(norm.apply(
                Output {
                    operation: split.clone(),
                    index: k as i32,
                },
                scope,
            )?);
        }
        // input, candidate, forget, output
        let (i, j, f, o) = (
            normed[0].clone(),
            normed[1].clone(),
            normed[2].clone(),
            normed[3].clone(),
        );
        let forget = ops::sigmoid(
            ops::add(f, ops::constant(self.forget_bias, scope)?, scope)?,
            scope,
        )?;
        let candidate = ops::multiply(ops::sigmoid(i, scope)?, ops::tanh(j, scope)?, scope)?;
        let c = ops::add(ops::multiply(state.c.clone(), forget, scope)?, candidate, scope)?;
        let c = self.state_norm.apply(c, scope)?;
        let h: Output = ops::multiply(ops::tanh(c.clone(), scope)?, ops::sigmoid(o, scope)?, scope)?.into();
        Ok((h.clone(), LstmState { c, h }))
    }

    pub fn variables(&self) -> Vec<Variable> {
        let mut vars = self.kernel.variables();
        for norm in &self.gate_norms {
            vars.extend(norm.variables());
        }
        vars.extend(self.state_norm.variables());
        vars
    }
}

/// Full recurrent state of the attention wrapper.
#[derive(Clone)]
pub struct AttentionState {
    pub cell: LstmState,
    /// (batch, attn_size) attention context from the previous step
    pub attention: Output,
    /// (batch, window, attn_size) most recent outputs, oldest first
    pub window: Output,
}

/// Wraps an LSTM so every step attends over a fixed window of past outputs.
pub struct AttentionLstm {
    input_projection: Dense,
    cell: LayerNormLstmCell,
    window_keys: Dense,
    query: Dense,
    score: Variable,
    output_projection: Dense,
    window_length: u64,
}

impl AttentionLstm {
    pub fn new(
        input_size: u64,
        units: u64,
        window_length: u64,
        forget_bias: f32,
        scope: &mut Scope,
    ) -> Result<AttentionLstm, Status> {
        let mut scope = scope.new_sub_scope("attention_lstm");
        let scope = &mut scope;
        // the attention size and attention vector size both equal the cell output size
        let attn_size = units;
        let input_projection = Dense::new(input_size + attn_size, input_size, true, scope)?;
        let cell = LayerNormLstmCell::new(input_size, units, forget_bias, scope)?;
        let window_keys = Dense::new(attn_size, attn_size, false, scope)?;
        let query = Dense::new(2 * units, attn_size, true, scope)?;
        let score = Variable::builder()
            .initial_value(ops::multiply(
                ops::RandomStandardNormal::new()
                    .dtype(DataType::Float)
                    .build(ops::constant(&[attn_size as i64][..], scope)?, scope)?,
                ops::constant(1.0 / (attn_size as f32).sqrt(), scope)?,
                scope,
            )?)
            .data_type(DataType::Float)
            .shape(crate::layers::known_shape(&[attn_size]))
            .build(&mut scope.with_op_name("attn_v"))?;
        let output_projection = Dense::new(units + attn_size, attn_size, true, scope)?;
        Ok(AttentionLstm {
            input_projection,
            cell,
            window_keys,
            query,
            score,
            output_projection,
            window_length,
        })
    }

    pub fn output_size(&self) -> u64 {
        self.cell.units()
    }

    /// All-zero state shaped for the batch of `like` (any (batch, ...) tensor).
    pub fn zero_state(&self, like: Output, scope: &mut Scope) -> Result<AttentionState, Status> {
        let units = self.cell.units() as i32;
        let batch = ops::slice(
            ops::shape(like, scope)?,
            ops::constant(&[0i32][..], scope)?,
            ops::constant(&[1i32][..], scope)?,
            scope,
        )?;
        let zeros = |trailing: &[i32], scope: &mut Scope| -> Result<Output, Status> {
            let dims = concat(vec![batch.clone().into(), ops::constant(trailing, scope)?.into()], 0, scope)?;
            Ok(ops::fill(dims, ops::constant(0f32, scope)?, scope)?.into())
        };
        let c = zeros(&[units], scope)?;
        let h = zeros(&[units], scope)?;
        let attention = zeros(&[units], scope)?;
        let window = zeros(&[self.window_length as i32, units], scope)?;
        Ok(AttentionState {
            cell: LstmState { c, h },
            attention,
            window,
        })
    }

    /// Attention context for `query_state` over `window`.
    fn attend(&self, query_state: Output, window: Output, scope: &mut Scope) -> Result<Output, Status> {
        let attn_size = self.cell.units() as i32;
        let length = self.window_length as i32;
        let flat_window = ops::reshape(
            window.clone(),
            ops::constant(&[-1i32, attn_size][..], scope)?,
            scope,
        )?;
        let keys = self.window_keys.apply(flat_window, &*activations::identity(), scope)?;
        let keys = ops::reshape(keys, ops::constant(&[-1i32, length, attn_size][..], scope)?, scope)?;
        let query = self.query.apply(query_state, &*activations::identity(), scope)?;
        let query = ops::reshape(query, ops::constant(&[-1i32, 1, attn_size][..], scope)?, scope)?;
        let energy = ops::multiply(
            ops::tanh(ops::add(keys, query, scope)?, scope)?,
            self.score.output().clone(),
            scope,
        )?;
        let scores = ops::sum(energy, ops::constant(2i32, scope)?, scope)?;
        let weights = ops::softmax(scores, scope)?;
        let weights = ops::reshape(weights, ops::constant(&[-1i32, length, 1][..], scope)?, scope)?;
        Ok(ops::sum(
            ops::multiply(weights, window, scope)?,
            ops::constant(1i32, scope)?,
            scope,
        )?
        .into())
    }

    /// One unmasked step. Returns the step output and the new state.
    pub fn step(&self, input: Output, state: &AttentionState, scope: &mut Scope) -> Result<(Output, AttentionState), Status> {
        let mut scope = scope.new_sub_scope("step");
        let scope = &mut scope;
        let projected_input = self.input_projection.apply(
            concat(vec![input, state.attention.clone()], 1, scope)?,
            &*activations::identity(),
            scope,
        )?;
        let (cell_output, cell) = self.cell.step(projected_input, &state.cell, scope)?;
        let query_state = concat(vec![cell.c.clone(), cell.h.clone()], 1, scope)?;
        let attention = self.attend(query_state, state.window.clone(), scope)?;
        let output = self.output_projection.apply(
            concat(vec![cell_output, attention.clone()], 1, scope)?,
            &*activations::identity(),
            scope,
        )?;
        // drop the oldest window entry and append this output
        let kept = ops::slice(
            state.window.clone(),
            ops::constant(&[0i32, 1, 0][..], scope)?,
            ops::constant(&[-1i32, -1, -1][..], scope)?,
            scope,
        )?;
        let newest = ops::reshape(
            output.clone(),
            ops::constant(&[-1i32, 1, self.cell.units() as i32][..], scope)?,
            scope,
        )?;
        let window = concat(vec![kept.into(), newest.into()], 1, scope)?;
        Ok((
            output,
            AttentionState {
                cell,
                attention,
                window,
            },
        ))
    }

    /// Run over `inputs` (batch, steps, input_size). Past an event's length the
    /// state is carried through unchanged and the step output is zero.
    ///
    /// Returns the (batch, steps, output_size) outputs and the final state.
    pub fn unroll(
        &self,
        inputs: Output,
        lengths: Output,
        steps: u64,
        scope: &mut Scope,
    ) -> Result<(Output, AttentionState), Status> {
        let mut scope = scope.new_sub_scope("rnn");
        let scope = &mut scope;
        let mut state = self.zero_state(inputs.clone(), scope)?;
        let mut outputs = Vec::with_capacity(steps as usize);
        for t in 0..steps {
            let input = ops::gather_v2(
                inputs.clone(),
                ops::constant(t as i32, scope)?,
                ops::constant(1i32, scope)?,
                scope,
            )?;
            let (output, next) = self.step(input.into(), &state, scope)?;

            let active = ops::Cast::new().DstT(DataType::Float).build(
                ops::less(ops::constant(t as i32, scope)?, lengths.clone(), scope)?,
                scope,
            )?;
            let active_rows = ops::reshape(active.clone(), ops::constant(&[-1i32, 1][..], scope)?, scope)?;
            let active_window = ops::reshape(active, ops::constant(&[-1i32, 1, 1][..], scope)?, scope)?;

            outputs.push(ops::multiply(output, active_rows.clone(), scope)?.into());
            state = AttentionState {
                cell: LstmState {
                    c: carry(next.cell.c, state.cell.c, active_rows.clone().into(), scope)?,
                    h: carry(next.cell.h, state.cell.h, active_rows.clone().into(), scope)?,
                },
                attention: carry(next.attention, state.attention, active_rows.into(), scope)?,
                window: carry(next.window, state.window, active_window.into(), scope)?,
            };
        }
        debug!("unrolled attention lstm over {} steps", steps);
        let stacked = stack(outputs, 1, scope)?;
        Ok((stacked, state))
    }

    pub fn variables(&self) -> Vec<Variable> {
        let mut vars = self.input_projection.variables();
        vars.extend(self.cell.variables());
        vars.extend(self.window_keys.variables());
        vars.extend(self.query.variables());
        vars.push(self.score.clone());
        vars.extend(self.output_projection.variables());
        vars
    }
}

/// `next` where `active` is 1, `previous` where it is 0.
fn carry(next: Output, previous: Output, active: Output, scope: &mut Scope) -> Result<Output, Status> {
    let delta = ops::sub(next, previous.clone(), scope)?;
    Ok(ops::add(previous, ops::multiply(delta, active, scope)?, scope)?.into())
}
