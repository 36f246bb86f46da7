//! Recurrent building blocks.
//!
//! Weight layout and naming follow the cudnn convention
//! (`weight_ih_l{layer}[_reverse]` etc.) so that checkpoints interoperate
//! with other Torch code. All weights are initialized uniformly in
//! [-0.1, 0.1]. Sequences are laid out time-first.
use std::borrow::Borrow;

use tch::nn::{self, Init};
use tch::{Device, Kind, Tensor};

const UNIFORM_INIT: Init = Init::Uniform { lo: -0.1, up: 0.1 };

fn lstm_weights<'a, T: Borrow<nn::Path<'a>>>(
    vs: T,
    in_dim: i64,
    hidden_dim: i64,
    num_layers: i64,
    num_directions: i64,
) -> Vec<Tensor> {
    let vs = vs.borrow();
    let gate_dim = 4 * hidden_dim;
    let mut flat_weights = vec![];
    for layer_idx in 0..num_layers {
        for direction_idx in 0..num_directions {
            let in_dim = if layer_idx == 0 { in_dim } else { hidden_dim * num_directions };
            let suffix = if direction_idx == 1 { "_reverse" } else { "" };
            let w_ih = vs.var(
                &format!("weight_ih_l{layer_idx}{suffix}"),
                &[gate_dim, in_dim],
                UNIFORM_INIT,
            );
            let w_hh = vs.var(
                &format!("weight_hh_l{layer_idx}{suffix}"),
                &[gate_dim, hidden_dim],
                UNIFORM_INIT,
            );
            let b_ih = vs.var(&format!("bias_ih_l{layer_idx}{suffix}"), &[gate_dim], UNIFORM_INIT);
            let b_hh = vs.var(&format!("bias_hh_l{layer_idx}{suffix}"), &[gate_dim], UNIFORM_INIT);
            flat_weights.push(w_ih);
            flat_weights.push(w_hh);
            flat_weights.push(b_ih);
            flat_weights.push(b_hh);
        }
    }
    flat_weights
}

/// A multi-layer (optionally bidirectional) LSTM over time-first sequences.
#[derive(Debug)]
pub struct Lstm {
    flat_weights: Vec<Tensor>,
    hidden_dim: i64,
    num_layers: i64,
    bidirectional: bool,
    /// Dropout between stacked layers, only active when `num_layers > 1`.
    dropout: f64,
    device: Device,
}

/// Creates a multi-layer LSTM.
pub fn lstm<'a, T: Borrow<nn::Path<'a>>>(
    vs: T,
    in_dim: i64,
    hidden_dim: i64,
    num_layers: i64,
    bidirectional: bool,
    dropout: f64,
) -> Lstm {
    let vs = vs.borrow();
    let num_directions = if bidirectional { 2 } else { 1 };
    let flat_weights = lstm_weights(vs, in_dim, hidden_dim, num_layers, num_directions);
    if vs.device().is_cuda() && tch::Cuda::cudnn_is_available() {
        let _ = Tensor::internal_cudnn_rnn_flatten_weight(
            &flat_weights,
            4,
            in_dim,
            2, // cudnn mode for LSTM
            hidden_dim,
            0, // no projections
            num_layers,
            false,
            bidirectional,
        );
    }
    Lstm { flat_weights, hidden_dim, num_layers, bidirectional, dropout, device: vs.device() }
}

impl Lstm {
    pub fn zero_state(&self, batch_dim: i64) -> (Tensor, Tensor) {
        let num_directions = if self.bidirectional { 2 } else { 1 };
        let shape = [self.num_layers * num_directions, batch_dim, self.hidden_dim];
        let zeros = Tensor::zeros(shape, (self.flat_weights[0].kind(), self.device));
        (zeros.shallow_clone(), zeros.shallow_clone())
    }

    /// Runs the LSTM over a full padded sequence of shape
    /// [seq_len, batch_size, features].
    pub fn seq(&self, input: &Tensor, train: bool) -> (Tensor, (Tensor, Tensor)) {
        let batch_dim = input.size()[1];
        let (h0, c0) = self.zero_state(batch_dim);
        let dropout = if self.num_layers > 1 { self.dropout } else { 0. };
        let flat_weights = self.flat_weights.iter().collect::<Vec<_>>();
        let (output, h, c) = input.lstm(
            &[&h0, &c0],
            &flat_weights,
            true,
            self.num_layers,
            dropout,
            train,
            self.bidirectional,
            false,
        );
        (output, (h, c))
    }

    /// Runs the LSTM over a packed sequence. `lengths` must be sorted in
    /// decreasing order and the input right-padded; the returned output is
    /// padded back to the input's time dimension.
    pub fn seq_packed(
        &self,
        input: &Tensor,
        lengths: &[i64],
        train: bool,
    ) -> (Tensor, (Tensor, Tensor)) {
        let seq_len = input.size()[0];
        let batch_dim = input.size()[1];
        let (h0, c0) = self.zero_state(batch_dim);
        let dropout = if self.num_layers > 1 { self.dropout } else { 0. };
        let lengths = Tensor::from_slice(lengths);
        let (packed, batch_sizes) = input.internal_pack_padded_sequence(&lengths, false);
        let flat_weights = self.flat_weights.iter().collect::<Vec<_>>();
        let (packed_out, h, c) = Tensor::lstm_data(
            &packed,
            &batch_sizes,
            &[&h0, &c0],
            &flat_weights,
            true,
            self.num_layers,
            dropout,
            train,
            self.bidirectional,
        );
        let (output, _lengths) =
            Tensor::internal_pad_packed_sequence(&packed_out, &batch_sizes, false, 0., seq_len);
        (output, (h, c))
    }

    pub fn output_units(&self) -> i64 {
        if self.bidirectional {
            2 * self.hidden_dim
        } else {
            self.hidden_dim
        }
    }

    pub fn kind(&self) -> Kind {
        self.flat_weights[0].kind()
    }
}

/// A single LSTM cell, used by the stacked decoder layers.
#[derive(Debug)]
pub struct LstmCell {
    w_ih: Tensor,
    w_hh: Tensor,
    b_ih: Tensor,
    b_hh: Tensor,
}

/// Creates an LSTM cell.
pub fn lstm_cell<'a, T: Borrow<nn::Path<'a>>>(vs: T, in_dim: i64, hidden_dim: i64) -> LstmCell {
    let vs = vs.borrow();
    let gate_dim = 4 * hidden_dim;
    LstmCell {
        w_ih: vs.var("weight_ih", &[gate_dim, in_dim], UNIFORM_INIT),
        w_hh: vs.var("weight_hh", &[gate_dim, hidden_dim], UNIFORM_INIT),
        b_ih: vs.var("bias_ih", &[gate_dim], UNIFORM_INIT),
        b_hh: vs.var("bias_hh", &[gate_dim], UNIFORM_INIT),
    }
}

impl LstmCell {
    /// Applies one step, input [batch_size, features], returning the new
    /// hidden and cell states.
    pub fn step(&self, input: &Tensor, h: &Tensor, c: &Tensor) -> (Tensor, Tensor) {
        input.lstm_cell(&[h, c], &self.w_ih, &self.w_hh, Some(&self.b_ih), Some(&self.b_hh))
    }
}
