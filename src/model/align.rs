//! Frame-synchronous alignment head for the CTC segmentation loss.
use std::borrow::Borrow;
use std::sync::Arc;

use tch::nn::{self, Module};
use tch::{Kind, Tensor};

use crate::config::AlignDecoderConfig;
use crate::dictionary::Dictionary;

use super::encoder::EncoderOut;
use super::rnn::{lstm, Lstm};

/// Projects the shared encoder's per-timestep representations to a
/// log-probability distribution over the segmentation vocabulary plus one
/// blank symbol. No attention, no autoregression: output timestep t
/// corresponds to input timestep t.
#[derive(Debug)]
pub struct AlignmentDecoder {
    rnn: Lstm,
    fc_out: nn::Linear,
    blank_idx: i64,
}

impl AlignmentDecoder {
    pub fn new<'a, T: Borrow<nn::Path<'a>>>(
        vs: T,
        seg_dict: &Arc<Dictionary>,
        encoder_output_units: i64,
        cfg: &AlignDecoderConfig,
    ) -> AlignmentDecoder {
        let vs = vs.borrow();
        // The blank gets the one id no real symbol uses.
        let blank_idx = seg_dict.len();
        let rnn = lstm(vs / "rnn", encoder_output_units, cfg.hidden_size, cfg.num_layers, false, 0.);
        let fc_out = nn::linear(vs / "fc_out", cfg.hidden_size, blank_idx + 1, Default::default());
        AlignmentDecoder { rnn, fc_out, blank_idx }
    }

    /// Maps encoder outputs [src_len, batch, units] to log-probabilities
    /// [src_len, batch, seg_vocab + 1].
    pub fn forward(&self, encoder_out: &EncoderOut, train: bool) -> Tensor {
        let (rnn_out, _) = self.rnn.seq(&encoder_out.outputs, train);
        self.fc_out.forward(&rnn_out).log_softmax(2, Kind::Float)
    }

    /// The reserved blank id, equal to the segmentation vocabulary size.
    pub fn blank_idx(&self) -> i64 {
        self.blank_idx
    }
}
