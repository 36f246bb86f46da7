//! Recurrent encoders over padded token batches.
use std::borrow::Borrow;
use std::sync::Arc;

use tch::nn;
use tch::Tensor;

use crate::config::EncoderConfig;
use crate::data::convert_padding_direction;
use crate::dictionary::Dictionary;
use crate::error::{Result, SegNmtError};

use super::embedding::{embedding, Embedding};
use super::rnn::{lstm, Lstm};

/// The output of an encoder pass.
///
/// `outputs` has shape [src_len, batch, units], the final states
/// [layers, batch, units]; `units` doubles for bidirectional encoders.
/// `padding_mask` is [src_len, batch], true at padded positions, and absent
/// when the batch carries no padding. Consumers read these tensors but never
/// mutate them; beam search obtains reindexed views through [`EncoderOut::reorder`].
#[derive(Debug)]
pub struct EncoderOut {
    pub outputs: Tensor,
    pub hiddens: Tensor,
    pub cells: Tensor,
    pub padding_mask: Option<Tensor>,
}

impl EncoderOut {
    /// Returns a copy of this output with the batch axis permuted by
    /// `new_order`. The original is left untouched so that other live
    /// hypotheses can keep referencing it.
    pub fn reorder(&self, new_order: &Tensor) -> EncoderOut {
        EncoderOut {
            outputs: self.outputs.index_select(1, new_order),
            hiddens: self.hiddens.index_select(1, new_order),
            cells: self.cells.index_select(1, new_order),
            padding_mask: self.padding_mask.as_ref().map(|m| m.index_select(1, new_order)),
        }
    }
}

/// A bidirectional LSTM encoder.
///
/// Used both as the shared character-level encoder and as the translation
/// encoder over the segmentation sequence.
#[derive(Debug)]
pub struct LstmEncoder {
    embed_tokens: Embedding,
    lstm: Lstm,
    num_layers: i64,
    hidden_size: i64,
    bidirectional: bool,
    dropout_in: f64,
    dropout_out: f64,
    left_pad: bool,
    padding_idx: i64,
    output_units: i64,
    max_positions: i64,
}

impl LstmEncoder {
    pub fn new<'a, T: Borrow<nn::Path<'a>>>(
        vs: T,
        dictionary: &Arc<Dictionary>,
        cfg: &EncoderConfig,
        pretrained_embed: Option<Embedding>,
    ) -> LstmEncoder {
        let vs = vs.borrow();
        let padding_idx = dictionary.pad();
        let embed_tokens = match pretrained_embed {
            Some(embed) => embed,
            None => {
                embedding(vs / "embed_tokens", dictionary.len(), cfg.embed_dim, padding_idx)
            }
        };
        let lstm = lstm(
            vs / "lstm",
            cfg.embed_dim,
            cfg.hidden_size,
            cfg.num_layers,
            cfg.bidirectional,
            cfg.dropout_out,
        );
        let output_units =
            if cfg.bidirectional { 2 * cfg.hidden_size } else { cfg.hidden_size };
        LstmEncoder {
            embed_tokens,
            lstm,
            num_layers: cfg.num_layers,
            hidden_size: cfg.hidden_size,
            bidirectional: cfg.bidirectional,
            dropout_in: cfg.dropout_in,
            dropout_out: cfg.dropout_out,
            left_pad: cfg.left_pad,
            padding_idx,
            output_units,
            max_positions: cfg.max_positions,
        }
    }

    /// Encodes a padded batch of shape [batch, src_len] with the given true
    /// lengths. Tokens and lengths must agree on the batch size.
    pub fn forward(&self, tokens: &Tensor, lengths: &[i64], train: bool) -> Result<EncoderOut> {
        let (bsz, seq_len) = tokens.size2()?;
        if lengths.len() as i64 != bsz {
            return Err(SegNmtError::Shape(format!(
                "encoder got {} tokens rows but {} lengths",
                bsz,
                lengths.len()
            )));
        }
        // The packed recurrence wants right-padding.
        let tokens = if self.left_pad {
            convert_padding_direction(tokens, self.padding_idx, lengths, true)?
        } else {
            tokens.shallow_clone()
        };

        // Packing also wants lengths sorted in decreasing order; sort here
        // and restore the caller's batch order on the way out.
        let order: Option<Vec<i64>> = if lengths.windows(2).all(|w| w[0] >= w[1]) {
            None
        } else {
            let mut order: Vec<i64> = (0..bsz).collect();
            order.sort_by_key(|&i| std::cmp::Reverse(lengths[i as usize]));
            Some(order)
        };
        let (tokens_sorted, lengths_sorted) = match &order {
            None => (tokens.shallow_clone(), lengths.to_vec()),
            Some(order) => {
                let order_t = Tensor::from_slice(order).to_device(tokens.device());
                let sorted = tokens.index_select(0, &order_t);
                let lengths = order.iter().map(|&i| lengths[i as usize]).collect();
                (sorted, lengths)
            }
        };

        let x = self.embed_tokens.forward(&tokens_sorted).dropout(self.dropout_in, train);
        // B x T x C -> T x B x C
        let x = x.transpose(0, 1);
        let (x, (final_hiddens, final_cells)) = self.lstm.seq_packed(&x, &lengths_sorted, train);
        let x = x.dropout(self.dropout_out, train);
        debug_assert_eq!(x.size(), [seq_len, bsz, self.output_units]);

        let (final_hiddens, final_cells) = if self.bidirectional {
            // Fuse the forward/backward final states of each layer along
            // the feature axis so the decoder sees one state per layer.
            let combine = |outs: Tensor| {
                outs.view([self.num_layers, 2, bsz, self.hidden_size])
                    .transpose(1, 2)
                    .contiguous()
                    .view([self.num_layers, bsz, 2 * self.hidden_size])
            };
            (combine(final_hiddens), combine(final_cells))
        } else {
            (final_hiddens, final_cells)
        };

        // Undo the length sort.
        let (x, final_hiddens, final_cells, tokens) = match &order {
            None => (x, final_hiddens, final_cells, tokens),
            Some(order) => {
                let mut inverse = vec![0i64; bsz as usize];
                for (sorted_idx, &orig_idx) in order.iter().enumerate() {
                    inverse[orig_idx as usize] = sorted_idx as i64;
                }
                let inverse = Tensor::from_slice(&inverse).to_device(tokens.device());
                (
                    x.index_select(1, &inverse),
                    final_hiddens.index_select(1, &inverse),
                    final_cells.index_select(1, &inverse),
                    tokens,
                )
            }
        };

        let padding_mask = tokens.eq(self.padding_idx).transpose(0, 1);
        let padding_mask =
            if padding_mask.any().int64_value(&[]) != 0 { Some(padding_mask) } else { None };

        Ok(EncoderOut { outputs: x, hiddens: final_hiddens, cells: final_cells, padding_mask })
    }

    /// Width of the per-timestep representations.
    pub fn output_units(&self) -> i64 {
        self.output_units
    }

    pub fn num_layers(&self) -> i64 {
        self.num_layers
    }

    /// Maximum input length supported by the encoder.
    pub fn max_positions(&self) -> i64 {
        self.max_positions
    }
}
