//! Dot-product attention over encoder outputs.
use std::borrow::Borrow;

use tch::nn::{self, Module};
use tch::{Kind, Tensor};

/// Single-head attention conditioning a decoder state on encoder outputs.
///
/// Scores are computed in full precision before masking so that the
/// negative-infinity fill stays stable under reduced-precision training.
/// Rows whose source positions are all padded fall back to zero attention
/// (the context becomes the zero vector) instead of propagating NaN.
#[derive(Debug)]
pub struct AttentionLayer {
    input_proj: nn::Linear,
    output_proj: nn::Linear,
}

impl AttentionLayer {
    pub fn new<'a, T: Borrow<nn::Path<'a>>>(
        vs: T,
        input_embed_dim: i64,
        source_embed_dim: i64,
        output_embed_dim: i64,
    ) -> AttentionLayer {
        let vs = vs.borrow();
        let no_bias = nn::LinearConfig { bias: false, ..Default::default() };
        AttentionLayer {
            input_proj: nn::linear(vs / "input_proj", input_embed_dim, source_embed_dim, no_bias),
            output_proj: nn::linear(
                vs / "output_proj",
                input_embed_dim + source_embed_dim,
                output_embed_dim,
                no_bias,
            ),
        }
    }

    /// `input` is [batch, input_embed_dim], `source_hids` is
    /// [src_len, batch, source_embed_dim]. Returns the attended output
    /// [batch, output_embed_dim] and the attention weights [src_len, batch].
    pub fn forward(
        &self,
        input: &Tensor,
        source_hids: &Tensor,
        padding_mask: Option<&Tensor>,
    ) -> (Tensor, Tensor) {
        let x = self.input_proj.forward(input);

        // Unnormalized scores, one per source timestep: src_len x batch.
        let attn_scores = (source_hids * x.unsqueeze(0)).sum_dim_intlist(2, false, Kind::Float);

        let attn_scores = match padding_mask {
            None => attn_scores,
            Some(mask) => {
                let kind = attn_scores.kind();
                attn_scores
                    .to_kind(Kind::Float)
                    .masked_fill(mask, f64::NEG_INFINITY)
                    .to_kind(kind)
            }
        };
        let attn_scores = attn_scores.softmax(0, Kind::Float);
        // A fully padded row softmaxes to NaN; zero attention is the
        // documented fallback.
        let attn_scores = match padding_mask {
            None => attn_scores,
            Some(mask) => {
                let all_padded = mask.all_dim(0, true);
                attn_scores.masked_fill(&all_padded, 0.)
            }
        };

        // Weighted sum over source timesteps: batch x source_embed_dim.
        let context = (attn_scores.unsqueeze(2) * source_hids).sum_dim_intlist(0, false, Kind::Float);

        let output =
            self.output_proj.forward(&Tensor::cat(&[context, input.shallow_clone()], 1)).tanh();
        (output, attn_scores)
    }
}
