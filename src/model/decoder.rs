//! Autoregressive LSTM decoder with attention and input feeding.
use std::borrow::Borrow;
use std::sync::Arc;

use tch::nn::{self, Module};
use tch::{Kind, Tensor};

use crate::config::DecoderConfig;
use crate::dictionary::Dictionary;
use crate::error::{Result, SegNmtError};

use super::adaptive::AdaptiveSoftmax;
use super::attention::AttentionLayer;
use super::embedding::{embedding, Embedding};
use super::encoder::EncoderOut;
use super::rnn::{lstm_cell, LstmCell};

/// Reindexes cached state along the batch axis. The `Vec` impl recurses,
/// so arbitrarily nested state structures reorder at their tensor leaves.
pub trait Reorderable {
    fn reorder(&self, new_order: &Tensor) -> Self;
}

impl Reorderable for Tensor {
    fn reorder(&self, new_order: &Tensor) -> Tensor {
        self.index_select(0, new_order)
    }
}

impl<T: Reorderable> Reorderable for Vec<T> {
    fn reorder(&self, new_order: &Tensor) -> Vec<T> {
        self.iter().map(|state| state.reorder(new_order)).collect()
    }
}

/// Per-layer recurrent states plus the previous attention context.
#[derive(Debug)]
pub struct CachedState {
    hiddens: Vec<Tensor>,
    cells: Vec<Tensor>,
    input_feed: Tensor,
}

impl Reorderable for CachedState {
    fn reorder(&self, new_order: &Tensor) -> CachedState {
        CachedState {
            hiddens: self.hiddens.reorder(new_order),
            cells: self.cells.reorder(new_order),
            input_feed: self.input_feed.reorder(new_order),
        }
    }
}

/// The decode cache for one generation session.
///
/// Starts cold; the first decode step of the session seeds it from the
/// encoder's final states and every later step updates it in place. The
/// generator owns exactly one per session, passes it exclusively into each
/// step, reorders it on beam pruning and drops it when generation ends.
#[derive(Debug, Default)]
pub struct IncrementalState {
    cached: Option<CachedState>,
}

impl IncrementalState {
    pub fn new() -> IncrementalState {
        IncrementalState { cached: None }
    }

    /// Whether the first decode step of the session has already run.
    pub fn is_warm(&self) -> bool {
        self.cached.is_some()
    }

    /// Forgets the session, e.g. when generation is abandoned.
    pub fn clear(&mut self) {
        self.cached = None;
    }

    /// Permutes the cached state along the batch axis, following the
    /// hypothesis reordering of the beam.
    pub fn reorder(&mut self, new_order: &Tensor) {
        if let Some(cached) = &self.cached {
            self.cached = Some(cached.reorder(new_order));
        }
    }
}

#[derive(Debug)]
enum OutputHead {
    /// Hierarchical softmax, produces normalized log-probabilities.
    Adaptive(AdaptiveSoftmax),
    /// Project through the transposed input embedding (weight tying).
    Tied,
    /// Independent learned projection.
    Projected(nn::Linear),
}

/// LSTM decoder with input feeding.
#[derive(Debug)]
pub struct LstmDecoder {
    embed_tokens: Embedding,
    layers: Vec<LstmCell>,
    attention: Option<AttentionLayer>,
    /// Present iff the encoder output width differs from the decoder width.
    encoder_hidden_proj: Option<nn::Linear>,
    encoder_cell_proj: Option<nn::Linear>,
    /// Present iff the decoder width differs from the output embedding width.
    additional_fc: Option<nn::Linear>,
    head: OutputHead,
    hidden_size: i64,
    encoder_output_units: i64,
    dropout_in: f64,
    dropout_out: f64,
    max_positions: i64,
}

impl LstmDecoder {
    #[allow(clippy::too_many_arguments)]
    pub fn new<'a, T: Borrow<nn::Path<'a>>>(
        vs: T,
        dictionary: &Arc<Dictionary>,
        cfg: &DecoderConfig,
        encoder_output_units: i64,
        encoder_num_layers: i64,
        pretrained_embed: Option<Embedding>,
        share_input_output_embed: bool,
        adaptive_softmax_cutoff: Option<&[i64]>,
    ) -> Result<LstmDecoder> {
        let vs = vs.borrow();
        if encoder_num_layers < cfg.num_layers {
            return Err(SegNmtError::Config(format!(
                "decoder has {} layers but the encoder provides only {} final states",
                cfg.num_layers, encoder_num_layers
            )));
        }
        let num_embeddings = dictionary.len();
        let embed_tokens = match pretrained_embed {
            Some(embed) => embed,
            None => {
                embedding(vs / "embed_tokens", num_embeddings, cfg.embed_dim, dictionary.pad())
            }
        };

        let (encoder_hidden_proj, encoder_cell_proj) = if encoder_output_units != cfg.hidden_size
        {
            (
                Some(nn::linear(
                    vs / "encoder_hidden_proj",
                    encoder_output_units,
                    cfg.hidden_size,
                    Default::default(),
                )),
                Some(nn::linear(
                    vs / "encoder_cell_proj",
                    encoder_output_units,
                    cfg.hidden_size,
                    Default::default(),
                )),
            )
        } else {
            (None, None)
        };

        let layers = (0..cfg.num_layers)
            .map(|layer| {
                let in_dim =
                    if layer == 0 { cfg.hidden_size + cfg.embed_dim } else { cfg.hidden_size };
                lstm_cell(vs / "layers" / layer, in_dim, cfg.hidden_size)
            })
            .collect();

        let attention = if cfg.attention {
            Some(AttentionLayer::new(
                vs / "attention",
                cfg.hidden_size,
                encoder_output_units,
                cfg.hidden_size,
            ))
        } else {
            None
        };

        let additional_fc = if cfg.hidden_size != cfg.out_embed_dim {
            Some(nn::linear(
                vs / "additional_fc",
                cfg.hidden_size,
                cfg.out_embed_dim,
                Default::default(),
            ))
        } else {
            None
        };

        let head = match adaptive_softmax_cutoff {
            Some(cutoffs) => OutputHead::Adaptive(AdaptiveSoftmax::new(
                vs / "adaptive_softmax",
                cfg.hidden_size,
                num_embeddings,
                cutoffs,
            )),
            None if share_input_output_embed => {
                if embed_tokens.embedding_dim() != cfg.out_embed_dim {
                    return Err(SegNmtError::Config(format!(
                        "weight tying needs out_embed_dim ({}) to match the embedding dim ({})",
                        cfg.out_embed_dim,
                        embed_tokens.embedding_dim()
                    )));
                }
                OutputHead::Tied
            }
            None => OutputHead::Projected(nn::linear(
                vs / "fc_out",
                cfg.out_embed_dim,
                num_embeddings,
                Default::default(),
            )),
        };

        Ok(LstmDecoder {
            embed_tokens,
            layers,
            attention,
            encoder_hidden_proj,
            encoder_cell_proj,
            additional_fc,
            head,
            hidden_size: cfg.hidden_size,
            encoder_output_units,
            dropout_in: cfg.dropout_in,
            dropout_out: cfg.dropout_out,
            max_positions: cfg.max_positions,
        })
    }

    fn initial_state(&self, encoder_out: &EncoderOut, bsz: i64) -> Result<CachedState> {
        let (enc_layers, enc_bsz, enc_units) = encoder_out.hiddens.size3()?;
        if enc_bsz != bsz {
            return Err(SegNmtError::Shape(format!(
                "encoder states cover batch size {enc_bsz}, decoder input has {bsz}"
            )));
        }
        if enc_units != self.encoder_output_units || enc_layers < self.layers.len() as i64 {
            return Err(SegNmtError::Shape(format!(
                "encoder states ({enc_layers} layers, width {enc_units}) do not provide a prior \
                 for this decoder ({} layers, expected width {})",
                self.layers.len(),
                self.encoder_output_units
            )));
        }
        let mut hiddens = Vec::with_capacity(self.layers.len());
        let mut cells = Vec::with_capacity(self.layers.len());
        for i in 0..self.layers.len() as i64 {
            let h = encoder_out.hiddens.select(0, i);
            let c = encoder_out.cells.select(0, i);
            match (&self.encoder_hidden_proj, &self.encoder_cell_proj) {
                (Some(h_proj), Some(c_proj)) => {
                    hiddens.push(h_proj.forward(&h));
                    cells.push(c_proj.forward(&c));
                }
                _ => {
                    hiddens.push(h);
                    cells.push(c);
                }
            }
        }
        let input_feed = Tensor::zeros(
            [bsz, self.hidden_size],
            (self.embed_tokens.ws.kind(), self.embed_tokens.ws.device()),
        );
        Ok(CachedState { hiddens, cells, input_feed })
    }

    /// Runs the decoder over `prev_output_tokens` ([batch, tgt_len]).
    ///
    /// With `incremental` set, only the last token column is consumed and
    /// the session cache is read and updated, so generation resumes from
    /// the previous step without recomputation. Returns the output logits
    /// [batch, tgt_len, vocab] (already log-normalized for the adaptive
    /// head) and, when attention is enabled, the attention weights
    /// [batch, tgt_len, src_len].
    pub fn forward(
        &self,
        prev_output_tokens: &Tensor,
        encoder_out: &EncoderOut,
        mut incremental: Option<&mut IncrementalState>,
        train: bool,
    ) -> Result<(Tensor, Option<Tensor>)> {
        let prev_output_tokens = if incremental.is_some() {
            let (_, seqlen) = prev_output_tokens.size2()?;
            prev_output_tokens.narrow(1, seqlen - 1, 1)
        } else {
            prev_output_tokens.shallow_clone()
        };
        let (bsz, seqlen) = prev_output_tokens.size2()?;

        let x = self
            .embed_tokens
            .forward(&prev_output_tokens)
            .dropout(self.dropout_in, train)
            .transpose(0, 1);

        let mut state = match incremental.as_deref_mut() {
            Some(session) => match session.cached.take() {
                Some(cached) => {
                    if cached.input_feed.size()[0] != bsz {
                        return Err(SegNmtError::Shape(format!(
                            "cached decoder state covers batch size {}, input has {bsz}",
                            cached.input_feed.size()[0]
                        )));
                    }
                    cached
                }
                None => self.initial_state(encoder_out, bsz)?,
            },
            None => self.initial_state(encoder_out, bsz)?,
        };

        let mut outs: Vec<Tensor> = Vec::with_capacity(seqlen as usize);
        let mut attn_cols: Vec<Tensor> = Vec::with_capacity(seqlen as usize);
        for j in 0..seqlen {
            // Input feeding: the previous attention context rides along
            // with the token embedding.
            let mut input =
                Tensor::cat(&[x.select(0, j), state.input_feed.shallow_clone()], 1);
            for (i, cell) in self.layers.iter().enumerate() {
                let (h, c) = cell.step(&input, &state.hiddens[i], &state.cells[i]);
                // The hidden state feeds the next layer up.
                input = h.dropout(self.dropout_out, train);
                state.hiddens[i] = h;
                state.cells[i] = c;
            }
            let top = state.hiddens.last().expect("decoder has at least one layer");
            let out = match &self.attention {
                Some(attention) => {
                    let (out, scores) = attention.forward(
                        top,
                        &encoder_out.outputs,
                        encoder_out.padding_mask.as_ref(),
                    );
                    attn_cols.push(scores);
                    out
                }
                None => top.shallow_clone(),
            };
            let out = out.dropout(self.dropout_out, train);
            state.input_feed = out.shallow_clone();
            outs.push(out);
        }

        if let Some(session) = incremental {
            session.cached = Some(state);
        }

        // T x B x H -> B x T x H
        let x = Tensor::stack(&outs, 0).transpose(0, 1);
        // tgt_len x src_len x batch -> batch x tgt_len x src_len
        let attn = if attn_cols.is_empty() {
            None
        } else {
            Some(Tensor::stack(&attn_cols, 0).permute([2, 0, 1]))
        };

        let x = match &self.additional_fc {
            Some(fc) => fc.forward(&x).dropout(self.dropout_out, train),
            None => x,
        };
        let logits = match &self.head {
            OutputHead::Adaptive(adaptive) => adaptive.log_prob(&x),
            OutputHead::Tied => x.linear(&self.embed_tokens.ws, None::<Tensor>),
            OutputHead::Projected(fc) => fc.forward(&x),
        };
        Ok((logits, attn))
    }

    /// Normalizes output logits to log-probabilities. The adaptive head
    /// already emits normalized log-probabilities, so this is the identity
    /// there.
    pub fn normalized_probs(&self, logits: &Tensor) -> Tensor {
        match &self.head {
            OutputHead::Adaptive(_) => logits.shallow_clone(),
            _ => logits.log_softmax(-1, Kind::Float),
        }
    }

    /// Reorders a session cache after beam pruning.
    pub fn reorder_incremental_state(&self, state: &mut IncrementalState, new_order: &Tensor) {
        state.reorder(new_order);
    }

    /// Maximum output length supported by the decoder.
    pub fn max_positions(&self) -> i64 {
        self.max_positions
    }
}
