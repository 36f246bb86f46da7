//! The joint segmentation/translation model.
//!
//! A batch flows through the shared character-level encoder, whose output
//! feeds both the frame-synchronous alignment head and (through the
//! segmentation sequence) the translation encoder/decoder pair:
//!
//! ```text
//! src chars -> shared encoder -> alignment decoder -> CTC log-probs
//! seg words -> translation encoder -> attention + decoder -> target logits
//! ```
use std::borrow::Borrow;
use std::sync::Arc;

use tch::nn;
use tch::Tensor;
use tracing::debug;

mod adaptive;
pub use adaptive::AdaptiveSoftmax;

mod align;
pub use align::AlignmentDecoder;

mod attention;
pub use attention::AttentionLayer;

mod decoder;
pub use decoder::{IncrementalState, LstmDecoder, Reorderable};

mod embedding;
pub use embedding::{embedding, Embedding};

mod encoder;
pub use encoder::{EncoderOut, LstmEncoder};

mod rnn;
pub use rnn::{lstm, lstm_cell, Lstm, LstmCell};

use crate::config::SegNmtConfig;
use crate::data::Batch;
use crate::dictionary::Dictionary;
use crate::error::Result;

/// Model outputs for one batch.
#[derive(Debug)]
pub struct SegNmtOutput {
    /// Alignment log-probabilities, [src_len, batch, seg_vocab + 1].
    pub align_lprobs: Tensor,
    /// Translation output scores, [batch, tgt_len, tgt_vocab].
    pub logits: Tensor,
    /// Attention weights, [batch, tgt_len, seg_len], when attention is on.
    pub attn: Option<Tensor>,
}

/// Joint CTC-segmentation + translation model.
#[derive(Debug)]
pub struct SegNmtModel {
    shared_encoder: LstmEncoder,
    align_decoder: AlignmentDecoder,
    translation_encoder: LstmEncoder,
    translation_decoder: LstmDecoder,
}

impl SegNmtModel {
    /// Builds the model. The shared encoder reads the source (character)
    /// dictionary, the alignment head projects to the segmentation
    /// dictionary plus blank, the translation encoder reads the
    /// segmentation dictionary and the decoder the target dictionary.
    /// Configuration violations surface here and are never retried.
    pub fn new<'a, T: Borrow<nn::Path<'a>>>(
        vs: T,
        cfg: &SegNmtConfig,
        src_dict: &Arc<Dictionary>,
        seg_dict: &Arc<Dictionary>,
        tgt_dict: &Arc<Dictionary>,
    ) -> Result<SegNmtModel> {
        let vs = vs.borrow();
        cfg.validate(seg_dict, tgt_dict)?;

        let shared_encoder =
            LstmEncoder::new(vs / "shared_encoder", src_dict, &cfg.shared_encoder, None);
        let align_decoder = AlignmentDecoder::new(
            vs / "align_decoder",
            seg_dict,
            shared_encoder.output_units(),
            &cfg.align_decoder,
        );

        let (encoder_embed, decoder_embed) = if cfg.share_all_embeddings {
            let shared = embedding(
                vs / "shared_embed",
                seg_dict.len(),
                cfg.translation_encoder.embed_dim,
                seg_dict.pad(),
            );
            let decoder_copy = shared.shallow_clone();
            (Some(shared), Some(decoder_copy))
        } else {
            (None, None)
        };
        let translation_encoder = LstmEncoder::new(
            vs / "translation_encoder",
            seg_dict,
            &cfg.translation_encoder,
            encoder_embed,
        );
        let translation_decoder = LstmDecoder::new(
            vs / "translation_decoder",
            tgt_dict,
            &cfg.translation_decoder,
            translation_encoder.output_units(),
            translation_encoder.num_layers(),
            decoder_embed,
            cfg.share_decoder_input_output_embed || cfg.share_all_embeddings,
            cfg.adaptive_softmax_cutoff.as_deref(),
        )?;

        debug!(
            src_vocab = src_dict.len(),
            seg_vocab = seg_dict.len(),
            tgt_vocab = tgt_dict.len(),
            shared_units = shared_encoder.output_units(),
            translation_units = translation_encoder.output_units(),
            "built joint segmentation/translation model"
        );
        Ok(SegNmtModel {
            shared_encoder,
            align_decoder,
            translation_encoder,
            translation_decoder,
        })
    }

    /// Full training forward pass.
    pub fn forward(&self, batch: &Batch, train: bool) -> Result<SegNmtOutput> {
        let shared_out =
            self.shared_encoder.forward(&batch.src_tokens, &batch.src_lengths, train)?;
        let align_lprobs = self.align_decoder.forward(&shared_out, train);
        let translation_out =
            self.translation_encoder.forward(&batch.seg_tokens, &batch.seg_lengths, train)?;
        let (logits, attn) = self.translation_decoder.forward(
            &batch.prev_output_tokens,
            &translation_out,
            None,
            train,
        )?;
        Ok(SegNmtOutput { align_lprobs, logits, attn })
    }

    /// Encodes the segmentation sequence for generation.
    pub fn encode_for_translation(
        &self,
        seg_tokens: &Tensor,
        seg_lengths: &[i64],
    ) -> Result<EncoderOut> {
        self.translation_encoder.forward(seg_tokens, seg_lengths, false)
    }

    /// One generation step: consumes the token history (only the last
    /// column is read once the session is warm) and the session state, and
    /// returns next-token log-probabilities [batch, vocab] plus attention
    /// weights [batch, seg_len].
    pub fn decode_step(
        &self,
        prev_output_tokens: &Tensor,
        encoder_out: &EncoderOut,
        state: &mut IncrementalState,
    ) -> Result<(Tensor, Option<Tensor>)> {
        let (logits, attn) = self.translation_decoder.forward(
            prev_output_tokens,
            encoder_out,
            Some(state),
            false,
        )?;
        let lprobs = self.translation_decoder.normalized_probs(&logits).squeeze_dim(1);
        Ok((lprobs, attn.map(|a| a.squeeze_dim(1))))
    }

    /// Normalizes translation output scores to log-probabilities.
    pub fn normalized_probs(&self, logits: &Tensor) -> Tensor {
        self.translation_decoder.normalized_probs(logits)
    }

    /// The reserved blank id of the alignment head.
    pub fn blank_idx(&self) -> i64 {
        self.align_decoder.blank_idx()
    }

    pub fn shared_encoder(&self) -> &LstmEncoder {
        &self.shared_encoder
    }

    pub fn align_decoder(&self) -> &AlignmentDecoder {
        &self.align_decoder
    }

    pub fn translation_encoder(&self) -> &LstmEncoder {
        &self.translation_encoder
    }

    pub fn translation_decoder(&self) -> &LstmDecoder {
        &self.translation_decoder
    }

    /// Maximum (source, segmentation, target) lengths.
    pub fn max_positions(&self) -> (i64, i64, i64) {
        (
            self.shared_encoder.max_positions(),
            self.translation_encoder.max_positions(),
            self.translation_decoder.max_positions(),
        )
    }
}
