//! Model and criterion configuration.
//!
//! Defaults follow the reference architecture: 512-wide embeddings and
//! hidden states, single layers, dropout 0.1. Architecture presets are
//! selected through the [`Architecture`] enum rather than a runtime
//! registry; each variant maps to a concrete configuration once at startup.
use std::sync::Arc;

use crate::dictionary::Dictionary;
use crate::error::{Result, SegNmtError};

/// Configuration shared by the two recurrent encoders.
#[derive(Debug, Clone)]
pub struct EncoderConfig {
    pub embed_dim: i64,
    pub hidden_size: i64,
    pub num_layers: i64,
    pub dropout_in: f64,
    pub dropout_out: f64,
    pub bidirectional: bool,
    /// Whether this encoder's input arrives left-padded.
    pub left_pad: bool,
    pub max_positions: i64,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        EncoderConfig {
            embed_dim: 512,
            hidden_size: 512,
            num_layers: 1,
            dropout_in: 0.1,
            dropout_out: 0.1,
            bidirectional: false,
            left_pad: true,
            max_positions: 1024,
        }
    }
}

/// Configuration for the frame-synchronous alignment head.
#[derive(Debug, Clone)]
pub struct AlignDecoderConfig {
    pub hidden_size: i64,
    pub num_layers: i64,
}

impl Default for AlignDecoderConfig {
    fn default() -> Self {
        AlignDecoderConfig { hidden_size: 512, num_layers: 1 }
    }
}

/// Configuration for the autoregressive translation decoder.
#[derive(Debug, Clone)]
pub struct DecoderConfig {
    pub embed_dim: i64,
    pub hidden_size: i64,
    pub out_embed_dim: i64,
    pub num_layers: i64,
    pub dropout_in: f64,
    pub dropout_out: f64,
    pub attention: bool,
    pub max_positions: i64,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        DecoderConfig {
            embed_dim: 512,
            hidden_size: 512,
            out_embed_dim: 512,
            num_layers: 1,
            dropout_in: 0.1,
            dropout_out: 0.1,
            attention: true,
            max_positions: 1024,
        }
    }
}

/// Full configuration of the joint model and criterion.
#[derive(Debug, Clone, Default)]
pub struct SegNmtConfig {
    pub shared_encoder: EncoderConfig,
    pub align_decoder: AlignDecoderConfig,
    pub translation_encoder: EncoderConfig,
    pub translation_decoder: DecoderConfig,
    /// Reuse the decoder input embedding, transposed, as output projection.
    pub share_decoder_input_output_embed: bool,
    /// Share the translation encoder and decoder embeddings (requires a
    /// joint dictionary and matching dims; implies input/output sharing).
    pub share_all_embeddings: bool,
    /// Cutoffs for the adaptive output head; `None` selects a dense head.
    pub adaptive_softmax_cutoff: Option<Vec<i64>>,
}

impl SegNmtConfig {
    /// Checks the configuration against the dictionaries it will be built
    /// with. All violations here are fatal; construction never retries.
    pub fn validate(
        &self,
        seg_dict: &Arc<Dictionary>,
        tgt_dict: &Arc<Dictionary>,
    ) -> Result<()> {
        if self.translation_encoder.num_layers != self.translation_decoder.num_layers {
            return Err(SegNmtError::Config(format!(
                "translation encoder layers ({}) must match translation decoder layers ({})",
                self.translation_encoder.num_layers, self.translation_decoder.num_layers
            )));
        }
        if self.shared_encoder.num_layers < 1
            || self.translation_encoder.num_layers < 1
            || self.translation_decoder.num_layers < 1
            || self.align_decoder.num_layers < 1
        {
            return Err(SegNmtError::Config("layer counts must be at least 1".to_string()));
        }
        if self.share_all_embeddings {
            if !Arc::ptr_eq(seg_dict, tgt_dict) {
                return Err(SegNmtError::Config(
                    "share_all_embeddings requires a joint dictionary".to_string(),
                ));
            }
            if self.translation_encoder.embed_dim != self.translation_decoder.embed_dim {
                return Err(SegNmtError::Config(
                    "share_all_embeddings requires matching encoder/decoder embed dims"
                        .to_string(),
                ));
            }
        }
        if (self.share_decoder_input_output_embed || self.share_all_embeddings)
            && self.translation_decoder.embed_dim != self.translation_decoder.out_embed_dim
        {
            return Err(SegNmtError::Config(
                "shared input/output embeddings require decoder embed_dim to match out_embed_dim"
                    .to_string(),
            ));
        }
        if let Some(cutoffs) = &self.adaptive_softmax_cutoff {
            let vocab = tgt_dict.len();
            if cutoffs.is_empty()
                || cutoffs.windows(2).any(|w| w[0] >= w[1])
                || *cutoffs.last().unwrap() >= vocab
            {
                return Err(SegNmtError::Config(format!(
                    "adaptive softmax cutoffs must be increasing and below the vocab size {vocab}"
                )));
            }
        }
        Ok(())
    }
}

/// Criterion weights and normalization mode.
#[derive(Debug, Clone)]
pub struct CriterionConfig {
    pub align_weight: f64,
    pub translation_weight: f64,
    /// Normalize gradients per sentence instead of per target token.
    pub sentence_avg: bool,
}

impl Default for CriterionConfig {
    fn default() -> Self {
        CriterionConfig { align_weight: 0.3, translation_weight: 1.0, sentence_avg: false }
    }
}

/// Named architecture presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    /// The reference architecture: 512 wide, single bidirectional encoders.
    Base,
    /// A small configuration for tests and smoke runs.
    Tiny,
}

impl Architecture {
    pub fn config(self) -> SegNmtConfig {
        match self {
            Architecture::Base => SegNmtConfig {
                shared_encoder: EncoderConfig { bidirectional: true, ..Default::default() },
                translation_encoder: EncoderConfig {
                    bidirectional: true,
                    left_pad: false,
                    ..Default::default()
                },
                ..Default::default()
            },
            Architecture::Tiny => SegNmtConfig {
                shared_encoder: EncoderConfig {
                    embed_dim: 16,
                    hidden_size: 16,
                    bidirectional: true,
                    ..Default::default()
                },
                align_decoder: AlignDecoderConfig { hidden_size: 16, num_layers: 1 },
                translation_encoder: EncoderConfig {
                    embed_dim: 16,
                    hidden_size: 16,
                    bidirectional: true,
                    left_pad: false,
                    ..Default::default()
                },
                translation_decoder: DecoderConfig {
                    embed_dim: 16,
                    hidden_size: 16,
                    out_embed_dim: 16,
                    ..Default::default()
                },
                ..Default::default()
            },
        }
    }
}
