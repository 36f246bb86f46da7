//! The joint training criterion: CTC alignment loss plus translation NLL.
use tch::{Reduction, Tensor};
use tracing::debug;

use crate::config::CriterionConfig;
use crate::data::Batch;
use crate::error::Result;
use crate::model::{SegNmtModel, SegNmtOutput};

const LN_2: f64 = std::f64::consts::LN_2;

/// Raw per-batch statistics, one record per worker batch.
///
/// Every field is an unnormalized sum so that records from data-parallel
/// workers combine by plain addition; ratios are only formed after
/// aggregation, never averaged across workers.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingRecord {
    /// Weighted combined loss.
    pub loss: f64,
    /// Alignment loss summed over the batch's sentences.
    pub align_loss: f64,
    /// Translation negative log-likelihood summed over non-pad tokens.
    pub nll_loss: f64,
    pub ntokens: i64,
    pub nsentences: i64,
    pub sample_size: i64,
}

/// Aggregated training metrics, in base-2 logarithm scale.
#[derive(Debug, Clone, Copy)]
pub struct AggregatedRecord {
    /// Combined loss per sample-size unit.
    pub loss: f64,
    /// Alignment loss per sentence.
    pub align_loss: f64,
    /// Translation loss per token; `None` when the sample size already is
    /// the token count and the value would duplicate `loss`.
    pub nll_loss: Option<f64>,
    pub ntokens: i64,
    pub nsentences: i64,
    pub sample_size: i64,
}

/// Computes the combined segmentation/translation loss for a batch.
#[derive(Debug, Clone)]
pub struct JointCriterion {
    align_weight: f64,
    translation_weight: f64,
    sentence_avg: bool,
    padding_idx: i64,
    blank_idx: i64,
}

impl JointCriterion {
    pub fn new(cfg: &CriterionConfig, padding_idx: i64, blank_idx: i64) -> JointCriterion {
        JointCriterion {
            align_weight: cfg.align_weight,
            translation_weight: cfg.translation_weight,
            sentence_avg: cfg.sentence_avg,
            padding_idx,
            blank_idx,
        }
    }

    /// Runs the model on the batch and returns the scalar loss used for
    /// backpropagation, the sample size for gradient normalization, and
    /// the batch's raw logging record.
    pub fn forward(
        &self,
        model: &SegNmtModel,
        batch: &Batch,
        train: bool,
    ) -> Result<(Tensor, i64, LoggingRecord)> {
        let output = model.forward(batch, train)?;
        let align_loss = self.alignment_loss(&output.align_lprobs, batch);
        let nll_loss = self.translation_loss(model, &output, batch);
        let loss = self.weighted_loss(&align_loss, &nll_loss);
        let sample_size = if self.sentence_avg { batch.nsentences } else { batch.ntokens };
        let record = LoggingRecord {
            loss: loss.double_value(&[]),
            align_loss: align_loss.double_value(&[]) * batch.nsentences as f64,
            nll_loss: nll_loss.double_value(&[]),
            ntokens: batch.ntokens,
            nsentences: batch.nsentences,
            sample_size,
        };
        Ok((loss, sample_size, record))
    }

    /// CTC loss between the frame-synchronous alignment log-probabilities
    /// [src_len, batch, seg_vocab + 1] and the segmentation targets, mean
    /// over the batch. Frames beyond a sentence's source length and target
    /// positions beyond its segmentation length are ignored.
    pub fn alignment_loss(&self, align_lprobs: &Tensor, batch: &Batch) -> Tensor {
        Tensor::ctc_loss(
            align_lprobs,
            &batch.seg_tokens,
            &batch.src_lengths[..],
            &batch.seg_lengths[..],
            self.blank_idx,
            Reduction::Mean,
            true,
        )
    }

    /// Negative log-likelihood of the translation targets, summed over
    /// non-padding positions; padding-id positions contribute nothing.
    pub fn translation_loss(
        &self,
        model: &SegNmtModel,
        output: &SegNmtOutput,
        batch: &Batch,
    ) -> Tensor {
        let lprobs = model.normalized_probs(&output.logits).flatten(0, 1);
        let target = batch.target.reshape([-1]);
        lprobs.g_nll_loss::<Tensor>(&target, None, Reduction::Sum, self.padding_idx)
    }

    /// The configured weighted sum of the two losses.
    pub fn weighted_loss(&self, align_loss: &Tensor, nll_loss: &Tensor) -> Tensor {
        align_loss * self.align_weight + nll_loss * self.translation_weight
    }

    /// Combines per-worker records into global metrics. Summation first,
    /// ratios after, so the result is independent of how batches were
    /// distributed across workers; a worker with zero sample size cannot
    /// corrupt the ratios.
    pub fn aggregate(records: &[LoggingRecord]) -> AggregatedRecord {
        let loss_sum: f64 = records.iter().map(|r| r.loss).sum();
        let align_sum: f64 = records.iter().map(|r| r.align_loss).sum();
        let nll_sum: f64 = records.iter().map(|r| r.nll_loss).sum();
        let ntokens: i64 = records.iter().map(|r| r.ntokens).sum();
        let nsentences: i64 = records.iter().map(|r| r.nsentences).sum();
        let sample_size: i64 = records.iter().map(|r| r.sample_size).sum();
        let loss =
            if sample_size > 0 { loss_sum / sample_size as f64 / LN_2 } else { 0. };
        let align_loss =
            if nsentences > 0 { align_sum / nsentences as f64 / LN_2 } else { 0. };
        let nll_loss = if sample_size != ntokens {
            Some(if ntokens > 0 { nll_sum / ntokens as f64 / LN_2 } else { 0. })
        } else {
            None
        };
        debug!(loss, align_loss, ntokens, nsentences, sample_size, "aggregated logging records");
        AggregatedRecord { loss, align_loss, nll_loss, ntokens, nsentences, sample_size }
    }
}
