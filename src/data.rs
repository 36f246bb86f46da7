//! Batch construction for the joint segmentation/translation task.
//!
//! A batch carries three aligned views of each sentence: the character-level
//! source sequence, the word-level segmentation sequence and the target
//! translation. Sources may be padded on either side; segmentation and
//! target sequences are right-padded so that the CTC loss and the shifted
//! decoder input can read them positionally.
use tch::{Device, Kind, Tensor};

use crate::error::{Result, SegNmtError};

/// One training example, as token ids.
#[derive(Debug, Clone)]
pub struct Sample {
    pub source: Vec<i64>,
    pub segmentation: Vec<i64>,
    pub target: Vec<i64>,
}

/// Padding ids and sides used when collating samples into a batch.
#[derive(Debug, Clone, Copy)]
pub struct CollateConfig {
    pub src_pad: i64,
    pub seg_pad: i64,
    pub tgt_pad: i64,
    pub tgt_eos: i64,
    pub left_pad_source: bool,
    pub left_pad_target: bool,
}

impl Default for CollateConfig {
    fn default() -> Self {
        CollateConfig {
            src_pad: 1,
            seg_pad: 1,
            tgt_pad: 1,
            tgt_eos: 2,
            left_pad_source: true,
            left_pad_target: false,
        }
    }
}

/// A padded batch of samples.
#[derive(Debug)]
pub struct Batch {
    /// Source token ids, batch x src_len.
    pub src_tokens: Tensor,
    pub src_lengths: Vec<i64>,
    /// Segmentation target ids, batch x seg_len, right-padded.
    pub seg_tokens: Tensor,
    pub seg_lengths: Vec<i64>,
    /// Translation target ids, batch x tgt_len.
    pub target: Tensor,
    /// Target shifted right by one position, starting with eos.
    pub prev_output_tokens: Tensor,
    /// Total number of non-padding target tokens.
    pub ntokens: i64,
    pub nsentences: i64,
}

impl Batch {
    /// Wraps pre-built tensors in a batch, checking size consistency.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        src_tokens: Tensor,
        src_lengths: Vec<i64>,
        seg_tokens: Tensor,
        seg_lengths: Vec<i64>,
        target: Tensor,
        prev_output_tokens: Tensor,
        ntokens: i64,
    ) -> Result<Batch> {
        let (bsz, src_len) = src_tokens.size2()?;
        if src_lengths.len() as i64 != bsz {
            return Err(SegNmtError::Shape(format!(
                "src_tokens batch size {} does not match {} source lengths",
                bsz,
                src_lengths.len()
            )));
        }
        if src_lengths.iter().any(|&l| l < 1 || l > src_len) {
            return Err(SegNmtError::Shape(format!(
                "source lengths must be in 1..={src_len}"
            )));
        }
        let (seg_bsz, seg_len) = seg_tokens.size2()?;
        if seg_bsz != bsz || seg_lengths.len() as i64 != bsz {
            return Err(SegNmtError::Shape(format!(
                "segmentation batch size {seg_bsz} does not match {bsz}"
            )));
        }
        if seg_lengths.iter().any(|&l| l < 1 || l > seg_len) {
            return Err(SegNmtError::Shape(format!(
                "segmentation lengths must be in 1..={seg_len}"
            )));
        }
        if target.size2()? != prev_output_tokens.size2()? || target.size2()?.0 != bsz {
            return Err(SegNmtError::Shape(
                "target and prev_output_tokens sizes do not match the batch".to_string(),
            ));
        }
        Ok(Batch {
            src_tokens,
            src_lengths,
            seg_tokens,
            seg_lengths,
            target,
            prev_output_tokens,
            ntokens,
            nsentences: bsz,
        })
    }
}

/// Stacks equal-length rows into a [rows, width] tensor.
fn rows_to_tensor(rows: &[Vec<i64>], device: Device) -> Tensor {
    let bsz = rows.len() as i64;
    let width = rows[0].len() as i64;
    let flat: Vec<i64> = rows.iter().flatten().copied().collect();
    Tensor::from_slice(&flat).view([bsz, width]).to_device(device)
}

fn pad_to(tokens: &[i64], len: usize, pad: i64, left: bool) -> Vec<i64> {
    let mut row = vec![pad; len];
    if left {
        row[len - tokens.len()..].copy_from_slice(tokens);
    } else {
        row[..tokens.len()].copy_from_slice(tokens);
    }
    row
}

/// Collates samples into a padded batch, sorted by decreasing source length.
pub fn collate(samples: &[Sample], cfg: &CollateConfig, device: Device) -> Result<Batch> {
    if samples.is_empty() {
        return Err(SegNmtError::Shape("cannot collate an empty batch".to_string()));
    }
    if samples.iter().any(|s| {
        s.source.is_empty() || s.segmentation.is_empty() || s.target.is_empty()
    }) {
        return Err(SegNmtError::Shape("cannot collate empty sequences".to_string()));
    }
    let mut order: Vec<usize> = (0..samples.len()).collect();
    order.sort_by_key(|&i| std::cmp::Reverse(samples[i].source.len()));
    let samples: Vec<&Sample> = order.iter().map(|&i| &samples[i]).collect();

    let src_len = samples.iter().map(|s| s.source.len()).max().unwrap_or(0);
    let seg_len = samples.iter().map(|s| s.segmentation.len()).max().unwrap_or(0);
    let tgt_len = samples.iter().map(|s| s.target.len()).max().unwrap_or(0);

    let src_rows: Vec<Vec<i64>> = samples
        .iter()
        .map(|s| pad_to(&s.source, src_len, cfg.src_pad, cfg.left_pad_source))
        .collect();
    let seg_rows: Vec<Vec<i64>> = samples
        .iter()
        .map(|s| pad_to(&s.segmentation, seg_len, cfg.seg_pad, false))
        .collect();
    let tgt_rows: Vec<Vec<i64>> = samples
        .iter()
        .map(|s| pad_to(&s.target, tgt_len, cfg.tgt_pad, cfg.left_pad_target))
        .collect();
    // Shift the target right by one, starting with eos, to form the decoder
    // input. The shift happens before padding so padded positions line up.
    let prev_rows: Vec<Vec<i64>> = samples
        .iter()
        .map(|s| {
            let mut shifted = Vec::with_capacity(s.target.len());
            shifted.push(cfg.tgt_eos);
            shifted.extend_from_slice(&s.target[..s.target.len() - 1]);
            pad_to(&shifted, tgt_len, cfg.tgt_pad, cfg.left_pad_target)
        })
        .collect();

    let src_lengths: Vec<i64> = samples.iter().map(|s| s.source.len() as i64).collect();
    let seg_lengths: Vec<i64> = samples.iter().map(|s| s.segmentation.len() as i64).collect();
    let ntokens: i64 = samples.iter().map(|s| s.target.len() as i64).sum();

    Batch::new(
        rows_to_tensor(&src_rows, device),
        src_lengths,
        rows_to_tensor(&seg_rows, device),
        seg_lengths,
        rows_to_tensor(&tgt_rows, device),
        rows_to_tensor(&prev_rows, device),
        ntokens,
    )
}

/// Moves padding from one side of each row to the other, e.g. turning
/// left-padded rows into the right-padded layout the packed recurrence
/// expects. Rows are rotated by their padding count, which assumes all
/// padding of a row sits on a single side; rows already padded on the
/// requested side are left untouched.
pub fn convert_padding_direction(
    tokens: &Tensor,
    pad: i64,
    lengths: &[i64],
    left_to_right: bool,
) -> Result<Tensor> {
    let (bsz, max_len) = tokens.size2()?;
    if lengths.len() as i64 != bsz {
        return Err(SegNmtError::Shape(format!(
            "tokens batch size {} does not match {} lengths",
            bsz,
            lengths.len()
        )));
    }
    if lengths.iter().all(|&l| l == max_len) {
        // No padding at all.
        return Ok(tokens.shallow_clone());
    }
    let boundary = if left_to_right { 0 } else { max_len - 1 };
    if tokens.select(1, boundary).eq(pad).any().int64_value(&[]) == 0 {
        // Nothing is padded on the side we would move away from.
        return Ok(tokens.shallow_clone());
    }
    let device = tokens.device();
    let range = Tensor::arange(max_len, (Kind::Int64, device))
        .unsqueeze(0)
        .expand([bsz, max_len], true);
    let num_pads: Vec<i64> = lengths.iter().map(|l| max_len - l).collect();
    let num_pads = Tensor::from_slice(&num_pads).to_device(device).unsqueeze(1);
    let index = if left_to_right {
        (range + num_pads).remainder(max_len)
    } else {
        (range - num_pads + max_len).remainder(max_len)
    };
    Ok(tokens.gather(1, &index, false))
}
