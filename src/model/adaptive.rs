//! Adaptive (hierarchical) softmax output head.
use std::borrow::Borrow;

use tch::nn::{self, Module};
use tch::{Kind, Tensor};

/// A hierarchical output projection for large target vocabularies.
///
/// The vocabulary is split at `cutoffs` into a head cluster of frequent
/// words plus one shortlist slot per tail cluster; each tail projects the
/// input down by a factor of 4 per level before its output projection.
/// `log_prob` flattens the hierarchy back into full-vocabulary
/// log-probabilities, so callers can treat the head as a single opaque
/// projection.
#[derive(Debug)]
pub struct AdaptiveSoftmax {
    head: nn::Linear,
    tails: Vec<(nn::Linear, nn::Linear)>,
    cutoffs: Vec<i64>,
    shortlist_size: i64,
}

impl AdaptiveSoftmax {
    pub fn new<'a, T: Borrow<nn::Path<'a>>>(
        vs: T,
        input_dim: i64,
        vocab_size: i64,
        cutoffs: &[i64],
    ) -> AdaptiveSoftmax {
        let vs = vs.borrow();
        let shortlist_size = cutoffs[0];
        let n_clusters = cutoffs.len() as i64;
        let no_bias = nn::LinearConfig { bias: false, ..Default::default() };
        let head =
            nn::linear(vs / "head", input_dim, shortlist_size + n_clusters, no_bias);
        let mut bounds = cutoffs.to_vec();
        bounds.push(vocab_size);
        let mut tails = vec![];
        for (i, w) in bounds.windows(2).enumerate() {
            let proj_dim = std::cmp::max(1, input_dim / (4i64 << i as i64));
            let tail_vs = vs / "tails" / i;
            let proj = nn::linear(&tail_vs / "proj", input_dim, proj_dim, no_bias);
            let out = nn::linear(&tail_vs / "out", proj_dim, w[1] - w[0], no_bias);
            tails.push((proj, out));
        }
        AdaptiveSoftmax { head, tails, cutoffs: bounds, shortlist_size }
    }

    /// Maps features [batch, tgt_len, input_dim] to full-vocabulary
    /// log-probabilities [batch, tgt_len, vocab_size].
    pub fn log_prob(&self, input: &Tensor) -> Tensor {
        let head_lprobs = self.head.forward(input).log_softmax(-1, Kind::Float);
        let mut pieces = vec![head_lprobs.narrow(-1, 0, self.shortlist_size)];
        for (i, (proj, out)) in self.tails.iter().enumerate() {
            let cluster_lprob = head_lprobs.narrow(-1, self.shortlist_size + i as i64, 1);
            let tail_lprobs =
                out.forward(&proj.forward(input)).log_softmax(-1, Kind::Float);
            pieces.push(cluster_lprob + tail_lprobs);
        }
        Tensor::cat(&pieces, -1)
    }

    /// Vocabulary boundaries, ending at the vocabulary size.
    pub fn cutoffs(&self) -> &[i64] {
        &self.cutoffs
    }
}
