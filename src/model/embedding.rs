//! Token embedding with a zeroed padding row.
use std::borrow::Borrow;

use tch::nn::{self, Init};
use tch::Tensor;

/// An embedding table whose padding row maps to the zero vector.
///
/// The weight tensor can be shared between components (encoder/decoder
/// embedding sharing, output weight tying) through [`Embedding::shallow_clone`],
/// which aliases the same underlying variable.
#[derive(Debug)]
pub struct Embedding {
    pub ws: Tensor,
    padding_idx: i64,
}

/// Creates an embedding table initialized uniformly in [-0.1, 0.1], with
/// the padding row zeroed.
pub fn embedding<'a, T: Borrow<nn::Path<'a>>>(
    vs: T,
    num_embeddings: i64,
    embedding_dim: i64,
    padding_idx: i64,
) -> Embedding {
    let vs = vs.borrow();
    let ws = vs.var(
        "weight",
        &[num_embeddings, embedding_dim],
        Init::Uniform { lo: -0.1, up: 0.1 },
    );
    tch::no_grad(|| {
        let _ = ws.narrow(0, padding_idx, 1).fill_(0.);
    });
    Embedding { ws, padding_idx }
}

impl Embedding {
    pub fn forward(&self, xs: &Tensor) -> Tensor {
        Tensor::embedding(&self.ws, xs, self.padding_idx, false, false)
    }

    /// A second handle onto the same weights.
    pub fn shallow_clone(&self) -> Embedding {
        Embedding { ws: self.ws.shallow_clone(), padding_idx: self.padding_idx }
    }

    pub fn embedding_dim(&self) -> i64 {
        self.ws.size()[1]
    }

    pub fn num_embeddings(&self) -> i64 {
        self.ws.size()[0]
    }
}
