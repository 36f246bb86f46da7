//! Joint word segmentation and machine translation based on Torch.
//!
//! This crate trains a single network that segments a character-level
//! source sequence into word-like units with a CTC alignment objective and
//! translates the segmented representation with an attention-based LSTM
//! decoder. The two objectives share a recurrent encoder and are combined
//! into one weighted loss.
//!
//! The building blocks are deliberately small: [`model::SegNmtModel`] wires
//! the encoders and decoders together, [`criterion::JointCriterion`]
//! produces the training loss and per-worker logging records, and the
//! incremental decoding state in [`model::IncrementalState`] lets an
//! external beam-search generator step the decoder one token at a time.
pub mod config;
pub mod criterion;
pub mod data;
pub mod dictionary;
mod error;
pub mod model;

pub use config::{Architecture, CriterionConfig, SegNmtConfig};
pub use criterion::{AggregatedRecord, JointCriterion, LoggingRecord};
pub use data::{collate, Batch, CollateConfig, Sample};
pub use dictionary::Dictionary;
pub use error::{Result, SegNmtError};
pub use model::{IncrementalState, SegNmtModel, SegNmtOutput};
