use std::sync::Arc;

use segnmt::model::AttentionLayer;
use segnmt::{
    collate, Architecture, CollateConfig, IncrementalState, Sample, SegNmtError, SegNmtModel,
};
use tch::{nn, Device, Kind, Tensor};

use test_utils::*;

#[test]
fn forward_output_shapes() {
    tch::manual_seed(42);
    let vs = nn::VarStore::new(Device::Cpu);
    let model = tiny_model(&vs.root(), &Architecture::Tiny.config());
    let batch = batch(Device::Cpu);
    let output = model.forward(&batch, true).unwrap();

    // One alignment distribution per source frame, over seg vocab + blank.
    assert_eq!(output.align_lprobs.size(), [5, 2, 9]);
    assert_eq!(model.blank_idx(), 8);
    // Decoder output length matches the target length, last dim the vocab.
    assert_eq!(output.logits.size(), [2, 4, 9]);
    let attn = output.attn.unwrap();
    assert_eq!(attn.size(), [2, 4, 3]);
}

#[test]
fn encoder_padding_mask_scenario() {
    tch::manual_seed(42);
    let vs = nn::VarStore::new(Device::Cpu);
    let model = tiny_model(&vs.root(), &Architecture::Tiny.config());
    let batch = batch(Device::Cpu);
    let out = model.shared_encoder().forward(&batch.src_tokens, &batch.src_lengths, false).unwrap();

    // Lengths [5, 3]: example 1 has no padded positions, example 2 is
    // padded at positions 4-5.
    let mask = out.padding_mask.expect("batch has padding");
    assert_eq!(mask.size(), [5, 2]);
    let mask: Vec<Vec<i64>> = Vec::<Vec<i64>>::try_from(&mask.to_kind(Kind::Int64)).unwrap();
    for t in 0..5 {
        assert_eq!(mask[t][0], 0);
        assert_eq!(mask[t][1], i64::from(t >= 3));
    }
}

#[test]
fn encoder_isolates_batch_examples() {
    tch::manual_seed(42);
    let vs = nn::VarStore::new(Device::Cpu);
    let model = tiny_model(&vs.root(), &Architecture::Tiny.config());
    let batch = batch(Device::Cpu);
    let batched =
        model.shared_encoder().forward(&batch.src_tokens, &batch.src_lengths, false).unwrap();

    // Encoding each example alone must reproduce its batched rows exactly:
    // the other example's padding cannot leak in.
    for (idx, sample) in samples().iter().enumerate() {
        let single =
            collate(std::slice::from_ref(sample), &CollateConfig::default(), Device::Cpu).unwrap();
        let alone =
            model.shared_encoder().forward(&single.src_tokens, &single.src_lengths, false).unwrap();
        let len = sample.source.len() as i64;
        let batched_rows = batched.outputs.narrow(0, 0, len).select(1, idx as i64);
        let alone_rows = alone.outputs.narrow(0, 0, len).select(1, 0);
        assert!(max_abs_diff(&batched_rows, &alone_rows) < 1e-5);
        let batched_h = batched.hiddens.select(1, idx as i64);
        let alone_h = alone.hiddens.select(1, 0);
        assert!(max_abs_diff(&batched_h, &alone_h) < 1e-5);
    }
}

#[test]
fn encoder_handles_unsorted_lengths() {
    tch::manual_seed(42);
    let vs = nn::VarStore::new(Device::Cpu);
    let model = tiny_model(&vs.root(), &Architecture::Tiny.config());
    // Segmentation lengths [2, 3] arrive unsorted once the batch is
    // ordered by source length.
    let samples = vec![
        Sample { source: vec![4, 5, 6, 7, 8], segmentation: vec![4, 5], target: vec![4, 2] },
        Sample { source: vec![6, 7, 8], segmentation: vec![5, 6, 7], target: vec![7, 8, 2] },
    ];
    let batch = collate(&samples, &CollateConfig::default(), Device::Cpu).unwrap();
    assert_eq!(batch.seg_lengths, [2, 3]);
    let batched = model
        .translation_encoder()
        .forward(&batch.seg_tokens, &batch.seg_lengths, false)
        .unwrap();

    let single = collate(&samples[1..], &CollateConfig::default(), Device::Cpu).unwrap();
    let alone = model
        .translation_encoder()
        .forward(&single.seg_tokens, &single.seg_lengths, false)
        .unwrap();
    let batched_rows = batched.outputs.select(1, 1);
    let alone_rows = alone.outputs.select(1, 0);
    assert!(max_abs_diff(&batched_rows, &alone_rows) < 1e-5);
}

#[test]
fn encoder_out_reorder_laws() {
    tch::manual_seed(42);
    let vs = nn::VarStore::new(Device::Cpu);
    let model = tiny_model(&vs.root(), &Architecture::Tiny.config());
    let batch = batch(Device::Cpu);
    let out = model.shared_encoder().forward(&batch.src_tokens, &batch.src_lengths, false).unwrap();

    let identity = Tensor::from_slice(&[0i64, 1]);
    let same = out.reorder(&identity);
    assert_eq!(max_abs_diff(&same.outputs, &out.outputs), 0.);
    assert_eq!(max_abs_diff(&same.hiddens, &out.hiddens), 0.);
    assert_eq!(max_abs_diff(&same.cells, &out.cells), 0.);

    let swap = Tensor::from_slice(&[1i64, 0]);
    let round_trip = out.reorder(&swap).reorder(&swap);
    assert_eq!(max_abs_diff(&round_trip.outputs, &out.outputs), 0.);
    let mask = out.padding_mask.as_ref().unwrap().to_kind(Kind::Float);
    let round_trip_mask = round_trip.padding_mask.as_ref().unwrap().to_kind(Kind::Float);
    assert_eq!(max_abs_diff(&round_trip_mask, &mask), 0.);
}

#[test]
fn incremental_decoding_matches_full_pass() {
    tch::manual_seed(42);
    let vs = nn::VarStore::new(Device::Cpu);
    let model = tiny_model(&vs.root(), &Architecture::Tiny.config());
    let batch = batch(Device::Cpu);
    let enc = model
        .translation_encoder()
        .forward(&batch.seg_tokens, &batch.seg_lengths, false)
        .unwrap();

    let (full_logits, _) = model
        .translation_decoder()
        .forward(&batch.prev_output_tokens, &enc, None, false)
        .unwrap();

    let mut state = IncrementalState::new();
    assert!(!state.is_warm());
    let mut step_logits = vec![];
    let tgt_len = batch.prev_output_tokens.size()[1];
    for t in 1..=tgt_len {
        let prefix = batch.prev_output_tokens.narrow(1, 0, t);
        let (logits, _) =
            model.translation_decoder().forward(&prefix, &enc, Some(&mut state), false).unwrap();
        assert_eq!(logits.size(), [2, 1, 9]);
        step_logits.push(logits);
    }
    assert!(state.is_warm());
    let stepped = Tensor::cat(&step_logits, 1);
    assert!(max_abs_diff(&stepped, &full_logits) < 1e-5);
}

#[test]
fn incremental_state_reorder_round_trip() {
    tch::manual_seed(42);
    let vs = nn::VarStore::new(Device::Cpu);
    let model = tiny_model(&vs.root(), &Architecture::Tiny.config());
    let batch = batch(Device::Cpu);
    let enc = model
        .translation_encoder()
        .forward(&batch.seg_tokens, &batch.seg_lengths, false)
        .unwrap();
    let swap = Tensor::from_slice(&[1i64, 0]);

    // Reordering a cold session is a no-op.
    let mut cold = IncrementalState::new();
    cold.reorder(&swap);
    assert!(!cold.is_warm());

    let step = |state: &mut IncrementalState, t: i64| {
        let prefix = batch.prev_output_tokens.narrow(1, 0, t);
        model.decode_step(&prefix, &enc, state).unwrap().0
    };

    let mut control = IncrementalState::new();
    let _ = step(&mut control, 1);
    let control_probs = step(&mut control, 2);

    // Swapping twice restores the original hypothesis order.
    let mut swapped = IncrementalState::new();
    let _ = step(&mut swapped, 1);
    model.translation_decoder().reorder_incremental_state(&mut swapped, &swap);
    model.translation_decoder().reorder_incremental_state(&mut swapped, &swap);
    let swapped_probs = step(&mut swapped, 2);
    assert!(max_abs_diff(&swapped_probs, &control_probs) < 1e-6);
}

#[test]
fn incremental_state_reorder_permutes_hypotheses() {
    tch::manual_seed(42);
    let vs = nn::VarStore::new(Device::Cpu);
    let model = tiny_model(&vs.root(), &Architecture::Tiny.config());
    let batch = batch(Device::Cpu);
    let enc = model
        .translation_encoder()
        .forward(&batch.seg_tokens, &batch.seg_lengths, false)
        .unwrap();
    let swap = Tensor::from_slice(&[1i64, 0]);

    let mut control = IncrementalState::new();
    let _ = model.decode_step(&batch.prev_output_tokens.narrow(1, 0, 1), &enc, &mut control);
    let (control_probs, _) = model
        .decode_step(&batch.prev_output_tokens.narrow(1, 0, 2), &enc, &mut control)
        .unwrap();

    // Reorder the session and every companion tensor by the same
    // permutation; the per-hypothesis outputs must follow it.
    let mut permuted = IncrementalState::new();
    let _ = model.decode_step(&batch.prev_output_tokens.narrow(1, 0, 1), &enc, &mut permuted);
    permuted.reorder(&swap);
    let enc_swapped = enc.reorder(&swap);
    let prev_swapped = batch.prev_output_tokens.index_select(0, &swap);
    let (permuted_probs, _) =
        model.decode_step(&prev_swapped.narrow(1, 0, 2), &enc_swapped, &mut permuted).unwrap();
    assert!(max_abs_diff(&permuted_probs, &control_probs.index_select(0, &swap)) < 1e-6);
}

#[test]
fn decoder_rejects_mismatched_batch() {
    tch::manual_seed(42);
    let vs = nn::VarStore::new(Device::Cpu);
    let model = tiny_model(&vs.root(), &Architecture::Tiny.config());
    let batch = batch(Device::Cpu);
    let enc = model
        .translation_encoder()
        .forward(&batch.seg_tokens, &batch.seg_lengths, false)
        .unwrap();
    let one_row = batch.prev_output_tokens.narrow(0, 0, 1);
    let err =
        model.translation_decoder().forward(&one_row, &enc, None, false).unwrap_err();
    assert!(matches!(err, SegNmtError::Shape(_)));
}

#[test]
fn attention_survives_fully_padded_rows() {
    tch::manual_seed(42);
    let vs = nn::VarStore::new(Device::Cpu);
    let attention = AttentionLayer::new(&vs.root() / "attention", 4, 6, 4);
    let input = Tensor::randn([2, 4], (Kind::Float, Device::Cpu));
    let source = Tensor::randn([3, 2, 6], (Kind::Float, Device::Cpu));
    // Batch element 1 has no valid source position at all.
    let mask = Tensor::from_slice(&[0i64, 1, 0, 1, 0, 1]).view([3, 2]).eq(1);
    let (output, weights) = attention.forward(&input, &source, Some(&mask));

    assert_eq!(output.isnan().any().int64_value(&[]), 0);
    assert_eq!(weights.isnan().any().int64_value(&[]), 0);
    // Zero attention is the fallback for the fully padded element.
    assert_eq!(weights.select(1, 1).abs().sum(Kind::Float).double_value(&[]), 0.);
    // The valid element still gets a proper distribution.
    let total = weights.select(1, 0).sum(Kind::Float).double_value(&[]);
    assert!((total - 1.).abs() < 1e-5);
}

#[test]
fn tied_output_head_shares_embedding_weights() {
    tch::manual_seed(42);
    let vs = nn::VarStore::new(Device::Cpu);
    let mut cfg = Architecture::Tiny.config();
    cfg.share_decoder_input_output_embed = true;
    let model = tiny_model(&vs.root(), &cfg);
    let batch = batch(Device::Cpu);
    let output = model.forward(&batch, false).unwrap();
    assert_eq!(output.logits.size(), [2, 4, 9]);
}

#[test]
fn adaptive_output_head_is_normalized() {
    tch::manual_seed(42);
    let vs = nn::VarStore::new(Device::Cpu);
    let mut cfg = Architecture::Tiny.config();
    cfg.adaptive_softmax_cutoff = Some(vec![4]);
    let model = tiny_model(&vs.root(), &cfg);
    let batch = batch(Device::Cpu);
    let output = model.forward(&batch, false).unwrap();
    assert_eq!(output.logits.size(), [2, 4, 9]);

    // The adaptive head emits log-probabilities directly; rows sum to one
    // and normalization is the identity.
    let sums = output.logits.exp().sum_dim_intlist(-1, false, Kind::Float);
    let ones = Tensor::ones([2, 4], (Kind::Float, Device::Cpu));
    assert!(max_abs_diff(&sums, &ones) < 1e-5);
    assert!(max_abs_diff(&model.normalized_probs(&output.logits), &output.logits) < 1e-6);
}

#[test]
fn configuration_errors_are_fatal() {
    tch::manual_seed(42);
    let (src, seg, tgt) = dictionaries();
    let vs = nn::VarStore::new(Device::Cpu);

    let mut cfg = Architecture::Tiny.config();
    cfg.translation_encoder.num_layers = 2;
    let err = SegNmtModel::new(&vs.root(), &cfg, &src, &seg, &tgt).unwrap_err();
    assert!(matches!(err, SegNmtError::Config(_)));

    let mut cfg = Architecture::Tiny.config();
    cfg.share_all_embeddings = true;
    let err = SegNmtModel::new(&vs.root(), &cfg, &src, &seg, &tgt).unwrap_err();
    assert!(matches!(err, SegNmtError::Config(_)));

    let mut cfg = Architecture::Tiny.config();
    cfg.share_decoder_input_output_embed = true;
    cfg.translation_decoder.out_embed_dim = 8;
    let err = SegNmtModel::new(&vs.root(), &cfg, &src, &seg, &tgt).unwrap_err();
    assert!(matches!(err, SegNmtError::Config(_)));

    let mut cfg = Architecture::Tiny.config();
    cfg.adaptive_softmax_cutoff = Some(vec![20]);
    let err = SegNmtModel::new(&vs.root(), &cfg, &src, &seg, &tgt).unwrap_err();
    assert!(matches!(err, SegNmtError::Config(_)));
}

#[test]
fn share_all_embeddings_with_joint_dictionary() {
    tch::manual_seed(42);
    let (src, seg, _) = dictionaries();
    let joint = Arc::clone(&seg);
    let vs = nn::VarStore::new(Device::Cpu);
    let mut cfg = Architecture::Tiny.config();
    cfg.share_all_embeddings = true;
    let model = SegNmtModel::new(&vs.root(), &cfg, &src, &seg, &joint).unwrap();

    // Targets now live in the segmentation dictionary (ids < 8).
    let samples = vec![
        Sample { source: vec![4, 5, 6], segmentation: vec![4, 5], target: vec![6, 7, 2] },
        Sample { source: vec![5, 6], segmentation: vec![6], target: vec![4, 2] },
    ];
    let batch = collate(&samples, &CollateConfig::default(), Device::Cpu).unwrap();
    let output = model.forward(&batch, false).unwrap();
    assert_eq!(output.logits.size(), [2, 3, 8]);
}
