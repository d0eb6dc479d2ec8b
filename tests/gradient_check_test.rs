use lstm_nmt::{
    Alignment, Batch, GradCheckOptions, ModelConfig, ParamSlot, PositionalMode, Seq2Seq,
    check_gradients,
};
use ndarray::array;

const NULL_INDEX: usize = 6;
const EOS_INDEX: usize = 7;

/// S = 3, tgt_len = 3, batch 3. Row 2 is left-padded in the source and right-padded
/// in the target; pad id 0 appears nowhere else.
fn batch() -> Batch {
    let input = array![
        [1, 2, 3, 4, 5],
        [2, 5, 1, 3, 2],
        [0, 4, 5, 1, 0],
    ];
    let targets = array![[4, 5, 1], [3, 2, 5], [1, 3, 0]];
    let alignments = array![
        [Alignment::Source(0), Alignment::Source(1), Alignment::Eos],
        [Alignment::Null, Alignment::Source(1), Alignment::Source(0)],
        [Alignment::Source(1), Alignment::Eos, Alignment::Null],
    ];
    Batch::from_padded(input, targets, 3, 0)
        .unwrap()
        .with_alignments(alignments)
        .unwrap()
}

fn check(config: ModelConfig) {
    let mut seq2seq = Seq2Seq::new(config, 0.5, 17).unwrap();
    let options = GradCheckOptions {
        samples_per_slot: 0,
        ..Default::default()
    };
    let report = check_gradients(&mut seq2seq, &batch(), &options).unwrap();
    assert!(
        report.max_abs_error() < 1e-6,
        "finite differences disagree:\n{report}"
    );
    for slot in &report.slots {
        assert!(slot.checked > 0, "{} was not checked", slot.slot);
    }
}

fn base() -> ModelConfig {
    ModelConfig::new(2, 3, 8)
}

#[test]
fn test_plain_gradients() {
    check(base());
}

#[test]
fn test_attention_gradients() {
    check(base().with_attention(true));
}

#[test]
fn test_embedding_concat_gradients() {
    check(base().with_positional_mode(PositionalMode::EmbeddingConcat, NULL_INDEX, EOS_INDEX));
}

#[test]
fn test_pointer_gradients() {
    check(base().with_positional_mode(PositionalMode::Pointer, NULL_INDEX, EOS_INDEX));
}

#[test]
fn test_copy_gradients() {
    check(base().with_positional_mode(PositionalMode::Copy, NULL_INDEX, EOS_INDEX));
}

#[test]
fn test_feed_slot_only_with_attention_or_copy() {
    let plain = Seq2Seq::new(base(), 0.5, 1).unwrap();
    let grads = plain.cost_grad(&batch(), false).unwrap().grads.unwrap();
    assert!(!grads.slots().contains(&ParamSlot::Feed));

    let copy = Seq2Seq::new(
        base().with_positional_mode(PositionalMode::Copy, NULL_INDEX, EOS_INDEX),
        0.5,
        1,
    )
    .unwrap();
    let grads = copy.cost_grad(&batch(), false).unwrap().grads.unwrap();
    assert!(grads.slots().contains(&ParamSlot::Feed));
    // Null and eos rows feed the output layer directly
    assert!(grads.embedding.get(NULL_INDEX).is_some());
    assert!(grads.embedding.get(EOS_INDEX).is_some());
}

#[test]
fn test_gradient_shapes_match_parameters() {
    let seq2seq = Seq2Seq::new(
        base().with_positional_mode(PositionalMode::Pointer, NULL_INDEX, EOS_INDEX),
        0.5,
        5,
    )
    .unwrap();
    let grads = seq2seq.cost_grad(&batch(), false).unwrap().grads.unwrap();
    for slot in grads.slots() {
        if let Some(grad) = grads.dense(slot) {
            assert_eq!(grad.dim(), seq2seq.param(slot).unwrap().dim(), "{slot}");
        }
    }
    let indices = &grads.embedding.indices;
    assert!(indices.windows(2).all(|w| w[0] < w[1]));
    assert!(indices.iter().all(|&i| i < 8));
}
