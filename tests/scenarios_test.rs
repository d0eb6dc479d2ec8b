use lstm_nmt::{
    Alignment, Batch, EmbeddingGradAccumulator, MaskInfo, ModelConfig, ModelError, PositionalMode,
    Recurrence, Seq2Seq, SideData, SourceChannel, extractor_for,
};
use lstm_nmt::positional::PositionalGradSink;
use ndarray::{Array2, Array3, array, s};

#[test]
fn test_single_layer_is_test_call() {
    // 1 layer, hidden 2, batch 1, S = 2, tgt_len = 2 -> T = 3
    let seq2seq = Seq2Seq::new(ModelConfig::new(1, 2, 4), 0.1, 0).unwrap();
    let batch = Batch::new(
        array![[1, 2, 3]],
        array![[2, 3]],
        vec![MaskInfo::all_real(1); 3],
        2,
    )
    .unwrap();

    let recurrence = Recurrence::new(&seq2seq.config, &seq2seq.model, &seq2seq.unit, &batch).unwrap();
    let cache = recurrence.forward(true).unwrap();
    assert_eq!(cache.num_states(), 3);
    assert_eq!(cache.top_hidden.dim(), (2, 1, 3));

    let output = seq2seq.cost_grad(&batch, true).unwrap();
    assert!(output.costs.total.is_finite());
    assert!(output.costs.total > 0.0);
    assert!(output.grads.is_none());
}

#[test]
fn test_padded_row_has_zero_inputs_and_no_embedding_gradient() {
    // Row 1 is padded at timestep 2 of 3 with token 0, which appears nowhere else
    let seq2seq = Seq2Seq::new(ModelConfig::new(1, 2, 6), 0.3, 4).unwrap();
    let batch = Batch::from_padded(array![[1, 2, 3], [4, 5, 0]], array![[2, 3], [5, 1]], 2, 0).unwrap();
    assert_eq!(batch.masks[2].masked_ids, vec![1]);

    let recurrence = Recurrence::new(&seq2seq.config, &seq2seq.model, &seq2seq.unit, &batch).unwrap();
    let cache = recurrence.forward(false).unwrap();
    let state = cache.states[0][2].as_ref().unwrap();
    assert!(state.stacked_input.column(1).iter().all(|&v| v == 0.0));
    assert!(state.prev_cell.column(1).iter().all(|&v| v == 0.0));
    assert!(state.hidden.column(1).iter().all(|&v| v == 0.0));

    let grads = seq2seq.cost_grad(&batch, false).unwrap().grads.unwrap();
    assert!(grads.embedding.get(0).is_none());
    assert!(grads.embedding.get(5).is_some());
}

#[test]
fn test_pointer_eos_row_routes_to_eos_embedding() {
    // S = 3, tgt_len = 2; every decoder row points past the source
    let eos = 7;
    let config = ModelConfig::new(1, 3, 8).with_positional_mode(PositionalMode::Pointer, 6, eos);
    let seq2seq = Seq2Seq::new(config.clone(), 0.3, 9).unwrap();
    let batch = Batch::from_padded(array![[1, 2, 3, 4], [2, 3, 4, 5]], array![[4, 5], [1, 2]], 3, 0)
        .unwrap()
        .with_alignments(array![
            [Alignment::Eos, Alignment::Eos],
            [Alignment::Eos, Alignment::Eos]
        ])
        .unwrap();

    let grads = seq2seq.cost_grad(&batch, false).unwrap().grads.unwrap();
    let eos_grad = grads.embedding.get(eos).unwrap();
    assert!(eos_grad.iter().any(|&v| v != 0.0));
    assert!(grads.embedding.get(6).is_none());

    // The scatter itself leaves the source hidden buffer untouched for eos rows
    let extractor = extractor_for(SourceChannel::Pointer, &config);
    let mut embedding = EmbeddingGradAccumulator::new(3);
    let mut buffer = Array3::zeros((3, 2, 2));
    let side = SideData::Pointer {
        null_rows: vec![],
        eos_rows: vec![0],
        source_rows: vec![(1, 1)],
    };
    let d_positional = Array2::from_elem((3, 2), 1.5);
    extractor
        .scatter(
            &side,
            d_positional.view(),
            &mut PositionalGradSink {
                embedding: &mut embedding,
                source_hidden: Some(&mut buffer),
            },
        )
        .unwrap();
    assert!(buffer.slice(s![.., 0, ..]).iter().all(|&v| v == 0.0));
    assert!(buffer.slice(s![.., 1, 1]).iter().all(|&v| v == 1.5));
    let sparse = embedding.aggregate();
    assert_eq!(sparse.indices, vec![eos]);
}

#[test]
fn test_two_layer_gradients_cover_both_layers() {
    let seq2seq = Seq2Seq::new(ModelConfig::new(2, 2, 6), 0.3, 2).unwrap();
    let batch = Batch::from_padded(array![[1, 2, 3], [4, 5, 0]], array![[2, 3], [5, 1]], 2, 0).unwrap();
    let grads = seq2seq.cost_grad(&batch, false).unwrap().grads.unwrap();
    for layer in 0..2 {
        assert!(grads.encoder[layer].iter().any(|&v| v != 0.0));
        assert!(grads.decoder[layer].iter().any(|&v| v != 0.0));
    }
}

#[test]
fn test_positional_step_without_real_tokens() {
    let config = ModelConfig::new(1, 2, 8).with_positional_mode(PositionalMode::Pointer, 6, 7);
    let seq2seq = Seq2Seq::new(config, 0.3, 1).unwrap();
    // Last decoder step is padded in every row
    let batch = Batch::from_padded(array![[1, 2, 3, 0]], array![[4, 0]], 3, 0)
        .unwrap()
        .with_alignments(array![[Alignment::Source(0), Alignment::Null]])
        .unwrap();
    assert!(matches!(
        seq2seq.cost_grad(&batch, false),
        Err(ModelError::Mask { timestep: 3, .. })
    ));
}

#[test]
fn test_alignment_outside_source_hidden_range() {
    let config = ModelConfig::new(1, 2, 8).with_positional_mode(PositionalMode::Pointer, 6, 7);
    let seq2seq = Seq2Seq::new(config, 0.3, 1).unwrap();
    let batch = Batch::from_padded(array![[1, 2, 3, 4]], array![[4, 5]], 3, 0)
        .unwrap()
        .with_alignments(array![[Alignment::Source(2), Alignment::Null]])
        .unwrap();
    assert!(matches!(
        seq2seq.cost_grad(&batch, false),
        Err(ModelError::Shape { .. })
    ));
}
