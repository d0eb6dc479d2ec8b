use std::io::Write;

use lstm_nmt::{
    Batch, ModelConfig, ModelError, PositionalMode, Precision, Seq2Seq, SourceChannel,
};
use ndarray::array;
use tempfile::NamedTempFile;

#[test]
fn test_load_json_with_defaults() {
    let mut file = NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{"num_layers": 2, "hidden_size": 4, "vocab_size": 10, "positional_mode": "pointer",
            "null_position_index": 8, "eos_position_index": 9}}"#
    )
    .unwrap();

    let config = ModelConfig::load_json(file.path().to_str().unwrap()).unwrap();
    assert_eq!(config.num_layers, 2);
    assert_eq!(config.positional_mode, PositionalMode::Pointer);
    assert!(!config.attention);
    assert_eq!(config.precision, Precision::Double);
    assert_eq!(config.channel().unwrap(), SourceChannel::Pointer);
}

#[test]
fn test_save_and_reload() {
    let file = NamedTempFile::new().unwrap();
    let path = file.path().to_str().unwrap();
    let config = ModelConfig::new(3, 5, 12)
        .with_attention(true)
        .with_precision(Precision::Single);
    config.save_json(path).unwrap();

    let loaded = ModelConfig::load_json(path).unwrap();
    assert_eq!(loaded.num_layers, 3);
    assert!(loaded.attention);
    assert_eq!(loaded.precision, Precision::Single);
}

#[test]
fn test_load_rejects_positional_with_attention() {
    let mut file = NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{"num_layers": 1, "hidden_size": 4, "vocab_size": 10, "positional_mode": "copy",
            "attention": true, "null_position_index": 1, "eos_position_index": 2}}"#
    )
    .unwrap();
    assert!(matches!(
        ModelConfig::load_json(file.path().to_str().unwrap()),
        Err(ModelError::Configuration { .. })
    ));
}

#[test]
fn test_load_errors() {
    assert!(matches!(
        ModelConfig::load_json("/nonexistent/model.json"),
        Err(ModelError::ConfigLoad { .. })
    ));

    let mut file = NamedTempFile::new().unwrap();
    write!(file, "not json").unwrap();
    assert!(matches!(
        ModelConfig::load_json(file.path().to_str().unwrap()),
        Err(ModelError::Serialization { .. })
    ));
}

#[test]
fn test_every_positional_mode_excludes_attention() {
    for mode in [
        PositionalMode::EmbeddingConcat,
        PositionalMode::Pointer,
        PositionalMode::Copy,
    ] {
        let config = ModelConfig::new(1, 2, 8)
            .with_positional_mode(mode, 6, 7)
            .with_attention(true);
        assert!(matches!(
            config.channel(),
            Err(ModelError::Configuration { .. })
        ));
    }
    assert!(matches!(
        PositionalMode::try_from(4u8),
        Err(ModelError::Configuration { .. })
    ));
}

#[test]
fn test_cost_grad_rejects_invalid_config_before_running() {
    let valid = ModelConfig::new(1, 2, 8);
    let mut seq2seq = Seq2Seq::new(valid, 0.1, 0).unwrap();
    seq2seq.config.attention = true;
    seq2seq.config.positional_mode = PositionalMode::EmbeddingConcat;
    let batch = Batch::from_padded(array![[1, 2, 3]], array![[2, 3]], 2, 0).unwrap();
    assert!(matches!(
        seq2seq.cost_grad(&batch, true),
        Err(ModelError::Configuration { .. })
    ));
}

#[test]
fn test_source_hidden_count_bounds() {
    let seq2seq = Seq2Seq::new(ModelConfig::new(1, 2, 8).with_attention(true), 0.1, 0).unwrap();
    let batch = Batch::from_padded(array![[1, 2, 3]], array![[2, 3]], 2, 0)
        .unwrap()
        .with_num_source_hidden_vecs(4);
    assert!(matches!(
        seq2seq.cost_grad(&batch, true),
        Err(ModelError::Configuration { .. })
    ));

    // Attention may attend over decoder states as well
    let batch = batch.with_num_source_hidden_vecs(3);
    assert!(seq2seq.cost_grad(&batch, false).is_ok());
}

#[test]
fn test_single_precision_stays_close_to_double() {
    let batch = Batch::from_padded(array![[1, 2, 3, 4]], array![[3, 4]], 3, 0).unwrap();
    let double = Seq2Seq::new(ModelConfig::new(2, 3, 8), 0.4, 6).unwrap();
    let single = Seq2Seq::new(ModelConfig::new(2, 3, 8).with_precision(Precision::Single), 0.4, 6).unwrap();
    let a = double.cost_grad(&batch, true).unwrap().costs.total;
    let b = single.cost_grad(&batch, true).unwrap().costs.total;
    assert!((a - b).abs() < 1e-4);
}
