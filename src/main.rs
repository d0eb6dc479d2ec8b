use clap::Parser;
use lstm_nmt::{
    Alignment, Batch, GradCheckOptions, MaskInfo, ModelConfig, ModelError, PositionalMode,
    Seq2Seq, check_gradients,
};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

const PAD_ID: usize = 0;

#[derive(Parser, Debug)]
#[command(name = "lstm_nmt")]
#[command(about = "Evaluate cost and gradients of a stacked LSTM encoder-decoder on a toy batch")]
struct Args {
    /// JSON model configuration; overrides the shape flags below
    #[arg(short, long)]
    config: Option<String>,

    #[arg(long, default_value_t = 2)]
    layers: usize,

    #[arg(long, default_value_t = 8)]
    hidden: usize,

    #[arg(long, default_value_t = 20)]
    vocab: usize,

    /// 0 none, 1 embedding-concat, 2 pointer, 3 copy
    #[arg(long, default_value_t = 0)]
    positional_mode: u8,

    #[arg(long)]
    attention: bool,

    #[arg(short, long, default_value_t = 4)]
    batch_size: usize,

    /// Source length including the boundary token
    #[arg(long, default_value_t = 5)]
    src_len: usize,

    #[arg(long, default_value_t = 4)]
    tgt_len: usize,

    #[arg(long, default_value_t = 0.1)]
    init_scale: f64,

    #[arg(short, long, default_value_t = 42)]
    seed: u64,

    /// Run the finite-difference gradient check
    #[arg(long)]
    grad_check: bool,

    /// Entries sampled per parameter block during the gradient check
    #[arg(long, default_value_t = 10)]
    samples: usize,
}

/// Random padded batch: sources are left-padded, targets right-padded, and row 0 is
/// always full length so every decoder step has a real token.
fn toy_batch(config: &ModelConfig, args: &Args, rng: &mut StdRng) -> lstm_nmt::Result<Batch> {
    if args.src_len == 0 || args.tgt_len == 0 || config.vocab_size < 2 {
        return Err(ModelError::Configuration {
            message: "toy batch needs src_len >= 1, tgt_len >= 1 and a vocabulary beyond padding"
                .to_string(),
        });
    }
    let boundary = args.src_len - 1;
    let total = boundary + args.tgt_len;
    let mut input = Array2::from_elem((args.batch_size, total), PAD_ID);
    let mut targets = Array2::from_elem((args.batch_size, args.tgt_len), PAD_ID);
    let mut alignments = Array2::from_elem((args.batch_size, args.tgt_len), Alignment::Null);

    for row in 0..args.batch_size {
        let src_real = if row == 0 || boundary == 0 {
            boundary
        } else {
            rng.random_range(1..=boundary)
        };
        let tgt_real = if row == 0 {
            args.tgt_len
        } else {
            rng.random_range(1..=args.tgt_len)
        };
        for t in boundary - src_real..boundary {
            input[[row, t]] = rng.random_range(1..config.vocab_size);
        }
        for j in 0..tgt_real {
            input[[row, boundary + j]] = rng.random_range(1..config.vocab_size);
            targets[[row, j]] = rng.random_range(1..config.vocab_size);
            let raw = rng.random_range(-1..=boundary as i64);
            alignments[[row, j]] = match Alignment::from_raw(raw, boundary) {
                // Left padding: keep source pointers on real tokens
                Alignment::Source(p) if p < boundary - src_real => Alignment::Null,
                other => other,
            };
        }
    }

    let masks: Vec<MaskInfo> = input
        .columns()
        .into_iter()
        .map(|column| MaskInfo::from_tokens(column, PAD_ID))
        .collect();
    let batch = Batch::new(input, targets, masks, args.src_len)?;
    if config.positional_mode.is_active() {
        batch.with_alignments(alignments)
    } else {
        Ok(batch)
    }
}

fn main() -> lstm_nmt::Result<()> {
    let args = Args::parse();

    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = match &args.config {
        Some(path) => ModelConfig::load_json(path)?,
        None => {
            let mode = PositionalMode::try_from(args.positional_mode)?;
            let vocab = args.vocab;
            ModelConfig::new(args.layers, args.hidden, vocab)
                .with_positional_mode(mode, vocab.saturating_sub(2), vocab.saturating_sub(1))
                .with_attention(args.attention)
        }
    };
    config.validate()?;

    let mut seq2seq = Seq2Seq::new(config.clone(), args.init_scale, args.seed)?;
    let mut rng = StdRng::seed_from_u64(args.seed.wrapping_add(1));
    let batch = toy_batch(&config, &args, &mut rng)?;

    println!("\n=== MODEL ===");
    println!("Channel: {:?}", config.channel()?);
    println!("Layers: {}, hidden: {}, vocab: {}", config.num_layers, config.hidden_size, config.vocab_size);
    println!("Total parameters: {}", seq2seq.parameters());

    let output = seq2seq.cost_grad(&batch, false)?;
    println!("\n=== COST ===");
    println!("Total cost: {:.6}", output.costs.total);
    if let Some(grads) = &output.grads {
        println!("Gradient norm: {:.6}", grads.norm());
        println!("Embedding rows touched: {}", grads.embedding.len());
        info!(
            cost = output.costs.total,
            grad_norm = grads.norm(),
            "Cost and gradients evaluated"
        );
    }

    if args.grad_check {
        let options = GradCheckOptions {
            samples_per_slot: args.samples,
            seed: args.seed,
            ..Default::default()
        };
        let report = check_gradients(&mut seq2seq, &batch, &options)?;
        println!("\n=== GRADIENT CHECK ===");
        print!("{report}");
        println!("Max relative error: {:.3e}", report.max_rel_error());
    }

    Ok(())
}
