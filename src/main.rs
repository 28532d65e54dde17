use llama_rs::{
    AttentionKernel, ComputePath, LlamaState, generate, load_model, load_tokenizer, sample,
};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::collections::HashSet;
use std::env;
use std::io::{self, Write};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args: Vec<String> = env::args().collect();

    if args.len() < 3 {
        eprintln!(
            "Usage: {} <checkpoint> <tokenizer> [prompt] [options]",
            args[0]
        );
        eprintln!("Options:");
        eprintln!("  --temp <float>    Temperature (default: 1.0, 0 = greedy)");
        eprintln!("  --topp <float>    Top-p sampling (default: 0.9)");
        eprintln!("  --steps <int>     Max tokens to generate (default: 256)");
        eprintln!("  --seed <int>      Random seed (default: 0)");
        eprintln!("  --flash           Use the tiled flash-attention kernel");
        std::process::exit(1);
    }

    let checkpoint_path = &args[1];
    let tokenizer_path = &args[2];
    let prompt = args.get(3).map(|s| s.as_str()).unwrap_or("");

    let mut temp = 1.0;
    let mut topp = 0.9;
    let mut steps = 256usize;
    let mut seed = 0u64;
    let mut use_flash = false;

    let mut i = 4;
    while i < args.len() {
        match args[i].as_str() {
            "--temp" => {
                temp = args.get(i + 1).and_then(|s| s.parse().ok()).unwrap_or(1.0);
                i += 2;
            }
            "--topp" => {
                topp = args.get(i + 1).and_then(|s| s.parse().ok()).unwrap_or(0.9);
                i += 2;
            }
            "--steps" => {
                steps = args.get(i + 1).and_then(|s| s.parse().ok()).unwrap_or(256);
                i += 2;
            }
            "--seed" => {
                seed = args.get(i + 1).and_then(|s| s.parse().ok()).unwrap_or(0);
                i += 2;
            }
            "--flash" => {
                use_flash = true;
                i += 1;
            }
            _ => i += 1,
        }
    }

    log::info!("loading model from {checkpoint_path}");
    let (config, weights) = load_model(checkpoint_path)?;
    log::info!(
        "config: dim={}, layers={}, heads={}, vocab={}",
        config.dim,
        config.n_layers,
        config.n_heads,
        config.vocab_size
    );

    let tokenizer = load_tokenizer(tokenizer_path, config.vocab_size as usize)?;
    log::info!("loaded tokenizer with {} tokens", tokenizer.vocab.len());

    let mut state = LlamaState::new(&config)?;
    let mut rng = StdRng::seed_from_u64(seed);

    let tokens = tokenizer.encode(prompt, true, false)?;
    log::debug!("prompt tokens: {tokens:?}");

    let mut stop = HashSet::new();
    stop.insert(2); // EOS, matching the tokenizer's fixed id convention

    let attn = if use_flash {
        AttentionKernel::Flash {
            tile_size: llama_rs::attention::DEFAULT_TILE_SIZE,
        }
    } else {
        AttentionKernel::Reference
    };

    let mut sampler = move |logits: &mut [f32]| sample(logits, temp, topp, &mut rng);

    let print_piece = |piece: &str| {
        if piece.starts_with("<0x") && piece.ends_with('>') && piece.len() == 6 {
            if let Ok(byte) = u8::from_str_radix(&piece[3..5], 16) {
                print!("{}", byte as char);
            }
        } else {
            print!("{piece}");
        }
    };

    // `generate()`'s callback never receives forced prompt tokens (§4.9), so
    // echoing the prompt back to the user is this CLI's own job, done before
    // the loop starts ingesting it.
    for &tok in &tokens {
        if let Some(piece) = tokenizer.decode(tok) {
            print_piece(piece);
        }
    }
    let _ = io::stdout().flush();

    let out = generate(
        &weights,
        &mut state,
        &config,
        0,
        &tokens,
        &stop,
        steps,
        &mut sampler,
        true, // echo: accepted for interface parity, unused by generate() itself
        |token| {
            if let Some(piece) = tokenizer.decode(token) {
                print_piece(piece);
                let _ = io::stdout().flush();
            }
        },
        ComputePath::Cpu,
        attn,
    )?;
    println!();

    log::info!(
        "prompt eval: {:.1} tok/s, generation: {:.1} tok/s ({} tokens)",
        out.stats.prompt_tokens_per_sec(),
        out.stats.generated_tokens_per_sec(),
        out.stats.generated_tokens
    );

    Ok(())
}
