//! Batched autoregressive decoding for decoder-only models.

use std::cmp::Ordering;

use candle_core::{D, DType, Tensor};
use rand::Rng;

use crate::error::Result;
use crate::model::{GenerationConfig, ModelInput, PretrainedModel};

/// Extends every row of `input_ids` by up to `max_new_tokens` tokens.
///
/// Decoding stops once every row has produced `eos_token_id`; finished rows are
/// filled with it. The context is cropped to the model's `max_seq_len`.
/// Returns `[batch, prompt + generated]`.
pub fn generate(
    model: &dyn PretrainedModel,
    input_ids: &Tensor,
    attention_mask: Option<&Tensor>,
    config: &GenerationConfig,
    eos_token_id: u32,
    rng: &mut dyn rand::RngCore,
) -> Result<Tensor> {
    let device = input_ids.device();
    let (batch_size, _) = input_ids.dims2()?;
    let max_seq_len = model.config().max_seq_len;

    let mut tokens: Vec<Vec<u32>> = input_ids.to_vec2()?;
    let mut mask: Option<Vec<Vec<u8>>> = attention_mask.map(|m| m.to_vec2()).transpose()?;
    let mut finished = vec![false; batch_size];

    for _ in 0..config.max_new_tokens {
        let len = tokens.first().map_or(0, Vec::len);
        let start = len.saturating_sub(max_seq_len);
        let width = len - start;

        let window: Vec<u32> = tokens
            .iter()
            .flat_map(|row| row[start..].iter().copied())
            .collect();
        let input = Tensor::from_vec(window, (batch_size, width), device)?;
        let window_mask = mask
            .as_ref()
            .map(|rows| {
                let flat: Vec<u8> = rows
                    .iter()
                    .flat_map(|row| row[start..].iter().copied())
                    .collect();
                Tensor::from_vec(flat, (batch_size, width), device)
            })
            .transpose()?;

        let logits = model.forward(
            &ModelInput::Dense {
                input_ids: &input,
                attention_mask: window_mask.as_ref(),
                labels: None,
            },
            false,
        )?;
        // [batch, seq, vocab] -> [batch, vocab]
        let logits = logits
            .narrow(1, width - 1, 1)?
            .squeeze(1)?
            .to_dtype(DType::F32)?;

        let next = next_tokens(&logits, config, rng)?;
        for (b, &token) in next.iter().enumerate() {
            let token = if finished[b] { eos_token_id } else { token };
            tokens[b].push(token);
            if let Some(rows) = mask.as_mut() {
                rows[b].push(1);
            }
            finished[b] |= token == eos_token_id;
        }

        if finished.iter().all(|&f| f) {
            break;
        }
    }

    let width = tokens.first().map_or(0, Vec::len);
    Ok(Tensor::from_vec(tokens.concat(), (batch_size, width), device)?)
}

/// Generated-token count per row: non-EOS tokens plus one for the EOS itself.
pub fn count_generated_tokens(generated: &[Vec<u32>], eos_token_id: u32) -> Vec<usize> {
    generated
        .iter()
        .map(|row| row.iter().filter(|&&t| t != eos_token_id).count() + 1)
        .collect()
}

fn next_tokens(
    logits: &Tensor,
    config: &GenerationConfig,
    rng: &mut dyn rand::RngCore,
) -> Result<Vec<u32>> {
    match config.temperature {
        Some(temperature) if temperature > 0.0 => {
            let logits = if temperature != 1.0 {
                logits.affine(1.0 / temperature, 0.0)?
            } else {
                logits.clone()
            };
            let logits = match config.top_k {
                Some(k) if k > 0 => top_k_filter(&logits, k)?,
                _ => logits,
            };
            let probs: Vec<Vec<f32>> = candle_nn::ops::softmax_last_dim(&logits)?.to_vec2()?;
            Ok(probs.iter().map(|p| sample_from_probs(p, rng)).collect())
        }
        _ => Ok(logits.argmax(D::Minus1)?.to_vec1::<u32>()?),
    }
}

/// Keeps the `k` largest logits of each row, masking the rest to `-inf`.
fn top_k_filter(logits: &Tensor, k: usize) -> Result<Tensor> {
    let (batch_size, vocab_size) = logits.dims2()?;
    let rows: Vec<Vec<f32>> = logits.to_vec2()?;
    let mut masked = vec![f32::NEG_INFINITY; batch_size * vocab_size];

    for (b, row) in rows.iter().enumerate() {
        let mut indexed: Vec<(usize, f32)> = row.iter().copied().enumerate().collect();
        indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
        for &(i, value) in indexed.iter().take(k) {
            masked[b * vocab_size + i] = value;
        }
    }

    Ok(Tensor::from_vec(masked, (batch_size, vocab_size), logits.device())?)
}

fn sample_from_probs(probs: &[f32], rng: &mut dyn rand::RngCore) -> u32 {
    let r: f32 = rng.random();
    let mut cumsum = 0.0;
    for (i, &p) in probs.iter().enumerate() {
        cumsum += p;
        if cumsum > r {
            return i as u32;
        }
    }
    probs
        .iter()
        .rposition(|&p| p > 0.0)
        .unwrap_or(0) as u32
}

#[cfg(test)]
mod tests {
    use candle_core::Device;
    use candle_nn::VarMap;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;
    use crate::config::Config;
    use crate::model::{GPT, ModelBuildOptions};

    fn model() -> GPT {
        let config = Config {
            vocab_size: 24,
            max_seq_len: 32,
            hidden_size: 16,
            num_layers: 1,
            num_heads: 2,
            num_kv_heads: 1,
            intermediate_size: 32,
            ..Config::nano()
        };
        GPT::new(&config, VarMap::new(), &ModelBuildOptions::cpu()).unwrap()
    }

    #[test]
    fn test_token_count_includes_eos_once() {
        let eos = 2;
        assert_eq!(count_generated_tokens(&[vec![5, 7, eos, eos]], eos), vec![3]);
        assert_eq!(count_generated_tokens(&[vec![eos, eos]], eos), vec![1]);
    }

    #[test]
    fn test_greedy_generates_max_new_tokens_without_eos() {
        let model = model();
        let input_ids = Tensor::new(&[[3u32, 4, 5], [6, 7, 8]], &Device::Cpu).unwrap();
        let config = GenerationConfig {
            max_new_tokens: 4,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(0);
        // an id outside the vocabulary is never produced
        let out = generate(&model, &input_ids, None, &config, 1000, &mut rng).unwrap();
        assert_eq!(out.dims(), &[2, 7]);
        let rows: Vec<Vec<u32>> = out.to_vec2().unwrap();
        assert_eq!(&rows[0][..3], &[3, 4, 5]);
    }

    #[test]
    fn test_left_padded_row_matches_unpadded_generation() {
        let model = model();
        let config = GenerationConfig {
            max_new_tokens: 3,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(0);

        let single = Tensor::new(&[[9u32, 10]], &Device::Cpu).unwrap();
        let single = generate(&model, &single, None, &config, 1000, &mut rng).unwrap();
        let single: Vec<Vec<u32>> = single.to_vec2().unwrap();

        let batch = Tensor::new(&[[0u32, 9, 10], [11, 12, 13]], &Device::Cpu).unwrap();
        let mask = Tensor::new(&[[0u8, 1, 1], [1, 1, 1]], &Device::Cpu).unwrap();
        let batch = generate(&model, &batch, Some(&mask), &config, 1000, &mut rng).unwrap();
        let batch: Vec<Vec<u32>> = batch.to_vec2().unwrap();

        assert_eq!(&batch[0][3..], &single[0][2..]);
    }

    #[test]
    fn test_top_k_filter_keeps_k_largest() {
        let logits = Tensor::new(&[[0.1f32, 3.0, 2.0, -1.0]], &Device::Cpu).unwrap();
        let filtered: Vec<Vec<f32>> = top_k_filter(&logits, 2).unwrap().to_vec2().unwrap();
        assert_eq!(
            filtered[0],
            vec![f32::NEG_INFINITY, 3.0, 2.0, f32::NEG_INFINITY]
        );
    }

    #[test]
    fn test_sampling_respects_one_hot_distribution() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..10 {
            assert_eq!(sample_from_probs(&[0.0, 0.0, 1.0], &mut rng), 2);
        }
    }
}
