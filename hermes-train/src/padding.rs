//! Batch padding for the four input regimes.
//!
//! Decoder-only batches are padded on the configured side (or left ragged in
//! padding-free mode); encoder-decoder inputs are padded on the configured
//! side while their labels are always right-padded. Labels carry
//! [`LABELS_MASK_VALUE`] wherever the loss must ignore a position.

use candle_core::{Device, Tensor};

use crate::ensure;
use crate::enums::{LossMask, PaddingSide};
use crate::error::{Error, Result};

/// Label value excluded from the loss.
pub const LABELS_MASK_VALUE: i64 = -100;

/// Padded rows before tensorization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaddedSequences {
    pub input_ids: Vec<Vec<u32>>,
    /// Absent in padding-free mode
    pub attention_mask: Option<Vec<Vec<u8>>>,
    pub labels: Option<Vec<Vec<i64>>>,
}

#[derive(Debug, Clone)]
pub enum TokenIds {
    /// `[batch, seq]` u32 tensor
    Dense(Tensor),
    /// Unpadded rows, consumed with sequence-boundary metadata
    Packed(Vec<Vec<u32>>),
}

#[derive(Debug, Clone)]
pub enum Labels {
    /// `[batch, seq]` i64 tensor
    Dense(Tensor),
    Packed(Vec<Vec<i64>>),
}

/// Model-ready batch.
#[derive(Debug, Clone)]
pub struct PaddedBatch {
    pub input_ids: TokenIds,
    pub attention_mask: Option<Tensor>,
    pub labels: Option<Labels>,
}

impl PaddedBatch {
    pub fn batch_size(&self) -> usize {
        match &self.input_ids {
            TokenIds::Dense(t) => t.dims().first().copied().unwrap_or(0),
            TokenIds::Packed(rows) => rows.len(),
        }
    }

    /// Moves dense tensors to `device`; packed rows stay host-side.
    pub fn to_device(self, device: &Device) -> Result<Self> {
        let input_ids = match self.input_ids {
            TokenIds::Dense(t) => TokenIds::Dense(t.to_device(device)?),
            packed => packed,
        };
        let attention_mask = self
            .attention_mask
            .map(|m| m.to_device(device))
            .transpose()?;
        let labels = match self.labels {
            Some(Labels::Dense(t)) => Some(Labels::Dense(t.to_device(device)?)),
            other => other,
        };
        Ok(Self {
            input_ids,
            attention_mask,
            labels,
        })
    }
}

/// Pads a batch and tensorizes it (on the host) unless `packed` is set.
pub fn pad(
    inputs: &[Vec<u32>],
    outputs: Option<&[Vec<u32>]>,
    pad_token_id: u32,
    padding_side: PaddingSide,
    is_encoder_decoder: bool,
    loss_mask: Option<LossMask>,
    packed: bool,
) -> Result<PaddedBatch> {
    let padded = pad_sequences(
        inputs,
        outputs,
        pad_token_id,
        padding_side,
        is_encoder_decoder,
        loss_mask,
        packed,
    )?;

    if packed && !is_encoder_decoder {
        return Ok(PaddedBatch {
            input_ids: TokenIds::Packed(padded.input_ids),
            attention_mask: None,
            labels: padded.labels.map(Labels::Packed),
        });
    }

    let device = Device::Cpu;
    let input_ids = TokenIds::Dense(to_tensor(padded.input_ids, &device)?);
    let attention_mask = padded
        .attention_mask
        .map(|m| to_tensor(m, &device))
        .transpose()?;
    let labels = padded
        .labels
        .map(|l| to_tensor(l, &device).map(Labels::Dense))
        .transpose()?;

    Ok(PaddedBatch {
        input_ids,
        attention_mask,
        labels,
    })
}

/// Pads rows without tensorizing them.
pub fn pad_sequences(
    inputs: &[Vec<u32>],
    outputs: Option<&[Vec<u32>]>,
    pad_token_id: u32,
    padding_side: PaddingSide,
    is_encoder_decoder: bool,
    loss_mask: Option<LossMask>,
    packed: bool,
) -> Result<PaddedSequences> {
    ensure!(!inputs.is_empty(), "cannot pad an empty batch");
    ensure!(
        inputs.iter().all(|row| !row.is_empty()),
        "every input sequence must contain at least one token"
    );
    if let Some(outputs) = outputs {
        ensure!(
            outputs.len() == inputs.len(),
            "got {} inputs but {} outputs",
            inputs.len(),
            outputs.len()
        );
    }

    if is_encoder_decoder {
        return pad_encoder_decoder(inputs, outputs, pad_token_id, padding_side, loss_mask);
    }

    if packed {
        let labels = outputs
            .map(|outputs| decoder_labels_unpadded(inputs, outputs, loss_mask))
            .transpose()?;
        return Ok(PaddedSequences {
            input_ids: inputs.to_vec(),
            attention_mask: None,
            labels,
        });
    }

    let max_length = max_len(inputs);
    let (input_ids, attention_mask) = pad_inputs(inputs, max_length, pad_token_id, padding_side);

    let labels = match outputs {
        None => None,
        Some(outputs) => Some(match loss_mask {
            Some(LossMask::OutputOnly) => match padding_side {
                PaddingSide::Left => {
                    let mut labels = Vec::with_capacity(outputs.len());
                    for output in outputs {
                        ensure!(
                            output.len() <= max_length,
                            "output of length {} does not fit into padded length {}",
                            output.len(),
                            max_length
                        );
                        let mut row = vec![LABELS_MASK_VALUE; max_length - output.len()];
                        row.extend(output.iter().map(|&t| t as i64));
                        labels.push(row);
                    }
                    labels
                }
                PaddingSide::Right => {
                    let mut labels = decoder_labels_unpadded(inputs, outputs, loss_mask)?;
                    for row in &mut labels {
                        row.resize(max_length, LABELS_MASK_VALUE);
                    }
                    labels
                }
            },
            Some(LossMask::NoMask) => {
                ensure!(
                    inputs.iter().all(|row| row.len() == max_length),
                    "no_mask loss requires equal-length sequences when padding is enabled"
                );
                to_labels(inputs)
            }
            None => return Err(Error::UnrecognizedPolicy("None".to_string())),
        }),
    };

    Ok(PaddedSequences {
        input_ids,
        attention_mask: Some(attention_mask),
        labels,
    })
}

fn pad_encoder_decoder(
    inputs: &[Vec<u32>],
    outputs: Option<&[Vec<u32>]>,
    pad_token_id: u32,
    padding_side: PaddingSide,
    loss_mask: Option<LossMask>,
) -> Result<PaddedSequences> {
    let (input_ids, attention_mask) =
        pad_inputs(inputs, max_len(inputs), pad_token_id, padding_side);

    let labels = match outputs {
        None => None,
        Some(outputs) => {
            if loss_mask != Some(LossMask::OutputOnly) {
                return Err(Error::Configuration(format!(
                    "only output_only loss mask is supported with encoder decoder models, got {}",
                    loss_mask.map_or_else(|| "None".to_string(), |m| m.to_string())
                )));
            }
            ensure!(
                outputs.iter().all(|row| !row.is_empty()),
                "every output sequence must contain at least one token"
            );
            // labels are right padded whatever the input padding side is
            let output_max_length = max_len(outputs);
            let labels = outputs
                .iter()
                .map(|row| {
                    let mut label: Vec<i64> = row.iter().map(|&t| t as i64).collect();
                    label.resize(output_max_length, LABELS_MASK_VALUE);
                    label
                })
                .collect();
            Some(labels)
        }
    };

    Ok(PaddedSequences {
        input_ids,
        attention_mask: Some(attention_mask),
        labels,
    })
}

/// Per-row labels with the input prefix masked, before any padding.
fn decoder_labels_unpadded(
    inputs: &[Vec<u32>],
    outputs: &[Vec<u32>],
    loss_mask: Option<LossMask>,
) -> Result<Vec<Vec<i64>>> {
    match loss_mask {
        Some(LossMask::OutputOnly) => inputs
            .iter()
            .zip(outputs)
            .map(|(input, output)| {
                ensure!(
                    output.len() <= input.len(),
                    "output of length {} is longer than its input of length {}",
                    output.len(),
                    input.len()
                );
                let mut row = vec![LABELS_MASK_VALUE; input.len() - output.len()];
                row.extend(output.iter().map(|&t| t as i64));
                Ok(row)
            })
            .collect(),
        Some(LossMask::NoMask) => Ok(to_labels(inputs)),
        None => Err(Error::UnrecognizedPolicy("None".to_string())),
    }
}

fn pad_inputs(
    inputs: &[Vec<u32>],
    max_length: usize,
    pad_token_id: u32,
    padding_side: PaddingSide,
) -> (Vec<Vec<u32>>, Vec<Vec<u8>>) {
    let mut input_ids = Vec::with_capacity(inputs.len());
    let mut attention_mask = Vec::with_capacity(inputs.len());

    for row in inputs {
        let pad = max_length - row.len();
        match padding_side {
            PaddingSide::Left => {
                let mut ids = vec![pad_token_id; pad];
                ids.extend_from_slice(row);
                let mut mask = vec![0u8; pad];
                mask.resize(max_length, 1);
                input_ids.push(ids);
                attention_mask.push(mask);
            }
            PaddingSide::Right => {
                let mut ids = row.clone();
                ids.resize(max_length, pad_token_id);
                let mut mask = vec![1u8; row.len()];
                mask.resize(max_length, 0);
                input_ids.push(ids);
                attention_mask.push(mask);
            }
        }
    }

    (input_ids, attention_mask)
}

fn max_len(rows: &[Vec<u32>]) -> usize {
    rows.iter().map(Vec::len).max().unwrap_or(0)
}

fn to_labels(rows: &[Vec<u32>]) -> Vec<Vec<i64>> {
    rows.iter()
        .map(|row| row.iter().map(|&t| t as i64).collect())
        .collect()
}

fn to_tensor<T: candle_core::WithDType>(rows: Vec<Vec<T>>, device: &Device) -> Result<Tensor> {
    let batch = rows.len();
    let width = rows.first().map_or(0, Vec::len);
    ensure!(
        rows.iter().all(|row| row.len() == width),
        "rows must share one length to form a tensor"
    );
    let flat: Vec<T> = rows.into_iter().flatten().collect();
    Ok(Tensor::from_vec(flat, (batch, width), device)?)
}

/// Cumulative sequence lengths (`[0, l0, l0 + l1, ...]`) for a packed batch.
pub fn cumulative_seqlens(rows: &[Vec<u32>]) -> Vec<u32> {
    let mut cu_seqlens = Vec::with_capacity(rows.len() + 1);
    let mut total = 0u32;
    cu_seqlens.push(0);
    for row in rows {
        total += row.len() as u32;
        cu_seqlens.push(total);
    }
    cu_seqlens
}
