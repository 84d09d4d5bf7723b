//! Pretraining data: JSONL corpora turned into fixed-length token windows.

use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::Deserialize;
use tracing::info;

use crate::arguments::{DatasetGroup, TrainingArgs};
use crate::distributed::{ProcessGroup, ProcessGroupManager};
use crate::error::{Error, Result};
use crate::io as file_io;
use crate::tokenizer::Tokenizer;

/// `(inputs, outputs)` token rows of one micro-batch.
pub type Batch = (Vec<Vec<u32>>, Vec<Vec<u32>>);

/// Pull-based batch supplier.
pub trait BatchSource {
    fn get_next_batch(&mut self) -> Result<Batch>;
}

#[derive(Deserialize)]
struct JsonlRecord {
    text: String,
}

/// Token stream of a corpus, documents separated by EOS.
pub struct Dataset {
    tokens: Vec<u32>,
    seq_len: usize,
}

impl Dataset {
    pub fn new(tokens: Vec<u32>, seq_len: usize) -> Self {
        Self { tokens, seq_len }
    }

    fn from_reader<R: Read>(reader: R, tokenizer: &Tokenizer, tokens: &mut Vec<u32>) -> Result<()> {
        let reader = BufReader::new(reader);
        for line in reader.lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let record: JsonlRecord = serde_json::from_str(&line)?;
            if !record.text.is_empty() {
                tokens.extend(tokenizer.encode(&record.text, false)?);
                tokens.push(tokenizer.eos_token_id());
            }
        }
        Ok(())
    }

    /// Load dataset from JSONL files where each line has a "text" field.
    /// Supports .gz and .zst/.zstd compressed files.
    pub fn from_files<P: AsRef<Path>>(paths: &[P], tokenizer: &Tokenizer, seq_len: usize) -> Result<Self> {
        let mut tokens = Vec::new();
        for path in paths {
            let reader = file_io::open_file(path)?;
            Self::from_reader(reader, tokenizer, &mut tokens)?;
        }
        Ok(Self::new(tokens, seq_len))
    }

    /// Number of non-overlapping `seq_len` windows.
    pub fn num_samples(&self) -> usize {
        if self.seq_len == 0 {
            0
        } else {
            self.tokens.len() / self.seq_len
        }
    }

    pub fn is_empty(&self) -> bool {
        self.num_samples() == 0
    }

    pub fn sample(&self, index: usize) -> &[u32] {
        let start = index * self.seq_len;
        &self.tokens[start..start + self.seq_len]
    }

    pub fn tokens(&self) -> &[u32] {
        &self.tokens
    }
}

/// Endless, data-parallel sharded loader over a [`Dataset`].
///
/// Global sample `i` belongs to epoch `i / num_samples`; each epoch visits
/// the windows in a permutation seeded by `seed + epoch`. A call consumes
/// `micro_batch_size * data_parallel_size` global samples, of which this rank
/// takes its contiguous slice, so resuming from `consumed_samples` continues
/// exactly where a run stopped.
pub struct PretrainingDataLoader {
    dataset: Dataset,
    micro_batch_size: usize,
    consumed_samples: usize,
    data_parallel_rank: usize,
    data_parallel_size: usize,
    seed: u64,
    shuffle: bool,
    epoch: Option<usize>,
    permutation: Vec<usize>,
}

impl PretrainingDataLoader {
    pub fn new(
        dataset: Dataset,
        micro_batch_size: usize,
        consumed_samples: usize,
        data_parallel_rank: usize,
        data_parallel_size: usize,
        seed: u64,
        shuffle: bool,
    ) -> Result<Self> {
        if dataset.is_empty() {
            return Err(Error::Configuration(format!(
                "dataset has fewer tokens ({}) than one sequence ({})",
                dataset.tokens.len(),
                dataset.seq_len
            )));
        }
        Ok(Self {
            dataset,
            micro_batch_size,
            consumed_samples,
            data_parallel_rank,
            data_parallel_size,
            seed,
            shuffle,
            epoch: None,
            permutation: Vec::new(),
        })
    }

    pub fn consumed_samples(&self) -> usize {
        self.consumed_samples
    }

    pub fn num_samples(&self) -> usize {
        self.dataset.num_samples()
    }

    fn sample_index(&mut self, global_index: usize) -> usize {
        let num_samples = self.dataset.num_samples();
        let offset = global_index % num_samples;
        if !self.shuffle {
            return offset;
        }
        let epoch = global_index / num_samples;
        if self.epoch != Some(epoch) {
            let mut permutation: Vec<usize> = (0..num_samples).collect();
            permutation.shuffle(&mut StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64)));
            self.permutation = permutation;
            self.epoch = Some(epoch);
        }
        self.permutation[offset]
    }
}

impl BatchSource for PretrainingDataLoader {
    fn get_next_batch(&mut self) -> Result<Batch> {
        let start = self.consumed_samples + self.data_parallel_rank * self.micro_batch_size;
        let mut rows = Vec::with_capacity(self.micro_batch_size);
        for i in 0..self.micro_batch_size {
            let index = self.sample_index(start + i);
            rows.push(self.dataset.sample(index).to_vec());
        }
        self.consumed_samples += self.micro_batch_size * self.data_parallel_size;
        Ok((rows.clone(), rows))
    }
}

/// Integers up to 2^24 survive the round trip through `f32`.
const MAX_BROADCAST_VALUE: u32 = 1 << 24;

fn fits_in_f32(inputs: &[Vec<u32>], outputs: &[Vec<u32>]) -> bool {
    inputs.iter().chain(outputs).all(|row| {
        row.len() < MAX_BROADCAST_VALUE as usize && row.iter().all(|&token| token < MAX_BROADCAST_VALUE)
    })
}

/// Feeds every member of a tensor-parallel group the same batches.
///
/// Only the group's first rank holds a real source; it broadcasts the row
/// count, the row lengths and the flattened tokens to its siblings as `f32`,
/// so token ids and row lengths must stay below 2^24.
pub struct TensorParallelBatchSource {
    inner: Option<Box<dyn BatchSource>>,
}

impl TensorParallelBatchSource {
    pub fn new(inner: Option<Box<dyn BatchSource>>) -> Self {
        Self { inner }
    }

    pub fn get_next_batch(&mut self, pg: &ProcessGroupManager) -> Result<Batch> {
        if pg.tensor_parallel_world_size() == 1 {
            return self.pull();
        }

        let group = ProcessGroup::TensorParallel;
        let is_root = pg.tensor_parallel_rank() == 0;
        let local = if is_root { Some(self.pull()?) } else { None };

        // a negative row count tells siblings the root's batch cannot be sent
        let mut header = [match &local {
            Some((inputs, outputs)) if fits_in_f32(inputs, outputs) => inputs.len() as f32,
            Some(_) => -1.0,
            None => 0.0,
        }];
        pg.broadcast(&mut header, 0, group)?;
        if header[0] < 0.0 {
            return Err(Error::Distributed(format!(
                "token ids and row lengths must be below {MAX_BROADCAST_VALUE} to be broadcast"
            )));
        }
        let num_rows = header[0] as usize;

        let mut lengths: Vec<f32> = match &local {
            Some((inputs, outputs)) => inputs
                .iter()
                .chain(outputs.iter())
                .map(|row| row.len() as f32)
                .collect(),
            None => vec![0.0; 2 * num_rows],
        };
        pg.broadcast(&mut lengths, 0, group)?;
        let lengths: Vec<usize> = lengths.iter().map(|&l| l as usize).collect();

        let mut payload: Vec<f32> = match &local {
            Some((inputs, outputs)) => inputs
                .iter()
                .chain(outputs.iter())
                .flatten()
                .map(|&token| token as f32)
                .collect(),
            None => vec![0.0; lengths.iter().sum()],
        };
        pg.broadcast(&mut payload, 0, group)?;

        if let Some(batch) = local {
            return Ok(batch);
        }
        let mut tokens = payload.into_iter().map(|t| t as u32);
        let mut rows: Vec<Vec<u32>> = lengths
            .iter()
            .map(|&len| tokens.by_ref().take(len).collect())
            .collect();
        let outputs = rows.split_off(num_rows);
        Ok((rows, outputs))
    }

    fn pull(&mut self) -> Result<Batch> {
        self.inner
            .as_mut()
            .ok_or_else(|| Error::Internal("this rank holds no dataloader".to_string()))?
            .get_next_batch()
    }
}

/// A validation or test group.
pub struct EvalDataLoader {
    pub name: Option<String>,
    pub source: TensorParallelBatchSource,
}

pub struct PretrainingDataLoaders {
    pub train: TensorParallelBatchSource,
    pub val: Vec<EvalDataLoader>,
    pub test: Vec<EvalDataLoader>,
}

/// Builds the train, validation and test loaders for this rank.
///
/// Files are only read on the first rank of each tensor-parallel group; the
/// other members receive batches through [`TensorParallelBatchSource`].
pub fn get_pretraining_dataloaders(
    args: &TrainingArgs,
    tokenizer: &Tokenizer,
    consumed_samples: usize,
    pg: &ProcessGroupManager,
) -> Result<PretrainingDataLoaders> {
    let reads_data = pg.tensor_parallel_rank() == 0;
    let micro_batch_size = args.training_parameters.micro_batch_size;
    let sequence_length = args.datasets.sequence_length;
    let seed = args.random_args.seed;

    let load = |files: &[PathBuf], consumed_samples: usize, shuffle: bool| -> Result<Option<Box<dyn BatchSource>>> {
        if !reads_data {
            return Ok(None);
        }
        let dataset = Dataset::from_files(files, tokenizer, sequence_length)?;
        let loader = PretrainingDataLoader::new(
            dataset,
            micro_batch_size,
            consumed_samples,
            pg.data_parallel_rank(),
            pg.data_parallel_world_size(),
            seed,
            shuffle,
        )?;
        Ok(Some(Box::new(loader)))
    };

    let train = TensorParallelBatchSource::new(load(&args.datasets.train_files, consumed_samples, true)?);
    if reads_data && pg.is_main_process() {
        info!(
            "training data from {} file(s), resuming at sample {consumed_samples}",
            args.datasets.train_files.len()
        );
    }

    let eval_groups = |groups: &[DatasetGroup]| -> Result<Vec<EvalDataLoader>> {
        groups
            .iter()
            .map(|group| {
                Ok(EvalDataLoader {
                    name: group.name.clone(),
                    source: TensorParallelBatchSource::new(load(&group.files, 0, false)?),
                })
            })
            .collect()
    };

    Ok(PretrainingDataLoaders {
        train,
        val: eval_groups(&args.datasets.val)?,
        test: eval_groups(&args.datasets.test)?,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::{HashSet, VecDeque};
    use std::sync::Mutex;

    use super::*;
    use crate::distributed::{Communicator, Topology};

    fn dataset(num_samples: usize, seq_len: usize) -> Dataset {
        Dataset::new((0..(num_samples * seq_len) as u32).collect(), seq_len)
    }

    #[test]
    fn test_windows_do_not_overlap() {
        let ds = Dataset::new((0..10).collect(), 4);
        assert_eq!(ds.num_samples(), 2);
        assert_eq!(ds.sample(1), &[4, 5, 6, 7]);
    }

    #[test]
    fn test_outputs_equal_inputs() {
        let mut loader = PretrainingDataLoader::new(dataset(4, 3), 2, 0, 0, 1, 0, false).unwrap();
        let (inputs, outputs) = loader.get_next_batch().unwrap();
        assert_eq!(inputs, vec![vec![0, 1, 2], vec![3, 4, 5]]);
        assert_eq!(inputs, outputs);
        assert_eq!(loader.consumed_samples(), 2);
    }

    #[test]
    fn test_data_parallel_ranks_see_disjoint_samples() {
        let mut seen = HashSet::new();
        for rank in 0..2 {
            let mut loader = PretrainingDataLoader::new(dataset(8, 2), 2, 0, rank, 2, 7, true).unwrap();
            for _ in 0..2 {
                let (inputs, _) = loader.get_next_batch().unwrap();
                for row in inputs {
                    assert!(seen.insert(row));
                }
            }
            assert_eq!(loader.consumed_samples(), 8);
        }
        assert_eq!(seen.len(), 8);
    }

    #[test]
    fn test_resume_from_consumed_samples() {
        let mut full = PretrainingDataLoader::new(dataset(5, 2), 2, 0, 0, 1, 3, true).unwrap();
        let mut batches = Vec::new();
        for _ in 0..4 {
            batches.push(full.get_next_batch().unwrap());
        }

        let mut resumed = PretrainingDataLoader::new(dataset(5, 2), 2, 4, 0, 1, 3, true).unwrap();
        assert_eq!(resumed.get_next_batch().unwrap(), batches[2]);
        assert_eq!(resumed.get_next_batch().unwrap(), batches[3]);
    }

    #[test]
    fn test_empty_dataset_rejected() {
        let err = PretrainingDataLoader::new(Dataset::new(vec![1, 2], 4), 1, 0, 0, 1, 0, false)
            .err()
            .unwrap();
        assert!(matches!(err, Error::Configuration(_)));
    }

    /// Replays the root's broadcasts on a non-root member.
    struct ScriptedCommunicator {
        broadcasts: Mutex<VecDeque<Vec<f32>>>,
    }

    impl Communicator for ScriptedCommunicator {
        fn all_reduce_sum(&self, _values: &mut [f32], _group: ProcessGroup) -> Result<()> {
            Ok(())
        }

        fn broadcast(&self, values: &mut [f32], _root: usize, _group: ProcessGroup) -> Result<()> {
            // the root keeps its own values
            if let Some(next) = self.broadcasts.lock().unwrap().pop_front() {
                values.copy_from_slice(&next);
            }
            Ok(())
        }

        fn barrier(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_tensor_parallel_sibling_receives_batch() {
        let communicator = ScriptedCommunicator {
            broadcasts: Mutex::new(VecDeque::from(vec![
                vec![2.0],
                vec![1.0, 2.0, 1.0, 2.0],
                vec![5.0, 6.0, 7.0, 5.0, 6.0, 7.0],
            ])),
        };
        let topology = Topology::new(1, 2, 1, 2, 1, None).unwrap();
        let pg = ProcessGroupManager::new(topology, Box::new(communicator));
        assert_eq!(pg.tensor_parallel_rank(), 1);

        let mut source = TensorParallelBatchSource::new(None);
        let (inputs, outputs) = source.get_next_batch(&pg).unwrap();
        assert_eq!(inputs, vec![vec![5], vec![6, 7]]);
        assert_eq!(outputs, inputs);
    }

    #[test]
    fn test_ids_beyond_f32_precision_are_not_broadcast() {
        let communicator = ScriptedCommunicator {
            broadcasts: Mutex::new(VecDeque::new()),
        };
        let pg = ProcessGroupManager::new(
            Topology::new(0, 2, 0, 2, 1, None).unwrap(),
            Box::new(communicator),
        );
        let loader =
            PretrainingDataLoader::new(Dataset::new(vec![MAX_BROADCAST_VALUE + 1, 1], 2), 1, 0, 0, 1, 0, false)
                .unwrap();
        let mut root = TensorParallelBatchSource::new(Some(Box::new(loader)));
        let err = root.get_next_batch(&pg).unwrap_err();
        assert!(matches!(err, Error::Distributed(_)));

        let communicator = ScriptedCommunicator {
            broadcasts: Mutex::new(VecDeque::from(vec![vec![-1.0]])),
        };
        let pg = ProcessGroupManager::new(
            Topology::new(1, 2, 1, 2, 1, None).unwrap(),
            Box::new(communicator),
        );
        let err = TensorParallelBatchSource::new(None).get_next_batch(&pg).unwrap_err();
        assert!(matches!(err, Error::Distributed(_)));
    }

    #[test]
    fn test_single_rank_passthrough() {
        let pg = ProcessGroupManager::single_process();
        let loader = PretrainingDataLoader::new(dataset(2, 2), 1, 0, 0, 1, 0, false).unwrap();
        let mut source = TensorParallelBatchSource::new(Some(Box::new(loader)));
        assert_eq!(source.get_next_batch(&pg).unwrap().0, vec![vec![0, 1]]);
    }

    #[test]
    fn test_reads_jsonl_with_eos_separators() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.jsonl");
        std::fs::write(&path, "{\"text\": \"w3 w4\"}\n\n{\"text\": \"w5\"}\n").unwrap();
        let tokenizer = Tokenizer::new(crate::tokenizer::tests::word_level(10));

        let ds = Dataset::from_files(&[&path], &tokenizer, 2).unwrap();
        let eos = tokenizer.eos_token_id();
        assert_eq!(ds.tokens(), &[5, 6, eos, 7, eos]);
        assert_eq!(ds.num_samples(), 2);
    }
}
