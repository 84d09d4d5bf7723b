//! Process-group topology and collective communication.
//!
//! The topology (tensor × data × pipeline parallel) is fixed when the
//! [`ProcessGroupManager`] is constructed and handed by reference to every
//! component that needs rank information. Multi-process runs use NCCL through
//! `cudarc` (feature `nccl`); single-process runs use [`LocalCommunicator`].

use tracing::info;

use crate::arguments::DistributedArgs;
use crate::error::{Error, Result};

/// Communication scope of a collective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessGroup {
    World,
    TensorParallel,
    DataParallel,
}

/// Collective operations over f32 buffers.
///
/// `root` arguments are ranks *within* the group.
pub trait Communicator: Send + Sync {
    fn all_reduce_sum(&self, values: &mut [f32], group: ProcessGroup) -> Result<()>;

    fn broadcast(&self, values: &mut [f32], root: usize, group: ProcessGroup) -> Result<()>;

    fn barrier(&self) -> Result<()>;

    fn destroy(&self) -> Result<()> {
        Ok(())
    }
}

/// Communicator for a world of one process; every collective is the identity.
#[derive(Debug, Default)]
pub struct LocalCommunicator;

impl Communicator for LocalCommunicator {
    fn all_reduce_sum(&self, _values: &mut [f32], _group: ProcessGroup) -> Result<()> {
        Ok(())
    }

    fn broadcast(&self, _values: &mut [f32], _root: usize, _group: ProcessGroup) -> Result<()> {
        Ok(())
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }
}

/// Rank layout: tensor parallel innermost, then data parallel, then pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Topology {
    pub rank: usize,
    pub world_size: usize,
    pub local_rank: usize,
    pub tensor_parallel_size: usize,
    pub data_parallel_size: usize,
    pub pipeline_parallel_size: usize,
}

impl Topology {
    pub fn new(
        rank: usize,
        world_size: usize,
        local_rank: usize,
        tensor_parallel_size: usize,
        pipeline_parallel_size: usize,
        data_parallel_size: Option<usize>,
    ) -> Result<Self> {
        if world_size == 0 || rank >= world_size {
            return Err(Error::Configuration(format!(
                "rank {rank} is outside a world of size {world_size}"
            )));
        }
        let model_parallel = tensor_parallel_size * pipeline_parallel_size;
        if model_parallel == 0 || world_size % model_parallel != 0 {
            return Err(Error::Configuration(format!(
                "world size ({world_size}) is not divisible by tensor_parallel_size ({tensor_parallel_size}) × pipeline_parallel_size ({pipeline_parallel_size})"
            )));
        }
        let data_parallel_size = data_parallel_size.unwrap_or(world_size / model_parallel);
        if data_parallel_size * model_parallel != world_size {
            return Err(Error::Configuration(format!(
                "tensor ({tensor_parallel_size}) × data ({data_parallel_size}) × pipeline ({pipeline_parallel_size}) parallel sizes do not match world size ({world_size})"
            )));
        }
        Ok(Self {
            rank,
            world_size,
            local_rank,
            tensor_parallel_size,
            data_parallel_size,
            pipeline_parallel_size,
        })
    }

    pub fn single_process() -> Self {
        Self {
            rank: 0,
            world_size: 1,
            local_rank: 0,
            tensor_parallel_size: 1,
            data_parallel_size: 1,
            pipeline_parallel_size: 1,
        }
    }

    pub fn tensor_parallel_rank(&self) -> usize {
        self.rank % self.tensor_parallel_size
    }

    pub fn data_parallel_rank(&self) -> usize {
        (self.rank / self.tensor_parallel_size) % self.data_parallel_size
    }

    pub fn pipeline_parallel_rank(&self) -> usize {
        self.rank / (self.tensor_parallel_size * self.data_parallel_size)
    }

    pub fn tensor_parallel_first_rank(&self) -> usize {
        self.rank - self.tensor_parallel_rank()
    }

    /// Global ranks that share this rank's tensor-parallel group.
    pub fn tensor_parallel_group_ranks(&self) -> Vec<usize> {
        let first = self.tensor_parallel_first_rank();
        (first..first + self.tensor_parallel_size).collect()
    }

    /// Global ranks that share this rank's data-parallel group.
    pub fn data_parallel_group_ranks(&self) -> Vec<usize> {
        let base = self.pipeline_parallel_rank() * self.tensor_parallel_size * self.data_parallel_size
            + self.tensor_parallel_rank();
        (0..self.data_parallel_size)
            .map(|i| base + i * self.tensor_parallel_size)
            .collect()
    }

    /// Size of `group` and this rank's position inside it.
    pub fn group_position(&self, group: ProcessGroup) -> (usize, usize) {
        match group {
            ProcessGroup::World => (self.world_size, self.rank),
            ProcessGroup::TensorParallel => {
                (self.tensor_parallel_size, self.tensor_parallel_rank())
            }
            ProcessGroup::DataParallel => (self.data_parallel_size, self.data_parallel_rank()),
        }
    }
}

/// Owns the topology and the communicator for the process lifetime.
pub struct ProcessGroupManager {
    topology: Topology,
    communicator: Box<dyn Communicator>,
}

impl std::fmt::Debug for ProcessGroupManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessGroupManager")
            .field("topology", &self.topology)
            .finish_non_exhaustive()
    }
}

impl ProcessGroupManager {
    pub fn new(topology: Topology, communicator: Box<dyn Communicator>) -> Self {
        Self {
            topology,
            communicator,
        }
    }

    pub fn single_process() -> Self {
        Self::new(Topology::single_process(), Box::new(LocalCommunicator))
    }

    /// Builds the topology from explicit ranks or the `RANK` / `WORLD_SIZE` /
    /// `LOCAL_RANK` environment variables and connects the communicator.
    pub fn init(
        args: &DistributedArgs,
        rank: Option<usize>,
        world_size: Option<usize>,
        local_rank: Option<usize>,
    ) -> Result<Self> {
        let rank = rank.map_or_else(|| env_usize("RANK", 0), Ok)?;
        let world_size = world_size.map_or_else(|| env_usize("WORLD_SIZE", 1), Ok)?;
        let local_rank = local_rank.map_or_else(|| env_usize("LOCAL_RANK", rank), Ok)?;

        let topology = Topology::new(
            rank,
            world_size,
            local_rank,
            args.tensor_parallel_size,
            args.pipeline_parallel_size,
            args.data_parallel_size,
        )?;

        let communicator: Box<dyn Communicator> = if world_size == 1 {
            Box::new(LocalCommunicator)
        } else {
            connect(&topology, args)?
        };

        if topology.rank == 0 {
            info!(
                "Initialized process groups: world={} tp={} dp={} pp={}",
                topology.world_size,
                topology.tensor_parallel_size,
                topology.data_parallel_size,
                topology.pipeline_parallel_size
            );
        }

        Ok(Self::new(topology, communicator))
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn rank(&self) -> usize {
        self.topology.rank
    }

    pub fn world_size(&self) -> usize {
        self.topology.world_size
    }

    pub fn local_rank(&self) -> usize {
        self.topology.local_rank
    }

    pub fn is_main_process(&self) -> bool {
        self.topology.rank == 0
    }

    pub fn tensor_parallel_world_size(&self) -> usize {
        self.topology.tensor_parallel_size
    }

    pub fn tensor_parallel_rank(&self) -> usize {
        self.topology.tensor_parallel_rank()
    }

    pub fn tensor_parallel_first_rank(&self) -> usize {
        self.topology.tensor_parallel_first_rank()
    }

    pub fn data_parallel_world_size(&self) -> usize {
        self.topology.data_parallel_size
    }

    pub fn data_parallel_rank(&self) -> usize {
        self.topology.data_parallel_rank()
    }

    pub fn all_reduce_sum(&self, values: &mut [f32], group: ProcessGroup) -> Result<()> {
        if self.topology.group_position(group).0 == 1 {
            return Ok(());
        }
        self.communicator.all_reduce_sum(values, group)
    }

    pub fn all_reduce_mean(&self, values: &mut [f32], group: ProcessGroup) -> Result<()> {
        let (size, _) = self.topology.group_position(group);
        if size == 1 {
            return Ok(());
        }
        self.communicator.all_reduce_sum(values, group)?;
        let scale = 1.0 / size as f32;
        values.iter_mut().for_each(|v| *v *= scale);
        Ok(())
    }

    /// Broadcasts from the group member at position `root`.
    pub fn broadcast(&self, values: &mut [f32], root: usize, group: ProcessGroup) -> Result<()> {
        if self.topology.group_position(group).0 == 1 {
            return Ok(());
        }
        self.communicator.broadcast(values, root, group)
    }

    /// Broadcasts a flag owned by the group member at position `root`.
    ///
    /// Non-root members pass `None`; the root must pass `Some`.
    pub fn broadcast_bool(
        &self,
        value: Option<bool>,
        root: usize,
        group: ProcessGroup,
    ) -> Result<bool> {
        let (_, position) = self.topology.group_position(group);
        if position == root && value.is_none() {
            return Err(Error::Distributed(
                "broadcast root must provide a value".to_string(),
            ));
        }
        let mut buffer = [if value.unwrap_or(false) { 1.0 } else { 0.0 }];
        self.broadcast(&mut buffer, root, group)?;
        Ok(buffer[0] != 0.0)
    }

    pub fn barrier(&self) -> Result<()> {
        if self.topology.world_size == 1 {
            return Ok(());
        }
        self.communicator.barrier()
    }

    /// Tears the process groups down. Collectives are unusable afterwards.
    pub fn destroy_process_groups(self) -> Result<()> {
        self.communicator.destroy()?;
        if self.topology.rank == 0 {
            info!("Destroyed process groups");
        }
        Ok(())
    }
}

fn env_usize(name: &str, default: usize) -> Result<usize> {
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .map_err(|_| Error::Configuration(format!("{name}={value} is not a valid integer"))),
        Err(_) => Ok(default),
    }
}

#[cfg(feature = "nccl")]
fn connect(topology: &Topology, args: &DistributedArgs) -> Result<Box<dyn Communicator>> {
    Ok(Box::new(nccl::NcclCommunicator::new(
        topology,
        &args.comm_file,
        std::time::Duration::from_secs(args.timeout_minutes * 60),
    )?))
}

#[cfg(not(feature = "nccl"))]
fn connect(_topology: &Topology, _args: &DistributedArgs) -> Result<Box<dyn Communicator>> {
    Err(Error::Distributed(
        "Distributed training requires --features nccl".to_string(),
    ))
}

#[cfg(feature = "nccl")]
pub mod nccl {
    //! NCCL communicators, one per process group this rank belongs to.

    use std::collections::HashMap;
    use std::io::Write;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use cudarc::driver::safe::{CudaContext, CudaStream};
    use cudarc::nccl::safe::{Comm, Id, ReduceOp};
    use tracing::info;

    use super::{Communicator, ProcessGroup, Topology};
    use crate::error::{Error, Result};

    pub struct NcclCommunicator {
        comms: HashMap<ProcessGroup, Comm>,
        stream: Arc<CudaStream>,
        rank: usize,
    }

    // SAFETY: every rank drives its communicators from a single thread; the
    // handles are only moved, never shared across threads concurrently.
    unsafe impl Send for NcclCommunicator {}
    unsafe impl Sync for NcclCommunicator {}

    impl NcclCommunicator {
        /// Initializes one communicator per non-trivial group.
        ///
        /// The first member of each group creates the NCCL id and writes it to
        /// `<comm_file>.<group>`; the other members wait for that file.
        pub fn new(topology: &Topology, comm_file: &str, timeout: Duration) -> Result<Self> {
            let ctx = CudaContext::new(topology.local_rank).map_err(|e| {
                Error::Distributed(format!(
                    "Failed to create CUDA context {}: {:?}",
                    topology.local_rank, e
                ))
            })?;
            let stream = ctx.default_stream();

            let groups = [
                (ProcessGroup::World, "world".to_string()),
                (
                    ProcessGroup::TensorParallel,
                    format!("tp{}", topology.rank / topology.tensor_parallel_size),
                ),
                (
                    ProcessGroup::DataParallel,
                    format!(
                        "dp{}",
                        topology.pipeline_parallel_rank() * topology.tensor_parallel_size
                            + topology.tensor_parallel_rank()
                    ),
                ),
            ];

            let mut comms = HashMap::new();
            for (group, suffix) in groups {
                let (size, position) = topology.group_position(group);
                if size == 1 {
                    continue;
                }
                let path = PathBuf::from(format!("{comm_file}.{suffix}"));
                let id = exchange_id(&path, position == 0, topology.rank, timeout)?;
                let comm = Comm::from_rank(stream.clone(), position, size, id).map_err(|e| {
                    Error::Distributed(format!(
                        "Failed to create NCCL communicator for {group:?}: {:?}",
                        e.0
                    ))
                })?;
                if position == 0 {
                    // let the other members read the id before removing it
                    std::thread::sleep(Duration::from_secs(2));
                    let _ = std::fs::remove_file(&path);
                }
                comms.insert(group, comm);
            }

            info!("Rank {}: NCCL communicators initialized", topology.rank);

            Ok(Self {
                comms,
                stream,
                rank: topology.rank,
            })
        }

        fn comm(&self, group: ProcessGroup) -> Result<&Comm> {
            self.comms.get(&group).ok_or_else(|| {
                Error::Distributed(format!("rank {} has no {group:?} communicator", self.rank))
            })
        }
    }

    fn exchange_id(path: &Path, is_creator: bool, rank: usize, timeout: Duration) -> Result<Id> {
        if is_creator {
            if path.exists() {
                std::fs::remove_file(path)?;
            }

            let id = Id::new()
                .map_err(|e| Error::Distributed(format!("Failed to create NCCL ID: {:?}", e)))?;

            // write then rename so readers never see a partial file
            let tmp_file = path.with_extension("tmp");
            let mut file = std::fs::File::create(&tmp_file)?;
            file.write_all(&id.internal().iter().map(|&i| i as u8).collect::<Vec<_>>())?;
            std::fs::rename(&tmp_file, path)?;

            info!("Rank {}: Created NCCL ID and wrote to {:?}", rank, path);
            return Ok(id);
        }

        info!("Rank {}: Waiting for NCCL ID file {:?}", rank, path);
        let started = Instant::now();
        while !path.exists() {
            if started.elapsed() > timeout {
                return Err(Error::Distributed(format!(
                    "timed out after {:?} waiting for {:?}",
                    timeout, path
                )));
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        std::thread::sleep(Duration::from_millis(100));

        let data = std::fs::read(path)?;
        let internal: [i8; 128] = data
            .into_iter()
            .map(|i| i as i8)
            .collect::<Vec<_>>()
            .try_into()
            .map_err(|_| Error::Distributed("Invalid NCCL ID file".to_string()))?;

        info!("Rank {}: Read NCCL ID from {:?}", rank, path);
        Ok(Id::uninit(internal))
    }

    impl Communicator for NcclCommunicator {
        fn all_reduce_sum(&self, values: &mut [f32], group: ProcessGroup) -> Result<()> {
            let comm = self.comm(group)?;
            let gpu_data = self
                .stream
                .clone_htod(values)
                .map_err(|e| Error::Distributed(format!("Failed to copy data to GPU: {:?}", e)))?;
            let mut gpu_output = self.stream.alloc_zeros::<f32>(values.len()).map_err(|e| {
                Error::Distributed(format!("Failed to allocate GPU buffer: {:?}", e))
            })?;

            comm.all_reduce(&gpu_data, &mut gpu_output, &ReduceOp::Sum)
                .map_err(|e| Error::Distributed(format!("NCCL all-reduce failed: {:?}", e.0)))?;

            let output = self.stream.clone_dtoh(&gpu_output).map_err(|e| {
                Error::Distributed(format!("Failed to copy data from GPU: {:?}", e))
            })?;
            values.copy_from_slice(&output);
            Ok(())
        }

        fn broadcast(&self, values: &mut [f32], root: usize, group: ProcessGroup) -> Result<()> {
            let comm = self.comm(group)?;
            let gpu_data = if comm.rank() == root {
                Some(self.stream.clone_htod(values).map_err(|e| {
                    Error::Distributed(format!("Failed to copy data to GPU: {:?}", e))
                })?)
            } else {
                None
            };
            let mut gpu_output = self.stream.alloc_zeros::<f32>(values.len()).map_err(|e| {
                Error::Distributed(format!("Failed to allocate GPU buffer: {:?}", e))
            })?;

            comm.broadcast(gpu_data.as_ref(), &mut gpu_output, root as i32)
                .map_err(|e| Error::Distributed(format!("NCCL broadcast failed: {:?}", e.0)))?;

            let output = self.stream.clone_dtoh(&gpu_output).map_err(|e| {
                Error::Distributed(format!("Failed to copy data from GPU: {:?}", e))
            })?;
            values.copy_from_slice(&output);
            Ok(())
        }

        fn barrier(&self) -> Result<()> {
            // a one-element all-reduce doubles as a barrier
            let mut dummy = [0.0f32];
            self.all_reduce_sum(&mut dummy, ProcessGroup::World)
        }
    }
}
