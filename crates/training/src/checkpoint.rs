use std::{
    collections::HashMap,
    fs::{self, File, OpenOptions},
    io::{Read, Write},
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use candle_core::safetensors::load as load_safetensors;
use fs2::{lock_contended_error, FileExt};
use hex::encode as hex_encode;
use model::LanguageModel;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    distributed::ProcessGrid,
    error::to_runtime_error,
    optimizer::{GradientScalerState, MixedPrecisionOptimizer, OptimizerState},
    scheduler::{LRScheduler, SchedulerState},
    TrainingError,
};

pub const CHECKPOINT_VERSION: u32 = 1;
pub const TRACKER_FILENAME: &str = "latest_checkpointed_iteration.txt";
const LOCK_FILENAME: &str = ".checkpoint.lock";
const MODEL_FILENAME: &str = "model.safetensors";
const OPTIMIZER_FILENAME: &str = "optimizer.json";
const SCHEDULER_FILENAME: &str = "scheduler.json";
const SCALER_FILENAME: &str = "scaler.json";
const MANIFEST_FILENAME: &str = "manifest.json";
const LOCK_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    pub iteration: usize,
    pub created_unix_timestamp: u64,
    pub model: FileRecord,
    pub optimizer: FileRecord,
    pub scheduler: FileRecord,
    pub scaler: FileRecord,
}

/// `<root>/iter_{iteration:07}/mp_rank_{mp_rank:02}`.
pub fn checkpoint_dir(root: &Path, iteration: usize, mp_rank: usize) -> PathBuf {
    root.join(format!("iter_{iteration:07}"))
        .join(format!("mp_rank_{mp_rank:02}"))
}

/// Iteration recorded in the tracker file, if any.
pub fn latest_iteration(root: &Path) -> Result<Option<usize>, TrainingError> {
    let tracker = root.join(TRACKER_FILENAME);
    if !tracker.is_file() {
        return Ok(None);
    }
    let text = fs::read_to_string(&tracker)?;
    text.trim().parse::<usize>().map(Some).map_err(|err| {
        TrainingError::checkpoint(format!(
            "tracker file {} does not hold an iteration: {err}",
            tracker.display()
        ))
    })
}

pub struct SaveRequest<'a> {
    pub root: &'a Path,
    pub iteration: usize,
    pub grid: &'a ProcessGrid,
    pub model: &'a dyn LanguageModel,
    pub optimizer: &'a MixedPrecisionOptimizer,
    pub scheduler: &'a dyn LRScheduler,
}

/// Writes one shard per model-parallel rank from data-parallel rank 0, then
/// updates the tracker from global rank 0. Every rank must call this.
pub fn save_checkpoint(request: SaveRequest<'_>) -> Result<PathBuf, TrainingError> {
    let grid = request.grid;
    let directory = checkpoint_dir(request.root, request.iteration, grid.model_parallel_rank());

    if grid.data_parallel_rank() == 0 {
        log::info!(
            "global rank {} is saving checkpoint at iteration {:7} to {}",
            grid.rank(),
            request.iteration,
            directory.display()
        );
        let _lock = CheckpointLock::acquire(request.root)?;
        write_shard(&request, &directory)?;
    }
    grid.global().barrier()?;

    if grid.rank() == 0 {
        let _lock = CheckpointLock::acquire(request.root)?;
        let tracker = request.root.join(TRACKER_FILENAME);
        fs::write(&tracker, request.iteration.to_string())?;
    }
    grid.global().barrier()?;
    Ok(directory)
}

fn write_shard(request: &SaveRequest<'_>, directory: &Path) -> Result<(), TrainingError> {
    if directory.exists() {
        fs::remove_dir_all(directory)?;
    }
    fs::create_dir_all(directory)?;

    let model_path = directory.join(MODEL_FILENAME);
    save_model_weights(request.model, &model_path)?;

    let optimizer_path = directory.join(OPTIMIZER_FILENAME);
    write_json(&optimizer_path, &request.optimizer.state()?)?;
    let scheduler_path = directory.join(SCHEDULER_FILENAME);
    write_json(&scheduler_path, &request.scheduler.snapshot())?;
    let scaler_path = directory.join(SCALER_FILENAME);
    write_json(&scaler_path, &request.optimizer.scaler_state())?;

    let manifest = CheckpointManifest {
        version: CHECKPOINT_VERSION,
        iteration: request.iteration,
        created_unix_timestamp: unix_timestamp(),
        model: file_record(&model_path)?,
        optimizer: file_record(&optimizer_path)?,
        scheduler: file_record(&scheduler_path)?,
        scaler: file_record(&scaler_path)?,
    };
    write_json(&directory.join(MANIFEST_FILENAME), &manifest)
}

pub struct LoadRequest<'a> {
    pub root: &'a Path,
    pub grid: &'a ProcessGrid,
    pub model: &'a dyn LanguageModel,
    pub optimizer: &'a mut MixedPrecisionOptimizer,
    pub scheduler: &'a mut dyn LRScheduler,
    pub load_optimizer: bool,
    pub load_scheduler: bool,
}

/// Restores the checkpoint named by the tracker file and returns its
/// iteration. `None` when no tracker exists; training then starts from
/// scratch. Every rank must call this.
pub fn load_checkpoint(request: LoadRequest<'_>) -> Result<Option<usize>, TrainingError> {
    let grid = request.grid;
    let loaded = {
        let _lock = CheckpointLock::acquire(request.root)?;
        read_checkpoint(request)?
    };
    grid.global().barrier()?;
    Ok(loaded)
}

fn read_checkpoint(request: LoadRequest<'_>) -> Result<Option<usize>, TrainingError> {
    let Some(iteration) = latest_iteration(request.root)? else {
        log::warn!(
            "no {TRACKER_FILENAME} under {}; starting from random initialization",
            request.root.display()
        );
        return Ok(None);
    };
    let directory = checkpoint_dir(request.root, iteration, request.grid.model_parallel_rank());
    let manifest: CheckpointManifest = read_json(&directory.join(MANIFEST_FILENAME))?;
    if manifest.version != CHECKPOINT_VERSION {
        return Err(TrainingError::checkpoint(format!(
            "unsupported checkpoint version {} (expected {CHECKPOINT_VERSION})",
            manifest.version
        )));
    }
    if manifest.iteration != iteration {
        return Err(TrainingError::checkpoint(format!(
            "manifest in {} records iteration {} but the tracker says {iteration}",
            directory.display(),
            manifest.iteration
        )));
    }

    let model_path = directory.join(&manifest.model.filename);
    validate_file(&model_path, &manifest.model.sha256)?;
    apply_model_weights(request.model, &model_path)?;

    if request.load_optimizer {
        let path = directory.join(&manifest.optimizer.filename);
        validate_file(&path, &manifest.optimizer.sha256)?;
        let state: OptimizerState = read_json(&path)?;
        request.optimizer.load_state(state)?;

        let path = directory.join(&manifest.scaler.filename);
        validate_file(&path, &manifest.scaler.sha256)?;
        let state: GradientScalerState = read_json(&path)?;
        request.optimizer.load_scaler_state(state)?;
    }
    if request.load_scheduler {
        let path = directory.join(&manifest.scheduler.filename);
        validate_file(&path, &manifest.scheduler.sha256)?;
        let state: SchedulerState = read_json(&path)?;
        request.scheduler.load_snapshot(state)?;
    }
    // The optimizer state carries its own rate; the scheduler owns it.
    request
        .optimizer
        .set_learning_rate(request.scheduler.learning_rate());

    log::info!(
        "loaded checkpoint {} at iteration {iteration}",
        directory.display()
    );
    Ok(Some(iteration))
}

/// Advisory lock on a file next to the checkpoints. The lock belongs to the
/// open handle, so the OS releases it when the holder exits, even abnormally.
/// The file itself is left in place.
struct CheckpointLock {
    file: File,
}

impl CheckpointLock {
    fn acquire(root: &Path) -> Result<Self, TrainingError> {
        fs::create_dir_all(root)?;
        let path = root.join(LOCK_FILENAME);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let started = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(Self { file }),
                Err(err) if err.raw_os_error() == lock_contended_error().raw_os_error() => {
                    if started.elapsed() > LOCK_TIMEOUT {
                        return Err(TrainingError::checkpoint(format!(
                            "timed out waiting for checkpoint lock {}",
                            path.display()
                        )));
                    }
                    thread::sleep(Duration::from_millis(10));
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

impl Drop for CheckpointLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            log::warn!("failed to release checkpoint lock: {err}");
        }
    }
}

fn save_model_weights(model: &dyn LanguageModel, path: &Path) -> Result<(), TrainingError> {
    let parameters = model.innermost().parameters();
    if parameters.is_empty() {
        return Err(TrainingError::checkpoint(
            "model contains no parameters to checkpoint",
        ));
    }
    let tensors: HashMap<String, candle_core::Tensor> = parameters
        .into_iter()
        .map(|param| (param.name, param.var.as_tensor().clone()))
        .collect();
    candle_core::safetensors::save(&tensors, path).map_err(|err| {
        TrainingError::checkpoint(format!(
            "failed to serialize model weights to {}: {err}",
            path.display()
        ))
    })
}

/// Loads weights by parameter name; every parameter must be present and no
/// extra tensors may remain.
pub fn apply_model_weights(model: &dyn LanguageModel, path: &Path) -> Result<(), TrainingError> {
    let model = model.innermost();
    let tensors = load_safetensors(path, model.device()).map_err(to_runtime_error)?;
    let mut by_name: HashMap<_, _> = tensors.into_iter().collect();

    for param in model.parameters() {
        let tensor = by_name.remove(&param.name).ok_or_else(|| {
            TrainingError::checkpoint(format!("checkpoint missing parameter {}", param.name))
        })?;
        let dtype = param.var.as_tensor().dtype();
        let tensor = if tensor.dtype() == dtype {
            tensor
        } else {
            tensor.to_dtype(dtype).map_err(to_runtime_error)?
        };
        param.var.set(&tensor).map_err(|err| {
            TrainingError::checkpoint(format!("failed to restore {}: {err}", param.name))
        })?;
    }

    if !by_name.is_empty() {
        let mut extra: Vec<_> = by_name.into_keys().collect();
        extra.sort();
        return Err(TrainingError::checkpoint(format!(
            "checkpoint contains unused parameters: {}",
            extra.join(", ")
        )));
    }
    Ok(())
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn file_record(path: &Path) -> Result<FileRecord, TrainingError> {
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            TrainingError::checkpoint(format!(
                "checkpoint file name is not valid UTF-8: {}",
                path.display()
            ))
        })?
        .to_string();
    Ok(FileRecord {
        filename,
        sha256: sha256_file(path)?,
        bytes: path.metadata()?.len(),
    })
}

fn validate_file(path: &Path, expected_sha: &str) -> Result<(), TrainingError> {
    if sha256_file(path)? != expected_sha {
        return Err(TrainingError::checkpoint(format!(
            "checkpoint file {} failed checksum validation",
            path.display()
        )));
    }
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String, TrainingError> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), TrainingError> {
    let mut file = File::create(path)?;
    let data = serde_json::to_vec_pretty(value)?;
    file.write_all(&data)?;
    file.write_all(b"\n")?;
    Ok(())
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, TrainingError> {
    let file = File::open(path).map_err(|err| {
        TrainingError::checkpoint(format!("failed to open {}: {err}", path.display()))
    })?;
    serde_json::from_reader(file).map_err(|err| {
        TrainingError::checkpoint(format!("failed to parse JSON {}: {err}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        optimizer::{AdamWConfig, GradientScaler},
        scheduler::{AnnealingLr, DecayStyle},
        test_support::ScalarModel,
    };

    fn optimizer(model: &ScalarModel) -> MixedPrecisionOptimizer {
        MixedPrecisionOptimizer::new(
            model.parameters(),
            AdamWConfig {
                learning_rate: 0.1,
                beta1: 0.9,
                beta2: 0.999,
                epsilon: 1e-8,
                weight_decay: 0.0,
            },
            GradientScaler::disabled(),
            ProcessGrid::single(),
            1,
            0.0,
        )
        .unwrap()
    }

    fn scheduler() -> AnnealingLr {
        AnnealingLr::new(0.1, 0.0, 10, DecayStyle::Linear, 0.1).unwrap()
    }

    #[test]
    fn layout_uses_padded_iteration_and_rank() {
        let dir = checkpoint_dir(Path::new("/ckpt/run"), 42, 3);
        assert_eq!(dir, PathBuf::from("/ckpt/run/iter_0000042/mp_rank_03"));
    }

    #[test]
    fn missing_tracker_starts_fresh() {
        let root = tempfile::tempdir().unwrap();
        let model = ScalarModel::new(1.0);
        let mut opt = optimizer(&model);
        let mut lr = scheduler();
        let loaded = load_checkpoint(LoadRequest {
            root: root.path(),
            grid: &ProcessGrid::single(),
            model: &model,
            optimizer: &mut opt,
            scheduler: &mut lr,
            load_optimizer: true,
            load_scheduler: true,
        })
        .unwrap();
        assert!(loaded.is_none());
        assert!(CheckpointLock::acquire(root.path()).is_ok());
    }

    #[test]
    fn leftover_lock_file_does_not_block_loading() {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join(LOCK_FILENAME), b"").unwrap();
        let model = ScalarModel::new(1.0);
        let mut opt = optimizer(&model);
        let mut lr = scheduler();
        let started = Instant::now();
        let loaded = load_checkpoint(LoadRequest {
            root: root.path(),
            grid: &ProcessGrid::single(),
            model: &model,
            optimizer: &mut opt,
            scheduler: &mut lr,
            load_optimizer: true,
            load_scheduler: true,
        })
        .unwrap();
        assert!(loaded.is_none());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn held_lock_excludes_other_handles_until_dropped() {
        let root = tempfile::tempdir().unwrap();
        let held = CheckpointLock::acquire(root.path()).unwrap();
        let other = File::open(root.path().join(LOCK_FILENAME)).unwrap();
        assert!(other.try_lock_exclusive().is_err());
        drop(held);
        assert!(other.try_lock_exclusive().is_ok());
    }

    #[test]
    fn saved_weights_and_tracker_round_trip() {
        let root = tempfile::tempdir().unwrap();
        let grid = ProcessGrid::single();
        let source = ScalarModel::new(0.25);
        let opt = optimizer(&source);
        let mut lr = scheduler();
        lr.step();
        lr.step();

        let dir = save_checkpoint(SaveRequest {
            root: root.path(),
            iteration: 7,
            grid: &grid,
            model: &source,
            optimizer: &opt,
            scheduler: &lr,
        })
        .unwrap();
        assert!(dir.join(MANIFEST_FILENAME).is_file());
        assert_eq!(latest_iteration(root.path()).unwrap(), Some(7));

        let target = ScalarModel::new(9.0);
        let mut target_opt = optimizer(&target);
        let mut target_lr = scheduler();
        let loaded = load_checkpoint(LoadRequest {
            root: root.path(),
            grid: &grid,
            model: &target,
            optimizer: &mut target_opt,
            scheduler: &mut target_lr,
            load_optimizer: true,
            load_scheduler: true,
        })
        .unwrap();
        assert_eq!(loaded, Some(7));
        assert_eq!(target.value(), 0.25);
        assert_eq!(target_lr.steps(), 2);
        assert_eq!(target_opt.learning_rate(), lr.learning_rate());
    }

    #[test]
    fn scheduler_state_can_be_left_behind() {
        let root = tempfile::tempdir().unwrap();
        let grid = ProcessGrid::single();
        let model = ScalarModel::new(0.5);
        let opt = optimizer(&model);
        let mut lr = scheduler();
        lr.step();
        save_checkpoint(SaveRequest {
            root: root.path(),
            iteration: 1,
            grid: &grid,
            model: &model,
            optimizer: &opt,
            scheduler: &lr,
        })
        .unwrap();

        let mut fresh_opt = optimizer(&model);
        let mut fresh_lr = scheduler();
        load_checkpoint(LoadRequest {
            root: root.path(),
            grid: &grid,
            model: &model,
            optimizer: &mut fresh_opt,
            scheduler: &mut fresh_lr,
            load_optimizer: false,
            load_scheduler: false,
        })
        .unwrap();
        assert_eq!(fresh_lr.steps(), 0);
    }

    #[test]
    fn fresh_scheduler_sets_the_rate_of_a_loaded_optimizer() {
        let root = tempfile::tempdir().unwrap();
        let grid = ProcessGrid::single();
        let model = ScalarModel::new(0.5);
        let mut opt = optimizer(&model);
        opt.set_learning_rate(0.0123);
        let mut lr = scheduler();
        for _ in 0..4 {
            lr.step();
        }
        save_checkpoint(SaveRequest {
            root: root.path(),
            iteration: 4,
            grid: &grid,
            model: &model,
            optimizer: &opt,
            scheduler: &lr,
        })
        .unwrap();

        let mut loaded_opt = optimizer(&model);
        let mut fresh_lr = scheduler();
        load_checkpoint(LoadRequest {
            root: root.path(),
            grid: &grid,
            model: &model,
            optimizer: &mut loaded_opt,
            scheduler: &mut fresh_lr,
            load_optimizer: true,
            load_scheduler: false,
        })
        .unwrap();
        assert_eq!(fresh_lr.steps(), 0);
        assert_eq!(loaded_opt.learning_rate(), fresh_lr.learning_rate());
        assert_ne!(loaded_opt.learning_rate(), 0.0123);
    }

    #[test]
    fn tampered_weights_fail_validation() {
        let root = tempfile::tempdir().unwrap();
        let grid = ProcessGrid::single();
        let model = ScalarModel::new(0.5);
        let opt = optimizer(&model);
        let lr = scheduler();
        let dir = save_checkpoint(SaveRequest {
            root: root.path(),
            iteration: 3,
            grid: &grid,
            model: &model,
            optimizer: &opt,
            scheduler: &lr,
        })
        .unwrap();
        fs::write(dir.join(MODEL_FILENAME), b"corrupt").unwrap();

        let mut opt = optimizer(&model);
        let mut lr = scheduler();
        let err = load_checkpoint(LoadRequest {
            root: root.path(),
            grid: &grid,
            model: &model,
            optimizer: &mut opt,
            scheduler: &mut lr,
            load_optimizer: true,
            load_scheduler: true,
        })
        .unwrap_err();
        assert!(matches!(err, TrainingError::Checkpoint(_)));
    }
}
