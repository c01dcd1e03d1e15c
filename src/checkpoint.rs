//! Checkpoint Save/Load
//!
//! A checkpoint bundles everything needed to resume training: the model's
//! named parameters, the optimizer's moment estimates and the epoch counter.
//!
//! ## File Layout
//!
//! All integers and floats are little-endian.
//!
//! ```text
//! "GPTCKPT"                      magic
//! u8                             format version
//! u32 + bytes                    JSON header {epoch, model_config, num_classes}
//! u32                            tensor count
//!   per tensor: name, shape, data
//! u8                             has optimizer state
//!   u32 + bytes                  JSON hyper-parameters
//!   u32                          moment count
//!     per moment: name, u64 step, m tensor, v tensor
//! ```
//!
//! Strings are a `u32` byte length followed by UTF-8. Tensors are a `u32`
//! rank, `u32` dims, then `u32` element count and `f32` values.
//!
//! Saving writes to a sibling temp file and renames it into place, so an
//! interrupted save never leaves a truncated checkpoint behind.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ModelConfig;
use crate::error::{GptError, Result};
use crate::optimizer::{AdamHyperParams, Moments, OptimizerState};
use crate::params::StateDict;
use crate::tensor::Tensor;

const MAGIC: &[u8; 7] = b"GPTCKPT";
const VERSION: u8 = 1;
/// Highest tensor rank accepted when reading.
const MAX_RANK: usize = 8;

#[derive(Clone, Debug, PartialEq)]
pub struct Checkpoint {
    pub model: StateDict,
    pub optimizer: Option<OptimizerState>,
    /// Epochs completed when the checkpoint was written
    pub epoch: usize,
    pub model_config: Option<ModelConfig>,
    /// Set for fine-tune checkpoints
    pub num_classes: Option<usize>,
}

/// What a `save_model`/`load_model` call did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CheckpointStatus {
    Saved(PathBuf),
    Loaded(PathBuf),
    /// A path was configured but no file exists there yet
    FileMissing(PathBuf),
    /// No path given and none configured
    NotConfigured,
}

/// Pick the checkpoint path for a save or load. An explicit path becomes
/// the configured one for later calls.
pub(crate) fn resolve_path(explicit: Option<&Path>, configured: &mut Option<PathBuf>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        *configured = Some(path.to_path_buf());
    }
    let resolved = configured.clone();
    if resolved.is_none() {
        warn!("checkpoint not found");
    }
    resolved
}

#[derive(Serialize, Deserialize)]
struct Header {
    epoch: usize,
    model_config: Option<ModelConfig>,
    num_classes: Option<usize>,
}

impl Checkpoint {
    pub fn new(model: StateDict, optimizer: Option<OptimizerState>, epoch: usize) -> Self {
        Self {
            model,
            optimizer,
            epoch,
            model_config: None,
            num_classes: None,
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp = temp_sibling(path);
        {
            let mut out = BufWriter::new(File::create(&tmp)?);
            self.write_to(&mut out)?;
            out.flush()?;
        }
        std::fs::rename(&tmp, path)?;
        info!(
            path = %path.display(),
            tensors = self.model.len(),
            epoch = self.epoch,
            optimizer = self.optimizer.is_some(),
            "saved checkpoint"
        );
        Ok(())
    }

    /// Load a checkpoint, or `Ok(None)` when the file does not exist.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        match File::open(path) {
            Ok(file) => {
                let checkpoint = Self::read_from(&mut BufReader::new(file))?;
                info!(
                    path = %path.display(),
                    tensors = checkpoint.model.len(),
                    epoch = checkpoint.epoch,
                    "loaded checkpoint"
                );
                Ok(Some(checkpoint))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "no checkpoint file");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Load a checkpoint that must exist.
    pub fn read(path: &Path) -> Result<Self> {
        Self::load(path)?.ok_or_else(|| {
            GptError::Io(std::io::Error::new(
                ErrorKind::NotFound,
                format!("checkpoint {} not found", path.display()),
            ))
        })
    }

    pub fn write_to<W: Write>(&self, out: &mut W) -> Result<()> {
        out.write_all(MAGIC)?;
        out.write_all(&[VERSION])?;

        let header = Header {
            epoch: self.epoch,
            model_config: self.model_config.clone(),
            num_classes: self.num_classes,
        };
        write_bytes(out, serde_json::to_string(&header)?.as_bytes())?;

        write_u32(out, self.model.len())?;
        for (name, tensor) in &self.model {
            write_bytes(out, name.as_bytes())?;
            write_tensor(out, tensor)?;
        }

        match &self.optimizer {
            None => out.write_all(&[0u8])?,
            Some(state) => {
                out.write_all(&[1u8])?;
                write_bytes(out, serde_json::to_string(&state.hyper)?.as_bytes())?;
                write_u32(out, state.moments.len())?;
                for (name, moments) in &state.moments {
                    write_bytes(out, name.as_bytes())?;
                    out.write_all(&moments.step.to_le_bytes())?;
                    write_tensor(out, &moments.m)?;
                    write_tensor(out, &moments.v)?;
                }
            }
        }
        Ok(())
    }

    pub fn read_from<R: Read>(input: &mut R) -> Result<Self> {
        let mut magic = [0u8; 7];
        input.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(GptError::Checkpoint("bad magic, not a checkpoint file".into()));
        }
        let version = read_u8(input)?;
        if version != VERSION {
            return Err(GptError::Checkpoint(format!(
                "unsupported version {version}"
            )));
        }

        let header: Header = serde_json::from_slice(&read_bytes(input)?)?;

        let count = read_u32(input)?;
        let mut model = BTreeMap::new();
        for _ in 0..count {
            let name = read_string(input)?;
            let tensor = read_tensor(input)?;
            if model.insert(name.clone(), tensor).is_some() {
                return Err(GptError::Checkpoint(format!("duplicate tensor {name}")));
            }
        }

        let optimizer = match read_u8(input)? {
            0 => None,
            1 => {
                let hyper: AdamHyperParams = serde_json::from_slice(&read_bytes(input)?)?;
                let count = read_u32(input)?;
                let mut moments = BTreeMap::new();
                for _ in 0..count {
                    let name = read_string(input)?;
                    let mut step = [0u8; 8];
                    input.read_exact(&mut step)?;
                    let m = read_tensor(input)?;
                    let v = read_tensor(input)?;
                    moments.insert(
                        name,
                        Moments {
                            m,
                            v,
                            step: u64::from_le_bytes(step),
                        },
                    );
                }
                Some(OptimizerState { hyper, moments })
            }
            flag => {
                return Err(GptError::Checkpoint(format!(
                    "invalid optimizer flag {flag}"
                )))
            }
        };

        Ok(Self {
            model,
            optimizer,
            epoch: header.epoch,
            model_config: header.model_config,
            num_classes: header.num_classes,
        })
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn write_u32<W: Write>(out: &mut W, value: usize) -> Result<()> {
    let value = u32::try_from(value)
        .map_err(|_| GptError::Checkpoint(format!("value {value} does not fit in u32")))?;
    out.write_all(&value.to_le_bytes())?;
    Ok(())
}

fn write_bytes<W: Write>(out: &mut W, bytes: &[u8]) -> Result<()> {
    write_u32(out, bytes.len())?;
    out.write_all(bytes)?;
    Ok(())
}

fn write_tensor<W: Write>(out: &mut W, tensor: &Tensor) -> Result<()> {
    write_u32(out, tensor.shape.len())?;
    for &dim in &tensor.shape {
        write_u32(out, dim)?;
    }
    write_u32(out, tensor.data.len())?;
    for &val in &tensor.data {
        out.write_all(&val.to_le_bytes())?;
    }
    Ok(())
}

fn read_u8<R: Read>(input: &mut R) -> Result<u8> {
    let mut buf = [0u8; 1];
    input.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u32<R: Read>(input: &mut R) -> Result<usize> {
    let mut buf = [0u8; 4];
    input.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf) as usize)
}

/// Read exactly `len` bytes without trusting `len` for the allocation.
fn read_exact_len<R: Read>(input: &mut R, len: usize, what: &str) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    input.by_ref().take(len as u64).read_to_end(&mut bytes)?;
    if bytes.len() != len {
        return Err(GptError::Checkpoint(format!(
            "truncated {what}: expected {len} bytes, found {}",
            bytes.len()
        )));
    }
    Ok(bytes)
}

fn read_bytes<R: Read>(input: &mut R) -> Result<Vec<u8>> {
    let len = read_u32(input)?;
    read_exact_len(input, len, "field")
}

fn read_string<R: Read>(input: &mut R) -> Result<String> {
    String::from_utf8(read_bytes(input)?)
        .map_err(|e| GptError::Checkpoint(format!("tensor name is not UTF-8: {e}")))
}

fn read_tensor<R: Read>(input: &mut R) -> Result<Tensor> {
    let rank = read_u32(input)?;
    if rank > MAX_RANK {
        return Err(GptError::Checkpoint(format!(
            "tensor rank {rank} exceeds {MAX_RANK}"
        )));
    }
    let mut shape = Vec::with_capacity(rank);
    for _ in 0..rank {
        shape.push(read_u32(input)?);
    }
    let numel = shape
        .iter()
        .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
        .ok_or_else(|| GptError::Checkpoint(format!("tensor shape {shape:?} overflows")))?;

    let len = read_u32(input)?;
    if len != numel {
        return Err(GptError::Checkpoint(format!(
            "tensor of shape {shape:?} declares {len} elements"
        )));
    }
    let byte_len = len
        .checked_mul(4)
        .ok_or_else(|| GptError::Checkpoint(format!("tensor of {len} elements overflows")))?;

    let raw = read_exact_len(input, byte_len, "tensor data")?;
    let data = raw
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    Ok(Tensor::new(data, shape))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Checkpoint {
        let mut model = StateDict::new();
        model.insert("a.weight".into(), Tensor::new(vec![1.0, -2.0, 3.5, 0.25], vec![2, 2]));
        model.insert("a.bias".into(), Tensor::new(vec![0.5, 0.0], vec![2]));

        let mut moments = BTreeMap::new();
        moments.insert(
            "a.bias".to_string(),
            Moments {
                m: Tensor::new(vec![0.1, 0.2], vec![2]),
                v: Tensor::new(vec![0.01, 0.04], vec![2]),
                step: 7,
            },
        );
        let hyper = AdamHyperParams {
            learning_rate: 0.0006,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
        };
        let mut checkpoint = Checkpoint::new(model, Some(OptimizerState { hyper, moments }), 3);
        checkpoint.num_classes = Some(5);
        checkpoint
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.ckpt");
        let checkpoint = sample();
        checkpoint.save(&path).unwrap();

        assert!(!temp_sibling(&path).exists());
        let loaded = Checkpoint::load(&path).unwrap().unwrap();
        assert_eq!(loaded, checkpoint);
    }

    #[test]
    fn test_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.ckpt");
        assert!(Checkpoint::load(&path).unwrap().is_none());
        assert!(matches!(Checkpoint::read(&path), Err(GptError::Io(_))));
    }

    fn file_with_tensor_header(rank: u32, dims: &[u32], declared: u32) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(MAGIC);
        bytes.push(VERSION);
        let header = br#"{"epoch":0,"model_config":null,"num_classes":null}"#;
        bytes.extend_from_slice(&(header.len() as u32).to_le_bytes());
        bytes.extend_from_slice(header);
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.push(b'w');
        bytes.extend_from_slice(&rank.to_le_bytes());
        for dim in dims {
            bytes.extend_from_slice(&dim.to_le_bytes());
        }
        bytes.extend_from_slice(&declared.to_le_bytes());
        bytes
    }

    #[test]
    fn test_corrupt_lengths_are_errors_not_panics() {
        let huge = file_with_tensor_header(3, &[u32::MAX; 3], u32::MAX);
        assert!(matches!(
            Checkpoint::read_from(&mut huge.as_slice()),
            Err(GptError::Checkpoint(_))
        ));

        let deep = file_with_tensor_header(u32::MAX, &[], 0);
        assert!(matches!(
            Checkpoint::read_from(&mut deep.as_slice()),
            Err(GptError::Checkpoint(_))
        ));

        // consistent header promising far more data than the file holds
        let short = file_with_tensor_header(2, &[65536, 4096], 65536 * 4096);
        assert!(matches!(
            Checkpoint::read_from(&mut short.as_slice()),
            Err(GptError::Checkpoint(_))
        ));
    }

    #[test]
    fn test_rejects_foreign_and_truncated_files() {
        let err = Checkpoint::read_from(&mut &b"NOTACKPT...."[..]).unwrap_err();
        assert!(matches!(err, GptError::Checkpoint(_)));

        let mut bytes = Vec::new();
        sample().write_to(&mut bytes).unwrap();
        bytes.truncate(bytes.len() - 3);
        assert!(Checkpoint::read_from(&mut bytes.as_slice()).is_err());
    }
}
