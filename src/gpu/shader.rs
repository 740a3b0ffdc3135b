//! Compiled compute-shader blobs supplied by the caller.
//!
//! The engine expects three kernels, named for the operation they encode. The
//! descriptor-set and push-constant interface is fixed (see the `shaders/`
//! sources); the delivery mechanism is the caller's business — embed the
//! binaries, read them from disk, or generate them at build time.

use crate::{error::DeviceError, Result};
use std::{borrow::Cow, fs, path::Path};

/// Names of the required kernels, in pipeline order.
pub const SHADER_NAMES: [&str; 3] = ["evaluation", "backpropagation", "deltas"];

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// One validated SPIR-V module, stored as words so the word stream is always
/// aligned regardless of how the caller sourced the bytes.
#[derive(Debug, Clone)]
pub struct ShaderBlob {
    words: Vec<u32>,
}

impl ShaderBlob {
    /// Parses a SPIR-V binary.
    ///
    /// Accepts either byte order and normalizes to host order via the magic
    /// number, the same trick every SPIR-V loader uses.
    pub fn from_spirv(spirv: impl Into<Cow<'static, [u8]>>) -> Result<Self> {
        let spirv = spirv.into();
        if spirv.len() < 4 || spirv.len() % 4 != 0 {
            return Err(DeviceError::InvalidShader.into());
        }
        let mut words: Vec<u32> = spirv
            .chunks_exact(4)
            .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        if words[0] == SPIRV_MAGIC.swap_bytes() {
            for word in words.iter_mut() {
                *word = word.swap_bytes();
            }
        }
        if words[0] != SPIRV_MAGIC {
            return Err(DeviceError::InvalidShader.into());
        }
        Ok(Self { words })
    }

    pub(crate) fn words(&self) -> &[u32] {
        &self.words
    }
}

/// The three kernels the GPU evaluator dispatches.
#[derive(Debug, Clone)]
pub struct ShaderSet {
    evaluation: ShaderBlob,
    backpropagation: ShaderBlob,
    deltas: ShaderBlob,
}

impl ShaderSet {
    pub fn new(evaluation: ShaderBlob, backpropagation: ShaderBlob, deltas: ShaderBlob) -> Self {
        Self {
            evaluation,
            backpropagation,
            deltas,
        }
    }

    /// Parses all three binaries at once, in [`SHADER_NAMES`] order.
    pub fn from_spirv(
        evaluation: impl Into<Cow<'static, [u8]>>,
        backpropagation: impl Into<Cow<'static, [u8]>>,
        deltas: impl Into<Cow<'static, [u8]>>,
    ) -> Result<Self> {
        Ok(Self::new(
            ShaderBlob::from_spirv(evaluation)?,
            ShaderBlob::from_spirv(backpropagation)?,
            ShaderBlob::from_spirv(deltas)?,
        ))
    }

    /// Loads `<name>.spv` for each required kernel from `dir`.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut blobs = Vec::with_capacity(SHADER_NAMES.len());
        for name in SHADER_NAMES {
            let path = dir.join(name).with_extension("spv");
            let bytes = fs::read(&path)
                .map_err(|err| anyhow::anyhow!("reading {}: {}", path.display(), err))?;
            blobs.push(ShaderBlob::from_spirv(bytes)?);
        }
        let mut blobs = blobs.into_iter();
        Ok(Self::new(
            blobs.next().expect("three blobs"),
            blobs.next().expect("three blobs"),
            blobs.next().expect("three blobs"),
        ))
    }

    pub(crate) fn evaluation(&self) -> &ShaderBlob {
        &self.evaluation
    }
    pub(crate) fn backpropagation(&self) -> &ShaderBlob {
        &self.backpropagation
    }
    pub(crate) fn deltas(&self) -> &ShaderBlob {
        &self.deltas
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words_to_bytes(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn accepts_minimal_module() {
        let bytes = words_to_bytes(&[SPIRV_MAGIC, 0x0001_0000, 0, 1, 0]);
        let blob = ShaderBlob::from_spirv(bytes).unwrap();
        assert_eq!(blob.words()[0], SPIRV_MAGIC);
    }

    #[test]
    fn normalizes_swapped_byte_order() {
        let swapped: Vec<u8> = [SPIRV_MAGIC.swap_bytes(), 42u32.swap_bytes()]
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect();
        let blob = ShaderBlob::from_spirv(swapped).unwrap();
        assert_eq!(blob.words(), &[SPIRV_MAGIC, 42]);
    }

    #[test]
    fn rejects_garbage() {
        assert!(ShaderBlob::from_spirv(vec![1, 2, 3]).is_err());
        assert!(ShaderBlob::from_spirv(words_to_bytes(&[0xdead_beef])).is_err());
        assert!(ShaderBlob::from_spirv(Vec::new()).is_err());
    }
}
