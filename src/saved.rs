//! On-disk network serialization.
//!
//! A network persists as a directory holding a `network.json` descriptor and
//! one zlib-compressed binary per layer: all biases, then all weights in
//! current-major order, 32-bit floats in little-endian byte order.

use crate::{
    network::{Activation, Layer, Network},
    Result,
};
use anyhow::{bail, ensure};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use flate2::{read::ZlibDecoder, write::ZlibEncoder, Compression};
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File},
    io::{BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

const DESCRIPTOR_FILE: &str = "network.json";

#[derive(Debug, Serialize, Deserialize)]
struct LayerDescriptor {
    /// Payload path relative to the network directory.
    path: PathBuf,
    size: u64,
    function: Activation,
}

#[derive(Debug, Serialize, Deserialize)]
struct NetworkDescriptor {
    input_count: u64,
    layers: Vec<LayerDescriptor>,
}

/// A network bound to a directory on disk.
#[derive(Debug)]
pub struct SavedNetwork {
    directory: PathBuf,
    file: PathBuf,
    network: Option<Network>,
}

impl SavedNetwork {
    /// Binds to `directory`, creating it when absent.
    pub fn new(directory: impl Into<PathBuf>) -> Result<Self> {
        let directory = directory.into();
        if directory.is_file() {
            bail!("cannot use a file as a network directory");
        }
        if !directory.exists() {
            fs::create_dir_all(&directory)?;
        }
        let file = directory.join(DESCRIPTOR_FILE);
        Ok(Self {
            directory,
            file,
            network: None,
        })
    }

    pub fn has_network_loaded(&self) -> bool {
        self.network.is_some()
    }

    /// Reads the descriptor and every layer payload into a fresh network.
    /// Fails if a network is already loaded.
    pub fn load_from_file(&mut self) -> Result<()> {
        ensure!(self.network.is_none(), "a network is already loaded");
        let descriptor: NetworkDescriptor =
            serde_json::from_reader(BufReader::new(File::open(&self.file)?))?;
        let mut layers = Vec::with_capacity(descriptor.layers.len());
        let mut previous_size = descriptor.input_count as usize;
        for layer_descriptor in &descriptor.layers {
            let size = layer_descriptor.size as usize;
            let mut layer = Layer::zeroed(size, previous_size, layer_descriptor.function);
            let path = self.directory.join(&layer_descriptor.path);
            let mut payload = ZlibDecoder::new(BufReader::new(File::open(&path)?));
            for bias in layer.biases.iter_mut() {
                *bias = payload.read_f32::<LittleEndian>()?;
            }
            for weight in layer.weights.iter_mut() {
                *weight = payload.read_f32::<LittleEndian>()?;
            }
            layers.push(layer);
            previous_size = size;
        }
        self.network.replace(Network::new(layers)?);
        Ok(())
    }

    /// Writes the loaded network's descriptor and layer payloads.
    pub fn save_to_file(&self) -> Result<()> {
        let network = match self.network.as_ref() {
            Some(network) => network,
            None => bail!("no network loaded to save"),
        };
        let layers = network.layers();
        let mut descriptor = NetworkDescriptor {
            input_count: network.input_count() as u64,
            layers: Vec::with_capacity(layers.len()),
        };
        for (i, layer) in layers.iter().enumerate() {
            let path = PathBuf::from(format!("{}.dat", i));
            let file = File::create(self.directory.join(&path))?;
            let mut payload = ZlibEncoder::new(BufWriter::new(file), Compression::default());
            for bias in &layer.biases {
                payload.write_f32::<LittleEndian>(*bias)?;
            }
            for weight in &layer.weights {
                payload.write_f32::<LittleEndian>(*weight)?;
            }
            payload.finish()?.flush()?;
            descriptor.layers.push(LayerDescriptor {
                path,
                size: layer.size as u64,
                function: layer.function,
            });
        }
        let file = File::create(&self.file)?;
        serde_json::to_writer_pretty(BufWriter::new(file), &descriptor)?;
        Ok(())
    }

    /// Takes ownership of an in-memory network. Fails if one is already
    /// loaded.
    pub fn load_from_memory(&mut self, network: Network) -> Result<()> {
        ensure!(self.network.is_none(), "a network is already loaded");
        self.network.replace(network);
        Ok(())
    }

    /// Releases the loaded network, if any.
    pub fn release_network(&mut self) -> Option<Network> {
        self.network.take()
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn temp_directory() -> PathBuf {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        std::env::temp_dir().join(format!(
            "neurograph-saved-{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        ))
    }

    #[test]
    fn round_trip_preserves_values() {
        let directory = temp_directory();
        let original = Network::randomize(&[3, 4, 2], Activation::Sigmoid).unwrap();
        let reference: Vec<Layer> = original.layers().to_vec();

        let mut saved = SavedNetwork::new(&directory).unwrap();
        saved.load_from_memory(original).unwrap();
        saved.save_to_file().unwrap();

        let mut loaded = SavedNetwork::new(&directory).unwrap();
        loaded.load_from_file().unwrap();
        let network = loaded.release_network().unwrap();
        assert_eq!(network.input_count(), 3);
        assert_eq!(network.layers().len(), reference.len());
        for (layer, expected) in network.layers().iter().zip(&reference) {
            assert_eq!(layer.size, expected.size);
            assert_eq!(layer.previous_size, expected.previous_size);
            for (a, b) in layer.biases.iter().zip(&expected.biases) {
                assert_relative_eq!(*a, *b);
            }
            for (a, b) in layer.weights.iter().zip(&expected.weights) {
                assert_relative_eq!(*a, *b);
            }
        }
        fs::remove_dir_all(&directory).unwrap();
    }

    #[test]
    fn load_twice_fails() {
        let directory = temp_directory();
        let mut saved = SavedNetwork::new(&directory).unwrap();
        saved
            .load_from_memory(Network::randomize(&[1, 1], Activation::Sigmoid).unwrap())
            .unwrap();
        assert!(saved
            .load_from_memory(Network::randomize(&[1, 1], Activation::Sigmoid).unwrap())
            .is_err());
        assert!(saved.has_network_loaded());
        fs::remove_dir_all(&directory).unwrap();
    }

    #[test]
    fn missing_descriptor_fails() {
        let directory = temp_directory();
        let mut saved = SavedNetwork::new(&directory).unwrap();
        assert!(saved.load_from_file().is_err());
        assert!(!saved.has_network_loaded());
        fs::remove_dir_all(&directory).unwrap();
    }
}
