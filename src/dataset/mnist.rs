//! Loader for handwritten-digit style IDX archives.
//!
//! Image and label archives are paired by group name: for each group present,
//! `<group>-images.idx3-ubyte` and `<group>-labels.idx1-ubyte` (optionally
//! gzipped with a `.gz` suffix) are read from the dataset directory. Pixels
//! are presented normalized to `[0, 1]` and labels as one-hot vectors.

use crate::{
    dataset::{Dataset, DatasetGroup, Sample},
    Float, Result,
};
use anyhow::{bail, ensure};
use byteorder::{BigEndian, ReadBytesExt};
use flate2::read::GzDecoder;
use std::{collections::HashMap, fs::File, io::Read, path::Path};

const IMAGE_MAGIC: u32 = 2051;
const LABEL_MAGIC: u32 = 2049;

#[derive(Debug)]
struct Group {
    /// Raw pixel bytes, one `rows * cols` block per sample.
    images: Vec<u8>,
    labels: Vec<u8>,
}

/// An IDX-backed dataset.
#[derive(Debug)]
pub struct IdxDataset {
    input_count: usize,
    output_count: usize,
    groups: HashMap<DatasetGroup, Group>,
}

fn open(path: &Path) -> Result<Option<Box<dyn Read>>> {
    let gz = path.with_extension(match path.extension().and_then(|e| e.to_str()) {
        Some(extension) => format!("{}.gz", extension),
        None => "gz".to_string(),
    });
    if gz.is_file() {
        return Ok(Some(Box::new(GzDecoder::new(File::open(&gz)?))));
    }
    if path.is_file() {
        return Ok(Some(Box::new(File::open(path)?)));
    }
    Ok(None)
}

fn read_images(mut reader: impl Read) -> Result<(usize, usize, Vec<u8>)> {
    let magic = reader.read_u32::<BigEndian>()?;
    ensure!(magic == IMAGE_MAGIC, "bad image archive magic {:#x}", magic);
    let count = reader.read_u32::<BigEndian>()? as usize;
    let rows = reader.read_u32::<BigEndian>()? as usize;
    let cols = reader.read_u32::<BigEndian>()? as usize;
    let mut pixels = vec![0u8; count * rows * cols];
    reader.read_exact(&mut pixels)?;
    Ok((count, rows * cols, pixels))
}

fn read_labels(mut reader: impl Read) -> Result<Vec<u8>> {
    let magic = reader.read_u32::<BigEndian>()?;
    ensure!(magic == LABEL_MAGIC, "bad label archive magic {:#x}", magic);
    let count = reader.read_u32::<BigEndian>()? as usize;
    let mut labels = vec![0u8; count];
    reader.read_exact(&mut labels)?;
    Ok(labels)
}

impl IdxDataset {
    /// Loads every group present in `dir`. At least one group must exist and
    /// all groups must agree on the image size; the output width is one past
    /// the largest label seen.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut groups = HashMap::new();
        let mut input_count = None;
        let mut max_label = 0u8;
        for group in DatasetGroup::ALL {
            let images_path = dir.join(format!("{}-images.idx3-ubyte", group.name()));
            let labels_path = dir.join(format!("{}-labels.idx1-ubyte", group.name()));
            let images = match open(&images_path)? {
                Some(reader) => reader,
                None => continue,
            };
            let labels = match open(&labels_path)? {
                Some(reader) => reader,
                None => bail!(
                    "group \"{}\" has an image archive but no label archive",
                    group.name()
                ),
            };
            let (count, pixels_per_image, pixels) = read_images(images)?;
            let labels = read_labels(labels)?;
            ensure!(
                labels.len() == count,
                "group \"{}\" has {} images but {} labels",
                group.name(),
                count,
                labels.len()
            );
            match input_count {
                Some(existing) => ensure!(
                    existing == pixels_per_image,
                    "group \"{}\" image size {} does not match {}",
                    group.name(),
                    pixels_per_image,
                    existing
                ),
                None => input_count = Some(pixels_per_image),
            }
            max_label = max_label.max(labels.iter().copied().max().unwrap_or(0));
            log::debug!("loaded {} group: {} samples", group.name(), count);
            groups.insert(
                group,
                Group {
                    images: pixels,
                    labels,
                },
            );
        }
        let input_count = match input_count {
            Some(input_count) => input_count,
            None => bail!("no dataset groups found in {}", dir.display()),
        };
        Ok(Self {
            input_count,
            output_count: max_label as usize + 1,
            groups,
        })
    }
}

impl Dataset for IdxDataset {
    fn input_count(&self) -> usize {
        self.input_count
    }
    fn output_count(&self) -> usize {
        self.output_count
    }
    fn groups(&self) -> Vec<DatasetGroup> {
        DatasetGroup::ALL
            .into_iter()
            .filter(|group| self.groups.contains_key(group))
            .collect()
    }
    fn sample_count(&self, group: DatasetGroup) -> usize {
        self.groups.get(&group).map_or(0, |g| g.labels.len())
    }
    fn get_sample(&self, group: DatasetGroup, index: usize) -> Option<Sample> {
        let group = self.groups.get(&group)?;
        if index >= group.labels.len() {
            return None;
        }
        let offset = index * self.input_count;
        let inputs = group.images[offset..offset + self.input_count]
            .iter()
            .map(|pixel| *pixel as Float / 255.)
            .collect();
        let mut outputs = vec![0.; self.output_count];
        outputs[group.labels[index] as usize] = 1.;
        Some((inputs, outputs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn image_archive(count: u32, rows: u32, cols: u32, pixels: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for word in [IMAGE_MAGIC, count, rows, cols] {
            bytes.extend_from_slice(&word.to_be_bytes());
        }
        bytes.extend_from_slice(pixels);
        bytes
    }

    #[test]
    fn parses_image_archive() {
        let bytes = image_archive(2, 2, 2, &[0, 64, 128, 255, 1, 2, 3, 4]);
        let (count, pixels_per_image, pixels) = read_images(Cursor::new(bytes)).unwrap();
        assert_eq!(count, 2);
        assert_eq!(pixels_per_image, 4);
        assert_eq!(pixels.len(), 8);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = image_archive(1, 1, 1, &[0]);
        bytes[3] = 0xff;
        assert!(read_images(Cursor::new(bytes)).is_err());

        let mut labels = Vec::new();
        labels.extend_from_slice(&IMAGE_MAGIC.to_be_bytes());
        labels.extend_from_slice(&1u32.to_be_bytes());
        labels.push(7);
        assert!(read_labels(Cursor::new(labels)).is_err());
    }

    #[test]
    fn rejects_truncated_pixels() {
        let bytes = image_archive(2, 2, 2, &[0, 1, 2]);
        assert!(read_images(Cursor::new(bytes)).is_err());
    }
}
