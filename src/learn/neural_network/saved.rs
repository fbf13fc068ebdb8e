//!
/*!
Binary weight persistence.

The format is fixed for compatibility: a `u64` layer count, then per layer a
`u64` size and an `i16` activation discriminant followed by the weights as
`size × previous_size` little-endian `f32` in row-major order and `size`
`f32` biases. The input layer contributes only its header; its size seeds the
incremental shape reconstruction on load.
*/
use super::{activation::Activation, layer::Layer, Network};
use anyhow::{bail, Context, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::{
    fs::File,
    io::{BufReader, BufWriter, Read, Write},
    path::Path,
};

/// Writes the network's weights to `path`.
///
/// **Errors**
///
/// The file could not be created or written.
pub fn save_weights(path: impl AsRef<Path>, network: &Network) -> Result<()> {
    let path = path.as_ref();
    let file = File::create(path).with_context(|| format!("Unable to create {path:?}!"))?;
    let mut writer = BufWriter::new(file);
    write_weights(&mut writer, network)?;
    writer.flush()?;
    Ok(())
}

/// Writes the network's weights to `writer`.
pub fn write_weights(writer: &mut impl Write, network: &Network) -> Result<()> {
    writer.write_u64::<LittleEndian>(network.layers().len() as u64)?;
    for layer in network.layers() {
        writer.write_u64::<LittleEndian>(layer.size() as u64)?;
        writer.write_i16::<LittleEndian>(layer.activation() as i16)?;
        for &w in layer.weights().iter() {
            writer.write_f32::<LittleEndian>(w)?;
        }
        for &b in layer.biases().iter() {
            writer.write_f32::<LittleEndian>(b)?;
        }
    }
    Ok(())
}

/// Reads a network from the weights stored at `path`.
///
/// **Errors**
///
/// The file is missing, truncated, or declares an unknown activation.
pub fn load_weights(path: impl AsRef<Path>) -> Result<Network> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("File not found {path:?}!"))?;
    read_weights(&mut BufReader::new(file))
}

/// Reads a network from `reader`.
///
/// Layer shapes are reconstructed incrementally: each layer's weight matrix
/// takes its column count from the previously read layer's size.
pub fn read_weights(reader: &mut impl Read) -> Result<Network> {
    let layer_count = reader.read_u64::<LittleEndian>()? as usize;
    let mut layers = Vec::with_capacity(layer_count);
    let mut previous_size = 0;
    for l in 0..layer_count {
        let size = reader.read_u64::<LittleEndian>()? as usize;
        let repr = reader.read_i16::<LittleEndian>()?;
        let Some(activation) = Activation::from_repr(repr) else {
            bail!("Unknown activation {repr} for layer {l}!");
        };
        if l == 0 {
            layers.push(Layer::input(size));
        } else {
            let mut layer = Layer::new(size, activation);
            layer.construct(previous_size);
            for w in layer.weights_mut().iter_mut() {
                *w = reader.read_f32::<LittleEndian>()?;
            }
            for b in layer.biases_mut().iter_mut() {
                *b = reader.read_f32::<LittleEndian>()?;
            }
            layers.push(layer);
        }
        previous_size = size;
    }
    Network::from_layers(layers)
}

#[cfg(test)]
mod tests {
    use super::super::{Init, Network};
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};
    use std::io::Cursor;

    fn fixture_network() -> Network {
        let mut network =
            Network::new(3, 2, Activation::Softmax).add_layer(4, Activation::Relu);
        let mut rng = StdRng::seed_from_u64(42);
        network.init_with_rng(Init::XavierUniform, &mut rng);
        network
    }

    #[test]
    fn round_trip_is_bit_exact() {
        let network = fixture_network();
        let mut bytes = Vec::new();
        write_weights(&mut bytes, &network).unwrap();
        let loaded = read_weights(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(loaded.layers().len(), network.layers().len());
        for (loaded, original) in loaded.layers().iter().zip(network.layers().iter()) {
            assert_eq!(loaded.size(), original.size());
            assert_eq!(loaded.activation(), original.activation());
            assert_eq!(loaded.weights().dim(), original.weights().dim());
            for (&a, &b) in loaded.weights().iter().zip(original.weights().iter()) {
                assert_eq!(a.to_bits(), b.to_bits());
            }
            for (&a, &b) in loaded.biases().iter().zip(original.biases().iter()) {
                assert_eq!(a.to_bits(), b.to_bits());
            }
        }
    }

    #[test]
    fn round_trip_through_file() {
        let network = fixture_network();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.bin");
        save_weights(&path, &network).unwrap();
        let loaded = load_weights(&path).unwrap();
        assert_eq!(loaded.layers().len(), 3);
        assert_eq!(loaded.layers()[1].weights().dim(), (4, 3));
        assert_eq!(loaded.layers()[2].weights().dim(), (2, 4));
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(load_weights("/nonexistent/weights.bin").is_err());
    }

    #[test]
    fn unknown_activation_is_an_error() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&2u64.to_le_bytes());
        bytes.extend_from_slice(&3u64.to_le_bytes());
        bytes.extend_from_slice(&99i16.to_le_bytes());
        assert!(read_weights(&mut Cursor::new(bytes)).is_err());
    }

    #[test]
    fn truncated_stream_is_an_error() {
        let network = fixture_network();
        let mut bytes = Vec::new();
        write_weights(&mut bytes, &network).unwrap();
        bytes.truncate(bytes.len() - 4);
        assert!(read_weights(&mut Cursor::new(bytes)).is_err());
    }
}
