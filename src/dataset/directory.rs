use super::SampleSource;
use anyhow::{ensure, Context, Result};
use ndarray::Array1;
use std::{
    fs,
    path::{Path, PathBuf},
};

/// Sample source over a directory tree.
///
/// Each immediate subdirectory of the scanned path is one class label and
/// each regular file within it is one sample. Classes and files are sorted
/// by name so enumeration order is stable across platforms. Decoding is
/// delegated to the supplied function, keeping codecs out of the core.
pub struct DirectorySource<F> {
    classes: Vec<ClassDir>,
    decode: F,
}

struct ClassDir {
    name: String,
    files: Vec<PathBuf>,
}

impl<F> DirectorySource<F>
where
    F: Fn(&Path) -> Result<Array1<f32>> + Send + Sync,
{
    /// Scans `path` for class directories.
    ///
    /// **Errors**
    ///
    /// The path does not exist or is not a directory.
    pub fn scan(path: impl AsRef<Path>, decode: F) -> Result<Self> {
        let path = path.as_ref();
        ensure!(
            path.is_dir(),
            "Data directory {path:?} does not exist or is not a directory!"
        );
        let mut dirs = Vec::new();
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                dirs.push(entry.path());
            }
        }
        dirs.sort();
        let mut classes = Vec::with_capacity(dirs.len());
        for dir in dirs {
            let mut files = Vec::new();
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                if entry.file_type()?.is_file() {
                    files.push(entry.path());
                }
            }
            files.sort();
            let name = dir
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            classes.push(ClassDir { name, files });
        }
        Ok(Self { classes, decode })
    }
    /// Class labels in enumeration order.
    pub fn class_names(&self) -> impl Iterator<Item = &str> {
        self.classes.iter().map(|class| class.name.as_str())
    }
}

impl<F> SampleSource for DirectorySource<F>
where
    F: Fn(&Path) -> Result<Array1<f32>> + Send + Sync,
{
    fn class_count(&self) -> usize {
        self.classes.len()
    }
    fn samples_per_class(&self, class: usize) -> usize {
        self.classes[class].files.len()
    }
    fn sample(&self, class: usize, index: usize) -> Result<Array1<f32>> {
        let path = &self.classes[class].files[index];
        (self.decode)(path).with_context(|| format!("Failed to decode sample {path:?}!"))
    }
}

/// Decodes a file of raw 8-bit grayscale bytes, scaled to `[0, 1]`.
pub fn decode_gray_bytes(path: &Path) -> Result<Array1<f32>> {
    let bytes = fs::read(path)?;
    Ok(bytes.iter().map(|&b| b as f32 / 255.0).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_sample(dir: &Path, name: &str, bytes: &[u8]) {
        let mut file = fs::File::create(dir.join(name)).unwrap();
        file.write_all(bytes).unwrap();
    }

    #[test]
    fn scan_enumerates_sorted_classes_and_files() {
        let root = tempfile::tempdir().unwrap();
        let cats = root.path().join("cats");
        let dogs = root.path().join("dogs");
        fs::create_dir(&dogs).unwrap();
        fs::create_dir(&cats).unwrap();
        write_sample(&cats, "b.raw", &[0, 255]);
        write_sample(&cats, "a.raw", &[255, 0]);
        write_sample(&dogs, "x.raw", &[128, 128]);
        let source = DirectorySource::scan(root.path(), decode_gray_bytes).unwrap();
        assert_eq!(source.class_count(), 2);
        assert_eq!(
            source.class_names().collect::<Vec<_>>(),
            vec!["cats", "dogs"]
        );
        assert_eq!(source.samples_per_class(0), 2);
        assert_eq!(source.samples_per_class(1), 1);
        // Files are sorted, so index 0 of "cats" is a.raw.
        let sample = source.sample(0, 0).unwrap();
        assert_eq!(sample.len(), 2);
        assert_eq!(sample[0], 1.0);
        assert_eq!(sample[1], 0.0);
    }

    #[test]
    fn missing_directory_is_an_error() {
        assert!(DirectorySource::scan("/nonexistent/data", decode_gray_bytes).is_err());
    }

    #[test]
    fn decode_failure_carries_the_path() {
        let root = tempfile::tempdir().unwrap();
        let class = root.path().join("only");
        fs::create_dir(&class).unwrap();
        write_sample(&class, "sample.raw", &[1, 2, 3]);
        let source = DirectorySource::scan(root.path(), |_: &Path| -> Result<Array1<f32>> {
            anyhow::bail!("decoder rejected the file")
        })
        .unwrap();
        let err = source.sample(0, 0).unwrap_err();
        assert!(format!("{err:#}").contains("sample.raw"));
    }

    #[test]
    fn decode_gray_bytes_scales_to_unit_range() {
        let root = tempfile::tempdir().unwrap();
        write_sample(root.path(), "sample.raw", &[0, 51, 255]);
        let sample = decode_gray_bytes(&root.path().join("sample.raw")).unwrap();
        assert_eq!(sample.len(), 3);
        assert_eq!(sample[0], 0.0);
        assert_eq!(sample[2], 1.0);
        assert!((sample[1] - 0.2).abs() < 1e-6);
    }
}
