// ─────────────────────────────────────────────────────────────────────
// SSC Kernel — Ensemble Store
// ─────────────────────────────────────────────────────────────────────
//! Storage backends for ensemble-member occupancy logits.
//!
//! Members are keyed by `(member, frame)`. On disk an artifact lives at
//! `<root>/<member:02>/<sequence_id>/<frame:08>.npy` and holds a float
//! array of shape `(1, C, H, W, Z)`; a leading batch axis of any size
//! other than 1 is rejected.
//!
//! The in-memory backend is used by tests and by callers that keep a
//! freshly trained proposal network's outputs resident.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind};
use std::path::{Path, PathBuf};

use ndarray::{ArrayD, IxDyn};
use ndarray_npy::{ReadNpyExt, WriteNpyExt};
use parking_lot::RwLock;
use ssc_types::{ClassVolume, FrameKey, GridShape, SscError, SscResult};

/// Trait for ensemble artifact backends.
pub trait EnsembleStore: Send + Sync {
    /// Load one member's logits. Returns `Ok(None)` when the artifact
    /// does not exist.
    fn load(&self, member: usize, frame: &FrameKey) -> SscResult<Option<ClassVolume>>;

    /// Persist one member's logits, replacing any previous artifact.
    fn save(&self, member: usize, frame: &FrameKey, volume: &ClassVolume) -> SscResult<()>;
}

// ─── Filesystem ─────────────────────────────────────────────────────

/// `.npy` backend rooted at an ensemble directory.
#[derive(Debug, Clone)]
pub struct NpyEnsembleStore {
    root: PathBuf,
}

impl NpyEnsembleStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn member_path(&self, member: usize, frame: &FrameKey) -> PathBuf {
        self.root
            .join(format!("{member:02}"))
            .join(&frame.sequence_id)
            .join(frame.npy_name())
    }
}

impl EnsembleStore for NpyEnsembleStore {
    fn load(&self, member: usize, frame: &FrameKey) -> SscResult<Option<ClassVolume>> {
        read_class_volume(&self.member_path(member, frame))
    }

    fn save(&self, member: usize, frame: &FrameKey, volume: &ClassVolume) -> SscResult<()> {
        write_class_volume(&self.member_path(member, frame), volume)
    }
}

/// Read a `(1, C, H, W, Z)` or `(C, H, W, Z)` float array.
///
/// `f4` arrays are read directly; `f8` arrays are narrowed to `f32`.
/// A missing file yields `Ok(None)`.
pub fn read_class_volume(path: &Path) -> SscResult<Option<ClassVolume>> {
    let array = match read_f32_array(path) {
        Ok(a) => a,
        Err(SscError::Io(_)) if !path.exists() => return Ok(None),
        Err(e) => return Err(e),
    };

    let dims = array.shape().to_vec();
    let (classes, shape) = match dims.as_slice() {
        [1, c, h, w, z] => (*c, GridShape::new(*h, *w, *z)),
        [c, h, w, z] => (*c, GridShape::new(*h, *w, *z)),
        [b, ..] if dims.len() == 5 => {
            return Err(SscError::Npy(format!(
                "{}: batch size {b} unsupported, expected 1",
                path.display()
            )))
        }
        _ => {
            return Err(SscError::Npy(format!(
                "{}: expected (1, C, H, W, Z) array, got {dims:?}",
                path.display()
            )))
        }
    };

    let data: Vec<f32> = array.iter().copied().collect();
    ClassVolume::new(classes, shape, data).map(Some)
}

fn read_f32_array(path: &Path) -> SscResult<ArrayD<f32>> {
    let file = File::open(path)?;
    match ArrayD::<f32>::read_npy(BufReader::new(file)) {
        Ok(a) => Ok(a),
        Err(f32_err) => {
            let file = File::open(path)?;
            let wide = ArrayD::<f64>::read_npy(BufReader::new(file)).map_err(|_| {
                SscError::Npy(format!("{}: {f32_err}", path.display()))
            })?;
            Ok(wide.mapv(|v| v as f32))
        }
    }
}

/// Write a volume as a `(1, C, H, W, Z)` `f4` array, creating parent
/// directories as needed.
pub fn write_class_volume(path: &Path, volume: &ClassVolume) -> SscResult<()> {
    let s = volume.shape;
    let array = ArrayD::from_shape_vec(
        IxDyn(&[1, volume.classes, s.h, s.w, s.z]),
        volume.data.clone(),
    )
    .map_err(|e| SscError::Contract(format!("logit volume layout: {e}")))?;
    write_npy(path, &array)
}

/// Write a 1-D `f8` array.
pub fn write_f64_vector(path: &Path, values: &[f64]) -> SscResult<()> {
    let array = ArrayD::from_shape_vec(IxDyn(&[values.len()]), values.to_vec())
        .map_err(|e| SscError::Contract(format!("score vector layout: {e}")))?;
    write_npy(path, &array)
}

/// Read a 1-D `f8` array written by [`write_f64_vector`].
pub fn read_f64_vector(path: &Path) -> SscResult<Vec<f64>> {
    let file = File::open(path)?;
    let array = ArrayD::<f64>::read_npy(BufReader::new(file))
        .map_err(|e| SscError::Npy(format!("{}: {e}", path.display())))?;
    if array.ndim() != 1 {
        return Err(SscError::Npy(format!(
            "{}: expected 1-D array, got {:?}",
            path.display(),
            array.shape()
        )));
    }
    Ok(array.iter().copied().collect())
}

fn write_npy<A: ndarray_npy::WritableElement>(path: &Path, array: &ArrayD<A>) -> SscResult<()> {
    ensure_parent(path)?;
    let file = File::create(path)?;
    array
        .write_npy(BufWriter::new(file))
        .map_err(|e| SscError::Npy(format!("{}: {e}", path.display())))
}

pub(crate) fn ensure_parent(path: &Path) -> SscResult<()> {
    if let Some(parent) = path.parent() {
        match fs::create_dir_all(parent) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

// ─── In-memory ──────────────────────────────────────────────────────

/// Member logits held in process memory.
#[derive(Default)]
pub struct InMemoryEnsembleStore {
    members: RwLock<HashMap<(usize, FrameKey), ClassVolume>>,
}

impl InMemoryEnsembleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, member: usize, frame: FrameKey, volume: ClassVolume) {
        self.members.write().insert((member, frame), volume);
    }

    pub fn len(&self) -> usize {
        self.members.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.read().is_empty()
    }
}

impl EnsembleStore for InMemoryEnsembleStore {
    fn load(&self, member: usize, frame: &FrameKey) -> SscResult<Option<ClassVolume>> {
        Ok(self.members.read().get(&(member, frame.clone())).cloned())
    }

    fn save(&self, member: usize, frame: &FrameKey, volume: &ClassVolume) -> SscResult<()> {
        self.insert(member, frame.clone(), volume.clone());
        Ok(())
    }
}

// ─── External ───────────────────────────────────────────────────────

type LoadFn = Box<dyn Fn(usize, &FrameKey) -> SscResult<Option<ClassVolume>> + Send + Sync>;

/// Read-only store delegating to a caller-supplied loader.
pub struct ExternalEnsembleStore {
    load_fn: LoadFn,
}

impl ExternalEnsembleStore {
    pub fn new(
        load_fn: impl Fn(usize, &FrameKey) -> SscResult<Option<ClassVolume>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            load_fn: Box::new(load_fn),
        }
    }
}

impl EnsembleStore for ExternalEnsembleStore {
    fn load(&self, member: usize, frame: &FrameKey) -> SscResult<Option<ClassVolume>> {
        (self.load_fn)(member, frame)
    }

    fn save(&self, member: usize, frame: &FrameKey, _volume: &ClassVolume) -> SscResult<()> {
        Err(SscError::Contract(format!(
            "external ensemble store is read-only (member {member}, frame {}/{})",
            frame.sequence_id, frame.frame_id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn volume(value: f32) -> ClassVolume {
        let shape = GridShape::new(2, 2, 2);
        ClassVolume::new(2, shape, vec![value; 16]).unwrap()
    }

    #[test]
    fn test_member_path_layout() {
        let store = NpyEnsembleStore::new("/data/ens");
        let key = FrameKey::new("08", "42");
        assert_eq!(
            store.member_path(3, &key),
            PathBuf::from("/data/ens/03/08/00000042.npy")
        );
    }

    #[test]
    fn test_npy_store_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = NpyEnsembleStore::new(dir.path());
        let key = FrameKey::new("00", "7");
        let mut v = volume(0.0);
        for (i, x) in v.data.iter_mut().enumerate() {
            *x = i as f32 * 0.5;
        }
        store.save(1, &key, &v).unwrap();
        let loaded = store.load(1, &key).unwrap().unwrap();
        assert_eq!(loaded, v);
    }

    #[test]
    fn test_npy_store_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = NpyEnsembleStore::new(dir.path());
        assert!(store.load(0, &FrameKey::new("00", "1")).unwrap().is_none());
    }

    #[test]
    fn test_f64_artifact_is_narrowed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wide.npy");
        let array = ArrayD::from_shape_vec(IxDyn(&[1, 2, 1, 1, 2]), vec![0.25f64, 0.5, 1.0, 2.0])
            .unwrap();
        write_npy(&path, &array).unwrap();
        let v = read_class_volume(&path).unwrap().unwrap();
        assert_eq!(v.classes, 2);
        assert_eq!(v.shape, GridShape::new(1, 1, 2));
        assert_eq!(v.data, vec![0.25, 0.5, 1.0, 2.0]);
    }

    #[test]
    fn test_batch_above_one_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batch.npy");
        let array = ArrayD::from_shape_vec(IxDyn(&[2, 2, 1, 1, 1]), vec![0.0f32; 4]).unwrap();
        write_npy(&path, &array).unwrap();
        assert!(matches!(read_class_volume(&path), Err(SscError::Npy(_))));
    }

    #[test]
    fn test_garbage_file_is_npy_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.npy");
        fs::write(&path, b"not an array").unwrap();
        assert!(matches!(read_class_volume(&path), Err(SscError::Npy(_))));
    }

    #[test]
    fn test_score_vector_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s").join("00000001.npy");
        write_f64_vector(&path, &[1.5, 0.25, f64::NAN]).unwrap();
        let back = read_f64_vector(&path).unwrap();
        assert_eq!(&back[..2], &[1.5, 0.25]);
        assert!(back[2].is_nan());
    }

    #[test]
    fn test_in_memory_store() {
        let store = InMemoryEnsembleStore::new();
        let key = FrameKey::new("01", "3");
        assert!(store.is_empty());
        store.save(2, &key, &volume(1.0)).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.load(2, &key).unwrap(), Some(volume(1.0)));
        assert!(store.load(0, &key).unwrap().is_none());
    }

    #[test]
    fn test_external_store_is_read_only() {
        let store = ExternalEnsembleStore::new(|member, _| {
            Ok((member == 0).then(|| volume(0.5)))
        });
        let key = FrameKey::new("00", "0");
        assert!(store.load(0, &key).unwrap().is_some());
        assert!(store.load(1, &key).unwrap().is_none());
        assert!(store.save(0, &key, &volume(0.5)).is_err());
    }
}
