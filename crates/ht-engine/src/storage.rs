use ht_optimizer::ConfigDigest;
use ht_types::{HtError, HtResult, TunerConfig};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::model::TrainableModel;
use crate::results::InstanceResults;

/// Kind of artifact handed to a remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactCategory {
    Config,
    Weights,
    InstanceResults,
}

impl ArtifactCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Weights => "weights",
            Self::InstanceResults => "instance-results",
        }
    }
}

impl fmt::Display for ArtifactCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an artifact belongs: project, instance and, depending on the
/// category, the execution or the training size it was produced for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactLocator {
    pub project: String,
    pub instance_id: ConfigDigest,
    /// Set for configs and weights.
    pub execution: Option<usize>,
    /// Set for instance results.
    pub training_size: Option<usize>,
    pub file_name: String,
}

impl ArtifactLocator {
    pub fn new(project: impl Into<String>, instance_id: ConfigDigest, file_name: String) -> Self {
        Self {
            project: project.into(),
            instance_id,
            execution: None,
            training_size: None,
            file_name,
        }
    }

    pub fn with_execution(mut self, execution: usize) -> Self {
        self.execution = Some(execution);
        self
    }

    pub fn with_training_size(mut self, training_size: usize) -> Self {
        self.training_size = Some(training_size);
        self
    }
}

/// Best-effort secondary copy of persisted artifacts.
pub trait RemoteStore: Send {
    fn save(
        &self,
        category: ArtifactCategory,
        locator: &ArtifactLocator,
        local_path: &Path,
        remote_dir: &str,
    ) -> HtResult<()>;
}

/// Copies artifacts into `<remote_dir>/<project>/<category>/<file_name>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectoryMirror;

impl RemoteStore for DirectoryMirror {
    fn save(
        &self,
        category: ArtifactCategory,
        locator: &ArtifactLocator,
        local_path: &Path,
        remote_dir: &str,
    ) -> HtResult<()> {
        let target_dir = Path::new(remote_dir)
            .join(&locator.project)
            .join(category.as_str());
        fs::create_dir_all(&target_dir)
            .map_err(|e| HtError::Storage(format!("{}: {e}", target_dir.display())))?;
        let target = target_dir.join(&locator.file_name);
        fs::copy(local_path, &target)
            .map_err(|e| HtError::Storage(format!("{}: {e}", target.display())))?;
        Ok(())
    }
}

/// Local result storage for one project, with an optional remote mirror.
pub struct ResultStore {
    pub root: PathBuf,
    pub tmp: PathBuf,
    pub project: String,
    remote: Option<(Box<dyn RemoteStore>, String)>,
}

impl fmt::Debug for ResultStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultStore")
            .field("root", &self.root)
            .field("tmp", &self.tmp)
            .field("project", &self.project)
            .field("remote_dir", &self.remote.as_ref().map(|(_, dir)| dir))
            .finish()
    }
}

impl ResultStore {
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(
        root: P,
        tmp: Q,
        project: impl Into<String>,
    ) -> HtResult<Self> {
        let root = root.as_ref().to_path_buf();
        let tmp = tmp.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        fs::create_dir_all(&tmp)?;
        Ok(Self {
            root,
            tmp,
            project: project.into(),
            remote: None,
        })
    }

    /// Store rooted at the project directory, mirroring to `remote_dir` when set.
    pub fn from_config(config: &TunerConfig) -> HtResult<Self> {
        let store = Self::new(config.project_dir(), &config.tmp_dir, &config.project_name)?;
        Ok(match &config.remote_dir {
            Some(dir) => store.with_remote(Box::new(DirectoryMirror), dir.clone()),
            None => store,
        })
    }

    pub fn with_remote(mut self, remote: Box<dyn RemoteStore>, remote_dir: impl Into<String>) -> Self {
        self.remote = Some((remote, remote_dir.into()));
        self
    }

    pub fn config_file_name(&self, instance_id: &ConfigDigest, execution: usize) -> String {
        format!("{}-{instance_id}-{execution}-config.json", self.project)
    }

    pub fn weights_file_name(&self, instance_id: &ConfigDigest, execution: usize) -> String {
        format!("{}-{instance_id}-{execution}-weights.bin", self.project)
    }

    pub fn config_path(&self, instance_id: &ConfigDigest, execution: usize) -> PathBuf {
        self.root.join(self.config_file_name(instance_id, execution))
    }

    pub fn weights_path(&self, instance_id: &ConfigDigest, execution: usize) -> PathBuf {
        self.root.join(self.weights_file_name(instance_id, execution))
    }

    pub fn results_path(&self, results: &InstanceResults) -> PathBuf {
        self.root.join(results.file_name())
    }

    /// Write through the tmp directory so readers never see a partial file.
    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> HtResult<()> {
        let staging = self.staging_path();
        fs::write(&staging, bytes)?;
        self.promote(&staging, path)
    }

    fn staging_path(&self) -> PathBuf {
        self.tmp.join(format!("{}.partial", Uuid::new_v4()))
    }

    fn promote(&self, staging: &Path, path: &Path) -> HtResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        // tmp and results may live on different filesystems
        if fs::rename(staging, path).is_err() {
            fs::copy(staging, path)?;
            fs::remove_file(staging)?;
        }
        Ok(())
    }

    pub fn save_config(
        &self,
        instance_id: &ConfigDigest,
        execution: usize,
        descriptor: &serde_json::Value,
    ) -> HtResult<PathBuf> {
        let file_name = self.config_file_name(instance_id, execution);
        let path = self.root.join(&file_name);
        self.write_atomic(&path, serde_json::to_string_pretty(descriptor)?.as_bytes())?;
        let locator = self.locator(instance_id, file_name).with_execution(execution);
        self.mirror(ArtifactCategory::Config, &locator, &path);
        Ok(path)
    }

    pub fn save_weights<M: TrainableModel + ?Sized>(
        &self,
        instance_id: &ConfigDigest,
        execution: usize,
        model: &M,
    ) -> HtResult<PathBuf> {
        let file_name = self.weights_file_name(instance_id, execution);
        let path = self.root.join(&file_name);
        let staging = self.staging_path();
        model.save_weights(&staging)?;
        self.promote(&staging, &path)?;
        let locator = self.locator(instance_id, file_name).with_execution(execution);
        self.mirror(ArtifactCategory::Weights, &locator, &path);
        Ok(path)
    }

    pub fn save_results(&self, results: &InstanceResults) -> HtResult<PathBuf> {
        let path = self.results_path(results);
        self.write_atomic(&path, results.to_json()?.as_bytes())?;
        let locator = self
            .locator(&results.instance_id, results.file_name())
            .with_training_size(results.training_size);
        self.mirror(ArtifactCategory::InstanceResults, &locator, &path);
        Ok(path)
    }

    fn locator(&self, instance_id: &ConfigDigest, file_name: String) -> ArtifactLocator {
        ArtifactLocator::new(self.project.clone(), instance_id.clone(), file_name)
    }

    /// Remote failures are logged and swallowed.
    fn mirror(&self, category: ArtifactCategory, locator: &ArtifactLocator, local_path: &Path) {
        let Some((remote, remote_dir)) = &self.remote else {
            return;
        };
        match remote.save(category, locator, local_path, remote_dir) {
            Ok(()) => debug!(%category, file = %locator.file_name, "mirrored"),
            Err(e) => warn!(%category, file = %locator.file_name, error = %e, "remote save failed"),
        }
    }

    /// Remove everything under the tmp directory.
    pub fn clear_tmp(&self) -> HtResult<()> {
        if self.tmp.exists() {
            fs::remove_dir_all(&self.tmp)?;
        }
        fs::create_dir_all(&self.tmp)?;
        Ok(())
    }

    pub fn get_stats(&self) -> HtResult<StorageStats> {
        storage_stats(&self.root)
    }
}

/// File count and size of everything under `root`.
pub fn storage_stats(root: &Path) -> HtResult<StorageStats> {
    fn scan_directory(path: &Path, stats: &mut (u64, u64)) -> std::io::Result<()> {
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                scan_directory(&path, stats)?;
            } else {
                stats.0 += 1;
                stats.1 += entry.metadata()?.len();
            }
        }
        Ok(())
    }

    let mut stats = (0u64, 0u64);
    if root.exists() {
        scan_directory(root, &mut stats)?;
    }
    Ok(StorageStats {
        total_files: stats.0,
        total_size_bytes: stats.1,
        data_root: root.to_path_buf(),
    })
}

/// Storage statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageStats {
    pub total_files: u64,
    pub total_size_bytes: u64,
    pub data_root: PathBuf,
}

impl StorageStats {
    pub fn total_size_kb(&self) -> f64 {
        self.total_size_bytes as f64 / 1024.0
    }

    pub fn total_size_mb(&self) -> f64 {
        self.total_size_bytes as f64 / (1024.0 * 1024.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FitOptions, Logs};
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    struct Blob(Vec<u8>);

    impl TrainableModel for Blob {
        type Data = ();

        fn descriptor(&self) -> serde_json::Value {
            json!({ "len": self.0.len() })
        }

        fn parameter_count(&self) -> u64 {
            self.0.len() as u64
        }

        fn train_epoch(&mut self, _: &(), _: usize, _: &FitOptions) -> HtResult<Logs> {
            Ok(Logs::new())
        }

        fn save_weights(&self, path: &Path) -> HtResult<()> {
            fs::write(path, &self.0)?;
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct Recording(Arc<Mutex<Vec<(ArtifactCategory, ArtifactLocator)>>>);

    impl RemoteStore for Recording {
        fn save(
            &self,
            category: ArtifactCategory,
            locator: &ArtifactLocator,
            _: &Path,
            _: &str,
        ) -> HtResult<()> {
            self.0.lock().unwrap().push((category, locator.clone()));
            Ok(())
        }
    }

    struct Unreachable;

    impl RemoteStore for Unreachable {
        fn save(&self, _: ArtifactCategory, _: &ArtifactLocator, _: &Path, _: &str) -> HtResult<()> {
            Err(HtError::Storage("bucket unreachable".into()))
        }
    }

    fn digest() -> ConfigDigest {
        ConfigDigest::of_descriptor(&json!({ "layers": [4, 2] }))
    }

    #[test]
    fn test_storage_roundtrip() {
        let dir = tempdir().unwrap();
        let store =
            ResultStore::new(dir.path().join("results"), dir.path().join("tmp"), "demo").unwrap();
        let id = digest();

        let config = store.save_config(&id, 0, &json!({ "layers": [4, 2] })).unwrap();
        assert_eq!(
            config.file_name().unwrap().to_str().unwrap(),
            format!("demo-{id}-0-config.json")
        );
        let loaded: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&config).unwrap()).unwrap();
        assert_eq!(loaded, json!({ "layers": [4, 2] }));

        let weights = store.save_weights(&id, 1, &Blob(vec![1, 2, 3])).unwrap();
        assert_eq!(weights, store.weights_path(&id, 1));
        assert_eq!(fs::read(&weights).unwrap(), vec![1, 2, 3]);

        // staging files do not linger
        assert_eq!(fs::read_dir(&store.tmp).unwrap().count(), 0);

        let stats = store.get_stats().unwrap();
        assert_eq!(stats.total_files, 2);
        assert!(stats.total_size_bytes > 3);
    }

    #[test]
    fn test_remote_mirror_receives_each_category() {
        let dir = tempdir().unwrap();
        let recording = Recording::default();
        let store = ResultStore::new(dir.path().join("r"), dir.path().join("t"), "p")
            .unwrap()
            .with_remote(Box::new(recording.clone()), "gs://bucket");
        let id = digest();

        store.save_config(&id, 0, &json!({})).unwrap();
        store.save_weights(&id, 0, &Blob(vec![0])).unwrap();

        store.save_weights(&id, 3, &Blob(vec![0])).unwrap();

        let calls = recording.0.lock().unwrap();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].0, ArtifactCategory::Config);
        assert_eq!(calls[1].0, ArtifactCategory::Weights);
        assert_eq!(calls[1].1.file_name, store.weights_file_name(&id, 0));

        let last = &calls[2].1;
        assert_eq!(last.project, "p");
        assert_eq!(last.instance_id, id);
        assert_eq!(last.execution, Some(3));
        assert_eq!(last.training_size, None);
    }

    #[test]
    fn test_results_locator_carries_training_size() {
        let dir = tempdir().unwrap();
        let recording = Recording::default();
        let store = ResultStore::new(dir.path().join("r"), dir.path().join("t"), "p")
            .unwrap()
            .with_remote(Box::new(recording.clone()), "gs://bucket");
        let results = InstanceResults {
            project: "p".into(),
            instance_id: digest(),
            trial_id: digest(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            training_size: 512,
            validation_size: 128,
            num_executions: 0,
            model_size: 6,
            model: json!({ "layers": [4, 2] }),
            hyperparameters: ht_optimizer::Assignment::new(),
            executions: Vec::new(),
            best_checkpoint: None,
            metrics: Default::default(),
            key_metrics: Default::default(),
        };

        store.save_results(&results).unwrap();

        let calls = recording.0.lock().unwrap();
        let (category, locator) = &calls[0];
        assert_eq!(*category, ArtifactCategory::InstanceResults);
        assert_eq!(locator.training_size, Some(512));
        assert_eq!(locator.execution, None);
        assert_eq!(locator.file_name, results.file_name());
    }

    #[test]
    fn test_remote_failure_is_swallowed() {
        let dir = tempdir().unwrap();
        let store = ResultStore::new(dir.path().join("r"), dir.path().join("t"), "p")
            .unwrap()
            .with_remote(Box::new(Unreachable), "nowhere");

        let path = store.save_config(&digest(), 0, &json!({ "ok": true })).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_directory_mirror_copies_by_category() {
        let dir = tempdir().unwrap();
        let remote = dir.path().join("remote");
        let store = ResultStore::new(dir.path().join("r"), dir.path().join("t"), "p")
            .unwrap()
            .with_remote(Box::new(DirectoryMirror), remote.to_string_lossy());
        let id = digest();

        store.save_config(&id, 2, &json!({ "a": 1 })).unwrap();
        assert!(remote
            .join("p")
            .join("config")
            .join(store.config_file_name(&id, 2))
            .exists());
    }

    #[test]
    fn test_clear_tmp() {
        let dir = tempdir().unwrap();
        let store = ResultStore::new(dir.path().join("r"), dir.path().join("t"), "p").unwrap();
        fs::write(store.tmp.join("stale"), b"x").unwrap();
        store.clear_tmp().unwrap();
        assert!(store.tmp.exists());
        assert_eq!(fs::read_dir(&store.tmp).unwrap().count(), 0);
    }

    #[test]
    fn test_stats_of_missing_root() {
        let stats = storage_stats(Path::new("/definitely/not/here")).unwrap();
        assert_eq!(stats.total_files, 0);
        assert_eq!(stats.total_size_mb(), 0.0);
    }
}
