use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use shutterflow_core::syncthing::{ReplicationApi, ReplicationError};

/// One scripted completion response.
#[derive(Debug, Clone, Copy)]
pub enum Scripted {
    Percent(f64),
    AuthDenied,
    Unreachable,
}

impl Scripted {
    fn resolve(self) -> Result<f64, ReplicationError> {
        match self {
            Scripted::Percent(percent) => Ok(percent),
            Scripted::AuthDenied => Err(ReplicationError::Auth { status: 403 }),
            Scripted::Unreachable => {
                Err(ReplicationError::Connect("connection refused".to_string()))
            }
        }
    }
}

/// In-memory replication service double. Completion responses are
/// scripted per folder and consumed in order; once a folder's script is
/// exhausted the default response repeats.
pub struct ScriptedReplication {
    scripts: Mutex<HashMap<String, VecDeque<Scripted>>>,
    default_response: Scripted,
    folder_rescans: Mutex<Vec<(String, Vec<String>)>>,
    path_rescans: Mutex<Vec<String>>,
    completion_calls: AtomicUsize,
}

impl ScriptedReplication {
    pub fn new(default_response: Scripted) -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            default_response,
            folder_rescans: Mutex::new(Vec::new()),
            path_rescans: Mutex::new(Vec::new()),
            completion_calls: AtomicUsize::new(0),
        }
    }

    pub fn script(&self, folder: &str, responses: impl IntoIterator<Item = Scripted>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(folder.to_string())
            .or_default()
            .extend(responses);
    }

    pub fn folder_rescans(&self) -> Vec<(String, Vec<String>)> {
        self.folder_rescans.lock().unwrap().clone()
    }

    pub fn path_rescans(&self) -> Vec<String> {
        self.path_rescans.lock().unwrap().clone()
    }

    pub fn completion_calls(&self) -> usize {
        self.completion_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReplicationApi for ScriptedReplication {
    async fn rescan_folder(
        &self,
        folder: &str,
        subdirs: &[String],
    ) -> Result<(), ReplicationError> {
        self.folder_rescans
            .lock()
            .unwrap()
            .push((folder.to_string(), subdirs.to_vec()));
        Ok(())
    }

    async fn rescan_path(&self, path: &str) -> Result<(), ReplicationError> {
        self.path_rescans.lock().unwrap().push(path.to_string());
        Ok(())
    }

    async fn folder_completion(
        &self,
        folder: &str,
        _device: Option<&str>,
    ) -> Result<f64, ReplicationError> {
        self.completion_calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(folder)
            .and_then(VecDeque::pop_front)
            .unwrap_or(self.default_response);
        scripted.resolve()
    }

    async fn ping(&self) -> Result<(), ReplicationError> {
        Ok(())
    }
}
