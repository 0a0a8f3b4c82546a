//! Shared test doubles: an in-memory container runtime and image store,
//! plus a ready-made fleet fixture.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::config::FleetConfig;
use crate::fleet::LifecycleManager;
use crate::machine::RegistryStore;
use crate::runtime::{
    ContainerRuntime, CreateSpec, ExecOutput, ImageStore, InstanceState, RuntimeError,
    RuntimeResult, RuntimeStats,
};
use crate::ws::OwnerHub;

/// Disk usage reported by the fake `df` exec.
pub(crate) const DF_USED: u64 = 1_200_000;
pub(crate) const DF_LIMIT: u64 = 3_000_000_000;

const DF_OUTPUT: &str = "Filesystem     1B-blocks    Used  Available Use% Mounted on\n\
                         /dev/sda1     3000000000 1200000 2998800000   1% /data\n";

/// In-memory stand-in for the docker runtime.
#[derive(Default)]
pub(crate) struct FakeRuntime {
    /// Every spec passed to `create`, in order.
    pub(crate) created: Mutex<Vec<CreateSpec>>,
    /// Names of instances that currently exist.
    pub(crate) existing: Mutex<HashSet<String>>,
    /// Names of instances that are running.
    pub(crate) running: Mutex<HashSet<String>>,
    /// Every exec call as `(instance, argv)`.
    pub(crate) execs: Mutex<Vec<(String, Vec<String>)>>,
    /// Remaining `create` calls that should fail.
    pub(crate) fail_creates: AtomicU32,
    /// Instance names whose `stop` should fail.
    pub(crate) fail_stop_names: Mutex<HashSet<String>>,
    /// Number of network resets requested.
    pub(crate) network_resets: AtomicU32,
    /// Environment of the most recent `create`.
    pub(crate) last_env: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create(&self, spec: &CreateSpec) -> RuntimeResult<()> {
        if self.fail_creates.load(Ordering::SeqCst) > 0 {
            self.fail_creates.fetch_sub(1, Ordering::SeqCst);
            return Err(RuntimeError::CommandFailed {
                command: format!("docker run {}", spec.name),
                stderr: "network bridge allocation failed".to_string(),
            });
        }
        self.created.lock().unwrap().push(spec.clone());
        self.existing.lock().unwrap().insert(spec.name.clone());
        self.running.lock().unwrap().insert(spec.name.clone());
        *self.last_env.lock().unwrap() = spec.env.clone();
        Ok(())
    }

    async fn start(&self, name: &str) -> RuntimeResult<()> {
        if !self.existing.lock().unwrap().contains(name) {
            return Err(RuntimeError::NotFound(name.to_string()));
        }
        self.running.lock().unwrap().insert(name.to_string());
        Ok(())
    }

    async fn stop(&self, name: &str) -> RuntimeResult<()> {
        if self.fail_stop_names.lock().unwrap().contains(name) {
            return Err(RuntimeError::CommandFailed {
                command: format!("docker stop {}", name),
                stderr: "daemon timeout".to_string(),
            });
        }
        if !self.existing.lock().unwrap().contains(name) {
            return Err(RuntimeError::NotFound(name.to_string()));
        }
        self.running.lock().unwrap().remove(name);
        Ok(())
    }

    async fn remove(&self, name: &str) -> RuntimeResult<()> {
        if !self.existing.lock().unwrap().remove(name) {
            return Err(RuntimeError::NotFound(name.to_string()));
        }
        self.running.lock().unwrap().remove(name);
        Ok(())
    }

    async fn exec(&self, name: &str, argv: &[&str]) -> RuntimeResult<ExecOutput> {
        if !self.existing.lock().unwrap().contains(name) {
            return Err(RuntimeError::NotFound(name.to_string()));
        }
        self.execs.lock().unwrap().push((
            name.to_string(),
            argv.iter().map(|s| s.to_string()).collect(),
        ));
        let output = if argv.first() == Some(&"df") {
            DF_OUTPUT.to_string()
        } else {
            String::new()
        };
        Ok(ExecOutput {
            exit_code: 0,
            output,
        })
    }

    async fn copy_into(&self, name: &str, _local: &Path, _remote: &str) -> RuntimeResult<()> {
        if !self.existing.lock().unwrap().contains(name) {
            return Err(RuntimeError::NotFound(name.to_string()));
        }
        Ok(())
    }

    async fn copy_from(&self, name: &str, _remote: &str, _local: &Path) -> RuntimeResult<()> {
        if !self.existing.lock().unwrap().contains(name) {
            return Err(RuntimeError::NotFound(name.to_string()));
        }
        Ok(())
    }

    async fn inspect(&self, name: &str) -> RuntimeResult<InstanceState> {
        Ok(InstanceState {
            exists: self.existing.lock().unwrap().contains(name),
            running: self.running.lock().unwrap().contains(name),
        })
    }

    async fn stats(&self, name: &str) -> RuntimeResult<RuntimeStats> {
        if !self.running.lock().unwrap().contains(name) {
            return Err(RuntimeError::NotFound(name.to_string()));
        }
        Ok(RuntimeStats {
            cpu_percent: 1.5,
            mem_used: 1024,
            mem_limit: 53_687_091,
        })
    }

    async fn reset_network(&self) -> RuntimeResult<()> {
        self.network_resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn shell_command(&self, _name: &str, _login_user: &str) -> Vec<String> {
        vec!["/bin/cat".to_string()]
    }
}

/// In-memory image store.
#[derive(Default)]
pub(crate) struct FakeImages {
    pub(crate) present: Mutex<HashSet<String>>,
    pub(crate) builds: Mutex<Vec<String>>,
}

#[async_trait]
impl ImageStore for FakeImages {
    async fn image_exists(&self, image: &str) -> RuntimeResult<bool> {
        Ok(self.present.lock().unwrap().contains(image))
    }

    async fn build_image(
        &self,
        image: &str,
        _dockerfile: &Path,
        _context: &Path,
    ) -> RuntimeResult<()> {
        self.present.lock().unwrap().insert(image.to_string());
        self.builds.lock().unwrap().push(image.to_string());
        Ok(())
    }
}

/// A fleet wired to fakes, rooted in a temp directory.
pub(crate) struct Fixture {
    pub(crate) manager: Arc<LifecycleManager>,
    pub(crate) runtime: Arc<FakeRuntime>,
    pub(crate) images: Arc<FakeImages>,
    pub(crate) hub: Arc<OwnerHub>,
    _tmp: tempfile::TempDir,
}

pub(crate) fn fixture(max_machines: u32) -> Fixture {
    let tmp = tempfile::tempdir().unwrap();
    let config = FleetConfig {
        max_machines,
        data_dir: tmp.path().join("data"),
        build_context: tmp.path().to_path_buf(),
        registry_path: tmp.path().join("containers.json"),
        // Fast enough for tests that wait a few cycles.
        status_interval: Duration::from_millis(25),
        ..Default::default()
    };

    let store = RegistryStore::open(config.registry_path.clone()).unwrap();
    let runtime = Arc::new(FakeRuntime::default());
    let images = Arc::new(FakeImages::default());
    let runtime_api: Arc<dyn ContainerRuntime> = runtime.clone();
    let image_api: Arc<dyn ImageStore> = images.clone();
    let manager = Arc::new(LifecycleManager::new(store, runtime_api, image_api, config));

    Fixture {
        manager,
        runtime,
        images,
        hub: Arc::new(OwnerHub::new()),
        _tmp: tmp,
    }
}
