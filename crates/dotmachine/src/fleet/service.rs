//! Lifecycle manager - orchestrates machine lifecycle against the registry
//! and the container runtime.
//!
//! Every mutating operation validates ownership and capacity before any
//! runtime call, and holds the registry lock for its whole
//! load-mutate-save sequence. Compaction runs inside the same critical
//! section so a concurrent create can never allocate an id mid-shift.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use log::{info, warn};

use crate::config::FleetConfig;
use crate::error::{FleetError, FleetResult};
use crate::machine::{
    MachineKind, MachineRecord, MachineStatus, MachineView, Registry, RegistryStore, allocator,
    generate_secret,
};
use crate::runtime::{ContainerRuntime, CreateSpec, ImageStore, RuntimeError};

use super::domain;

/// Container-side ports every instance exposes; the host side is derived.
const SSH_CONTAINER_PORT: u16 = 22;
const FTP_CONTAINER_PORT: u16 = 21;
const HTTP_CONTAINER_PORT: u16 = 80;

/// Mount point of the persistent data directory inside the instance.
const DATA_MOUNT: &str = "/data";

/// Script baked into every image that creates or rotates the login user.
const CREATE_USER_SCRIPT: &str = "/usr/local/bin/create_user.sh";

/// Script that writes a site's reverse-proxy config and reloads nginx.
const SITE_CONFIG_SCRIPT: &str = "/usr/local/bin/generate_nginx_config.sh";

/// Power operations on a machine's backing instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    Start,
    Stop,
    Restart,
}

/// Live status snapshot for one machine.
#[derive(Debug, Clone, Copy)]
pub struct StatusProbe {
    pub status: MachineStatus,
    pub cpu_percent: f64,
    pub mem_used: u64,
    pub mem_limit: u64,
    pub disk_used: u64,
    pub disk_limit: u64,
}

impl StatusProbe {
    fn zeroed(status: MachineStatus) -> Self {
        Self {
            status,
            cpu_percent: 0.0,
            mem_used: 0,
            mem_limit: 0,
            disk_used: 0,
            disk_limit: 0,
        }
    }
}

/// Orchestrates create/remove/reset/renew and friends against the registry,
/// the allocator, and the container runtime.
pub struct LifecycleManager {
    store: RegistryStore,
    runtime: Arc<dyn ContainerRuntime>,
    images: Arc<dyn ImageStore>,
    config: FleetConfig,
}

impl LifecycleManager {
    pub fn new(
        store: RegistryStore,
        runtime: Arc<dyn ContainerRuntime>,
        images: Arc<dyn ImageStore>,
        config: FleetConfig,
    ) -> Self {
        Self {
            store,
            runtime,
            images,
            config,
        }
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub(crate) fn store(&self) -> &RegistryStore {
        &self.store
    }

    /// Create a machine for an owner.
    ///
    /// Returns the sanitized view and the one-time plaintext secret; this is
    /// the only moment the secret is handed out.
    pub async fn create(
        &self,
        owner_id: &str,
        login_name: &str,
        kind: MachineKind,
    ) -> FleetResult<(MachineView, String)> {
        let mut registry = self.store.lock().await;

        if registry.find_by_owner(owner_id).is_some() {
            return Err(FleetError::AlreadyOwned {
                owner_id: owner_id.to_string(),
            });
        }
        if registry.count() as u32 >= self.config.max_machines {
            return Err(FleetError::CapacityExhausted {
                max: self.config.max_machines,
            });
        }

        let id = allocator::next_id(&registry, self.config.max_machines)?;
        let name = allocator::derive_name(&self.config.name_prefix, id);
        let login_user = format!("{}{}", self.config.login_prefix, login_name);
        let secret = generate_secret();

        self.ensure_image(kind).await?;

        tokio::fs::create_dir_all(self.config.machine_data_dir(id)).await?;

        let spec = self.build_spec(id, kind, &login_user, &secret);
        self.provision(&spec).await?;
        self.create_login(&name, &login_user, &secret).await?;

        let now = Utc::now();
        let record = MachineRecord {
            id,
            name,
            owner_id: owner_id.to_string(),
            login_user,
            secret: secret.clone(),
            kind,
            sites: Vec::new(),
            created_at: now,
            expires_at: now + Duration::days(self.config.lease_days),
        };
        let view = record.view(self.config.port_bases);
        registry.machines.insert(id, record);
        registry.sync_next_id();
        self.store.persist(&registry)?;

        info!("created machine {} for owner {}", id, owner_id);
        Ok((view, secret))
    }

    /// Remove a machine owned by the caller, then compact the id space.
    pub async fn remove(&self, owner_id: &str, id: u32) -> FleetResult<()> {
        let mut registry = self.store.lock().await;
        let record = registry
            .machines
            .get(&id)
            .ok_or(FleetError::NotFound { id })?;
        if record.owner_id != owner_id {
            return Err(FleetError::NotOwner { id });
        }
        self.remove_locked(&mut registry, id).await
    }

    /// Removal with system authority (expiry reaping); no ownership check.
    pub(crate) async fn remove_unchecked(&self, id: u32) -> FleetResult<()> {
        let mut registry = self.store.lock().await;
        if !registry.machines.contains_key(&id) {
            return Err(FleetError::NotFound { id });
        }
        self.remove_locked(&mut registry, id).await
    }

    async fn remove_locked(&self, registry: &mut Registry, id: u32) -> FleetResult<()> {
        let record = match registry.machines.remove(&id) {
            Some(record) => record,
            None => return Err(FleetError::NotFound { id }),
        };

        // Best-effort: the registry entry must be removable even when the
        // backing instance is already gone.
        self.teardown(&record.name).await;

        let data_dir = self.config.machine_data_dir(id);
        if let Err(err) = tokio::fs::remove_dir_all(&data_dir).await
            && err.kind() != std::io::ErrorKind::NotFound
        {
            warn!("failed to delete data dir {:?}: {}", data_dir, err);
        }

        let result = self.compact(registry, id).await;
        registry.sync_next_id();
        self.store.persist(registry)?;
        info!("removed machine {}", id);
        result
    }

    /// Replace a machine's instance and credential, keeping its id, ports,
    /// and data directory.
    pub async fn reset(&self, owner_id: &str, id: u32) -> FleetResult<String> {
        let mut registry = self.store.lock().await;
        let record = registry
            .machines
            .get(&id)
            .ok_or(FleetError::NotFound { id })?;
        if record.owner_id != owner_id {
            return Err(FleetError::NotOwner { id });
        }
        let record = record.clone();

        self.teardown(&record.name).await;

        // Only the instance is replaced; the data directory survives.
        tokio::fs::create_dir_all(self.config.machine_data_dir(id)).await?;

        let secret = generate_secret();
        let spec = self.build_spec(id, record.kind, &record.login_user, &secret);
        self.provision(&spec).await?;
        self.create_login(&record.name, &record.login_user, &secret).await?;

        if let Some(stored) = registry.machines.get_mut(&id) {
            stored.secret = secret.clone();
        }
        self.store.persist(&registry)?;
        info!("reset machine {}", id);
        Ok(secret)
    }

    /// Extend a machine's lease. An unexpired lease stacks; an expired one
    /// restarts from now, so renewal can never shorten a lease.
    pub async fn renew(
        &self,
        owner_id: &str,
        id: u32,
        lease_days: i64,
    ) -> FleetResult<DateTime<Utc>> {
        let mut registry = self.store.lock().await;
        let record = registry
            .machines
            .get_mut(&id)
            .ok_or(FleetError::NotFound { id })?;
        if record.owner_id != owner_id {
            return Err(FleetError::NotOwner { id });
        }

        let now = Utc::now();
        let base = if record.expires_at < now {
            now
        } else {
            record.expires_at
        };
        record.expires_at = base + Duration::days(lease_days);
        let expires_at = record.expires_at;

        self.store.persist(&registry)?;
        info!("renewed machine {} until {}", id, expires_at);
        Ok(expires_at)
    }

    /// Serve a new domain from the machine.
    pub async fn add_site(&self, owner_id: &str, id: u32, domain: &str) -> FleetResult<()> {
        if !domain::validate_domain(domain) {
            return Err(FleetError::InvalidDomain(domain.to_string()));
        }

        let mut registry = self.store.lock().await;
        let record = registry
            .machines
            .get(&id)
            .ok_or(FleetError::NotFound { id })?;
        if record.owner_id != owner_id {
            return Err(FleetError::NotOwner { id });
        }
        if record.sites.iter().any(|s| s == domain) {
            return Ok(());
        }
        let name = record.name.clone();

        let out = self.runtime.exec(&name, &[SITE_CONFIG_SCRIPT, domain]).await?;
        if !out.success() {
            return Err(RuntimeError::ExecFailed {
                container: name,
                exit_code: out.exit_code,
                output: out.output,
            }
            .into());
        }

        if let Some(record) = registry.machines.get_mut(&id) {
            record.sites.push(domain.to_string());
        }
        self.store.persist(&registry)?;
        info!("machine {} now serves {}", id, domain);
        Ok(())
    }

    /// Stop serving a domain.
    pub async fn remove_site(&self, owner_id: &str, id: u32, domain: &str) -> FleetResult<()> {
        if !domain::validate_domain(domain) {
            return Err(FleetError::InvalidDomain(domain.to_string()));
        }

        let mut registry = self.store.lock().await;
        let record = registry
            .machines
            .get(&id)
            .ok_or(FleetError::NotFound { id })?;
        if record.owner_id != owner_id {
            return Err(FleetError::NotOwner { id });
        }
        let name = record.name.clone();

        // Config teardown inside the instance is best-effort; the site list
        // must shrink regardless.
        let conf = format!("/etc/nginx/sites-enabled/{}.conf", domain);
        let web_root = format!("{}/www/{}", DATA_MOUNT, domain);
        self.exec_best_effort(&name, &["rm", "-f", &conf]).await;
        self.exec_best_effort(&name, &["rm", "-rf", &web_root]).await;
        self.exec_best_effort(&name, &["nginx", "-s", "reload"]).await;

        if let Some(record) = registry.machines.get_mut(&id) {
            record.sites.retain(|s| s != domain);
        }
        self.store.persist(&registry)?;
        info!("machine {} no longer serves {}", id, domain);
        Ok(())
    }

    /// Start, stop, or restart a machine's backing instance.
    pub async fn power(&self, owner_id: &str, id: u32, action: PowerAction) -> FleetResult<()> {
        let registry = self.store.lock().await;
        let record = registry
            .machines
            .get(&id)
            .ok_or(FleetError::NotFound { id })?;
        if record.owner_id != owner_id {
            return Err(FleetError::NotOwner { id });
        }
        let name = record.name.clone();

        match action {
            PowerAction::Start => self.runtime.start(&name).await?,
            PowerAction::Stop => self.runtime.stop(&name).await?,
            PowerAction::Restart => {
                self.runtime.stop(&name).await?;
                self.runtime.start(&name).await?;
            }
        }
        Ok(())
    }

    /// Copy a file out of the machine.
    pub async fn pull_file(
        &self,
        owner_id: &str,
        id: u32,
        remote: &str,
        local: &Path,
    ) -> FleetResult<()> {
        let view = self.authorize(owner_id, id).await?;
        self.runtime.copy_from(&view.name, remote, local).await?;
        Ok(())
    }

    /// Copy a local file into the machine.
    pub async fn push_file(
        &self,
        owner_id: &str,
        id: u32,
        local: &Path,
        remote: &str,
    ) -> FleetResult<()> {
        let view = self.authorize(owner_id, id).await?;
        self.runtime.copy_into(&view.name, local, remote).await?;
        Ok(())
    }

    /// Check that `owner_id` owns machine `id` and return its view.
    pub async fn authorize(&self, owner_id: &str, id: u32) -> FleetResult<MachineView> {
        let registry = self.store.lock().await;
        let record = registry
            .machines
            .get(&id)
            .ok_or(FleetError::NotFound { id })?;
        if record.owner_id != owner_id {
            return Err(FleetError::NotOwner { id });
        }
        Ok(record.view(self.config.port_bases))
    }

    /// The caller's machine, if they have one.
    pub async fn describe(&self, owner_id: &str) -> Option<MachineView> {
        let registry = self.store.lock().await;
        registry
            .find_by_owner(owner_id)
            .map(|r| r.view(self.config.port_bases))
    }

    /// Current machine count and the capacity ceiling.
    pub async fn fleet_usage(&self) -> (usize, u32) {
        let registry = self.store.lock().await;
        (registry.count(), self.config.max_machines)
    }

    /// Live status for the caller's machine.
    pub async fn status(&self, owner_id: &str, id: u32) -> FleetResult<StatusProbe> {
        let view = self.authorize(owner_id, id).await?;
        Ok(self.probe_status(&view.name).await)
    }

    /// Probe an instance for its live status and metrics. Never fails: a
    /// runtime error degrades to `MachineStatus::Error` with zeroed metrics.
    pub async fn probe_status(&self, name: &str) -> StatusProbe {
        let state = match self.runtime.inspect(name).await {
            Ok(state) => state,
            Err(err) => {
                warn!("inspect of {} failed: {}", name, err);
                return StatusProbe::zeroed(MachineStatus::Error);
            }
        };
        if !state.exists {
            return StatusProbe::zeroed(MachineStatus::Error);
        }
        if !state.running {
            return StatusProbe::zeroed(MachineStatus::Stopped);
        }

        let stats = match self.runtime.stats(name).await {
            Ok(stats) => stats,
            Err(err) => {
                warn!("stats of {} failed: {}", name, err);
                return StatusProbe::zeroed(MachineStatus::Error);
            }
        };
        let (disk_used, disk_limit) = self.probe_disk(name).await;
        StatusProbe {
            status: MachineStatus::Running,
            cpu_percent: stats.cpu_percent,
            mem_used: stats.mem_used,
            mem_limit: stats.mem_limit,
            disk_used,
            disk_limit,
        }
    }

    async fn probe_disk(&self, name: &str) -> (u64, u64) {
        match self.runtime.exec(name, &["df", "-B1", DATA_MOUNT]).await {
            Ok(out) if out.success() => parse_df(&out.output).unwrap_or((0, 0)),
            _ => (0, 0),
        }
    }

    // ========================================================================
    // Internals
    // ========================================================================

    async fn ensure_image(&self, kind: MachineKind) -> FleetResult<()> {
        let image = kind.image();
        if !self.images.image_exists(&image).await? {
            info!("image {} absent, building", image);
            let dockerfile = self.config.build_context.join(kind.dockerfile());
            self.images
                .build_image(&image, &dockerfile, &self.config.build_context)
                .await?;
        }
        Ok(())
    }

    fn build_spec(&self, id: u32, kind: MachineKind, login_user: &str, secret: &str) -> CreateSpec {
        let name = allocator::derive_name(&self.config.name_prefix, id);
        let ports = allocator::derive_ports(self.config.port_bases, id);
        let data_dir = self.config.machine_data_dir(id);
        let data_dir = std::fs::canonicalize(&data_dir).unwrap_or(data_dir);

        CreateSpec {
            name,
            image: kind.image(),
            ports: vec![
                (ports.ssh, SSH_CONTAINER_PORT),
                (ports.ftp, FTP_CONTAINER_PORT),
                (ports.http, HTTP_CONTAINER_PORT),
            ],
            volumes: vec![(data_dir.to_string_lossy().into_owned(), DATA_MOUNT.to_string())],
            env: HashMap::from([
                ("CONTAINER_USER".to_string(), login_user.to_string()),
                ("CONTAINER_PASSWORD".to_string(), secret.to_string()),
            ]),
            cpu_period: self.config.limits.cpu_period,
            cpu_quota: self.config.limits.cpu_quota,
            memory_mb: self.config.limits.memory_mb,
            storage: self.config.limits.storage.clone(),
        }
    }

    /// Start an instance, retrying exactly once after a network-layer reset.
    /// Stale network allocations are a known transient fault mode.
    async fn provision(&self, spec: &CreateSpec) -> FleetResult<()> {
        match self.runtime.create(spec).await {
            Ok(()) => Ok(()),
            Err(first) => {
                warn!(
                    "instance start failed for {}, resetting network and retrying: {}",
                    spec.name, first
                );
                if let Err(err) = self.runtime.reset_network().await {
                    warn!("network reset failed: {}", err);
                }
                self.teardown(&spec.name).await;
                self.runtime.create(spec).await.map_err(FleetError::from)
            }
        }
    }

    async fn create_login(&self, name: &str, login_user: &str, secret: &str) -> FleetResult<()> {
        let out = self
            .runtime
            .exec(name, &[CREATE_USER_SCRIPT, login_user, secret])
            .await?;
        if !out.success() {
            return Err(RuntimeError::ExecFailed {
                container: name.to_string(),
                exit_code: out.exit_code,
                output: out.output,
            }
            .into());
        }
        Ok(())
    }

    /// Best-effort stop + remove of an instance.
    async fn teardown(&self, name: &str) {
        if let Err(err) = self.runtime.stop(name).await {
            warn!("stop of {} failed (continuing): {}", name, err);
        }
        if let Err(err) = self.runtime.remove(name).await {
            warn!("removal of {} failed (continuing): {}", name, err);
        }
    }

    async fn exec_best_effort(&self, name: &str, argv: &[&str]) {
        if let Err(err) = self.runtime.exec(name, argv).await {
            warn!("exec in {} failed (continuing): {:?}: {}", name, argv, err);
        }
    }

    /// Shift every record above the freed id down by one, ascending.
    ///
    /// On the first failed shift, stop: already-shifted records keep their
    /// new ids, the rest keep their old ones. A sparse id space is an
    /// acceptable degraded state; a lost or duplicated machine is not.
    async fn compact(&self, registry: &mut Registry, removed_id: u32) -> FleetResult<()> {
        let shifts = allocator::compaction_shifts(registry, removed_id);
        let mut shifted = 0usize;
        for (old_id, new_id) in shifts {
            if let Err(err) = self.shift(registry, old_id, new_id).await {
                warn!(
                    "compaction shift {} -> {} failed, leaving id space sparse: {}",
                    old_id, new_id, err
                );
                return Err(FleetError::CompactionFailed {
                    shifted,
                    failed_id: old_id,
                    reason: err.to_string(),
                });
            }
            shifted += 1;
        }
        Ok(())
    }

    /// Renumber one machine. Ports are a function of the id, so the
    /// instance must be recreated under the new name with new bindings.
    async fn shift(&self, registry: &mut Registry, old_id: u32, new_id: u32) -> FleetResult<()> {
        let record = registry
            .machines
            .get(&old_id)
            .cloned()
            .ok_or(FleetError::NotFound { id: old_id })?;
        let new_name = allocator::derive_name(&self.config.name_prefix, new_id);

        self.runtime.stop(&record.name).await?;
        self.runtime.remove(&record.name).await?;

        let old_dir = self.config.machine_data_dir(old_id);
        let new_dir = self.config.machine_data_dir(new_id);
        match tokio::fs::remove_dir_all(&new_dir).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        tokio::fs::rename(&old_dir, &new_dir).await?;

        let spec = self.build_spec(new_id, record.kind, &record.login_user, &record.secret);
        self.runtime.create(&spec).await?;
        self.create_login(&new_name, &record.login_user, &record.secret)
            .await?;

        let mut record = registry
            .machines
            .remove(&old_id)
            .ok_or(FleetError::NotFound { id: old_id })?;
        record.id = new_id;
        record.name = new_name;
        registry.machines.insert(new_id, record);
        Ok(())
    }
}

/// Parse `df -B1 <mount>` output into `(used, limit)` bytes.
fn parse_df(output: &str) -> Option<(u64, u64)> {
    let line = output.lines().nth(1)?;
    let mut fields = line.split_whitespace();
    let _filesystem = fields.next()?;
    let limit: u64 = fields.next()?.parse().ok()?;
    let used: u64 = fields.next()?.parse().ok()?;
    Some((used, limit))
}
