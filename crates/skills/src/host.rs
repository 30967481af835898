//! Skill host service
//!
//! Walks the skills directory for manifests, subscribes on behalf of each
//! skill, and dispatches inbound messages to sandboxed invocations through a
//! bounded worker pool. Every invocation is recorded into the audit store
//! under the skill's canonical session (`skill:<name>`).

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::StreamExt;
use loqa_bus::{BusClient, Publisher};
use loqa_config::SkillsConfig;
use loqa_store::{EventStore, NewEvent};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use walkdir::WalkDir;

use crate::sandbox::{self, HostAuditEvent, HostBindings};
use crate::{Manifest, SkillError};

const INVOKE_DEADLINE: Duration = Duration::from_secs(30);
const AUDIT_DEADLINE: Duration = Duration::from_secs(2);

/// One discovered skill, immutable after startup.
pub struct SkillBinding {
    pub manifest: Manifest,
    pub manifest_path: PathBuf,
    pub module_path: PathBuf,
    pub directory: PathBuf,
    pub subscribe_list: Vec<String>,
    pub audit_session_id: String,
    publish_set: HashSet<String>,
    permissions: HashSet<String>,
}

impl SkillBinding {
    pub fn from_manifest(manifest: Manifest, manifest_path: &Path) -> Self {
        let directory = manifest_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let module = Path::new(&manifest.runtime.module);
        let module_path = if module.is_absolute() {
            module.to_path_buf()
        } else {
            directory.join(module)
        };
        Self {
            audit_session_id: format!("skill:{}", manifest.metadata.name),
            publish_set: manifest.capabilities.bus.publish.iter().cloned().collect(),
            subscribe_list: manifest.capabilities.bus.subscribe.clone(),
            permissions: manifest.permissions.iter().cloned().collect(),
            manifest_path: manifest_path.to_path_buf(),
            module_path,
            directory,
            manifest,
        }
    }

    pub fn name(&self) -> &str {
        &self.manifest.metadata.name
    }

    /// Publish gate: requires the `bus:publish` permission and an exact match
    /// against the declared publish subjects.
    pub fn allow_publish(&self, subject: &str) -> Result<(), String> {
        if !self.permissions.contains("bus:publish") {
            return Err("missing permission bus:publish".to_string());
        }
        if !self.publish_set.contains(subject) {
            return Err(format!("subject {subject} not declared in manifest"));
        }
        Ok(())
    }
}

struct AuditJob {
    binding: Arc<SkillBinding>,
    invocation_id: String,
    event_type: String,
    data: serde_json::Value,
}

/// Skill host service handle.
pub struct SkillHost {
    cfg: SkillsConfig,
    publisher: Arc<dyn Publisher>,
    skills: HashMap<String, Arc<SkillBinding>>,
    semaphore: Arc<Semaphore>,
    audit_tx: mpsc::UnboundedSender<AuditJob>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    healthy: AtomicBool,
}

impl SkillHost {
    /// Discover skills, register subscriptions and start dispatching.
    /// Returns `None` when the host is disabled. Subscription failures abort
    /// startup; manifest failures only skip the offending skill.
    pub async fn start(
        cfg: SkillsConfig,
        bus: &BusClient,
        store: EventStore,
    ) -> Result<Option<Arc<Self>>, SkillError> {
        if !cfg.enabled {
            return Ok(None);
        }
        let host = Self::build(cfg, Arc::new(bus.clone()), store)?;
        host.subscribe_all(bus).await?;
        host.healthy.store(true, Ordering::Release);
        Ok(Some(host))
    }

    fn build(
        cfg: SkillsConfig,
        publisher: Arc<dyn Publisher>,
        store: EventStore,
    ) -> Result<Arc<Self>, SkillError> {
        let skills = discover(Path::new(&cfg.directory))?;
        if skills.is_empty() {
            tracing::warn!(directory = %cfg.directory, "no skills discovered");
        } else {
            tracing::info!(count = skills.len(), "skills discovered");
        }

        let concurrency = cfg.max_concurrency.max(1);
        let (shutdown, _) = watch::channel(false);
        let (audit_tx, audit_rx) = mpsc::unbounded_channel();

        let host = Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(concurrency)),
            publisher,
            skills,
            audit_tx,
            shutdown,
            tasks: Mutex::new(Vec::new()),
            healthy: AtomicBool::new(false),
            cfg,
        });
        host.spawn_audit_writer(store, audit_rx);
        Ok(host)
    }

    async fn subscribe_all(self: &Arc<Self>, bus: &BusClient) -> Result<(), SkillError> {
        for binding in self.skills.values() {
            for subject in &binding.subscribe_list {
                let mut sub = bus.subscribe(subject).await?;
                tracing::info!(skill = binding.name(), subject, "skill subscribed");

                let host = Arc::clone(self);
                let binding = Arc::clone(binding);
                let mut shutdown = self.shutdown.subscribe();
                self.tasks.lock().push(tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            msg = sub.next() => {
                                let Some(msg) = msg else { break };
                                let host = Arc::clone(&host);
                                let binding = Arc::clone(&binding);
                                // Hand off immediately; the worker pool bounds
                                // actual executions.
                                tokio::spawn(async move {
                                    let subject = msg.subject.to_string();
                                    let reply = msg.reply.as_ref().map(ToString::to_string);
                                    if let Err(error) = host
                                        .invoke(binding.clone(), subject.clone(), msg.payload.to_vec(), reply)
                                        .await
                                    {
                                        tracing::error!(
                                            skill = binding.name(),
                                            subject,
                                            %error,
                                            "skill invocation failed"
                                        );
                                    }
                                });
                            }
                            _ = shutdown.changed() => {
                                let _ = sub.unsubscribe().await;
                                break;
                            }
                        }
                    }
                }));
            }
        }
        Ok(())
    }

    pub async fn close(&self) {
        let _ = self.shutdown.send(true);
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }

    pub fn healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Number of registered skills.
    pub fn skill_count(&self) -> usize {
        self.skills.len()
    }

    /// Execute one inbound message against a skill in a fresh sandbox.
    pub(crate) async fn invoke(
        self: &Arc<Self>,
        binding: Arc<SkillBinding>,
        subject: String,
        payload: Vec<u8>,
        reply: Option<String>,
    ) -> Result<(), SkillError> {
        let _permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SkillError::Sandbox("worker pool closed".to_string()))?;

        let invocation_id = uuid::Uuid::new_v4().to_string();
        let started = Instant::now();

        self.append_audit(
            &binding,
            &invocation_id,
            "skill.invoke.start",
            serde_json::json!({ "subject": subject }),
        );

        let mut env = vec![
            ("LOQA_SKILL_NAME".to_string(), binding.name().to_string()),
            ("LOQA_EVENT_SUBJECT".to_string(), subject.clone()),
            (
                "LOQA_EVENT_PAYLOAD".to_string(),
                String::from_utf8_lossy(&payload).into_owned(),
            ),
            ("LOQA_INVOCATION_ID".to_string(), invocation_id.clone()),
            (
                "LOQA_SKILL_DIRECTORY".to_string(),
                binding.directory.to_string_lossy().into_owned(),
            ),
        ];
        if let Some(reply) = reply {
            env.push(("LOQA_EVENT_REPLY".to_string(), reply));
        }

        let host_bindings = self.host_bindings(&binding, &invocation_id);
        let module_path = binding.module_path.clone();
        let entrypoint = binding.manifest.runtime.entrypoint.clone();

        let outcome = tokio::task::spawn_blocking(move || {
            sandbox::invoke(&module_path, &entrypoint, &env, host_bindings, INVOKE_DEADLINE)
        })
        .await
        .map_err(|e| SkillError::Sandbox(format!("sandbox task: {e}")))
        .and_then(|result| result);

        match outcome {
            Ok(()) => {
                metrics::counter!(
                    "loqa_skill_invocations_total",
                    "skill" => binding.name().to_string(),
                    "outcome" => "ok",
                )
                .increment(1);
                self.append_audit(
                    &binding,
                    &invocation_id,
                    "skill.invoke.complete",
                    serde_json::json!({ "duration_ms": started.elapsed().as_millis() as u64 }),
                );
                Ok(())
            }
            Err(error) => {
                metrics::counter!(
                    "loqa_skill_invocations_total",
                    "skill" => binding.name().to_string(),
                    "outcome" => "error",
                )
                .increment(1);
                self.append_audit(
                    &binding,
                    &invocation_id,
                    "skill.invoke.error",
                    serde_json::json!({ "error": error.to_string() }),
                );
                Err(error)
            }
        }
    }

    fn host_bindings(&self, binding: &Arc<SkillBinding>, invocation_id: &str) -> HostBindings {
        let allow = Arc::clone(binding);
        let publisher = Arc::clone(&self.publisher);
        let runtime = tokio::runtime::Handle::current();
        let audit_binding = Arc::clone(binding);
        let audit_tx = self.audit_tx.clone();
        let audit_invocation = invocation_id.to_string();

        HostBindings {
            skill: binding.name().to_string(),
            allow_publish: Box::new(move |subject| allow.allow_publish(subject)),
            publish: Box::new(move |subject, payload| {
                runtime
                    .block_on(publisher.publish(subject, Bytes::copy_from_slice(payload)))
                    .map_err(|e| e.to_string())
            }),
            record_audit: Box::new(move |event: HostAuditEvent| {
                let _ = audit_tx.send(AuditJob {
                    binding: Arc::clone(&audit_binding),
                    invocation_id: audit_invocation.clone(),
                    event_type: event.event_type.to_string(),
                    data: event.data,
                });
            }),
        }
    }

    fn append_audit(
        &self,
        binding: &Arc<SkillBinding>,
        invocation_id: &str,
        event_type: &str,
        data: serde_json::Value,
    ) {
        let _ = self.audit_tx.send(AuditJob {
            binding: Arc::clone(binding),
            invocation_id: invocation_id.to_string(),
            event_type: event_type.to_string(),
            data,
        });
    }

    /// Single consumer draining audit jobs into the store; serializes the
    /// timeline per skill session. Ends when the host is dropped.
    fn spawn_audit_writer(&self, store: EventStore, mut rx: mpsc::UnboundedReceiver<AuditJob>) {
        let privacy = self.cfg.audit_privacy.clone();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let mut payload = serde_json::json!({
                    "invocation_id": job.invocation_id,
                    "skill": job.binding.name(),
                });
                if let (Some(base), Some(extra)) = (payload.as_object_mut(), job.data.as_object())
                {
                    for (key, value) in extra {
                        base.insert(key.clone(), value.clone());
                    }
                }
                let ensure = tokio::time::timeout(
                    AUDIT_DEADLINE,
                    store.ensure_session(
                        &job.binding.audit_session_id,
                        Some(job.binding.name()),
                        &privacy,
                    ),
                )
                .await;
                if !matches!(ensure, Ok(Ok(()))) {
                    tracing::warn!(skill = job.binding.name(), "failed to ensure audit session");
                    continue;
                }
                let event = NewEvent {
                    session_id: job.binding.audit_session_id.clone(),
                    actor_id: Some(job.binding.name().to_string()),
                    event_type: job.event_type.clone(),
                    payload: serde_json::to_vec(&payload).unwrap_or_default(),
                    privacy_scope: privacy.clone(),
                    ..NewEvent::default()
                };
                let append = tokio::time::timeout(AUDIT_DEADLINE, store.append_event(event)).await;
                if !matches!(append, Ok(Ok(()))) {
                    tracing::warn!(skill = job.binding.name(), "failed to append audit event");
                }
            }
        });
    }
}

/// Walk a directory tree and load every valid `skill.yaml`. Invalid
/// manifests and duplicate names are logged and skipped; the walk itself
/// failing is fatal.
pub fn discover(root: &Path) -> Result<HashMap<String, Arc<SkillBinding>>, SkillError> {
    let mut skills: HashMap<String, Arc<SkillBinding>> = HashMap::new();
    for entry in WalkDir::new(root) {
        let entry = entry.map_err(|e| SkillError::Io(std::io::Error::other(e)))?;
        if !entry.file_type().is_file() {
            continue;
        }
        if !entry
            .file_name()
            .to_string_lossy()
            .eq_ignore_ascii_case("skill.yaml")
        {
            continue;
        }
        match load_binding(entry.path()) {
            Ok(binding) => {
                let name = binding.name().to_string();
                if skills.contains_key(&name) {
                    tracing::error!(
                        path = %entry.path().display(),
                        %name,
                        "failed to load skill: duplicate skill name"
                    );
                    continue;
                }
                skills.insert(name, Arc::new(binding));
            }
            Err(error) => {
                tracing::error!(path = %entry.path().display(), %error, "failed to load skill");
            }
        }
    }
    Ok(skills)
}

fn load_binding(manifest_path: &Path) -> Result<SkillBinding, SkillError> {
    let manifest = Manifest::load(manifest_path)?;
    manifest.validate()?;
    Ok(SkillBinding::from_manifest(manifest, manifest_path))
}
