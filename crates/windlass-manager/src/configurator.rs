//! Machine configurator.
//!
//! Drives the asynchronous post-creation configuration workflow via
//! periodic polling, independent of the creation call. One single-threaded
//! worker owns the candidate set; each poll cycle consumes the "ready for
//! configuration" marker of any candidate carrying it and, when a local
//! configuration script exists for the candidate's target, executes it
//! asynchronously off the poll loop. The marker is a one-shot trigger, not
//! a retry token: the candidate is removed whether or not a script exists.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use windlass_model::AgentContext;

use crate::apps::ApplicationRegistry;
use crate::config::ConfiguratorConfig;

/// One instance awaiting post-creation configuration.
#[derive(Debug, Clone)]
struct Candidate {
    target_id: String,
}

/// Polls configuration candidates to completion.
pub struct MachineConfigurator {
    applications: Arc<ApplicationRegistry>,
    script_dir: PathBuf,
    domain: String,
    poll_interval: Duration,
    candidates: DashMap<AgentContext, Candidate>,
}

impl MachineConfigurator {
    /// Create a configurator over the application registry.
    #[must_use]
    pub fn new(
        applications: Arc<ApplicationRegistry>,
        config: &ConfiguratorConfig,
        domain: impl Into<String>,
    ) -> Self {
        Self {
            applications,
            script_dir: config.script_dir.clone(),
            domain: domain.into(),
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            candidates: DashMap::new(),
        }
    }

    /// Register an instance whose machine was just created.
    pub fn register_candidate(&self, context: AgentContext, target_id: impl Into<String>) {
        debug!(context = %context, "configuration candidate registered");
        self.candidates.insert(
            context,
            Candidate {
                target_id: target_id.into(),
            },
        );
    }

    /// Drop a candidate (its instance is being undeployed) so a stray
    /// script execution does not run against a since-terminated machine.
    pub fn cancel(&self, context: &AgentContext) {
        if self.candidates.remove(context).is_some() {
            debug!(context = %context, "configuration candidate cancelled");
        }
    }

    /// Number of instances currently awaiting configuration.
    #[must_use]
    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }

    /// Start the single polling worker. All candidate handling is
    /// serialized through this one task; only script executions run
    /// elsewhere.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                this.poll_once().await;
            }
        })
    }

    /// One poll cycle. Public so tests and embedders can drive the
    /// configurator without the worker task.
    pub async fn poll_once(&self) {
        let contexts: Vec<AgentContext> =
            self.candidates.iter().map(|r| r.key().clone()).collect();

        for context in contexts {
            let Ok(app) = self.applications.get(&context.application) else {
                self.candidates.remove(&context);
                continue;
            };
            let Some(instance) = app.get(&context.scoped_path) else {
                self.candidates.remove(&context);
                continue;
            };

            if !instance.data.awaiting_configuration {
                continue;
            }

            // Consume the one-shot marker and retire the candidate.
            if let Err(e) = app.update(&context.scoped_path, |i| {
                i.data.awaiting_configuration = false;
            }) {
                debug!(context = %context, error = %e, "instance vanished before marker clear");
            }
            let Some((_, candidate)) = self.candidates.remove(&context) else {
                continue;
            };

            let script = self
                .script_dir
                .join(&candidate.target_id)
                .join("configure.sh");
            if !script.is_file() {
                debug!(context = %context, "no local configuration script");
                continue;
            }

            let public_address = instance.data.public_address.clone().unwrap_or_default();
            let application = context.application.clone();
            let path = context.scoped_path.clone();
            let domain = self.domain.clone();

            info!(context = %context, script = %script.display(), "running configuration script");
            tokio::spawn(async move {
                let result = tokio::process::Command::new(&script)
                    .env("WINDLASS_APPLICATION", &application)
                    .env("WINDLASS_INSTANCE_PATH", path.as_str())
                    .env("WINDLASS_DOMAIN", &domain)
                    .env("WINDLASS_PUBLIC_ADDRESS", &public_address)
                    .stdin(Stdio::null())
                    .status()
                    .await;

                match result {
                    Ok(status) if status.success() => {
                        info!(instance = %path, "configuration script succeeded");
                    }
                    Ok(status) => {
                        warn!(instance = %path, %status, "configuration script failed");
                    }
                    Err(e) => {
                        warn!(instance = %path, error = %e, "configuration script did not run");
                    }
                }
            });
        }
    }
}

impl std::fmt::Debug for MachineConfigurator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachineConfigurator")
            .field("candidates", &self.candidates.len())
            .finish_non_exhaustive()
    }
}
