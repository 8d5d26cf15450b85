//! End-to-end image generation against one ComfyUI server.
//!
//! [`ImageGenerator`] runs the request pipeline: admission through the
//! [`ConcurrencyGate`], template preparation, push-channel open, workflow
//! submission, completion wait, output resolution, and download. Every
//! failure leaves as a classified [`GenerationError`], and the actor's
//! slot is released on every exit path.
//!
//! Request lifecycle events are broadcast via a
//! [`tokio::sync::broadcast`] channel. Call [`ImageGenerator::subscribe`]
//! to receive them.

use std::sync::Arc;
use std::time::Duration;

use relay_core::context::RequestContext;
use relay_core::error::{ErrorKind, GenerationError};
use relay_core::gate::ConcurrencyGate;
use relay_core::types::ActorId;
use tokio::sync::broadcast;

use crate::api::{ComfyUIApi, PromptId};
use crate::client::ComfyUIClient;
use crate::config::ComfyUIConfig;
use crate::events::GenerationEvent;
use crate::messages::ProgressData;
use crate::monitor::ExecutionMonitor;
use crate::template::WorkflowTemplate;

/// Broadcast channel capacity for generation events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Bound on the best-effort queue deletion after an abandoned request.
const ABANDON_TIMEOUT: Duration = Duration::from_secs(5);

/// Orchestrates image generation requests.
///
/// Created once at startup. The gate is passed in so that tests (and
/// multiple generators, if ever needed) control its scope.
pub struct ImageGenerator {
    api: ComfyUIApi,
    monitor: ExecutionMonitor,
    template: WorkflowTemplate,
    gate: Arc<ConcurrencyGate>,
    generation_timeout: Duration,
    event_tx: broadcast::Sender<GenerationEvent>,
}

impl ImageGenerator {
    pub fn new(
        api: ComfyUIApi,
        monitor: ExecutionMonitor,
        template: WorkflowTemplate,
        gate: Arc<ConcurrencyGate>,
        generation_timeout: Duration,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            api,
            monitor,
            template,
            gate,
            generation_timeout,
            event_tx,
        }
    }

    /// Build a generator from configuration, loading the workflow template.
    ///
    /// A missing or invalid template is an [`ErrorKind::InvalidJob`] error
    /// and should abort startup.
    pub fn from_config(
        config: &ComfyUIConfig,
        gate: Arc<ConcurrencyGate>,
    ) -> Result<Self, GenerationError> {
        let template = WorkflowTemplate::load(&config.workflow_path)?;

        let http = reqwest::Client::builder()
            .timeout(config.http_timeout())
            .build()
            .map_err(|e| {
                GenerationError::new(ErrorKind::BackendUnavailable, "failed to build HTTP client")
                    .with_source(e)
            })?;

        let api = ComfyUIApi::with_client(http, config.base_url.clone());
        let monitor = ExecutionMonitor::new(ComfyUIClient::new(config.ws_url.clone()), config.monitor());

        Ok(Self::new(api, monitor, template, gate, config.generation_timeout()))
    }

    /// Subscribe to generation lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<GenerationEvent> {
        self.event_tx.subscribe()
    }

    /// Number of generations currently in flight.
    pub fn active_count(&self) -> usize {
        self.gate.active_count()
    }

    /// Global cap on concurrent generations, `0` for none.
    pub fn max_concurrent(&self) -> usize {
        self.gate.max_global()
    }

    pub fn api(&self) -> &ComfyUIApi {
        &self.api
    }

    /// Re-read the workflow template. The previous template stays active
    /// if the new one is invalid.
    pub fn reload_template(&self) -> Result<(), GenerationError> {
        self.template.reload().map_err(GenerationError::from)
    }

    /// Check that the backend answers `GET /system_stats`.
    pub async fn check_health(&self, ctx: &RequestContext) -> Result<(), GenerationError> {
        ctx.run(async {
            self.api.check_health().await.map_err(|e| {
                tracing::warn!(api_url = %self.api.api_url(), error = %e, "ComfyUI health check failed");
                GenerationError::from(e)
            })
        })
        .await
    }

    /// Generate one image for `actor_id` from `prompt`.
    ///
    /// Returns the raw bytes of the first output image. Rejects
    /// immediately with [`ErrorKind::ConcurrencyConflict`] if the actor
    /// already has a generation in flight. The whole request is bounded by
    /// the configured generation timeout and by `ctx`.
    pub async fn generate_image(
        &self,
        ctx: &RequestContext,
        actor_id: ActorId,
        prompt: &str,
    ) -> Result<Vec<u8>, GenerationError> {
        let Some(_slot) = self.gate.acquire_slot(actor_id) else {
            tracing::info!(actor_id, "Generation already in progress for actor");
            return Err(GenerationError::concurrency_conflict(actor_id));
        };

        let ctx = ctx.child().with_timeout(self.generation_timeout);
        tracing::info!(actor_id, prompt_length = prompt.len(), "Starting generation");

        let mut prompt_id = None;
        let result = self.run_pipeline(&ctx, actor_id, prompt, &mut prompt_id).await;

        match &result {
            Ok(bytes) => {
                let prompt_id = prompt_id.as_ref().map(ToString::to_string).unwrap_or_default();
                tracing::info!(actor_id, prompt_id = %prompt_id, bytes = bytes.len(), "Generation complete");
                let _ = self.event_tx.send(GenerationEvent::Completed {
                    actor_id,
                    prompt_id,
                    bytes: bytes.len(),
                });
            }
            Err(e) => {
                if let (Some(id), ErrorKind::Cancelled | ErrorKind::Timeout) = (&prompt_id, e.kind()) {
                    self.abandon(id).await;
                }
                self.emit_failure(actor_id, prompt_id.as_ref(), e);
            }
        }

        result
    }

    // ---- private helpers ----

    async fn run_pipeline(
        &self,
        ctx: &RequestContext,
        actor_id: ActorId,
        prompt: &str,
        prompt_id_out: &mut Option<PromptId>,
    ) -> Result<Vec<u8>, GenerationError> {
        let workflow = self.template.prepare(prompt).map_err(|e| {
            tracing::error!(actor_id, error = %e, "Workflow preparation failed");
            GenerationError::from(e)
        })?;

        let mut session = self.monitor.open(ctx).await?;

        let prompt_id = ctx
            .run(async {
                self.api
                    .submit_workflow(&workflow, session.client_id())
                    .await
                    .map_err(GenerationError::from)
            })
            .await?;
        *prompt_id_out = Some(prompt_id.clone());

        tracing::debug!(actor_id, prompt_id = %prompt_id, client_id = %session.client_id(), "Prompt queued");
        let _ = self.event_tx.send(GenerationEvent::Submitted {
            actor_id,
            prompt_id: prompt_id.to_string(),
        });

        let on_progress = |p: &ProgressData| {
            let _ = self.event_tx.send(GenerationEvent::Progress {
                actor_id,
                prompt_id: prompt_id.to_string(),
                value: p.value,
                max: p.max,
                percent: p.percent(),
                current_node: p.node.clone(),
            });
        };
        session
            .wait_for_completion(&prompt_id, ctx, Some(&on_progress))
            .await?;

        let image = ctx
            .run(async {
                self.api.resolve_output(&prompt_id).await.map_err(|e| {
                    tracing::error!(prompt_id = %prompt_id, error = %e, "Output resolution failed");
                    GenerationError::from(e)
                })
            })
            .await?;

        tracing::debug!(
            prompt_id = %prompt_id,
            filename = %image.filename,
            subfolder = %image.subfolder,
            "Downloading output image",
        );

        ctx.run(async {
            self.api.download_image(&image).await.map_err(|e| {
                tracing::error!(prompt_id = %prompt_id, filename = %image.filename, error = %e, "Output download failed");
                GenerationError::from(e)
            })
        })
        .await
    }

    /// Best-effort removal of an abandoned prompt from the server queue.
    async fn abandon(&self, prompt_id: &PromptId) {
        match tokio::time::timeout(ABANDON_TIMEOUT, self.api.cancel_execution(prompt_id)).await {
            Ok(Ok(())) => tracing::debug!(prompt_id = %prompt_id, "Removed abandoned prompt from queue"),
            Ok(Err(e)) => tracing::warn!(prompt_id = %prompt_id, error = %e, "Failed to remove abandoned prompt"),
            Err(_) => tracing::warn!(prompt_id = %prompt_id, "Timed out removing abandoned prompt"),
        }
    }

    fn emit_failure(&self, actor_id: ActorId, prompt_id: Option<&PromptId>, err: &GenerationError) {
        let prompt_id = prompt_id.map(ToString::to_string);
        let event = if err.kind() == ErrorKind::Cancelled {
            tracing::debug!(actor_id, prompt_id = ?prompt_id, "Generation cancelled");
            GenerationEvent::Cancelled {
                actor_id,
                prompt_id,
            }
        } else {
            // The cause was logged by the stage that detected it.
            tracing::info!(actor_id, prompt_id = ?prompt_id, kind = %err.kind(), "Generation failed");
            GenerationEvent::Failed {
                actor_id,
                prompt_id,
                kind: err.kind(),
                error: err.to_string(),
            }
        };
        let _ = self.event_tx.send(event);
    }
}
