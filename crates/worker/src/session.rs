//! Line-oriented operator session driving an [`ImageGenerator`].
//!
//! Each generation request runs in its own task under a child of the root
//! cancellation token. When input ends or the root token is cancelled,
//! in-flight requests are cancelled and given [`SHUTDOWN_GRACE`] to wind
//! down.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use relay_comfyui::events::GenerationEvent;
use relay_comfyui::generator::ImageGenerator;
use relay_core::context::RequestContext;
use relay_core::error::ErrorKind;
use relay_core::types::ActorId;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::command::{parse_line, Command};

/// How long in-flight requests get to finish after shutdown begins.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

pub struct Session {
    generator: Arc<ImageGenerator>,
    output_dir: PathBuf,
    root: CancellationToken,
    tasks: JoinSet<()>,
}

impl Session {
    pub fn new(generator: Arc<ImageGenerator>, output_dir: PathBuf, root: CancellationToken) -> Self {
        Self {
            generator,
            output_dir,
            root,
            tasks: JoinSet::new(),
        }
    }

    /// Process `input` until it ends or the root token is cancelled, then
    /// shut down.
    pub async fn run<R>(mut self, input: R)
    where
        R: AsyncBufRead + Unpin,
    {
        let progress = tokio::spawn(print_progress(self.generator.subscribe()));
        let mut lines = input.lines();

        loop {
            tokio::select! {
                biased;
                _ = self.root.cancelled() => {
                    tracing::info!("Shutdown requested");
                    break;
                }
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "Generation task panicked");
                    }
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => self.dispatch(&line).await,
                    Ok(None) => {
                        tracing::info!("Input closed");
                        break;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to read input");
                        break;
                    }
                },
            }
        }

        self.shutdown().await;
        progress.abort();
    }

    async fn dispatch(&mut self, line: &str) {
        match parse_line(line) {
            Ok(Command::Empty) => {}
            Ok(Command::Status) => self.status().await,
            Ok(Command::Reload) => match self.generator.reload_template() {
                Ok(()) => println!("Workflow template reloaded"),
                Err(e) => println!("Reload failed: {e}"),
            },
            Ok(Command::Generate { actor_id, prompt }) => self.spawn_generation(actor_id, prompt),
            Err(e) => println!("{e}"),
        }
    }

    async fn status(&self) {
        let ctx = RequestContext::new(self.root.child_token());
        let healthy = self.generator.check_health(&ctx).await.is_ok();
        println!(
            "{}",
            status_line(
                healthy,
                self.generator.active_count(),
                self.generator.max_concurrent()
            )
        );
    }

    fn spawn_generation(&mut self, actor_id: ActorId, prompt: String) {
        let generator = Arc::clone(&self.generator);
        let output_dir = self.output_dir.clone();
        let ctx = RequestContext::new(self.root.child_token());

        self.tasks.spawn(async move {
            match generator.generate_image(&ctx, actor_id, &prompt).await {
                Ok(bytes) => match save_image(&output_dir, actor_id, &bytes).await {
                    Ok(path) => println!("[{actor_id}] Saved {}", path.display()),
                    Err(e) => {
                        tracing::error!(actor_id, dir = %output_dir.display(), error = %e, "Failed to write image");
                        println!("[{actor_id}] Image generated but could not be saved");
                    }
                },
                Err(e) if e.kind() == ErrorKind::Cancelled => {}
                Err(e) => println!("[{actor_id}] {}", e.user_message()),
            }
        });
    }

    async fn shutdown(&mut self) {
        self.root.cancel();
        if self.tasks.is_empty() {
            return;
        }

        tracing::info!(in_flight = self.tasks.len(), "Waiting for in-flight generations");
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while self.tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            tracing::warn!(remaining = self.tasks.len(), "Grace period elapsed, aborting generations");
            self.tasks.abort_all();
        }
    }
}

fn status_line(healthy: bool, active: usize, max_concurrent: usize) -> String {
    let backend = if healthy { "healthy" } else { "unreachable" };
    if max_concurrent == 0 {
        format!("ComfyUI: {backend} | active generations: {active}")
    } else {
        format!("ComfyUI: {backend} | active generations: {active}/{max_concurrent}")
    }
}

/// Write `bytes` to `<dir>/<actor_id>-<timestamp>.png`.
pub async fn save_image(dir: &Path, actor_id: ActorId, bytes: &[u8]) -> std::io::Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
    let path = dir.join(format!("{actor_id}-{stamp}.png"));
    tokio::fs::write(&path, bytes).await?;
    Ok(path)
}

async fn print_progress(mut events: broadcast::Receiver<GenerationEvent>) {
    loop {
        match events.recv().await {
            Ok(GenerationEvent::Progress {
                actor_id, percent, ..
            }) => println!("[{actor_id}] {percent}%"),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "Progress printer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use relay_comfyui::api::ComfyUIApi;
    use relay_comfyui::client::ComfyUIClient;
    use relay_comfyui::monitor::{ExecutionMonitor, MonitorConfig};
    use relay_comfyui::template::WorkflowTemplate;
    use relay_core::gate::ConcurrencyGate;
    use tokio::io::AsyncWriteExt;

    use super::*;

    /// A generator whose backend is unreachable.
    fn offline_generator() -> Arc<ImageGenerator> {
        Arc::new(ImageGenerator::new(
            ComfyUIApi::new("http://127.0.0.1:1".into()),
            ExecutionMonitor::new(
                ComfyUIClient::new("ws://127.0.0.1:1/ws".into()),
                MonitorConfig::default(),
            ),
            WorkflowTemplate::from_text(r#"{"text": "{{PROMPT}}"}"#).unwrap(),
            Arc::new(ConcurrencyGate::new(0)),
            Duration::from_secs(5),
        ))
    }

    #[tokio::test]
    async fn save_image_writes_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("images");

        let path = save_image(&nested, 12, b"png").await.unwrap();

        assert!(path.starts_with(&nested));
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("12-") && name.ends_with(".png"));
        assert_eq!(std::fs::read(&path).unwrap(), b"png");
    }

    #[tokio::test]
    async fn offline_backend_failure_is_reported_and_nothing_written() {
        let dir = tempfile::tempdir().unwrap();
        let generator = offline_generator();
        let mut events = generator.subscribe();
        let session = Session::new(
            Arc::clone(&generator),
            dir.path().to_path_buf(),
            CancellationToken::new(),
        );

        let (mut writer, reader) = tokio::io::duplex(256);
        let running = tokio::spawn(session.run(tokio::io::BufReader::new(reader)));
        writer.write_all(b"1 a lighthouse at dusk\n").await.unwrap();

        // Input stays open until the request has finished on its own.
        let failure = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let GenerationEvent::Failed { kind, .. } = events.recv().await.unwrap() {
                    return kind;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(failure, ErrorKind::BackendUnavailable);

        drop(writer);
        tokio::time::timeout(Duration::from_secs(10), running)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(generator.active_count(), 0);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn status_line_shows_cap_when_set() {
        assert_eq!(
            status_line(true, 2, 0),
            "ComfyUI: healthy | active generations: 2"
        );
        assert_eq!(
            status_line(false, 1, 4),
            "ComfyUI: unreachable | active generations: 1/4"
        );
    }

    #[tokio::test]
    async fn eof_ends_session_and_cancels_in_flight_requests() {
        let dir = tempfile::tempdir().unwrap();
        let generator = offline_generator();
        let session = Session::new(
            Arc::clone(&generator),
            dir.path().to_path_buf(),
            CancellationToken::new(),
        );

        let input: &[u8] = b"/bogus\n\n1 a lighthouse at dusk\n";
        tokio::time::timeout(Duration::from_secs(20), session.run(input))
            .await
            .unwrap();

        assert_eq!(generator.active_count(), 0);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn cancelled_root_stops_session() {
        let root = CancellationToken::new();
        root.cancel();
        let session = Session::new(offline_generator(), PathBuf::from("unused"), root);

        // Never yields a line; only the root token can end the loop.
        let (_writer, reader) = tokio::io::duplex(64);
        let reader = tokio::io::BufReader::new(reader);
        tokio::time::timeout(Duration::from_secs(5), session.run(reader))
            .await
            .unwrap();
    }
}
