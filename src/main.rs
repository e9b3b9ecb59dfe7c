use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use skein_capture::ScriptedRun;
use skein_client::{ConsumerSession, HttpMetricsSource, HybridPoller, OpenStepPolicy, SessionUpdate, Subscriber, SubscriberConfig};
use skein_core::events::StepStatus;
use skein_core::ids::{StepKey, ThreadId};
use skein_server::{AllowAll, Authorizer, Pipeline, ServerConfig, ServerHandle, SkeinSettings, StaticTokens};
use skein_telemetry::{init_telemetry, spawn_history_task, MetricsAggregator, TelemetryGuard};

#[derive(Parser)]
#[command(name = "skein", version, about = "Stream and reconstruct execution events")]
struct Cli {
    /// Settings file (defaults to ~/.skein/settings.json).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the streaming server.
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run the server and drive one scripted execution through it.
    Demo {
        #[arg(long)]
        port: Option<u16>,
        /// Thread id to use; a fresh one by default.
        #[arg(long)]
        thread: Option<String>,
        /// JSON file holding a scripted run; the built-in demo otherwise.
        #[arg(long)]
        script: Option<PathBuf>,
        #[arg(long, default_value_t = 250)]
        step_delay_ms: u64,
    },
    /// Follow a thread and print its reconstructed timeline.
    Watch {
        thread: String,
        #[arg(long, default_value = "http://127.0.0.1:9091")]
        url: String,
        #[arg(long)]
        token: Option<String>,
        /// Keep concurrent sub-task steps open side by side.
        #[arg(long)]
        per_scope: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = skein_server::load_settings(cli.config.as_deref()).context("failed to load settings")?;
    let telemetry = init_telemetry(settings.telemetry.to_config());

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            on_signal.cancel();
        }
    });

    match cli.command {
        Command::Serve { host, port } => {
            let running = serve(&settings, &telemetry, host, port, &cancel).await?;
            cancel.cancelled().await;
            running.shutdown().await;
        }
        Command::Demo {
            port,
            thread,
            script,
            step_delay_ms,
        } => {
            let running = serve(&settings, &telemetry, None, port, &cancel).await?;
            let thread_id = thread.map(ThreadId::from).unwrap_or_default();
            let run = match script {
                Some(path) => {
                    let text = std::fs::read_to_string(&path)
                        .with_context(|| format!("failed to read script {}", path.display()))?;
                    let mut run: ScriptedRun = serde_json::from_str(&text).context("invalid script")?;
                    run.thread_id = thread_id;
                    run
                }
                None => ScriptedRun::demo(thread_id),
            }
            .with_step_delay(Duration::from_millis(step_delay_ms));

            tracing::info!(
                thread_id = %run.thread_id,
                url = %format!("http://127.0.0.1:{}/threads/{}/events", running.handle.port(), run.thread_id),
                "demo execution starting"
            );
            run.drive(running.pipeline.bridge.as_ref(), &cancel).await;
            tracing::info!(thread_id = %run.thread_id, "demo execution finished; serving until interrupted");
            cancel.cancelled().await;
            running.shutdown().await;
        }
        Command::Watch {
            thread,
            url,
            token,
            per_scope,
        } => watch(ThreadId::from(thread), url, token, per_scope, &cancel).await?,
    }
    Ok(())
}

struct Running {
    pipeline: Pipeline,
    handle: ServerHandle,
    background: CancellationToken,
    history: Option<tokio::task::JoinHandle<()>>,
}

impl Running {
    async fn shutdown(self) {
        self.background.cancel();
        self.handle.shutdown().await;
        if let Some(history) = self.history {
            let _ = history.await;
        }
        tracing::info!(threads = self.pipeline.hub.len(), "stopped");
    }
}

async fn serve(
    settings: &SkeinSettings,
    telemetry: &TelemetryGuard,
    host: Option<String>,
    port: Option<u16>,
    cancel: &CancellationToken,
) -> anyhow::Result<Running> {
    let metrics = MetricsAggregator::global();
    metrics.set_pricing(settings.pricing.clone());
    let pipeline = Pipeline::new(
        settings.channel.to_config(),
        settings.capture.to_config(),
        Arc::clone(&metrics),
    );

    let authorizer: Arc<dyn Authorizer> = if settings.server.auth_tokens.is_empty() {
        Arc::new(AllowAll)
    } else {
        Arc::new(StaticTokens::new(settings.server.auth_tokens.iter().cloned()))
    };
    let config = ServerConfig {
        host: host.unwrap_or_else(|| settings.server.host.clone()),
        port: port.unwrap_or(settings.server.port),
    };
    let handle = skein_server::start(config, pipeline.app_state(authorizer))
        .await
        .context("failed to start server")?;

    let background = cancel.child_token();
    let history = telemetry.history().map(|history| {
        let telemetry = settings.telemetry.to_config();
        spawn_history_task(
            metrics,
            Arc::clone(history),
            Duration::from_secs(telemetry.history_snapshot_interval_secs),
            telemetry.history_retention_days,
            background.clone(),
        )
    });

    tracing::info!(port = handle.port(), "skein ready");
    Ok(Running {
        pipeline,
        handle,
        background,
        history,
    })
}

async fn watch(
    thread_id: ThreadId,
    url: String,
    token: Option<String>,
    per_scope: bool,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let policy = if per_scope {
        OpenStepPolicy::PerScope
    } else {
        OpenStepPolicy::Single
    };
    let mut session = ConsumerSession::new(thread_id.clone(), policy);
    let subscriber = Subscriber::new(SubscriberConfig {
        base_url: url.clone(),
        token: token.clone(),
        ..Default::default()
    });
    let mut poller = HybridPoller::new(HttpMetricsSource::thread(&url, &thread_id, token));
    poller.update(true, true);

    let mut shown: HashMap<StepKey, StepStatus> = HashMap::new();
    subscriber
        .follow(&mut session, cancel, |session, update| {
            if !matches!(update, SessionUpdate::Applied(_)) {
                return;
            }
            for step in session.steps() {
                if shown.insert(step.id.clone(), step.status) == Some(step.status) {
                    continue;
                }
                let ms = step.duration().map(|d| d.num_milliseconds());
                println!(
                    "#{:<3} {:<15} {:<24} {:<10} tokens={} ms={}",
                    step.ordinal,
                    step.kind.as_str(),
                    step.label,
                    format!("{:?}", step.status).to_lowercase(),
                    step.token_count,
                    ms.map_or_else(|| "-".to_string(), |ms| ms.to_string()),
                );
            }
            poller.update(!session.is_finished(), true);
        })
        .await
        .context("stream failed")?;

    if let Some((kind, message)) = session.last_error() {
        println!("error: {kind}: {message}");
    }
    println!("{}", serde_json::to_string_pretty(session.metrics())?);
    if let Some(polled) = poller.latest().value {
        tracing::info!(cost_usd = polled.cost_usd, generation_calls = polled.generation_calls, "server-side metrics");
    }
    poller.stop();
    Ok(())
}
