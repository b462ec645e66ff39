//! Berth CLI entry point.

use berth::config::{BackendKind, Config};
use berth::control_plane::ControlPlaneClient;
use berth::db::Db;
use berth::deploy::local::docker::DockerEngine;
use berth::deploy::{DeploymentProvider, Ledger, LocalBackend, RemoteBackend};
use berth::instances::{DeploymentLogStore, Instance, InstanceStore};
use berth::memory::HttpMemoryService;
use berth::secrets::{AesGcmCipher, SecretCipher};
use berth::sync::{ConfigSynchronizer, ConfigurationStore, SettingsFile};

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::{EnvFilter, Layer as _};

#[derive(Parser)]
#[command(name = "berth")]
#[command(about = "Provision and operate per-user agent instances")]
struct Cli {
    /// Path to config file (optional)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Also write daily-rolling logs into this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Store a settings file, then provision or re-apply
    Apply {
        #[arg(long)]
        user: String,
        #[arg(long)]
        file: PathBuf,
        /// Block until the rollout finishes
        #[arg(long)]
        wait: bool,
    },
    /// Rebuild the configuration from storage and push it
    Sync {
        #[arg(long)]
        user: String,
    },
    /// Show the user's instance
    Status {
        #[arg(long)]
        user: String,
    },
    /// Reconcile the status of every instance
    Health,
    /// Print recent instance logs
    Logs {
        #[arg(long)]
        user: String,
        #[arg(long, default_value_t = 100)]
        tail: usize,
    },
    Start {
        #[arg(long)]
        user: String,
    },
    Stop {
        #[arg(long)]
        user: String,
    },
    Restart {
        #[arg(long)]
        user: String,
    },
    /// Remove the instance and its backend resource
    Destroy {
        #[arg(long)]
        user: String,
    },
    /// Roll out a fresh process
    Redeploy {
        #[arg(long)]
        user: String,
        /// Generate a new gateway token first
        #[arg(long)]
        rotate_token: bool,
    },
    /// Show the deployment log
    History {
        #[arg(long)]
        user: String,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

/// Everything a command needs, wired once from config.
struct App {
    db: Db,
    instances: InstanceStore,
    logs: DeploymentLogStore,
    sync: ConfigSynchronizer,
}

impl App {
    async fn build(config: &Config) -> anyhow::Result<Self> {
        config.prepare_data_dir()?;
        let db = Db::connect(&config.data_dir)
            .await
            .with_context(|| "failed to connect to database")?;

        let cipher: Arc<dyn SecretCipher> = Arc::new(AesGcmCipher::new(config.master_key()?)?);
        let instances = InstanceStore::new(db.sqlite.clone(), config.ports);
        let logs = DeploymentLogStore::new(db.sqlite.clone());
        let configs = ConfigurationStore::new(db.sqlite.clone(), cipher);
        let ledger = Ledger::new(instances.clone(), logs.clone());

        let provider: Arc<dyn DeploymentProvider> = match config.backend {
            BackendKind::Remote => {
                let (token, project_id, environment_id) = config.remote.credentials()?;
                let client = ControlPlaneClient::new(
                    &config.remote.endpoint,
                    token,
                    project_id,
                    environment_id,
                )?;
                Arc::new(RemoteBackend::new(
                    Arc::new(client),
                    ledger,
                    config.remote.backend_settings()?,
                ))
            }
            BackendKind::Local => {
                let engine = DockerEngine::connect().context("failed to connect to docker")?;
                Arc::new(LocalBackend::new(Arc::new(engine), ledger, config.local.clone()))
            }
        };
        tracing::debug!(backend = provider.kind(), "deployment provider selected");

        let mut sync = ConfigSynchronizer::new(configs, instances.clone(), provider);
        if let Some(url) = &config.sync.memory_url {
            let memory = HttpMemoryService::new(url.clone(), config.sync.memory_token.clone())?;
            sync = sync.with_memory(Arc::new(memory));
        }
        if let Some(base) = &config.sync.callback_base_url {
            sync = sync.with_callback_base(base.clone());
        }

        Ok(Self {
            db,
            instances,
            logs,
            sync,
        })
    }

    fn provider(&self) -> &Arc<dyn DeploymentProvider> {
        self.sync.provider()
    }

    async fn instance_for(&self, user_id: &str) -> anyhow::Result<Instance> {
        self.instances
            .get_by_user(user_id)
            .await?
            .with_context(|| format!("user {user_id} has no instance"))
    }

    async fn run(&self, command: Command) -> anyhow::Result<()> {
        match command {
            Command::Apply { user, file, wait } => {
                let settings = SettingsFile::load(&file)?;
                let configs = self.sync.configs();
                settings.store(&user, configs).await?;

                let instance_id = match self.instances.get_by_user(&user).await? {
                    Some(existing) => {
                        settings
                            .store_links(&existing.id, configs, &self.instances)
                            .await?;
                        self.sync.rebuild_and_apply(&user).await?;
                        existing.id
                    }
                    None => {
                        let outcome = self.sync.provision(&user).await?;
                        println!(
                            "deployed {} ({}) on port {}",
                            outcome.resource_name, outcome.instance_id, outcome.port
                        );
                        if settings
                            .store_links(&outcome.instance_id, configs, &self.instances)
                            .await?
                            > 0
                        {
                            self.sync.rebuild_and_apply(&user).await?;
                        }
                        outcome.instance_id
                    }
                };

                if wait {
                    let access_url = self.provider().wait_until_ready(&instance_id).await?;
                    println!("ready: {}", access_url.as_deref().unwrap_or("(no access url)"));
                }
            }
            Command::Sync { user } => match self.sync.rebuild_and_apply(&user).await? {
                Some(instance_id) => println!("applied to {instance_id}"),
                None => println!("no instance yet, configuration stored"),
            },
            Command::Status { user } => {
                let instance = self.instance_for(&user).await?;
                println!("{}", serde_json::to_string_pretty(&instance)?);
            }
            Command::Health => {
                for instance in self.instances.list().await? {
                    match self.provider().check_health(&instance.id).await {
                        Ok(running) => {
                            let status = self.instances.require(&instance.id).await?.status;
                            println!("{}\t{}\trunning={running}", instance.user_id, status);
                        }
                        Err(error) => {
                            tracing::warn!(instance_id = %instance.id, %error, "health check failed");
                        }
                    }
                }
            }
            Command::Logs { user, tail } => {
                let instance = self.instance_for(&user).await?;
                println!("{}", self.provider().get_logs(&instance.id, tail).await?);
            }
            Command::Start { user } => {
                let instance = self.instance_for(&user).await?;
                self.provider().start(&instance.id).await?;
            }
            Command::Stop { user } => {
                let instance = self.instance_for(&user).await?;
                self.provider().stop(&instance.id).await?;
            }
            Command::Restart { user } => {
                let instance = self.instance_for(&user).await?;
                self.provider().restart(&instance.id).await?;
            }
            Command::Destroy { user } => {
                let instance = self.instance_for(&user).await?;
                self.provider().destroy(&instance.id).await?;
                self.sync.configs().set_instance(&user, None).await?;
                println!("destroyed {}", instance.container_name);
            }
            Command::Redeploy { user, rotate_token } => {
                if rotate_token {
                    // Applying the new token already rolls the process.
                    self.sync.rotate_gateway_token(&user).await?;
                } else {
                    let instance = self.instance_for(&user).await?;
                    self.provider().redeploy(&instance.id).await?;
                }
            }
            Command::History { user, limit } => {
                for entry in self.logs.list_for_user(&user, limit).await? {
                    println!(
                        "{}\t{}\t{}\t{}{}",
                        entry.created_at.format("%Y-%m-%d %H:%M:%S"),
                        entry.action,
                        entry.status.as_str(),
                        entry.message,
                        entry
                            .error
                            .map(|error| format!(" ({error})"))
                            .unwrap_or_default()
                    );
                }
            }
        }
        Ok(())
    }
}

fn build_env_filter(debug: bool) -> EnvFilter {
    if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Stderr logging, plus a daily-rolling file when `log_dir` is set. The
/// returned guard must live until exit so buffered lines are flushed.
fn init_tracing(
    debug: bool,
    log_dir: Option<&std::path::Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(build_env_filter(debug));

    match log_dir {
        Some(dir) => {
            let file_appender = tracing_appender::rolling::daily(dir, "berth.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .compact()
                .with_filter(build_env_filter(debug));
            tracing_subscriber::registry()
                .with(stderr_layer)
                .with(file_layer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(stderr_layer).init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.debug, cli.log_dir.as_deref());

    let config = if let Some(config_path) = &cli.config {
        Config::load_from_path(config_path)
            .with_context(|| format!("failed to load config from {}", config_path.display()))?
    } else {
        Config::load().with_context(|| "failed to load configuration")?
    };
    tracing::debug!(data_dir = %config.data_dir.display(), backend = ?config.backend, "configuration loaded");

    let app = App::build(&config).await?;
    let result = app.run(cli.command).await;
    app.db.close().await;
    result
}
