//! Process bootstrap (SPEC_FULL §2 stage 10, §4.12, §6): parses CLI
//! flags and pod-info files into a [`navecd::config::Config`], wires the
//! reconciliation engine to a live `kube::Client`, serves metrics/health
//! endpoints, and runs leader-elected reconcile passes until shut down.
//!
//! The Kubernetes watch/reconcile trigger a production controller
//! manager would normally provide is named an external collaborator in
//! this project's scope (spec §1); in its place this loop periodically
//! lists the `GitopsProject` custom resources it owns and reconciles
//! whichever are due, which keeps the binary self-contained without
//! reimplementing `kube::runtime::Controller`'s informer machinery.

use clap::{Parser, Subcommand};
use kube::api::{Api, ListParams, Patch, PatchParams};
use navecd::config::{default_worker_pool_size, read_podinfo_value, Config};
use navecd::crd::{ConditionStatus, GitopsProject, GitopsProjectStatus, Revision};
use navecd::errors::CoreError;
use navecd::install::{run_install, InstallOptions};
use navecd::leader::LeaderElector;
use navecd::metrics::Metrics;
use navecd::scanner::{DockerRegistryLister, HttpChartIndexLister, VersionScanner};
use navecd::scheduler::{Scheduler, SchedulerConfig};
use navecd::secrets::ClusterSecretProvider;
use navecd::updater::{GitHubPullRequestProvider, PullRequestProvider, UnconfiguredPullRequestProvider, Updater};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "navecd", version, about = "GitOps continuous-delivery controller")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
    #[command(flatten)]
    run: RunArgs,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Materializes this shard's Kubernetes footprint and one project's bootstrap artifacts.
    Install(InstallArgs),
}

#[derive(clap::Args, Debug, Clone)]
struct RunArgs {
    #[arg(long, env = "METRICS_BIND_ADDRESS", default_value = "0.0.0.0:8080")]
    metrics_bind_address: String,
    #[arg(long, env = "HEALTH_PROBE_BIND_ADDRESS", default_value = "0.0.0.0:8081")]
    health_probe_bind_address: String,
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
    #[arg(long)]
    namespace_podinfo_path: Option<PathBuf>,
    #[arg(long)]
    name_podinfo_path: Option<PathBuf>,
    #[arg(long)]
    shard_podinfo_path: Option<PathBuf>,
    #[arg(long)]
    insecure_skip_tls_verify: bool,
    #[arg(long)]
    plain_http: bool,
    #[arg(long, env = "WORKER_POOL_SIZE")]
    worker_pool_size: Option<usize>,
    #[arg(long, env = "INVENTORY_PATH", default_value = "/inventory")]
    inventory_path: PathBuf,
    #[arg(long, env = "POD_NAMESPACE", default_value = "navecd-system")]
    controller_namespace: String,
    #[arg(long, default_value = "main")]
    base_branch: String,
    #[arg(long, env = "WORK_DIR", default_value = "/tmp/navecd")]
    work_dir: PathBuf,
}

#[derive(clap::Args, Debug, Clone)]
struct InstallArgs {
    #[arg(long)]
    name: String,
    #[arg(long, default_value = "navecd-system")]
    namespace: String,
    #[arg(long)]
    image: String,
    #[arg(long)]
    repository_url: String,
    #[arg(long, default_value = "main")]
    branch: String,
    #[arg(long, default_value = "dev")]
    stage: String,
    #[arg(long, default_value_t = 60)]
    pull_interval_seconds: u32,
    #[arg(long)]
    project_root: PathBuf,
    #[arg(long)]
    deploy_key_path: PathBuf,
    #[arg(long)]
    deploy_key_pub_path: PathBuf,
    #[arg(long)]
    decryption_key_path: PathBuf,
    #[arg(long)]
    known_hosts_path: PathBuf,
}

fn init_tracing(log_level: &str) {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).json().init();
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    // kube and reqwest both pick rustls without a default crypto provider
    // wired up; install one before either opens a TLS connection. Already-
    // installed is not an error worth surfacing.
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let cli = Cli::parse();
    match &cli.command {
        Some(Command::Install(args)) => {
            init_tracing(&cli.run.log_level);
            match install_main(args).await {
                Ok(()) => std::process::ExitCode::SUCCESS,
                Err(err) => {
                    error!(%err, "install failed");
                    std::process::ExitCode::FAILURE
                }
            }
        }
        None => {
            init_tracing(&cli.run.log_level);
            match run_main(cli.run).await {
                Ok(()) => std::process::ExitCode::SUCCESS,
                Err(err) => {
                    error!(%err, "bootstrap failed");
                    std::process::ExitCode::FAILURE
                }
            }
        }
    }
}

async fn install_main(args: &InstallArgs) -> Result<(), CoreError> {
    let client = build_client(false).await?;
    let opts = InstallOptions {
        name: args.name.clone(),
        namespace: args.namespace.clone(),
        image: args.image.clone(),
        repository_url: args.repository_url.clone(),
        branch: args.branch.clone(),
        stage: args.stage.clone(),
        pull_interval_seconds: args.pull_interval_seconds,
        deploy_key_identity: tokio::fs::read(&args.deploy_key_path).await.map_err(CoreError::from)?,
        deploy_key_identity_pub: tokio::fs::read(&args.deploy_key_pub_path).await.map_err(CoreError::from)?,
        decryption_key: tokio::fs::read(&args.decryption_key_path).await.map_err(CoreError::from)?,
        known_hosts: tokio::fs::read_to_string(&args.known_hosts_path).await.map_err(CoreError::from)?,
    };
    run_install(&client, &opts, &args.project_root).await
}

async fn build_client(insecure_skip_tls_verify: bool) -> Result<kube::Client, CoreError> {
    let mut config = kube::Config::infer().await.map_err(|err| {
        CoreError::permanent("KubeconfigInferenceFailed", navecd::errors::CommandError::new_from_safe_message(err.to_string()))
    })?;
    config.accept_invalid_certs = insecure_skip_tls_verify;
    kube::Client::try_from(config).map_err(CoreError::from)
}

fn build_config(args: &RunArgs) -> Config {
    let controller_namespace = args
        .namespace_podinfo_path
        .as_deref()
        .and_then(|path| read_podinfo_value(path).ok())
        .unwrap_or_else(|| args.controller_namespace.clone());
    let shard_identity = args
        .shard_podinfo_path
        .as_deref()
        .and_then(|path| read_podinfo_value(path).ok())
        .unwrap_or_else(|| "default".to_string());

    Config {
        metrics_bind_address: args.metrics_bind_address.clone(),
        health_probe_bind_address: args.health_probe_bind_address.clone(),
        log_level: args.log_level.clone(),
        insecure_skip_tls_verify: args.insecure_skip_tls_verify,
        plain_http: args.plain_http,
        worker_pool_size: args.worker_pool_size.unwrap_or_else(default_worker_pool_size),
        inventory_path: args.inventory_path.clone(),
        controller_namespace,
        shard_identity,
        base_branch: args.base_branch.clone(),
        field_manager: navecd::kube_apply::FIELD_MANAGER.to_string(),
    }
}

async fn run_main(args: RunArgs) -> Result<(), CoreError> {
    let config = build_config(&args);
    let client = build_client(config.insecure_skip_tls_verify).await?;
    let metrics = Arc::new(Metrics::new());
    let shutdown = CancellationToken::new();

    let metrics_server = tokio::spawn({
        let bind = config.metrics_bind_address.clone();
        let metrics = metrics.clone();
        async move {
            if let Err(err) = navecd::metrics::serve_metrics(&bind, metrics).await {
                error!(%err, "metrics server exited");
            }
        }
    });
    let health_server = tokio::spawn({
        let bind = config.health_probe_bind_address.clone();
        async move {
            if let Err(err) = navecd::metrics::serve_health(&bind).await {
                error!(%err, "health probe server exited");
            }
        }
    });

    let (elector, mut leadership) = LeaderElector::new(client.clone(), config.leader_election_config());
    let work_cancellation = elector.cancellation_token();
    let election_shutdown = shutdown.clone();
    let election_task = tokio::spawn(elector.run(election_shutdown));

    let inventory = navecd::inventory::Inventory::new(config.inventory_path.clone());
    let shared = build_shared_parts(&client, &config, &inventory)?;

    let mut reconciled_at: HashMap<String, u64> = HashMap::new();
    let mut schedulers: HashMap<String, Scheduler> = HashMap::new();
    let poll_interval = Duration::from_secs(5);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = work_cancellation.cancelled() => {
                warn!("leadership lost, pausing reconcile loop until a fresh process regains it");
                break;
            }
            _ = tokio::time::sleep(poll_interval) => {}
        }

        if !*leadership.borrow_and_update() {
            continue;
        }

        if let Err(err) = reconcile_due_projects(&client, &shared, &inventory, &metrics, &config, &mut reconciled_at, &mut schedulers).await {
            error!(%err, "project discovery failed");
        }
    }

    for (name, scheduler) in schedulers {
        if let Err(err) = scheduler.shutdown().await {
            warn!(project = %name, %err, "failed to shut down scheduler cleanly");
        }
    }
    shutdown.cancel();
    election_task.abort();
    metrics_server.abort();
    health_server.abort();
    Ok(())
}

/// The parts of a [`navecd::reconcile::Reconciler`] that are the same for
/// every project this shard owns. Credentials are the one piece that
/// isn't: each `GitopsProject` names its own `vcs-auth-{name}` deploy key,
/// so [`reconcile_due_projects`] builds a fresh `Reconciler` per project,
/// cloning these shared `Arc`s in and substituting that project's own
/// [`navecd::git::CredentialProvider`].
struct SharedReconcilerParts {
    manifest_reconciler: Arc<navecd::reconcile::ManifestReconciler>,
    helm_reconciler: Arc<navecd::helmchart::HelmChartReconciler>,
    secret_decrypter: Arc<navecd::secrets::SecretDecrypter>,
    manifest_deleter: Arc<dyn navecd::gc::ManifestDeleter>,
    release_uninstaller: Arc<dyn navecd::gc::ReleaseUninstaller>,
    project_builder: Arc<navecd::builder::ComponentBuilder>,
    secret_provider: Arc<navecd::secrets::KubeSecretProvider>,
    version_scanner: Arc<VersionScanner>,
    http_client: reqwest::Client,
}

fn build_shared_parts(client: &kube::Client, config: &Config, inventory: &navecd::inventory::Inventory) -> Result<SharedReconcilerParts, CoreError> {
    let mut http_builder = reqwest::Client::builder();
    if config.insecure_skip_tls_verify {
        http_builder = http_builder.danger_accept_invalid_certs(true);
    }
    let http_client = http_builder.build().map_err(|err| {
        CoreError::permanent("HttpClientBuildFailed", navecd::errors::CommandError::new_from_safe_message(err.to_string()))
    })?;

    let cache_dir = config.inventory_path.join("..").join("chart-cache");
    let helm_reconciler = Arc::new(navecd::helmchart::HelmChartReconciler::new(
        client.clone(),
        navecd::helmchart::ChartCache::new(cache_dir),
        Arc::new(navecd::helmchart::OciChartPuller { client: http_client.clone(), auth: Arc::new(navecd::helmchart::NoAuthProvider) }),
        Arc::new(navecd::helmchart::HttpChartPuller { client: http_client }),
        Arc::new(navecd::helmchart::TarGzChartRenderer),
        Arc::new(navecd::helmchart::KubeReleaseStateStore { client: client.clone() }),
        config.chart_reconciler_config(),
    ));
    let secret_provider = Arc::new(navecd::secrets::KubeSecretProvider { client: client.clone() });
    let secret_decrypter = Arc::new(navecd::secrets::SecretDecrypter::new(secret_provider.clone(), config.secret_decrypter_config()));

    let docker_lister: Arc<dyn navecd::scanner::RemoteVersionLister> =
        Arc::new(DockerRegistryLister { client: http_client.clone(), auth: Arc::new(navecd::helmchart::NoAuthProvider) });
    let http_chart_lister: Arc<dyn navecd::scanner::RemoteVersionLister> = Arc::new(HttpChartIndexLister { client: http_client.clone() });
    let version_scanner = Arc::new(VersionScanner::new(docker_lister, http_chart_lister));

    Ok(SharedReconcilerParts {
        manifest_reconciler: Arc::new(navecd::reconcile::ManifestReconciler::new(client.clone(), inventory.clone(), config.manifest_reconciler_config())),
        helm_reconciler,
        secret_decrypter,
        manifest_deleter: Arc::new(navecd::gc::KubeManifestDeleter { client: client.clone() }),
        release_uninstaller: Arc::new(navecd::helmchart::KubeReleaseUninstaller::new(client.clone())),
        project_builder: Arc::new(navecd::builder::ComponentBuilder::new(Arc::new(navecd::builder::YamlPackageCompiler))),
        secret_provider,
        version_scanner,
        http_client,
    })
}

/// Best-effort fetch of a secret key that is allowed to be absent (the
/// `vcs-auth-{name}` secret's optional `token` field) — `KeyNotFound` is
/// swallowed, any other error still propagates.
async fn optional_secret_key(secret_provider: &navecd::secrets::KubeSecretProvider, namespace: &str, name: &str, key: &str) -> Result<Option<Vec<u8>>, CoreError> {
    match secret_provider.get_secret_key(namespace, name, key).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.reason == "KeyNotFound" => Ok(None),
        Err(err) => Err(err),
    }
}

/// `git@github.com:owner/repo.git` or `https://github.com/owner/repo.git`
/// (trailing `.git` optional) -> `(owner, repo)`. Returns `None` for any
/// other host or shape; the PR-integration path is only meaningful
/// against a GitHub-hosted project.
fn parse_github_owner_repo(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("git@github.com:").or_else(|| url.strip_prefix("https://github.com/")).or_else(|| url.strip_prefix("ssh://git@github.com/"))?;
    let rest = rest.trim_end_matches(".git").trim_end_matches('/');
    let (owner, repo) = rest.split_once('/')?;
    Some((owner.to_string(), repo.to_string()))
}

/// Builds the `PR`-integration provider for one project: a real GitHub
/// client if the project's repository is GitHub-hosted and its
/// `vcs-auth-{name}` secret carries a `token`, or
/// [`UnconfiguredPullRequestProvider`] otherwise — `Direct`-integration
/// updates never touch this seam, per spec §4.10.
fn build_pull_request_provider(http_client: reqwest::Client, repository_url: &str, token: Option<String>) -> Arc<dyn PullRequestProvider> {
    match (parse_github_owner_repo(repository_url), token) {
        (Some((owner, repo)), Some(token)) => {
            Arc::new(GitHubPullRequestProvider { client: http_client, api_base: "https://api.github.com".to_string(), owner, repo, token })
        }
        _ => Arc::new(UnconfiguredPullRequestProvider),
    }
}

/// Fetches the `vcs-auth-{name}` secret a project's manifest names and
/// builds the SSH credential provider `git::fetch_project` authenticates
/// with. The secret always carries an `identity` key; `identity.pub` is
/// only required for some SSH servers, so its absence is tolerated.
async fn project_credentials(
    secret_provider: &navecd::secrets::KubeSecretProvider,
    namespace: &str,
    project_name: &str,
) -> Result<Arc<dyn navecd::git::CredentialProvider>, CoreError> {
    let secret_name = format!("vcs-auth-{project_name}");
    let identity_pem = secret_provider.get_secret_key(namespace, &secret_name, "identity").await?;
    let identity_pub = secret_provider.get_secret_key(namespace, &secret_name, "identity.pub").await.ok();
    Ok(Arc::new(navecd::git::SshKeyCredentialProvider { identity_pem, identity_pub, passphrase: None }))
}

fn build_reconciler(shared: &SharedReconcilerParts, inventory: &navecd::inventory::Inventory, credentials: Arc<dyn navecd::git::CredentialProvider>, config: &Config) -> navecd::reconcile::Reconciler {
    navecd::reconcile::Reconciler::new(
        shared.manifest_reconciler.clone(),
        shared.helm_reconciler.clone(),
        shared.secret_decrypter.clone(),
        inventory.clone(),
        shared.manifest_deleter.clone(),
        shared.release_uninstaller.clone(),
        credentials,
        shared.project_builder.clone(),
        config.reconciler_config(),
    )
}

/// Creates this project's [`Scheduler`] on first sight and reconciles its
/// job set against the instructions this pass just harvested, per spec
/// §4.11's "diff desired against actual" contract. The `PullRequestProvider`
/// a project gets is re-derived only at creation time: a project's VCS
/// token or host doesn't change shape between reconcile passes.
#[allow(clippy::too_many_arguments)]
async fn sync_scheduler(
    schedulers: &mut HashMap<String, Scheduler>,
    shared: &SharedReconcilerParts,
    credentials: &Arc<dyn navecd::git::CredentialProvider>,
    name: &str,
    namespace: &str,
    url: &url::Url,
    branch: &str,
    work_dir: &PathBuf,
    instructions: &[navecd::builder::UpdateInstruction],
) -> Result<(), CoreError> {
    if !schedulers.contains_key(name) {
        let token = optional_secret_key(&shared.secret_provider, namespace, &format!("vcs-auth-{name}"), "token")
            .await?
            .map(|bytes| String::from_utf8_lossy(&bytes).trim().to_string());
        let pull_request_provider = build_pull_request_provider(shared.http_client.clone(), url.as_str(), token);
        let updater = Arc::new(Updater::new(pull_request_provider, credentials.clone(), branch.to_string())?);
        let scheduler_config = SchedulerConfig { repository_url: url.clone(), project_work_dir: work_dir.clone(), base_branch: branch.to_string() };
        let scheduler = Scheduler::new(shared.version_scanner.clone(), updater, credentials.clone(), scheduler_config).await?;
        schedulers.insert(name.to_string(), scheduler);
    }
    schedulers.get_mut(name).expect("just inserted if absent").reconcile(instructions).await
}

async fn reconcile_due_projects(
    client: &kube::Client,
    shared: &SharedReconcilerParts,
    inventory: &navecd::inventory::Inventory,
    metrics: &Arc<Metrics>,
    config: &Config,
    reconciled_at: &mut HashMap<String, u64>,
    schedulers: &mut HashMap<String, Scheduler>,
) -> Result<(), CoreError> {
    let api: Api<GitopsProject> = Api::all(client.clone());
    let projects = api.list(&ListParams::default()).await?;
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
    let mut current_names = std::collections::HashSet::new();

    for project in projects.items {
        let name = project.metadata.name.clone().unwrap_or_default();
        let namespace = project.metadata.namespace.clone().unwrap_or_default();
        current_names.insert(name.clone());
        if project.spec.suspend.unwrap_or(false) {
            continue;
        }
        let interval = project.spec.pull_interval_seconds.max(5) as u64;
        let due = reconciled_at.get(&name).map(|last| now.saturating_sub(*last) >= interval).unwrap_or(true);
        if !due {
            continue;
        }
        reconciled_at.insert(name.clone(), now);

        let url = match url::Url::parse(&project.spec.url) {
            Ok(url) => url,
            Err(err) => {
                warn!(project = %name, %err, "invalid project url, skipping");
                continue;
            }
        };
        let credentials = match project_credentials(&shared.secret_provider, &namespace, &name).await {
            Ok(credentials) => credentials,
            Err(err) => {
                warn!(project = %name, %err, "failed to load deploy key, skipping");
                continue;
            }
        };
        let reconciler = build_reconciler(shared, inventory, credentials.clone(), config);
        let work_dir = config.inventory_path.join("..").join("work").join(&namespace).join(&name);
        let decrypted_dir = config.inventory_path.join("..").join("work").join(format!("{name}-dec"));

        update_running_status(client, &namespace, &name, project.metadata.generation.unwrap_or(0)).await;

        let histogram = metrics.reconciliation_duration_seconds.with_label_values(&[&name, project.spec.url.as_str()]);
        let timer = histogram.start_timer();
        let result = reconciler.reconcile_project(url.clone(), project.spec.branch.clone(), work_dir.clone(), decrypted_dir).await;
        timer.observe_duration();

        match result {
            Ok((outcome, instructions)) => {
                info!(project = %name, manifests = outcome.manifests_applied, releases = outcome.releases_reconciled, updates = instructions.len(), "reconcile pass succeeded");
                metrics.update_instructions_total.with_label_values(&[&name]).inc_by(instructions.len() as u64);
                if let Err(err) = sync_scheduler(schedulers, shared, &credentials, &name, &namespace, &url, &project.spec.branch, &work_dir, &instructions).await {
                    warn!(project = %name, %err, "failed to reconcile update-scan schedule");
                }
                update_status(client, &namespace, &name, project.metadata.generation.unwrap_or(0), Ok(&outcome)).await;
            }
            Err(err) => {
                metrics.reconcile_errors_total.with_label_values(&[&name, err.reason]).inc();
                error!(project = %name, %err, "reconcile pass failed");
                update_status(client, &namespace, &name, project.metadata.generation.unwrap_or(0), Err(&err)).await;
            }
        }
    }

    let stale: Vec<String> = schedulers.keys().filter(|key| !current_names.contains(*key)).cloned().collect();
    for name in stale {
        if let Some(scheduler) = schedulers.remove(&name) {
            if let Err(err) = scheduler.shutdown().await {
                warn!(project = %name, %err, "failed to shut down scheduler for removed project");
            }
        }
    }
    Ok(())
}

/// Sets the `Running` condition before a reconcile pass starts, so an
/// observer polling `Conditions` between passes sees `Running` precede
/// `Finished` (spec §8's fresh-apply scenario).
async fn update_running_status(client: &kube::Client, namespace: &str, name: &str, generation: i64) {
    let api: Api<GitopsProject> = Api::namespaced(client.clone(), namespace);
    let now = chrono::Utc::now().to_rfc3339();
    let mut status = GitopsProjectStatus::default();
    status.mark_running(generation, &now);
    let patch = serde_json::json!({"status": status});
    if let Err(err) = api.patch_status(name, &PatchParams::apply(navecd::kube_apply::FIELD_MANAGER).force(), &Patch::Merge(&patch)).await {
        warn!(project = %name, %err, "failed to update project status");
    }
}

/// Sets `Finished` to the pass's terminal outcome: `True,reason=Success`
/// (spec §4.8 step 6), or `False,reason=<Kind>` using the error's
/// `Transient`/`Permanent`/`Partial` classification, not its specific
/// machine-readable reason (spec §7).
async fn update_status(client: &kube::Client, namespace: &str, name: &str, generation: i64, result: Result<&navecd::reconcile::ReconcileOutcome, &CoreError>) {
    let api: Api<GitopsProject> = Api::namespaced(client.clone(), namespace);
    let now = chrono::Utc::now().to_rfc3339();
    let mut status = GitopsProjectStatus::default();
    match result {
        Ok(outcome) => {
            status.mark_finished(ConditionStatus::True, "Success", "reconcile pass applied successfully", generation, &now);
            status.revision = Some(Revision { commit_hash: outcome.commit_hash.clone(), reconcile_time: now.clone() });
        }
        Err(err) => {
            status.mark_finished(ConditionStatus::False, &err.kind.to_string(), &err.message(), generation, &now);
        }
    }
    let patch = serde_json::json!({"status": status});
    if let Err(err) = api.patch_status(name, &PatchParams::apply(navecd::kube_apply::FIELD_MANAGER).force(), &Patch::Merge(&patch)).await {
        warn!(project = %name, %err, "failed to update project status");
    }
}
