use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::Response,
    routing::get,
    Router,
};
use clap::{Arg, ArgAction, Command};
use commonware_runtime::{tokio, Metrics, Runner, Spawner};
use jackpot_node::{
    api,
    gateway::{Gateway, HttpGateway, LogGateway},
    table, Config, ValidatedConfig,
};
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
};
use tracing::{error, info, warn};

struct MetricsState {
    context: tokio::Context,
}

async fn metrics_handler(State(state): State<Arc<MetricsState>>) -> Result<Response<Body>, StatusCode> {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; version=0.0.4")
        .body(Body::from(state.context.encode()))
        .map_err(|err| {
            error!("metrics response build failed: {err}");
            StatusCode::INTERNAL_SERVER_ERROR
        })
}

fn spawn_metrics_server(context: tokio::Context, addr: SocketAddr) {
    let state = Arc::new(MetricsState {
        context: context.clone(),
    });
    context.with_label("metrics").spawn(move |_context| async move {
        let listener = match ::tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(err) => {
                error!("metrics server bind failed on {addr}: {err}");
                return;
            }
        };
        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .with_state(state);
        if let Err(err) = axum::serve(listener, app.into_make_service()).await {
            error!("metrics server failed on {addr}: {err}");
        }
    });
}

fn build_gateway(config: &ValidatedConfig) -> Result<Gateway> {
    match &config.gateway {
        Some(gateway) => {
            let http = HttpGateway::new(
                gateway.url.clone(),
                gateway.token.clone(),
                config.withdrawal.timeout,
            )
            .context("Could not build payout gateway client")?;
            Ok(Gateway::Http(http))
        }
        None => {
            warn!("no gateway_url configured, withdrawals will only be logged");
            Ok(Gateway::Log(LogGateway))
        }
    }
}

fn print_dry_run_report(config: &ValidatedConfig) {
    println!("dry-run report");
    println!(
        "  ports: api={} admin={} metrics={}",
        config.port, config.admin_port, config.metrics_port
    );
    println!(
        "  round: countdown={}ms reveal={}ms cooldown={}ms",
        config.round.countdown_ms, config.round.reveal_ms, config.round.cooldown_ms
    );
    println!(
        "  wagers: min={} max={} participants<={}",
        config.round.min_wager, config.round.max_wager, config.round.max_participants
    );
    println!(
        "  rake: {} {}bps referral={}bps",
        config.round.settlement.policy.as_str(),
        config.round.settlement.rake_bps,
        config.round.settlement.referral_bps
    );
    println!(
        "  withdrawals: min={} fee={}bps timeout={:?}",
        config.withdrawal.min_amount, config.withdrawal.fee_bps, config.withdrawal.timeout
    );
    match &config.gateway {
        Some(gateway) => println!("  gateway: {}", gateway.url),
        None => println!("  gateway: log only"),
    }
}

fn main() {
    if let Err(err) = main_result() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn main_result() -> Result<()> {
    // Parse arguments
    let matches = Command::new("jackpot-node")
        .about("Pooled-wager jackpot table.")
        .arg(
            Arg::new("dry-run")
                .long("dry-run")
                .help("Validate config and exit without starting the table")
                .action(ArgAction::SetTrue),
        )
        .arg(Arg::new("config").long("config").required(true))
        .get_matches();
    let dry_run = matches.get_flag("dry-run");

    // Load config
    let config_file = matches
        .get_one::<String>("config")
        .context("missing --config")?;
    let config_file = std::fs::read_to_string(config_file)
        .with_context(|| format!("Could not read config file {config_file}"))?;
    let config: Config =
        serde_yaml::from_str(&config_file).context("Could not parse config file")?;

    if dry_run {
        println!("{:#?}", config.redacted_debug());
        let config = config.validate().context("Invalid config")?;
        print_dry_run_report(&config);
        println!("config ok");
        return Ok(());
    }

    let redacted = format!("{:?}", config.redacted_debug());
    let config = config.validate().context("Invalid config")?;

    // Initialize runtime
    let cfg = tokio::Config::default()
        .with_worker_threads(config.worker_threads)
        .with_catch_panics(true);
    let executor = tokio::Runner::new(cfg);

    // Start runtime
    executor.start(|context| async move {
        let context = context.with_label("jackpot");
        let result: Result<()> = async {
            // Configure telemetry
            tokio::telemetry::init(
                context.with_label("telemetry"),
                tokio::telemetry::Logging {
                    level: config.log_level,
                    json: config.json_logs,
                },
                None,
                None,
            );
            info!(config = %redacted, "loaded config file");

            spawn_metrics_server(
                context.clone(),
                SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.metrics_port),
            );

            let gateway = build_gateway(&config)?;
            let (actor, mailbox) = table::Actor::new(
                context.with_label("table"),
                table::Config {
                    round: config.round,
                    history_limit: config.history_limit,
                    staking: config.staking,
                    withdrawal: config.withdrawal,
                    gateway,
                    mailbox_size: config.mailbox_size,
                    event_buffer: config.event_buffer,
                    tick_interval: config.tick_interval,
                    referral_retry: config.referral_retry,
                    referral_retry_max: config.referral_retry_max,
                    withdrawal_history_limit: config.withdrawal_history_limit,
                },
            );
            let table = actor.start();

            let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.port);
            let listener = ::tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("Could not bind api server on {addr}"))?;
            let app = api::router(mailbox.clone(), config.wager_rate_per_second);
            info!(%addr, "api server listening");
            context.with_label("api").spawn(move |_context| async move {
                if let Err(err) = axum::serve(listener, app.into_make_service()).await {
                    error!("api server failed on {addr}: {err}");
                }
            });

            let admin_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), config.admin_port);
            let admin_listener = ::tokio::net::TcpListener::bind(admin_addr)
                .await
                .with_context(|| format!("Could not bind admin server on {admin_addr}"))?;
            let admin = api::admin_router(mailbox.clone());
            info!(addr = %admin_addr, "admin server listening");
            context.with_label("admin").spawn(move |_context| async move {
                if let Err(err) = axum::serve(admin_listener, admin.into_make_service()).await {
                    error!("admin server failed on {admin_addr}: {err}");
                }
            });

            // The routers hold mailbox clones, so the table only stops when asked.
            context.with_label("signals").spawn({
                let mut mailbox = mailbox;
                move |_context| async move {
                    if let Err(err) = ::tokio::signal::ctrl_c().await {
                        error!("could not listen for shutdown signal: {err}");
                        return;
                    }
                    info!("shutdown signal received");
                    if mailbox.shutdown().await.is_err() {
                        warn!("table already stopped");
                    }
                }
            });

            table.await.context("table actor failed")?;
            Ok(())
        }
        .await;

        if let Err(err) = result {
            error!(?err, "jackpot node failed");
        }
    });

    Ok(())
}
