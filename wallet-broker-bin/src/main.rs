//! Process bootstrap for the wallet broker (§1, §5). Reads configuration
//! from the environment, stands up the Intercom2 transport in whichever
//! mode it's configured for, registers the two inbound handlers, and runs
//! until asked to shut down.

use std::sync::Arc;

use anyhow::Context;
use intercom::{
    DispatcherBuilder, RemoteEndpointConfig, Session, SessionConfig,
    TlsMaterial, TransportMode,
};
use tracing::{info, warn};
use wallet_broker::{
    broker::{message_id, Broker},
    config::{BrokerConfig, IntercomMode},
    gateway::PgGateway,
    inbound::{HeartbeatHandler, NotifyHandler},
};

fn init_logger() {
    use std::str::FromStr;

    use tracing_subscriber::{filter::Targets, layer::SubscriberExt, util::SubscriberInitExt};

    let rust_log_filter = std::env::var("RUST_LOG")
        .ok()
        .and_then(|rust_log| Targets::from_str(&rust_log).ok())
        .unwrap_or_else(|| Targets::new().with_default(tracing::Level::INFO));

    let stdout_log = tracing_subscriber::fmt::layer()
        .compact()
        .with_level(true)
        .with_target(true)
        .with_filter(rust_log_filter);

    let _ = tracing_subscriber::registry().with(stdout_log).try_init();
}

/// Loads this process's own TLS identity off disk per the §6 certificate
/// layout rooted at `config.config_dir`.
fn load_transport_mode(config: &BrokerConfig) -> anyhow::Result<TransportMode> {
    match config.intercom_mode {
        IntercomMode::Plaintext => Ok(TransportMode::Plaintext),
        IntercomMode::MutualTls => {
            let cert_dir =
                config.config_dir.join("cert").join(&config.intercom_sitename);
            let material: TlsMaterial = intercom::tls::load_tls_material(
                &config.config_dir.join("cert").join("CA.pem"),
                &cert_dir.join("cert.pem"),
                &cert_dir.join("key.pem"),
                config.intercom_passphrase.as_deref(),
            )
            .context("failed to load tls material at startup")?;
            Ok(TransportMode::MutualTls(Arc::new(material)))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logger();

    let config = BrokerConfig::from_env().context("failed to read configuration")?;

    let gateway = Arc::new(
        PgGateway::connect(&config.database_url)
            .await
            .context("failed to connect to database")?,
    );

    let dispatcher = DispatcherBuilder::new()
        .register(
            message_id::NOTIFY,
            Arc::new(NotifyHandler::new(
                gateway.clone(),
                config.confirm_threshold,
                config.decimal_precision,
            )),
        )
        .register(
            message_id::HEARTBEAT,
            Arc::new(HeartbeatHandler::new(gateway.clone())),
        )
        .build();

    let mode = load_transport_mode(&config)?;

    let session = Arc::new(Session::new(
        SessionConfig {
            own_id: config.intercom_id,
            max_frame: config.max_frame,
            request_timeout: config.request_timeout,
            worker_pool_size: config.worker_pool_size,
        },
        dispatcher,
        mode,
    ));

    let (_listen_task, bound_addr) = session
        .listen(("0.0.0.0", config.intercom_port))
        .await
        .context("failed to bind intercom listener")?;
    info!(%bound_addr, "intercom listener bound");

    let site_endpoint = session
        .connect(RemoteEndpointConfig {
            remote_id: config.site_intercom_id,
            host: config.site_intercom_host.clone(),
            port: config.site_intercom_port,
        })
        .await;

    // Bound for the lifetime of the process: other entry points (an admin
    // API, a CLI) would construct their own `Broker` over the same
    // `Session`, sharing the one underlying connection.
    let _broker = Broker::new(session.clone(), config.site_intercom_id);

    info!("wallet broker running");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    info!("shutdown signal received; closing endpoints");
    site_endpoint.close().await;

    if session
        .wait_for_idle_handlers(config.handler_shutdown_grace)
        .await
    {
        info!("all in-flight handlers drained before the shutdown grace period");
    } else {
        warn!(
            grace_secs = config.handler_shutdown_grace.as_secs(),
            "handler shutdown grace period elapsed with handlers still in flight",
        );
    }

    Ok(())
}
