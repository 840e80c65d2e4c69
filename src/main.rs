use std::{net::SocketAddr, path::Path, sync::Arc};

use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use switchyard::{
    adapters::{CatalogSync, HealthMonitor, HttpClientAdapter, MemoryCatalog, ProxyHandler},
    config::{ProxyConfig, ProxyConfigValidator, loader::load_config},
    core::{
        HealthRegistry, HealthThresholds, LoadBalancer, MultiCircuitBreaker, Router, ServerPool,
        StickySessions,
        balancer::build_balancer,
        rate_limit::{ClientRateLimiter, SWEEP_INTERVAL},
    },
    ports::{catalog::CatalogStore, http_client::HttpClient},
    tracing_setup,
    utils::{ConnectionTracker, GracefulShutdown, ShutdownToken},
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "config.yaml")]
    config: String,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate a configuration file and exit
    Validate {
        #[clap(short, long, default_value = "config.yaml")]
        config: String,
    },
    /// Start the gateway (default)
    Serve {
        #[clap(short, long, default_value = "config.yaml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    let (command, config_path) = match args.command {
        Some(Commands::Validate { config }) => ("validate", config),
        Some(Commands::Serve { config }) => ("serve", config),
        None => ("serve", args.config),
    };

    if command == "validate" {
        return validate_config_command(&config_path);
    }

    tracing_setup::init_tracing()?;

    tracing::info!(path = %config_path, "loading configuration");
    let config = match load_config(&config_path)
        .and_then(|c| ProxyConfigValidator::validate(&c).map_err(Into::into).map(|()| c))
    {
        Ok(config) => Arc::new(config),
        Err(e) => {
            tracing::error!(error = ?e, "configuration load or validation failed");
            eprintln!("configuration error: {e:#}");
            std::process::exit(1);
        }
    };

    let shutdown = Arc::new(GracefulShutdown::new(config.shutdown_timeout()));
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { shutdown.run_signal_handler().await });
    }

    // Catalog, seeded from the config file; runtime mutation goes through
    // the store and reconfigures the data plane via its watch stream.
    let catalog: Arc<MemoryCatalog> = Arc::new(MemoryCatalog::new());
    catalog
        .seed(config.services.clone(), config.routes.clone())
        .await
        .map_err(|e| eyre!("failed to seed catalog: {e}"))?;
    let catalog_store: Arc<dyn CatalogStore> = catalog.clone();

    let registry = Arc::new(HealthRegistry::new(HealthThresholds {
        fail_threshold: config.health_check.fail_threshold,
        pass_threshold: config.health_check.pass_threshold,
    }));
    let pool = Arc::new(ServerPool::new(registry.clone()));

    let router = Arc::new(Router::new());
    router.set_routes(catalog_store.list_routes().await.unwrap_or_default());

    let balancer = build_balancer(config.load_balancing.algorithm);
    let sticky = config.load_balancing.sticky.enabled.then(|| {
        Arc::new(StickySessions::new(
            balancer.clone(),
            config.load_balancing.sticky.cookie_name.clone(),
            config.load_balancing.sticky.ttl(),
        ))
    });

    let breakers = config
        .circuit_breaker
        .enabled
        .then(|| Arc::new(MultiCircuitBreaker::new(config.circuit_breaker.breaker_config())));
    let limiter = config.rate_limit.enabled.then(|| {
        Arc::new(ClientRateLimiter::new(
            config.rate_limit.rps,
            config.rate_limit.burst,
            config.rate_limit.by_header.clone(),
        ))
    });

    let http_client: Arc<dyn HttpClient> =
        Arc::new(HttpClientAdapter::new().context("failed to create the upstream HTTP client")?);
    let tracker = Arc::new(ConnectionTracker::new());

    let handler = Arc::new(ProxyHandler::new(
        catalog_store.clone(),
        router.clone(),
        pool.clone(),
        balancer.clone(),
        sticky.clone(),
        registry.clone(),
        breakers.clone(),
        limiter.clone(),
        http_client.clone(),
        tracker.clone(),
        config.retry.clone(),
        config.tls.is_some(),
    ));

    // Long-lived background tasks, all joined on shutdown.
    let mut background = Vec::new();

    let monitor = Arc::new(HealthMonitor::new(
        catalog_store.clone(),
        pool.clone(),
        registry.clone(),
        http_client.clone(),
        config.health_check.clone(),
    ));
    background.push(tokio::spawn(monitor.run(shutdown.token())));

    let selection_entry: Arc<dyn LoadBalancer> = match &sticky {
        Some(sticky) => sticky.clone(),
        None => balancer.clone(),
    };
    let sync = CatalogSync::new(
        catalog_store.clone(),
        router.clone(),
        pool.clone(),
        selection_entry,
    );
    background.push(tokio::spawn(sync.run(shutdown.token())));

    if let Some(sticky) = sticky.clone() {
        background.push(tokio::spawn(sticky_sweep_task(sticky, shutdown.token())));
    }
    if let Some(limiter) = limiter.clone() {
        background.push(tokio::spawn(limiter_sweep_task(limiter, shutdown.token())));
    }

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .context("failed to parse listen address")?;

    tracing::info!(
        listen_addr = %addr,
        algorithm = ?config.load_balancing.algorithm,
        sticky = config.load_balancing.sticky.enabled,
        tls = config.tls.is_some(),
        "starting switchyard"
    );

    let serve_result = match &config.tls {
        Some(tls) => serve_tls(addr, tls, handler.clone(), shutdown.token()).await,
        None => serve_plain(addr, handler.clone(), shutdown.token()).await,
    };

    if let Err(e) = serve_result {
        tracing::error!(error = ?e, "fatal listener error");
        std::process::exit(1);
    }

    // Stop accepting happened above; now drain in-flight work and join the
    // background tasks.
    shutdown.trigger();
    if !tracker.drain(shutdown.timeout()).await {
        tracing::warn!(
            active = tracker.active(),
            "shutdown timeout reached with requests still in flight"
        );
    }
    for task in background {
        let _ = task.await;
    }

    tracing::info!("shutdown complete");
    Ok(())
}

/// Plain-HTTP listener via axum, stopped by the shutdown token.
async fn serve_plain(
    addr: SocketAddr,
    handler: Arc<ProxyHandler>,
    mut shutdown: ShutdownToken,
) -> Result<()> {
    use axum::extract::ConnectInfo;

    let app = axum::Router::new().fallback(
        move |ConnectInfo(peer): ConnectInfo<SocketAddr>, req: axum::extract::Request| {
            let handler = handler.clone();
            async move { handler.handle(req, Some(peer)).await }
        },
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind listen address")?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.wait().await })
    .await
    .context("server error")
}

/// TLS listener: rustls accept loop feeding hyper's auto (h1/h2) builder.
async fn serve_tls(
    addr: SocketAddr,
    tls: &switchyard::config::models::TlsConfig,
    handler: Arc<ProxyHandler>,
    mut shutdown: ShutdownToken,
) -> Result<()> {
    use hyper_util::{
        rt::{TokioExecutor, TokioIo},
        server::conn::auto,
    };
    use tokio_rustls::TlsAcceptor;

    let server_config = build_rustls_config(tls)?;
    let acceptor = TlsAcceptor::from(Arc::new(server_config));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind listen address")?;

    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => accepted.context("accept failed")?,
            _ = shutdown.wait() => break,
        };

        let acceptor = acceptor.clone();
        let handler = handler.clone();
        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(tls_stream) => tls_stream,
                Err(e) => {
                    tracing::debug!(peer = %peer, error = %e, "TLS handshake failed");
                    return;
                }
            };

            let service = hyper::service::service_fn(move |req: hyper::Request<hyper::body::Incoming>| {
                let handler = handler.clone();
                async move {
                    Ok::<_, std::convert::Infallible>(
                        handler.handle(req.map(axum::body::Body::new), Some(peer)).await,
                    )
                }
            });

            let io = TokioIo::new(tls_stream);
            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .serve_connection_with_upgrades(io, service)
                .await
            {
                tracing::debug!(peer = %peer, error = %e, "connection error");
            }
        });
    }

    Ok(())
}

fn build_rustls_config(tls: &switchyard::config::models::TlsConfig) -> Result<rustls::ServerConfig> {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let cert_bytes = std::fs::read(&tls.cert_path)
        .with_context(|| format!("failed to read certificate {}", tls.cert_path))?;
    let key_bytes = std::fs::read(&tls.key_path)
        .with_context(|| format!("failed to read private key {}", tls.key_path))?;

    let certs: Vec<rustls::pki_types::CertificateDer<'static>> =
        rustls_pemfile::certs(&mut cert_bytes.as_slice())
            .collect::<Result<_, _>>()
            .context("failed to parse certificates")?;
    let key = rustls_pemfile::private_key(&mut key_bytes.as_slice())
        .context("failed to parse private key")?
        .ok_or_else(|| eyre!("no private key found in {}", tls.key_path))?;

    let versions: &[&'static rustls::SupportedProtocolVersion] = match tls.min_version.as_str() {
        "1.3" => &[&rustls::version::TLS13],
        "1.2" => &[&rustls::version::TLS12, &rustls::version::TLS13],
        other => {
            tracing::warn!(
                min_version = other,
                "TLS versions below 1.2 are not supported by rustls; using 1.2"
            );
            &[&rustls::version::TLS12, &rustls::version::TLS13]
        }
    };

    let mut server_config = rustls::ServerConfig::builder_with_protocol_versions(versions)
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("failed to build TLS server config")?;

    server_config.alpn_protocols = if tls.http2 {
        vec![b"h2".to_vec(), b"http/1.1".to_vec()]
    } else {
        vec![b"http/1.1".to_vec()]
    };
    Ok(server_config)
}

async fn sticky_sweep_task(sticky: Arc<StickySessions>, mut shutdown: ShutdownToken) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(5 * 60));
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let removed = sticky.sweep();
                if removed > 0 {
                    tracing::debug!(removed, "swept expired sessions");
                }
            }
            _ = shutdown.wait() => break,
        }
    }
}

async fn limiter_sweep_task(limiter: Arc<ClientRateLimiter>, mut shutdown: ShutdownToken) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => limiter.sweep(),
            _ = shutdown.wait() => break,
        }
    }
}

/// Validate a configuration file and exit 0/1.
fn validate_config_command(config_path: &str) -> Result<()> {
    println!("validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        eprintln!("error: configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    let config: ProxyConfig = match load_config(config_path) {
        Ok(config) => {
            println!("configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("configuration parsing failed:\n  {e:#}");
            std::process::exit(1);
        }
    };

    match ProxyConfigValidator::validate(&config) {
        Ok(()) => {
            println!("configuration validation: OK");
            println!();
            println!("summary:");
            println!("  listen address: {}", config.listen_addr);
            println!("  algorithm:      {:?}", config.load_balancing.algorithm);
            println!("  services:       {}", config.services.len());
            println!("  routes:         {}", config.routes.len());
            println!("  tls:            {}", config.tls.is_some());
            println!("  health checks:  {}", config.health_check.enabled);
            Ok(())
        }
        Err(e) => {
            eprintln!("configuration validation failed:");
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}
