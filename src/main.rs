use std::{path::Path, sync::Arc};

use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use dgate::{
    DGateServer,
    config::{ConfigValidator, DGateConfig, loader::load_config},
    metrics, tracing_setup,
    utils::{GracefulShutdown, ShutdownReason},
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "config.dgate.yaml")]
    config: String,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        #[clap(short, long, default_value = "config.dgate.yaml")]
        config: String,
    },
    /// Initialize a new configuration file
    Init {
        /// Output path for the new config file
        #[clap(short, long, default_value = "config.dgate.yaml")]
        config: String,
    },
    /// Start the gateway (default)
    Serve {
        /// Configuration file to use
        #[clap(short, long, default_value = "config.dgate.yaml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    let config_path = match args.command {
        Some(Commands::Validate { config }) => return validate_config_command(&config).await,
        Some(Commands::Init { config }) => return init_config_command(&config).await,
        Some(Commands::Serve { config }) => config,
        None => args.config,
    };

    let config = load_config(&config_path)
        .await
        .with_context(|| format!("Failed to load config from {config_path}"))?;
    ConfigValidator::validate(&config).map_err(|e| eyre!("Invalid configuration: {e}"))?;

    tracing_setup::init_tracing(&config.log_level, config.log_json)
        .map_err(|e| eyre!("Failed to initialize tracing: {}", e))?;

    let provider = rustls::crypto::aws_lc_rs::default_provider();
    if let Err(e) = rustls::crypto::CryptoProvider::install_default(provider) {
        tracing::warn!(
            "CryptoProvider::install_default for aws-lc-rs reported an error: {:?}. \
            A provider was probably installed already.",
            e
        );
    }

    let metrics_handle = metrics::init_metrics(&config.metrics, config.disable_metrics)
        .map_err(|e| eyre!("Failed to initialize metrics: {}", e))?;

    tracing::info!(
        config = %config_path,
        version = env!("CARGO_PKG_VERSION"),
        replicated = config.replication().is_some(),
        "Starting DGate"
    );

    let server = DGateServer::build(config, metrics_handle.sink.clone())
        .context("Failed to build gateway")?;

    let graceful_shutdown = Arc::new(GracefulShutdown::new());
    let signal_handler_shutdown = graceful_shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = signal_handler_shutdown.run_signal_handler().await {
            tracing::error!("Signal handler error: {}", e);
        }
    });

    server.start().await?;
    let reason = server.serve(graceful_shutdown).await;
    metrics_handle.shutdown();

    match reason? {
        ShutdownReason::Fatal => Err(eyre!("DGate stopped after a fatal state error")),
        reason => {
            tracing::info!(?reason, "Graceful shutdown completed");
            Ok(())
        }
    }
}

/// Validate configuration file and exit
async fn validate_config_command(config_path: &str) -> Result<()> {
    println!("🔍 Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    let config = match load_config(config_path).await {
        Ok(config) => {
            println!("✅ Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("❌ Configuration parsing failed:");
            eprintln!("   {e:#}");
            std::process::exit(1);
        }
    };

    match ConfigValidator::validate(&config) {
        Ok(()) => {
            print_summary(&config);
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ Configuration validation failed:");
            eprintln!("{e}");
            println!();
            println!("💡 Common fixes:");
            println!("   • Set storage.dir when storage.type is `file`");
            println!("   • Give every init resource a name and an existing namespace");
            println!("   • Set either payload or payload_file on init modules, not both");
            println!("   • Provide cert_file and key_file together");
            std::process::exit(1);
        }
    }
}

fn print_summary(config: &DGateConfig) {
    println!("✅ Configuration validation: OK");
    println!();
    println!("📋 Configuration Summary:");
    println!(
        "   • Proxy Address: {}:{}",
        config.proxy.host, config.proxy.port
    );
    println!("   • TLS Enabled: {}", config.proxy.tls.is_some());
    println!("   • Storage: {:?}", config.storage.kind);
    match &config.admin {
        Some(admin) => println!("   • Admin API: {}:{}", admin.host, admin.port),
        None => println!("   • Admin API: disabled"),
    }
    println!("   • Replication: {}", config.replication().is_some());
    println!();
    println!("🎉 Configuration is valid and ready to use!");
}

/// Initialize a new configuration file
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' already exists");
        std::process::exit(1);
    }

    let default_config = r#"# DGate Configuration
version: v1
log_level: ${LOG_LEVEL:-info}
debug: false

storage:
  type: file
  dir: .dgate/data/

proxy:
  host: 0.0.0.0
  port: 80
  # tls:
  #   port: 443
  #   cert_file: server.crt
  #   key_file: server.key
  global_headers:
    X-Powered-By: DGate
  init_resources:
    namespaces:
      - name: example
    services:
      - name: httpbin
        namespace: example
        urls:
          - https://httpbin.org
    routes:
      - name: httpbin
        namespace: example
        paths: ["/httpbin/*"]
        methods: ["*"]
        stripPath: true
        service: httpbin

admin:
  host: 127.0.0.1
  port: 9080
  allow_list:
    - 127.0.0.1
    - ::1
"#;

    tokio::fs::write(path, default_config)
        .await
        .context("Failed to write config file")?;
    println!("✅ Created default configuration at: {config_path}");
    println!("   Run 'dgate serve --config {config_path}' to start the gateway");
    Ok(())
}
