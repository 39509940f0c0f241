use std::path::Path;

use clap::Parser;
use color_eyre::{
    Result,
    eyre::{WrapErr, eyre},
};
use sphinx::{
    GracefulShutdown, Lifetime, Supervisor,
    adapters::site,
    config::{ServerConfigValidator, loader::load_config},
    metrics, tracing_setup,
    utils::panic_hook,
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "config.yaml")]
    config: String,

    /// Human-readable console logs instead of JSON
    #[clap(long, global = true)]
    pretty: bool,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        #[clap(short, long, default_value = "config.yaml")]
        config: String,
    },
    /// Initialize a new configuration file
    Init {
        /// Output path for the new config file
        #[clap(short, long, default_value = "config.yaml")]
        config: String,
    },
    /// Start the server (default)
    Serve {
        /// Configuration file to use
        #[clap(short, long, default_value = "config.yaml")]
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

    let subscriber = if args.pretty {
        tracing_setup::init_console_tracing()
    } else {
        tracing_setup::init_tracing()
    };
    subscriber.map_err(|e| eyre!("Failed to initialize tracing: {}", e))?;
    panic_hook::install();

    let provider = rustls::crypto::aws_lc_rs::default_provider();
    if rustls::crypto::CryptoProvider::install_default(provider).is_err() {
        tracing::warn!("a rustls crypto provider was already installed");
    }

    metrics::init_metrics().map_err(|e| eyre!("Failed to initialize metrics: {}", e))?;

    let config = load_config(&config_path)
        .await
        .wrap_err_with(|| format!("Failed to load configuration from {config_path}"))?;
    tracing::info!(
        path = %config_path,
        addr = %config.listen_addr(),
        tls = config.tls.is_some(),
        https_redirect = config.https_redirect,
        "configuration loaded"
    );

    let supervisor = Supervisor::new(config, site::factory()).wrap_err("Failed to start server")?;

    let lifetime = Lifetime::new();
    let signals = GracefulShutdown::new(lifetime.clone(), supervisor.reload_handle());
    let signal_task = tokio::spawn(async move {
        if let Err(e) = signals.run_signal_handler().await {
            tracing::error!(error = %format!("{e:#}"), "signal handler failed");
        }
    });

    let result = supervisor.run(lifetime.clone()).await;

    lifetime.cancel(sphinx::CancelReason::Requested);
    let _ = signal_task.await;

    match result {
        Ok(()) => {
            tracing::info!("server gracefully stopped");
            Ok(())
        }
        Err(e) => {
            tracing::error!(error = %e, "server stopped unexpectedly");
            Err(eyre!(e))
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

    match ServerConfigValidator::validate(&config) {
        Ok(()) => {
            println!("✅ Configuration validation: OK");
            println!();
            println!("📋 Configuration Summary:");
            println!("   • Listen Address: {}", config.listen_addr());
            println!("   • TLS Enabled: {}", config.tls.is_some());
            println!("   • HTTPS Redirect: {}", config.https_redirect);
            println!(
                "   • Admission: {} shards, {} per shard, one start per {}",
                config.admission.shards,
                config.admission.max_concurrent,
                humantime::format_duration(config.admission.period)
            );
            match config.deadline {
                Some(deadline) => println!("   • Deadline: {deadline}"),
                None => println!("   • Deadline: none"),
            }
            println!();
            println!("🎉 Configuration is valid and ready to use!");
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ Configuration validation failed:");
            eprintln!("{e}");
            println!();
            println!("💡 Common fixes:");
            println!("   • Set port, data_dir, admin_key and shutdown_timeout");
            println!("   • Give admission.shards, admission.period and admission.max_concurrent");
            println!("   • Name both tls.cert_file and tls.key_file, or neither");
            println!("   • Use valid duration units (ms, s, m, h)");
            std::process::exit(1);
        }
    }
}

/// Initialize a new configuration file
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' already exists");
        std::process::exit(1);
    }

    let default_config = r#"# Sphinx server configuration

# Canonical host; requests for any other host are redirected here.
# Leave empty to listen on every interface without redirecting.
host: ""
port: 8080

# tls:
#   cert_file: /etc/letsencrypt/live/example.com/fullchain.pem
#   key_file: /etc/letsencrypt/live/example.com/privkey.pem
#   reload_interval: 24h
# https_redirect: true
# redirect_port: 80

admission:
  shards: 1024
  period: 100ms
  max_concurrent: 3

shutdown_timeout: 10s
# deadline: "2026-11-01T18:00:00Z"

data_dir: ./data
admin_key: change-me
"#;

    tokio::fs::write(path, default_config)
        .await
        .wrap_err("Failed to write config file")?;
    println!("✅ Created default configuration at: {config_path}");
    println!("   Run 'sphinx serve --config {config_path}' to start the server");
    Ok(())
}
