use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{debug, error, info, warn};
use ykapdu_core::transport::list_keys;
use ykapdu_core::{
    Application, CcidConnector, Command, Connection, ConnectionConfig, Response,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "YubiKey APDU Tool (Pure Rust)", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Path to a TOML connection config
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Serial number of the key to use (default: first found)
    #[arg(short, long, global = true)]
    serial: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List attached keys
    List,
    /// Show key details and which applications answer SELECT
    Info,
    /// Send raw APDUs, optionally after selecting an application
    Send {
        /// Application to select first: piv, oath, fido, mgmt or a hex AID
        #[arg(short, long)]
        app: Option<Application>,

        /// Stop at the first non-success status word
        #[arg(long)]
        strict: bool,

        /// APDUs as hex, e.g. 00CB3FFF055C035FC102
        #[arg(required = true)]
        apdus: Vec<String>,
    },
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::WARN.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => ConnectionConfig::load_from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => ConnectionConfig::default(),
    };
    debug!(?config, "Configuration");

    if let Commands::List = args.command {
        return list();
    }

    let conn = open(&config, args.serial)?;
    let result = match args.command {
        Commands::Info => info_cmd(&conn),
        Commands::Send { app, strict, apdus } => send(&conn, app, strict, &apdus),
        Commands::List => Ok(()),
    };

    // Let the key power down before the process exits
    if let Err(e) = conn.stop_blocking(config.stop_timeout()) {
        warn!(error = %e, "Key did not close cleanly");
    }
    result
}

fn list() -> Result<()> {
    let keys = list_keys()?;
    if keys.is_empty() {
        println!("No keys found");
        return Ok(());
    }
    for key in keys {
        println!(
            "{:04x}:{:04x}  {:<32}  serial {}",
            key.vendor_id,
            key.product_id,
            key.product.as_deref().unwrap_or("<unknown>"),
            key.serial.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

fn open(config: &ConnectionConfig, serial: Option<String>) -> Result<Connection> {
    let connector = match serial {
        Some(serial) => CcidConnector::with_serial(serial),
        None => CcidConnector::new(),
    };
    let conn = Connection::new(connector, config.clone());
    conn.start_blocking(config.start_timeout())
        .context("opening key")?;
    Ok(conn)
}

fn info_cmd(conn: &Connection) -> Result<()> {
    let Some(description) = conn.description() else {
        bail!("connection closed before reading key details");
    };
    println!("Name:      {}", description.name);
    println!("Interface: {}", description.kind);
    if let Some(serial) = description.serial {
        println!("Serial:    {}", serial);
    }
    if let Some(version) = &description.firmware_version {
        println!("Firmware:  {}", version);
    }
    println!("Extended:  {}", if description.extended_apdu { "yes" } else { "no" });

    for app in [
        Application::Management,
        Application::Piv,
        Application::Oath,
        Application::Fido,
    ] {
        match conn.select(&app) {
            Ok(_) => println!("{:<10} available", app.to_string()),
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => println!("{:<10} unavailable ({})", app.to_string(), e),
        }
    }
    Ok(())
}

fn send(conn: &Connection, app: Option<Application>, strict: bool, apdus: &[String]) -> Result<()> {
    let session = match &app {
        Some(app) => {
            info!(app = %app, "Selecting application");
            Some(conn.select(app).with_context(|| format!("selecting {}", app))?)
        }
        None => None,
    };

    for text in apdus {
        let bytes = hex::decode(text.replace([' ', ':'], ""))
            .with_context(|| format!("invalid hex APDU '{}'", text))?;
        let command = Command::from_bytes(&bytes)?;
        let response = match &session {
            Some(session) => session.transmit(command)?,
            None => conn.execute_blocking(command)?,
        };
        print_response(&response);
        if strict && !response.is_success() {
            warn!(status = %response.status(), "Stopping at non-success status");
            bail!("card returned {}", response.status());
        }
    }
    Ok(())
}

fn print_response(response: &Response) {
    if response.payload().is_empty() {
        println!("{}", response.status());
    } else {
        println!("{} {}", hex::encode_upper(response.payload()), response.status());
    }
}
