//! mail-bridge: offline operator tool for a bridge settings directory
//!
//! Inspects and edits the vault a running bridge uses, and manages the
//! bridge-managed TLS certificate. Run it while the bridge is stopped; the
//! bridge reads the vault only at start.
//!
//! # Environment Variables
//!
//! See [`BridgeConfig::load_from_env`] for the settings directory and other
//! options. A `.env` file in the working directory is honoured.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use mail_bridge_core::config::{BridgeConfig, parse_bool_value};
use mail_bridge_core::errors::{AppError, AppResult};
use mail_bridge_core::tls;
use mail_bridge_core::vault::Vault;
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "mail-bridge", version, about = "Local mail bridge operator tool")]
struct Cli {
    /// Settings directory (overrides MAIL_BRIDGE_SETTINGS_DIR)
    #[arg(long, global = true)]
    settings_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show or change persisted settings
    #[command(subcommand)]
    Settings(SettingsCommand),
    /// Inspect persisted accounts
    #[command(subcommand)]
    Users(UsersCommand),
    /// Manage the local TLS certificate
    #[command(subcommand)]
    Cert(CertCommand),
}

#[derive(Debug, Subcommand)]
enum SettingsCommand {
    /// Print settings as JSON
    Show,
    /// Change one setting
    Set {
        #[arg(value_enum)]
        key: SettingKey,
        value: String,
    },
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum SettingKey {
    ImapPort,
    SmtpPort,
    ImapSsl,
    SmtpSsl,
    DataDir,
}

#[derive(Debug, Subcommand)]
enum UsersCommand {
    /// List accounts without credentials
    List,
}

#[derive(Debug, Subcommand)]
enum CertCommand {
    /// Write a fresh self-signed certificate, replacing any existing one
    Generate,
}

fn parse_port(value: &str) -> AppResult<u16> {
    value
        .trim()
        .parse()
        .map_err(|_| AppError::invalid(format!("invalid port '{value}'")))
}

fn parse_flag(value: &str) -> AppResult<bool> {
    parse_bool_value(value).ok_or_else(|| AppError::invalid(format!("invalid boolean '{value}'")))
}

fn set_setting(vault: &Vault, key: SettingKey, value: &str) -> AppResult<()> {
    match key {
        SettingKey::ImapPort => vault.set_imap_port(parse_port(value)?),
        SettingKey::SmtpPort => vault.set_smtp_port(parse_port(value)?),
        SettingKey::ImapSsl => vault.set_imap_ssl(parse_flag(value)?),
        SettingKey::SmtpSsl => vault.set_smtp_ssl(parse_flag(value)?),
        SettingKey::DataDir => vault.set_data_dir(&PathBuf::from(value)),
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> AppResult<String> {
    serde_json::to_string_pretty(value).map_err(|e| AppError::Internal(format!("json encode failed: {e}")))
}

fn run(cli: Cli) -> AppResult<()> {
    let mut config = BridgeConfig::load_from_env()?;
    if let Some(dir) = cli.settings_dir {
        config.settings_dir = dir;
    }

    match cli.command {
        Command::Settings(SettingsCommand::Show) => {
            let vault = Vault::open(config.vault_path())?;
            println!("{}", to_json(&vault.settings())?);
        }
        Command::Settings(SettingsCommand::Set { key, value }) => {
            let vault = Vault::open(config.vault_path())?;
            set_setting(&vault, key, &value)?;
            info!(?key, value = %value, "setting updated");
        }
        Command::Users(UsersCommand::List) => {
            let vault = Vault::open(config.vault_path())?;
            let users = vault
                .get_user_ids()
                .iter()
                .map(|id| {
                    vault.get_user(id).map(|r| {
                        json!({
                            "user_id": r.user_id,
                            "username": r.username,
                            "primary_email": r.primary_email,
                            "address_mode": r.address_mode,
                            "signed_in": r.has_auth(),
                            "bad_event": r.bad_event.is_some(),
                        })
                    })
                })
                .collect::<AppResult<Vec<_>>>()?;
            println!("{}", to_json(&users)?);
        }
        Command::Cert(CertCommand::Generate) => {
            let paths = tls::generate_certificate(&config.settings_dir)?;
            println!("{}", paths.cert.display());
        }
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    run(Cli::parse())?;
    Ok(())
}
