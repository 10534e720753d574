//! Herald - announces Ghost posts into Discord channels
//!
//! Main entry point for the Herald CLI and daemon.

use anyhow::{bail, Context};
use async_trait::async_trait;
use clap::{Parser, Subcommand, ValueEnum};
use herald::admin::{ConnectionCheck, NotificationSettings, TenantAdmin, TenantStatus};
use herald::config::{validate_config_result, HeraldConfig};
use herald::credentials::{CredentialCache, Secret};
use herald::ids::{ChannelId, MentionId, TenantId};
use herald::notify::{DiscordNotifier, Notification, Notifier};
use herald::server::StatusServer;
use herald::source::{ContentItem, GhostClient};
use herald::store::{NotificationMode, TenantConfig, TenantEdit, TenantSetup, TenantStore};
use herald::sync::{CycleReport, Scheduler, SyncEngine};
use herald::{logging, HeraldError};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

/// Herald - Ghost to Discord announcements, per guild
#[derive(Parser, Debug)]
#[command(name = "herald")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to config file (default: ~/.config/herald/config.yaml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Ghost Content API key for the tenant this command targets
    #[arg(long, env = "HERALD_SOURCE_KEY", hide_env_values = true, global = true)]
    source_key: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the scheduler daemon
    Serve {
        /// Health/metrics/trigger address (overrides server.bind)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Configure a tenant (requires --source-key)
    Setup {
        /// Tenant id (Discord guild id)
        tenant: String,

        /// Ghost site URL
        #[arg(long)]
        url: String,

        /// Channel to announce into
        #[arg(long)]
        channel: Option<String>,

        /// Role to mention with each announcement
        #[arg(long)]
        mention: Option<String>,

        #[arg(long, value_enum, default_value = "new-and-updated")]
        mode: ModeArg,

        /// Enable announcements right away (requires --channel)
        #[arg(long)]
        enable: bool,
    },

    /// Change one setting of a tenant
    Edit {
        tenant: String,

        #[command(subcommand)]
        field: EditField,
    },

    /// Turn announcements on or off
    Notifications {
        tenant: String,

        #[arg(value_enum)]
        state: Toggle,

        #[arg(long)]
        channel: Option<String>,

        #[arg(long)]
        mention: Option<String>,

        #[arg(long, value_enum)]
        mode: Option<ModeArg>,
    },

    /// Remove a tenant and everything recorded for it
    Remove { tenant: String },

    /// Show a tenant's configuration and connection state
    Status {
        tenant: String,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Run one cycle now
    Run {
        /// Only this tenant (default: all enabled tenants)
        tenant: Option<String>,

        /// Ask a running daemon instead, e.g. http://127.0.0.1:9184
        #[arg(long)]
        via: Option<String>,
    },

    /// Measure the round trip to a tenant's Ghost site
    Ping { tenant: String },

    /// Search a tenant's posts by title
    Search { tenant: String, query: String },

    /// List a tenant's tags
    Tags { tenant: String },

    /// Recent posts carrying a tag
    Tag { tenant: String, slug: String },

    /// Open the store, apply pending migrations and report them
    Migrate,
}

#[derive(Subcommand, Debug)]
enum EditField {
    /// Ghost site URL
    Url { url: String },
    /// Rotate the Content API key (value from --source-key)
    Key,
    Channel { channel: String },
    /// Mention role; omit to clear
    Mention { role: Option<String> },
    Mode {
        #[arg(value_enum)]
        mode: ModeArg,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ModeArg {
    NewOnly,
    NewAndUpdated,
}

impl From<ModeArg> for NotificationMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::NewOnly => NotificationMode::NewOnly,
            ModeArg::NewAndUpdated => NotificationMode::NewAndUpdated,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Toggle {
    On,
    Off,
}

/// Stands in for Discord when no token is configured; commands that never
/// send still work
struct NoDestination;

#[async_trait]
impl Notifier for NoDestination {
    async fn send(&self, _: &ChannelId, _: &Notification) -> herald::Result<()> {
        Err(HeraldError::Config(
            "no Discord token configured in this process".to_string(),
        ))
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = match cli.command {
        Commands::Serve { .. } => logging::DAEMON_FILTER,
        _ => logging::CLI_FILTER,
    };
    if let Err(e) = logging::init(filter) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = HeraldConfig::load_or_default(cli.config.as_deref())?;
    validate_config_result(&config)?;

    if let Commands::Run {
        tenant,
        via: Some(base),
    } = &cli.command
    {
        return run_remote(base, tenant.as_deref()).await;
    }

    if let Commands::Migrate = cli.command {
        let store = TenantStore::open(&config.store_config())
            .context("Failed to open the tenant store")?;
        let report = store.migration_report();
        println!("Store: {}", config.database.path.display());
        println!("  legacy tenants imported:    {}", report.legacy_tenants);
        println!("  legacy watermarks imported: {}", report.legacy_watermarks);
        println!("  credentials re-hashed:      {}", report.credentials_upgraded);
        return Ok(());
    }

    let needs_destination = matches!(cli.command, Commands::Serve { .. } | Commands::Run { .. });
    let engine = Arc::new(build_engine(&config, needs_destination)?);
    let admin = TenantAdmin::new(engine.clone());

    match cli.command {
        Commands::Serve { bind } => {
            let mut scheduler = Scheduler::new(config.scheduler_config(), engine);

            if let Some(addr) = bind.or_else(|| config.server.bind.clone()) {
                let server = StatusServer::new(Some(scheduler.handle()));
                tokio::spawn(async move {
                    if let Err(e) = server.run(&addr).await {
                        tracing::error!(error = %e, "Status server stopped");
                    }
                });
            }

            scheduler.run().await?;
        }

        Commands::Setup {
            tenant,
            url,
            channel,
            mention,
            mode,
            enable,
        } => {
            let credential = required_key(cli.source_key)?;
            let summary = admin
                .setup(
                    &TenantId::new(tenant),
                    TenantSetup {
                        source_endpoint: url,
                        credential,
                        notifications_enabled: enable,
                        destination_channel: channel.map(ChannelId::new),
                        mention_target: mention.map(MentionId::new),
                        mode: mode.into(),
                    },
                )
                .await?;

            println!("✓ Tenant {} configured", summary.tenant.id);
            if let Some(title) = summary.site_title {
                println!("  Site: {}", title);
            }
            print_tenant(&summary.tenant);
            if let Some(indexed) = summary.indexed {
                println!("  Indexed {} existing posts (they will not be announced)", indexed);
            }
        }

        Commands::Edit { tenant, field } => {
            let tenant_id = TenantId::new(tenant);
            let edit = match field {
                EditField::Url { url } => {
                    admit_key(&engine, &tenant_id, cli.source_key)?;
                    TenantEdit::SourceEndpoint(url)
                }
                EditField::Key => TenantEdit::SourceCredential(required_key(cli.source_key)?),
                EditField::Channel { channel } => TenantEdit::Destination(ChannelId::new(channel)),
                EditField::Mention { role } => TenantEdit::Mention(role.map(MentionId::new)),
                EditField::Mode { mode } => TenantEdit::Mode(mode.into()),
            };
            let field_name = edit.field_name();
            let updated = admin.edit(&tenant_id, edit).await?;
            println!("✓ Updated {} for tenant {}", field_name, updated.id);
            print_tenant(&updated);
        }

        Commands::Notifications {
            tenant,
            state,
            channel,
            mention,
            mode,
        } => {
            let tenant_id = TenantId::new(tenant);
            admit_key(&engine, &tenant_id, cli.source_key)?;
            let summary = admin
                .set_notifications(
                    &tenant_id,
                    NotificationSettings {
                        enabled: matches!(state, Toggle::On),
                        channel: channel.map(ChannelId::new),
                        mention: mention.map(MentionId::new),
                        mode: mode.map(Into::into),
                    },
                )
                .await?;

            let verb = if summary.tenant.notifications_enabled {
                "enabled"
            } else {
                "disabled"
            };
            println!("✓ Notifications {} for tenant {}", verb, summary.tenant.id);
            print_tenant(&summary.tenant);
            if let Some(indexed) = summary.indexed.filter(|n| *n > 0) {
                println!("  Indexed {} existing posts (they will not be announced)", indexed);
            }
        }

        Commands::Remove { tenant } => {
            let removed = admin.remove(&TenantId::new(tenant))?;
            println!("✓ Removed tenant {} and its announcement history", removed.id);
        }

        Commands::Status { tenant, json } => {
            let tenant_id = TenantId::new(tenant);
            admit_key(&engine, &tenant_id, cli.source_key)?;
            let status = admin.status(&tenant_id).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_status(&status);
            }
        }

        Commands::Run { tenant, via: _ } => {
            let tenant_id = tenant.map(TenantId::new);
            if let Some(id) = tenant_id.as_ref() {
                admit_key(&engine, id, cli.source_key)?;
            }
            let report = engine.run_cycle(tenant_id.as_ref()).await;
            print_report(&report);
            if report.aborted {
                bail!("cycle aborted by a store failure");
            }
        }

        Commands::Ping { tenant } => {
            let tenant_id = TenantId::new(tenant);
            admit_key(&engine, &tenant_id, cli.source_key)?;
            let status = admin.ping(&tenant_id).await?;
            println!(
                "✓ {} responded in {} ms",
                status.site_title.as_deref().unwrap_or("Ghost site"),
                status.latency.as_millis()
            );
        }

        Commands::Search { tenant, query } => {
            let tenant_id = TenantId::new(tenant);
            admit_key(&engine, &tenant_id, cli.source_key)?;
            let items = admin.search(&tenant_id, &query).await?;
            print_items(&items, &format!("No posts matching '{}'", query));
        }

        Commands::Tags { tenant } => {
            let tenant_id = TenantId::new(tenant);
            admit_key(&engine, &tenant_id, cli.source_key)?;
            let tags = admin.tags(&tenant_id).await?;
            if tags.is_empty() {
                println!("No tags");
            }
            for tag in tags {
                match tag.post_count {
                    Some(count) => println!("  {:<24} {:<24} {} posts", tag.name, tag.slug, count),
                    None => println!("  {:<24} {}", tag.name, tag.slug),
                }
            }
        }

        Commands::Tag { tenant, slug } => {
            let tenant_id = TenantId::new(tenant);
            admit_key(&engine, &tenant_id, cli.source_key)?;
            let items = admin.posts_by_tag(&tenant_id, &slug).await?;
            print_items(&items, &format!("No posts tagged '{}'", slug));
        }

        Commands::Migrate => {}
    }

    Ok(())
}

fn build_engine(config: &HeraldConfig, needs_destination: bool) -> anyhow::Result<SyncEngine> {
    let store = TenantStore::open(&config.store_config())
        .with_context(|| format!("Failed to open tenant store at {}", config.database.path.display()))?;

    let migration = store.migration_report();
    if migration.legacy_tenants > 0 || migration.credentials_upgraded > 0 {
        tracing::info!(
            legacy_tenants = migration.legacy_tenants,
            legacy_watermarks = migration.legacy_watermarks,
            credentials_upgraded = migration.credentials_upgraded,
            "Store migrated"
        );
    }

    let notifier: Arc<dyn Notifier> = match config.discord_config() {
        Ok(discord) => Arc::new(DiscordNotifier::new(discord)?),
        Err(e) if needs_destination => return Err(e.into()),
        Err(e) => {
            tracing::debug!(error = %e, "No Discord token; sends are unavailable");
            Arc::new(NoDestination)
        }
    };

    let credentials = Arc::new(CredentialCache::new(config.credential_cache_config()));
    seed_credentials(config, &store, &credentials)?;

    Ok(SyncEngine::new(
        Arc::new(store),
        Arc::new(GhostClient::new()?),
        notifier,
        credentials,
        config.engine_config(),
    ))
}

/// Load bound credentials from the environment, verified against stored hashes
fn seed_credentials(
    config: &HeraldConfig,
    store: &TenantStore,
    credentials: &CredentialCache,
) -> herald::Result<()> {
    for binding in &config.credentials {
        let tenant_id = binding.tenant();
        let Some(secret) = binding.resolve() else {
            tracing::warn!(tenant_id = %tenant_id, env_var = %binding.env_var, "Credential variable not set");
            continue;
        };
        let stored = store
            .get_tenant(&tenant_id)?
            .and_then(|t| t.source_credential);
        match stored {
            Some(stored) => {
                if credentials.admit(&tenant_id, secret, &stored) {
                    tracing::debug!(tenant_id = %tenant_id, "Loaded credential from environment");
                }
            }
            None => {
                tracing::warn!(tenant_id = %tenant_id, "Credential bound for a tenant that has none stored")
            }
        }
    }
    Ok(())
}

fn required_key(key: Option<String>) -> anyhow::Result<Secret> {
    match key.map(Secret::new) {
        Some(secret) if !secret.is_blank() => Ok(secret),
        _ => bail!("a Ghost Content API key is required: pass --source-key or set HERALD_SOURCE_KEY"),
    }
}

/// Admit `--source-key` for one tenant, if given
fn admit_key(engine: &SyncEngine, tenant_id: &TenantId, key: Option<String>) -> anyhow::Result<()> {
    let Some(key) = key else {
        return Ok(());
    };
    let stored = engine
        .store()
        .require_tenant(tenant_id)?
        .source_credential
        .ok_or_else(|| HeraldError::Validation("no source credential is stored".to_string()))?;
    if !engine.credentials().admit(tenant_id, Secret::new(key), &stored) {
        bail!("--source-key does not match the stored credential for tenant {}", tenant_id);
    }
    Ok(())
}

async fn run_remote(base: &str, tenant: Option<&str>) -> anyhow::Result<()> {
    let base = base.trim_end_matches('/');
    let url = match tenant {
        Some(tenant) => format!("{}/run/{}", base, tenant),
        None => format!("{}/run", base),
    };

    let response = reqwest::Client::new()
        .post(&url)
        .send()
        .await
        .with_context(|| format!("Failed to reach daemon at {}", base))?;
    let status = response.status();
    let body: serde_json::Value = response.json().await?;
    if !status.is_success() {
        bail!(
            "daemon returned {}: {}",
            status,
            body["error"].as_str().unwrap_or("unknown error")
        );
    }
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

fn print_tenant(tenant: &TenantConfig) {
    println!(
        "  Source:   {}",
        tenant.source_endpoint.as_deref().unwrap_or("(not set)")
    );
    println!(
        "  Channel:  {}",
        tenant
            .destination_channel
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "(not set)".to_string())
    );
    if let Some(mention) = &tenant.mention_target {
        println!("  Mention:  <@&{}>", mention);
    }
    println!("  Mode:     {}", tenant.mode.label());
}

fn print_status(status: &TenantStatus) {
    println!("Tenant {}", status.tenant_id);
    println!(
        "  Source:        {}",
        status.source_endpoint.as_deref().unwrap_or("(not set)")
    );
    println!(
        "  Credential:    {}",
        if status.credential_configured {
            "configured"
        } else {
            "(not set)"
        }
    );
    println!(
        "  Notifications: {}",
        if status.notifications_enabled {
            "on"
        } else {
            "off"
        }
    );
    if let Some(channel) = &status.destination_channel {
        println!("  Channel:       {}", channel);
    }
    if let Some(mention) = &status.mention_target {
        println!("  Mention:       <@&{}>", mention);
    }
    println!("  Mode:          {}", status.mode.label());
    println!("  Indexed posts: {}", status.watermarks);
    if let Some(reason) = &status.skip_reason {
        println!("  Not polled:    {}", reason);
    }
    let connection = match &status.connection {
        ConnectionCheck::Connected {
            latency_ms,
            site_title,
        } => format!(
            "✓ {} ({} ms)",
            site_title.as_deref().unwrap_or("connected"),
            latency_ms
        ),
        ConnectionCheck::Failed { error } => format!("✗ {}", error),
        ConnectionCheck::NotConfigured => "not configured".to_string(),
        ConnectionCheck::CredentialNotLoaded => {
            "credential not loaded (pass --source-key)".to_string()
        }
    };
    println!("  Connection:    {}", connection);
    println!("  Updated:       {}", status.updated_at.format("%Y-%m-%d %H:%M UTC"));
}

fn print_report(report: &CycleReport) {
    println!("Cycle {}", report.status());
    println!("  Tenants checked: {}", report.tenants_checked);
    println!("  New posts:       {}", report.new_items);
    println!("  Updated posts:   {}", report.updated_items);
    println!("  Sent:            {}", report.sent);
    if report.failed_sends > 0 {
        println!("  Failed sends:    {}", report.failed_sends);
    }
    for skip in &report.skipped {
        println!("  - skipped {}: {}", skip.tenant_id, skip.reason);
    }
    for failure in &report.failures {
        println!(
            "  - failed {} ({}): {}",
            failure.tenant_id,
            failure.kind.as_str(),
            failure.message
        );
    }
}

fn print_items(items: &[ContentItem], empty: &str) {
    if items.is_empty() {
        println!("{}", empty);
        return;
    }
    for item in items {
        println!("  {}  {}", item.published_at.format("%Y-%m-%d"), item.title);
        println!("      {}", item.url);
    }
}
