// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! mws-admin - Tenant administration for the MWS app store
//!
//! Operates on the control plane configured through `MWS_*` environment
//! variables (a `.env` file is honoured). Commands that touch a tenant
//! database bind that tenant's execution context first, exactly as a routed
//! request would.

use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{error, info};

use mws_tenancy::{
    Config, ExecutionContext, NewTenant, Tenancy, TenancyError, TenantDescriptor, TenantKey,
};

#[derive(Parser)]
#[command(name = "mws-admin")]
#[command(version, about = "Tenant administration for the MWS app store", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Print machine-readable JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision a new tenant
    Provision {
        /// Store display name
        #[arg(long)]
        name: String,

        /// Tenant key (also the store subdomain)
        #[arg(long)]
        key: String,

        /// Contact email of the store operator
        #[arg(long)]
        email: String,
    },

    /// List active tenants
    List,

    /// Show a tenant's control-plane record
    Show {
        /// Tenant key
        key: String,
    },

    /// Show which tenant a host routes to
    Resolve {
        /// Host name, e.g. acme.example.com
        host: String,
    },

    /// Apply pending schema migrations to a tenant database
    Migrate {
        /// Tenant key
        key: String,
    },

    /// Re-seed baseline roles and permissions of a tenant
    SeedPermissions {
        /// Tenant key
        key: String,
    },

    /// Check that a tenant database accepts connections
    Ping {
        /// Tenant key
        key: String,
    },

    /// Drop a tenant: registry entry, control-plane record and database
    Rollback {
        /// Tenant key
        key: String,

        /// Confirm the tenant database may be dropped
        #[arg(long)]
        yes: bool,
    },

    /// Roll back tenants left half-provisioned by a crash
    Recover {
        /// Only touch tenants that started provisioning this long ago
        #[arg(long, default_value = "3600")]
        grace_secs: u64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| {
                    tracing_subscriber::EnvFilter::new("mws_tenancy=info,mws_admin=info")
                }),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.downcast_ref::<TenancyError>() {
                Some(tenancy_error) => {
                    error!(code = tenancy_error.error_code(), error = %e, "Command failed");
                    eprintln!("error: {}", tenancy_error.public_message());
                }
                None => {
                    error!(error = %e, "Command failed");
                    eprintln!("error: {:#}", e);
                }
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::from_env()?;
    let tenancy = Tenancy::connect(&config).await?;
    let json = cli.json;

    match cli.command {
        Commands::Provision { name, key, email } => {
            let descriptor = tenancy
                .provision(&NewTenant::new(name, key, email))
                .await?;
            print_descriptor(&descriptor, None, json)?;
        }

        Commands::List => {
            let tenants = tenancy.control_plane().list_active().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&tenants)?);
            } else {
                for tenant in &tenants {
                    println!(
                        "{:<25}  {:<25}  {:<30}  {}",
                        tenant.key.as_str(),
                        tenant.display_name,
                        tenant.contact_email,
                        tenant.connection.database
                    );
                }
            }
        }

        Commands::Show { key } => {
            let key = TenantKey::parse(key)?;
            let Some(record) = tenancy.control_plane().get(&key).await? else {
                return Err(TenancyError::UnknownTenant {
                    key: key.to_string(),
                }
                .into());
            };
            print_descriptor(&record.descriptor, Some(record.status.as_str()), json)?;
        }

        Commands::Resolve { host } => {
            let ctx = tenancy.router().route(host.as_str()).await?;
            if json {
                println!(
                    "{}",
                    json!({ "tenant": ctx.key(), "database": ctx.connection().database })
                );
            } else {
                println!("{} -> {} ({})", host, ctx.key(), ctx.connection().database);
            }
        }

        Commands::Migrate { key } => {
            let key = TenantKey::parse(key)?;
            let schema = tenancy.schema().clone();
            tenancy
                .router()
                .enter(&key, |ctx| async move { schema.migrate(ctx.connection()).await })
                .await??;
            info!(tenant = %key, "Migrations applied");
            print_outcome(json, &key, "migrated");
        }

        Commands::SeedPermissions { key } => {
            let key = TenantKey::parse(key)?;
            let schema = tenancy.schema().clone();
            tenancy
                .router()
                .enter(&key, |ctx| async move {
                    schema.seed_permissions(ctx.connection()).await
                })
                .await??;
            info!(tenant = %key, "Permissions seeded");
            print_outcome(json, &key, "seeded");
        }

        Commands::Ping { key } => {
            let key = TenantKey::parse(key)?;
            let pools = tenancy.pools().clone();
            tenancy
                .router()
                .enter(&key, |_| async move {
                    let ctx = ExecutionContext::current()?;
                    let pool = pools.pool(&ctx);
                    sqlx::query("SELECT 1").execute(&pool).await?;
                    anyhow::Ok(())
                })
                .await??;
            print_outcome(json, &key, "ok");
        }

        Commands::Rollback { key, yes } => {
            let key = TenantKey::parse(key)?;
            if !yes {
                bail!(
                    "refusing to drop tenant '{}' and its database without --yes",
                    key
                );
            }
            tenancy.rollback(&key).await?;
            print_outcome(json, &key, "rolled back");
        }

        Commands::Recover { grace_secs } => {
            let report = tenancy
                .recover_incomplete(Duration::from_secs(grace_secs))
                .await?;

            if json {
                println!(
                    "{}",
                    json!({
                        "recovered": report.recovered,
                        "failed": report
                            .failed
                            .iter()
                            .map(|failure| json!({
                                "tenant": failure.key,
                                "database": failure.database,
                                "error": failure.to_string(),
                            }))
                            .collect::<Vec<_>>(),
                    })
                );
            } else {
                for key in &report.recovered {
                    println!("recovered {}", key);
                }
                for failure in &report.failed {
                    println!("FAILED    {}", failure);
                }
            }

            if !report.failed.is_empty() {
                bail!(
                    "{} tenant(s) could not be cleaned up; manual intervention required",
                    report.failed.len()
                );
            }
        }
    }

    Ok(())
}

fn print_descriptor(descriptor: &TenantDescriptor, status: Option<&str>, json: bool) -> Result<()> {
    if json {
        let mut value = serde_json::to_value(descriptor)?;
        if let (Some(status), Some(object)) = (status, value.as_object_mut()) {
            object.insert("status".to_string(), json!(status));
        }
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("tenant:    {}", descriptor.key);
    println!("name:      {}", descriptor.display_name);
    println!("email:     {}", descriptor.contact_email);
    println!(
        "database:  {} on {}:{}",
        descriptor.connection.database, descriptor.connection.host, descriptor.connection.port
    );
    println!("created:   {}", descriptor.created_at.to_rfc3339());
    if let Some(status) = status {
        println!("status:    {}", status);
    }
    Ok(())
}

fn print_outcome(json: bool, key: &TenantKey, outcome: &str) {
    if json {
        println!("{}", json!({ "tenant": key, "result": outcome }));
    } else {
        println!("{}: {}", key, outcome);
    }
}
