use anyhow::{Context, Result};
use std::fmt::Write;
use std::path::Path;

use migrator_core::MigratorConfig;
use migrator_engine::{
    create_migration, MigrationError, MigrationRunResult, Migrator, RollbackResult, StatusReport,
};

fn load_config(config_path: &Path) -> Result<MigratorConfig> {
    MigratorConfig::load(config_path)
        .with_context(|| format!("failed to load configuration from {}", config_path.display()))
}

async fn connect(config_path: &Path) -> Result<Migrator> {
    let config = load_config(config_path)?;
    for (key, source) in config.config_sources() {
        tracing::debug!(key = %key, source = %source, "configuration value");
    }
    tracing::info!(
        database = %config.database.display_url(),
        migrations = %config.migrations_path.display(),
        table = %config.table,
        "using configuration"
    );
    Ok(Migrator::connect(&config).await?)
}

pub async fn up(config_path: &Path, dry_run: bool) -> Result<()> {
    let migrator = connect(config_path).await?;
    let result = migrator.up(dry_run).await.map_err(report_committed)?;
    print!("{}", render_run(&result));
    Ok(())
}

pub async fn down(config_path: &Path, steps: usize) -> Result<()> {
    let migrator = connect(config_path).await?;
    let result = migrator.down(steps).await?;
    print!("{}", render_rollback(&result));
    Ok(())
}

pub async fn status(config_path: &Path, json: bool) -> Result<()> {
    let migrator = connect(config_path).await?;
    let report = migrator.status().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", render_status(&report));
    }
    Ok(())
}

pub fn create(config_path: &Path, name: &str, dir: Option<&Path>) -> Result<()> {
    let created = match dir {
        Some(dir) => create_migration(dir, name)?,
        None => {
            let config = load_config(config_path)?;
            create_migration(&config.migrations_path, name)?
        }
    };

    println!("Created migration: {}", created.up_path.display());
    println!("Created migration: {}", created.down_path.display());
    Ok(())
}

pub async fn auto(config_path: &Path) -> Result<()> {
    let migrator = connect(config_path).await?;
    let result = migrator.auto_migrate().await.map_err(report_committed)?;
    print!("{}", render_run(&result));
    Ok(())
}

/// Print the migrations a failed run committed before handing the error back
fn report_committed(err: MigrationError) -> MigrationError {
    print!("{}", render_committed(&err));
    err
}

fn render_committed(err: &MigrationError) -> String {
    let mut out = String::new();
    for key in err.applied() {
        let _ = writeln!(out, "  applied {}", key);
    }
    if let MigrationError::Interrupted { applied, total, .. } = err {
        let _ = writeln!(out, "applied {}/{} migrations before the failure", applied.len(), total);
    }
    out
}

fn render_run(result: &MigrationRunResult) -> String {
    let mut out = String::new();
    for key in &result.pending_migrations {
        let _ = writeln!(out, "  would apply {}", key);
    }
    for key in &result.applied_migrations {
        let _ = writeln!(out, "  applied {}", key);
    }
    let _ = writeln!(out, "{}", result.summary());
    out
}

fn render_rollback(result: &RollbackResult) -> String {
    let mut out = String::new();
    for key in &result.rolled_back_migrations {
        let _ = writeln!(out, "  rolled back {}", key);
    }
    let _ = writeln!(out, "{}", result.summary());
    out
}

fn render_status(report: &StatusReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Migration Status:");
    let _ = writeln!(out, "================");

    if report.applied.is_empty() {
        let _ = writeln!(out, "No applied migrations");
    } else {
        let _ = writeln!(out, "Applied:");
        for entry in &report.applied {
            let _ = writeln!(
                out,
                "  [batch {}] {} {}  {}  {}",
                entry.batch,
                entry.id,
                entry.name,
                entry.applied_at.format("%Y-%m-%d %H:%M:%S UTC"),
                entry.checksum.chars().take(12).collect::<String>()
            );
        }
    }

    if report.pending.is_empty() {
        let _ = writeln!(out, "No pending migrations");
    } else {
        let _ = writeln!(out, "Pending:");
        for pending in &report.pending {
            let _ = writeln!(out, "  {} {}", pending.id, pending.name);
        }
    }
    out
}
