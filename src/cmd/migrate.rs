//! Job commands: `svnlift migrate`, `status`, `init-db`, `reconcile`.

use anyhow::{Context, Result};
use svnlift::config::SvnliftConfig;
use svnlift::migration::models::{MigrationDetail, NewMigration, Status};
use svnlift::migration::server::{build_manager, open_db};

fn print_detail(detail: &MigrationDetail) {
    let m = &detail.migration;
    println!(
        "Migration {}: {} ({}) -> {} [{}]",
        m.id, m.svn_group, m.svn_project, m.gitlab_group, m.status
    );
    for record in &detail.history {
        println!(
            "  {:<18} {:<8} {}  {}",
            record.step.as_str(),
            record.status.as_str(),
            record.date.format("%Y-%m-%d %H:%M:%S%.3f"),
            record.data.as_deref().unwrap_or("")
        );
    }
}

pub async fn cmd_migrate(config: &SvnliftConfig, request: NewMigration) -> Result<()> {
    request.validate().map_err(|e| anyhow::anyhow!(e))?;
    let db = open_db(&config.server.db_path)?;
    let migration = db
        .call(move |db| db.create_migration(&request))
        .await
        .context("Failed to create migration")?;
    println!("Created migration {}", migration.id);

    let manager = build_manager(config, &db)?;
    let status = manager.run_migration(migration.id).await?;

    let id = migration.id;
    let detail = db
        .call(move |db| db.get_migration_detail(id))
        .await?
        .with_context(|| format!("Migration {} not found", id))?;
    print_detail(&detail);

    if status == Status::Failed {
        anyhow::bail!("Migration {} FAILED", id);
    }
    Ok(())
}

pub async fn cmd_status(config: &SvnliftConfig, id: i64) -> Result<()> {
    let db = open_db(&config.server.db_path)?;
    let detail = db
        .call(move |db| db.get_migration_detail(id))
        .await?
        .with_context(|| format!("Migration {} not found", id))?;
    print_detail(&detail);
    Ok(())
}

pub fn cmd_init_db(config: &SvnliftConfig) -> Result<()> {
    open_db(&config.server.db_path)?;
    println!("Migration database initialized at {}", config.server.db_path.display());
    Ok(())
}

pub async fn cmd_reconcile(config: &SvnliftConfig) -> Result<()> {
    let db = open_db(&config.server.db_path)?;
    let count = db.call(|db| db.fail_interrupted()).await?;
    println!("Marked {} interrupted migration(s) FAILED", count);
    Ok(())
}
