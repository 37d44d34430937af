use anyhow::Context;
use keel_migrate::{
    AdvanceTarget, MigrateError, MigrationFailure, MigrationId, MigrationRollback, MigrationRunner,
    MigrationState, MigrationStatusReport, RevertTarget, RunReport,
};

/// Apply pending migrations
pub async fn up(runner: &MigrationRunner, to: Option<MigrationId>) -> anyhow::Result<()> {
    let target = to.map_or(AdvanceTarget::Latest, AdvanceTarget::To);
    match runner.advance(target).await {
        Ok(report) => {
            print_report(&report, "Applied");
            Ok(())
        }
        Err(err) => Err(report_failure(err)),
    }
}

/// Revert applied migrations
pub async fn down(runner: &MigrationRunner, target: RevertTarget) -> anyhow::Result<()> {
    match runner.revert(target).await {
        Ok(report) => {
            print_report(&report, "Reverted");
            Ok(())
        }
        Err(err) => Err(report_failure(err)),
    }
}

/// Show migration status
pub async fn status(runner: &MigrationRunner, json: bool) -> anyhow::Result<()> {
    let report = runner
        .status()
        .await
        .context("Failed to read migration status")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", render_status(&report));
    }
    Ok(())
}

fn print_report(report: &RunReport, verb: &str) {
    if report.is_empty() && !report.cancelled {
        println!("Nothing to do: database is up to date");
        return;
    }

    for id in &report.processed {
        println!("  ✅ {} {}", verb, id);
    }
    println!(
        "{} {} migration(s) in {}ms",
        verb,
        report.count(),
        report.execution_time_ms
    );

    if report.cancelled {
        println!("⚠️  Cancelled before completion; not processed:");
        for id in &report.remaining {
            println!("  ⏳ {}", id);
        }
    }
}

/// Print what a failed batch left behind, then hand the error back
fn report_failure(err: MigrateError) -> anyhow::Error {
    if let Some(failure) = err.as_failure() {
        print_failure(failure);
    }
    anyhow::Error::new(err)
}

fn print_failure(failure: &MigrationFailure) {
    eprintln!(
        "❌ Migration {} ('{}') failed during {} ({})",
        failure.id, failure.name, failure.direction, failure.stage
    );
    eprintln!("   Cause: {}", failure.cause);
    if !failure.completed.is_empty() {
        eprintln!("   Completed before the failure:");
        for id in &failure.completed {
            eprintln!("     ✅ {}", id);
        }
    }
    eprintln!("   Not attempted:");
    eprintln!("     ❌ {} (rolled back)", failure.id);
    for id in &failure.remaining {
        eprintln!("     ⏳ {}", id);
    }
}

/// Human-readable status table
pub fn render_status(report: &MigrationStatusReport) -> String {
    let mut out = String::from("Migration Status:\n================\n");

    if report.entries.is_empty() {
        out.push_str("No migrations registered\n");
    }

    for entry in &report.entries {
        let line = match &entry.state {
            MigrationState::Applied { applied_at } => format!(
                "  ✅ {}  {}  (applied {})\n",
                entry.id,
                entry.name,
                applied_at.format("%Y-%m-%d %H:%M:%S UTC")
            ),
            MigrationState::Pending => format!("  ⏳ {}  {}\n", entry.id, entry.name),
            MigrationState::Skipped => format!(
                "  ⚠️  {}  {}  (older than the latest applied migration; will not run)\n",
                entry.id, entry.name
            ),
        };
        out.push_str(&line);
    }

    for orphan in &report.orphaned {
        out.push_str(&format!(
            "  ❓ {}  {}  (applied but not registered)\n",
            orphan.id, orphan.name
        ));
    }

    out.push_str(&format!(
        "\n{} applied, {} pending",
        report.applied_count(),
        report.pending_count()
    ));
    if report.skipped_count() > 0 {
        out.push_str(&format!(", {} skipped", report.skipped_count()));
    }
    out.push('\n');
    out
}
