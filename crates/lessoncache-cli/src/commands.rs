//! Command handlers. Each one drives the engine and prints a short summary.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use lessoncache_core::{
    Admission, EngineEvent, Error, ProgressKey, ProgressRecord, SettingsPatch, SweepReport,
};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::format::{format_bytes, format_percent, format_timestamp, truncate_string};
use crate::{Commands, Session, SettingsAction};

/// Column width for module titles in listings.
const TITLE_WIDTH: usize = 32;

pub async fn dispatch(session: &Session, command: Commands) -> Result<()> {
    match command {
        Commands::Status => status(session).await,
        Commands::Catalog { refresh } => catalog(session, refresh).await,
        Commands::Download { module_id } => download(session, &module_id).await,
        Commands::Remove { module_id } => remove(session, &module_id).await,
        Commands::Pin { module_id, off } => {
            let module = session
                .engine
                .set_pinned(&module_id, !off)
                .await
                .map_err(describe)?;
            println!(
                "{} {}",
                module.id,
                if module.is_pinned { "pinned" } else { "unpinned" }
            );
            Ok(())
        }
        Commands::Progress {
            module_id,
            section_id,
            completion,
            score,
            time_spent,
            responses,
        } => {
            let key = ProgressKey::new(module_id, section_id, session.user_id());
            let mut record = ProgressRecord::new(key, completion).with_time_spent(time_spent);
            if let Some(score) = score {
                record = record.with_score(score);
            }
            if let Some(json) = responses {
                let value = serde_json::from_str(&json).context("--responses is not valid JSON")?;
                record = record.with_responses(value);
            }
            progress(session, record).await
        }
        Commands::Sync => {
            let report = session.engine.sync_now().await.map_err(describe)?;
            println!(
                "Pushed {} record(s): {} synced, {} failed, {} replaced by newer copies, {} changed meanwhile",
                report.pushed, report.synced, report.failed, report.adopted, report.skipped
            );
            Ok(())
        }
        Commands::Sweep => {
            let report = session.engine.sweep().await;
            print_sweep(&report);
            Ok(())
        }
        Commands::ClearCache => {
            let report = session.engine.clear_cache().await.map_err(describe)?;
            print_sweep(&report);
            Ok(())
        }
        Commands::Settings { action } => settings(session, action).await,
        Commands::Run => run(session).await,
    }
}

/// Keep the stable error code next to the message.
fn describe(e: Error) -> anyhow::Error {
    anyhow!("{} [{}]", e, e.kind())
}

async fn status(session: &Session) -> Result<()> {
    let engine = &session.engine;
    let network = session.network.status();
    println!(
        "Network:   {} ({:?}, {:?}{})",
        if network.online { "online" } else { "offline" },
        network.connection_type,
        network.quality(),
        network
            .rtt_ms
            .map(|rtt| format!(", {} ms", rtt))
            .unwrap_or_default()
    );

    match engine.storage_snapshot().await {
        Ok(snapshot) => println!(
            "Storage:   {} modules + {} media of {} ceiling ({}), {} free on device",
            format_bytes(snapshot.module_bytes),
            format_bytes(snapshot.media_bytes),
            format_bytes(snapshot.max_storage_size),
            format_percent(snapshot.ceiling_percent() / 100.0),
            format_bytes(snapshot.available)
        ),
        Err(e) => println!("Storage:   unavailable ({})", e),
    }

    let modules = engine.modules().await;
    let downloaded = modules.iter().filter(|m| m.is_downloaded()).count();
    let pinned = modules.iter().filter(|m| m.is_pinned).count();
    println!(
        "Modules:   {} known, {} downloaded, {} pinned",
        modules.len(),
        downloaded,
        pinned
    );

    let stats = engine.sync_stats().await;
    println!(
        "Sync:      {} pending, last sync {}",
        engine.pending_sync().await,
        format_timestamp(stats.last_sync_at, "never")
    );
    if let Some(ref error) = stats.last_error {
        println!("           last error: {}", error);
    }
    Ok(())
}

async fn catalog(session: &Session, refresh: bool) -> Result<()> {
    if refresh {
        let count = session
            .engine
            .refresh_catalog()
            .await
            .map_err(describe)
            .context("Failed to refresh catalog")?;
        info!(modules = count, "Catalog refreshed");
    }

    let modules = session.engine.modules().await;
    if modules.is_empty() {
        println!("No modules known. Try `lessoncache catalog --refresh`.");
        return Ok(());
    }
    for m in modules {
        println!(
            "{:<16} {:<width$} {:>9} {:>5} {:<8} {}{}",
            truncate_string(&m.id, 16),
            truncate_string(&m.title, TITLE_WIDTH),
            format_bytes(m.size_estimate),
            format_percent(m.download_fraction()),
            format!("{:?}", m.priority).to_lowercase(),
            format_timestamp(m.expires_at, "-"),
            if m.is_pinned { " (pinned)" } else { "" },
            width = TITLE_WIDTH
        );
    }
    Ok(())
}

async fn download(session: &Session, module_id: &str) -> Result<()> {
    let mut events = session.engine.subscribe();
    let handle = match session
        .engine
        .request_download(module_id)
        .await
        .map_err(describe)?
    {
        Admission::Started(handle) => handle,
        Admission::InProgress => {
            println!("{} is already downloading", module_id);
            return Ok(());
        }
    };

    let done = handle.wait();
    tokio::pin!(done);
    loop {
        tokio::select! {
            result = &mut done => {
                let module = result.map_err(describe)?;
                println!(
                    "\rDownloaded {} ({}), expires {}",
                    module.id,
                    format_bytes(module.downloaded_size),
                    format_timestamp(module.expires_at, "never")
                );
                return Ok(());
            }
            event = events.recv() => match event {
                Ok(EngineEvent::DownloadProgress { module_id: id, downloaded, total }) if id == module_id => {
                    eprint!("\r{} / {}", format_bytes(downloaded), format_bytes(total));
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => bail!("Engine stopped during download"),
            }
        }
    }
}

async fn remove(session: &Session, module_id: &str) -> Result<()> {
    match session.engine.remove_module(module_id).await.map_err(describe)? {
        Some(report) => {
            print_sweep(&report);
            Ok(())
        }
        None => bail!("Unknown module: {}", module_id),
    }
}

async fn progress(session: &Session, record: ProgressRecord) -> Result<()> {
    let saved = session.engine.save_progress(record).await.map_err(describe)?;
    println!(
        "Saved {} at {} (revision {})",
        saved.key,
        format_percent(f64::from(saved.completion)),
        saved.revision
    );

    // This process exits before a debounced sync would fire.
    if session.network.is_online() {
        match session.engine.sync_now().await {
            Ok(report) => println!("Synced {} record(s)", report.synced + report.adopted),
            Err(e) => warn!(error = %e, "Sync after save failed, progress stays pending"),
        }
    }
    Ok(())
}

async fn settings(session: &Session, action: Option<SettingsAction>) -> Result<()> {
    if let Some(SettingsAction::Set { assignments }) = action {
        for assignment in assignments {
            let patch = SettingsPatch::from_assignment(&assignment)
                .map_err(|e| anyhow!("{} [invalid_settings]", e))?;
            session.engine.update_settings(&patch).await.map_err(describe)?;
        }
    }
    let current = session.engine.settings().await;
    println!("{}", serde_json::to_string_pretty(&current)?);
    Ok(())
}

async fn run(session: &Session) -> Result<()> {
    let engine = &session.engine;
    let swept = engine.start().await.map_err(describe)?;
    if !swept.is_empty() {
        print_sweep(&swept);
    }

    let cancel = CancellationToken::new();
    if let Some(ref probe) = session.probe {
        session.network.spawn_probe(
            probe.clone(),
            Duration::from_secs(session.config.probe_interval_secs.max(1)),
            cancel.clone(),
        );
    }

    println!("Running. Press Ctrl-C to stop.");
    let mut events = engine.subscribe();
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                break;
            }
            event = events.recv() => match event {
                Ok(event) => {
                    if let Some(line) = event_line(&event) {
                        println!("{}", line);
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped = skipped, "Event listener lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    }
    cancel.cancel();
    Ok(())
}

fn event_line(event: &EngineEvent) -> Option<String> {
    let line = match event {
        EngineEvent::DownloadCompleted { module_id } => format!("Downloaded {}", module_id),
        EngineEvent::DownloadFailed { module_id, kind, message } => {
            format!("Download of {} failed [{}]: {}", module_id, kind, message)
        }
        EngineEvent::DownloadCancelled { module_id } => format!("Download of {} cancelled", module_id),
        EngineEvent::NetworkChanged(status) => format!(
            "Network {} ({:?})",
            if status.online { "online" } else { "offline" },
            status.quality()
        ),
        EngineEvent::SyncFinished { synced, failed } => {
            format!("Sync finished: {} synced, {} failed", synced, failed)
        }
        EngineEvent::SyncFailed { message } => format!("Sync failed: {}", message),
        _ => return None,
    };
    Some(line)
}

fn print_sweep(report: &SweepReport) {
    println!(
        "Removed {} module(s) and {} media file(s), reclaimed {}",
        report.modules_removed.len(),
        report.media_removed,
        format_bytes(report.bytes_reclaimed)
    );
    for error in &report.errors {
        println!("  error: {}", error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lessoncache_core::{AdmissionError, ConnectionType, NetworkStatus};

    #[test]
    fn test_describe_keeps_error_code() {
        let err = describe(AdmissionError::CellularRestricted.into());
        assert_eq!(
            err.to_string(),
            "Downloads over cellular are disabled [cellular_restricted]"
        );
    }

    #[test]
    fn test_event_lines() {
        let online = EngineEvent::NetworkChanged(NetworkStatus::online(ConnectionType::Wifi));
        assert_eq!(event_line(&online).as_deref(), Some("Network online (Poor)"));
        assert!(event_line(&EngineEvent::ModulesChanged).is_none());
        let failed = EngineEvent::SyncFailed {
            message: "timeout".into(),
        };
        assert_eq!(event_line(&failed).as_deref(), Some("Sync failed: timeout"));
    }
}
