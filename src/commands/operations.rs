//! Core operations
//!
//! Flash sessions and cache eviction.

use std::future::Future;
use std::sync::Arc;

use cordatus_flash::cache::{ArchiveCache, HttpFetcher};
use cordatus_flash::compat::DeviceSelector;
use cordatus_flash::plan::FlashOptions;
use cordatus_flash::progress::Subscription;
use cordatus_flash::runner::TokioRunner;
use cordatus_flash::sequencer::{CommandSequencer, FlashRequest, SessionUpdate, SystemHostProbe};
use cordatus_flash::utils::is_root;
use cordatus_flash::{log_error, log_info, log_warn};

use super::AppContext;

const MODULE: &str = "commands::operations";

fn archive_cache(ctx: &AppContext) -> Result<Arc<ArchiveCache>, String> {
    let fetcher = HttpFetcher::new().map_err(|e| e.to_string())?;
    Ok(Arc::new(ArchiveCache::new(
        ctx.cache_root().to_path_buf(),
        Arc::new(fetcher),
    )))
}

fn tool_runner(ctx: &AppContext) -> Arc<TokioRunner> {
    Arc::new(TokioRunner::new(ctx.settings.privilege_command.clone()))
}

fn print_update(update: &SessionUpdate) {
    match &update.event {
        Some(event) => println!("[{:5.1}%] {}: {}", update.percent, update.state, event.message),
        None => println!("[{:5.1}%] {}", update.percent, update.state),
    }
}

/// Print updates until the session ends, calling `cancel` on the first interrupt
///
/// The interrupt future lives across loop passes so a signal is never missed.
async fn follow_session<I, C>(mut updates: Subscription<SessionUpdate>, interrupt: I, cancel: C)
where
    I: Future<Output = std::io::Result<()>>,
    C: FnOnce(),
{
    tokio::pin!(interrupt);
    let mut cancel = Some(cancel);
    loop {
        tokio::select! {
            biased;
            signal = &mut interrupt, if cancel.is_some() => {
                let on_interrupt = cancel.take();
                match (signal, on_interrupt) {
                    (Ok(()), Some(on_interrupt)) => on_interrupt(),
                    (Err(e), _) => log_warn!(MODULE, "Cannot listen for Ctrl-C: {}", e),
                    (Ok(()), None) => {}
                }
            }
            update = updates.next() => match update {
                Some(update) => print_update(&update),
                None => break,
            },
        }
    }
}

/// Run one flash session in the foreground
///
/// Ctrl-C requests cancellation; a running flash tool is allowed to finish.
pub async fn flash(
    ctx: &AppContext,
    selector: DeviceSelector,
    options: FlashOptions,
    device_id: String,
) -> Result<bool, String> {
    if !is_root() && ctx.settings.privilege_command.is_empty() {
        log_warn!(
            MODULE,
            "Not running as root and no privilege command configured; privileged steps will fail"
        );
    }

    let sequencer = CommandSequencer::new(
        Arc::new(ctx.resolver()),
        archive_cache(ctx)?,
        tool_runner(ctx),
        Arc::new(SystemHostProbe::new()),
        ctx.settings.clone(),
    );

    let handle = sequencer
        .start(FlashRequest {
            selector,
            options,
            device_id,
        })
        .map_err(|e| e.to_string())?;
    log_info!(
        MODULE,
        "Session {} started for device {}",
        handle.id(),
        handle.device_id()
    );

    follow_session(handle.subscribe(), tokio::signal::ctrl_c(), || {
        eprintln!("Cancelling after the current step...");
        handle.cancel();
    })
    .await;

    let report = handle.wait().await;
    if report.succeeded() {
        log_info!(MODULE, "{}", report.summary());
        return Ok(true);
    }

    log_error!(MODULE, "{}", report.summary());
    eprintln!("{}", report.summary());
    if let Some(code) = report.exit_code {
        eprintln!("Tool exit code: {}", code);
    }
    if !report.output_tail.is_empty() {
        eprintln!("Last output:");
        for line in &report.output_tail {
            eprintln!("  {}", line);
        }
    }
    Ok(false)
}

/// Remove one cached release
pub async fn evict(ctx: &AppContext, family: &str, version: &str) -> Result<(), String> {
    let cache = archive_cache(ctx)?;
    let runner = tool_runner(ctx);
    let removed = cache
        .evict(family, version, runner.as_ref())
        .await
        .map_err(|e| e.to_string())?;
    if removed {
        println!("Removed {} {}", family, version);
    } else {
        println!("Nothing removed for {} {}", family, version);
    }
    Ok(())
}
