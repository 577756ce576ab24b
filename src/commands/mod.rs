//! CLI entry points wrapping the transfer engine.

pub mod receive;
pub mod send;

use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::payload::Progress;

/// Cancels the session on the first Ctrl-C.
pub(crate) fn cancel_on_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });
}

/// Renders progress updates until the channel closes. The bar appears on
/// the first update so sessions that fail early never draw one.
pub(crate) async fn drive_progress(mut updates: mpsc::Receiver<Progress>) {
    let mut bar: Option<ProgressBar> = None;
    while let Some(progress) = updates.recv().await {
        let bar = bar.get_or_insert_with(|| {
            let bar = ProgressBar::new(progress.total);
            bar.set_style(
                ProgressStyle::default_bar()
                    .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
                    .expect("progress template is valid"),
            );
            bar
        });
        bar.set_position(progress.current);
    }
    if let Some(bar) = bar {
        bar.finish_and_clear();
    }
}

pub(crate) fn mood_for<T>(result: &crate::Result<T>) -> &'static str {
    match result {
        Ok(_) => "happy",
        Err(crate::Error::PakeFailed) => "scary",
        Err(crate::Error::Cancelled) => "lonely",
        Err(_) => "errory",
    }
}
