use std::path::Path;

use anyhow::Context;
use log::debug;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::commands::{cancel_on_ctrl_c, drive_progress, mood_for};
use crate::payload::{self, Progress};
use crate::session::{Role, Session};
use crate::Result;

/// Sends the file or directory at `path` to whoever presents the code.
pub async fn run(mailbox_url: &str, path: &str) -> anyhow::Result<()> {
    let path = Path::new(path);
    if !path.exists() {
        anyhow::bail!("path does not exist: {}", path.display());
    }

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let mut session = Session::connect(mailbox_url, Role::Sender, cancel.clone())
        .await
        .context("connecting to the rendezvous server")?;
    let code = session.create_code().await?;

    println!("Wormhole code: \x1b[1m{code}\x1b[0m");
    println!("On the other machine, run: wormpipe receive {code}");

    let result = transfer(&mut session, path, &cancel).await;
    session.close(mood_for(&result)).await;
    result?;

    println!("Transfer complete");
    Ok(())
}

async fn transfer(session: &mut Session, path: &Path, cancel: &CancellationToken) -> Result<()> {
    debug!("waiting for the receiver to join the key exchange");
    session.derive_key().await?;

    let mut stream = session.connect_transit().await?;

    let (progress_tx, progress_rx) = mpsc::channel::<Progress>(64);
    let bar = tokio::spawn(drive_progress(progress_rx));

    let result = payload::send(&mut stream, path, Some(&progress_tx), cancel).await;
    drop(progress_tx);
    bar.await.ok();

    result
}
