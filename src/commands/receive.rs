use std::path::{Path, PathBuf};

use anyhow::Context;
use log::debug;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::commands::{cancel_on_ctrl_c, drive_progress, mood_for};
use crate::payload::{self, Progress};
use crate::session::{Role, Session};
use crate::{code, config, Result};

/// Receives a payload using a wormhole code, saving it under the
/// configured download directory.
pub async fn run(mailbox_url: &str, code_arg: Option<String>) -> anyhow::Result<()> {
    let code = match code_arg {
        Some(code) => {
            code::parse_code(&code)?;
            code
        }
        None => prompt_for_code()?,
    };

    let download_dir = config::load()
        .context("reading the wormpipe config")?
        .download_dir;

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let mut session = Session::connect(mailbox_url, Role::Receiver, cancel.clone())
        .await
        .context("connecting to the rendezvous server")?;

    let result = transfer(&mut session, &code, &download_dir, &cancel).await;
    session.close(mood_for(&result)).await;
    let saved = result?;

    println!("Saved to {}", saved.display());
    Ok(())
}

async fn transfer(
    session: &mut Session,
    code: &str,
    download_dir: &Path,
    cancel: &CancellationToken,
) -> Result<PathBuf> {
    session.set_code(code).await?;

    debug!("joining the key exchange");
    session.derive_key().await?;

    let mut stream = session.connect_transit().await?;

    let (progress_tx, progress_rx) = mpsc::channel::<Progress>(64);
    let bar = tokio::spawn(drive_progress(progress_rx));

    let result = payload::receive(&mut stream, download_dir, Some(&progress_tx), cancel).await;
    drop(progress_tx);
    bar.await.ok();

    result
}

fn prompt_for_code() -> anyhow::Result<String> {
    loop {
        println!("Enter the wormhole code:");
        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;
        let trimmed = input.trim();
        if code::parse_code(trimmed).is_ok() {
            return Ok(trimmed.to_string());
        }
        println!("Codes look like 7-123456; try again.");
    }
}
