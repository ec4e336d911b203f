//! `vigil setup`: downloads the ONNX models used by the trained face engine
//! and pins their digests.

use anyhow::{Context, Result};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use vigil_models::{ModelFile, ModelIntegrityError, MODELS};

/// Determine the model directory.
///
/// When running as root (UID 0), defaults to `/var/lib/vigil/models`, where
/// the system daemon looks. Otherwise `$XDG_DATA_HOME/vigil/models`.
pub fn default_model_dir() -> PathBuf {
    if is_root() {
        PathBuf::from("/var/lib/vigil/models")
    } else {
        let data_home = std::env::var("XDG_DATA_HOME").unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            format!("{home}/.local/share")
        });
        PathBuf::from(data_home).join("vigil/models")
    }
}

fn is_root() -> bool {
    // SAFETY: geteuid is always safe to call.
    unsafe { libc::geteuid() == 0 }
}

/// Download a single model file with progress output, then pin its digest.
fn download_model(dir: &Path, model: &ModelFile) -> Result<String> {
    let dest = vigil_models::model_path(dir, model);
    let tmp_path = dest.with_extension("onnx.part");

    println!("  downloading {} ({})...", model.name, model.size_display);

    let resp = ureq::get(model.url)
        .call()
        .with_context(|| format!("failed to download {}", model.url))?;

    let content_length = resp
        .headers()
        .get("Content-Length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    let mut reader = resp.into_body().into_reader();
    let mut file = fs::File::create(&tmp_path)
        .with_context(|| format!("failed to create {}", tmp_path.display()))?;

    let mut buf = [0u8; 65536];
    let mut total: u64 = 0;
    let mut last_pct: u64 = 0;

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n])?;
        total += n as u64;

        // Print progress every 10%
        if let Some(len) = content_length.filter(|&len| len > 0) {
            let pct = (total * 100) / len;
            if pct / 10 > last_pct / 10 {
                print!("  {pct}%\r");
                io::stdout().flush().ok();
                last_pct = pct;
            }
        }
    }

    file.flush()?;
    drop(file);

    fs::rename(&tmp_path, &dest)
        .with_context(|| format!("failed to rename {} -> {}", tmp_path.display(), dest.display()))?;

    let digest = vigil_models::pin_digest(dir, model)?;
    println!("  pinned sha256 {digest}");
    Ok(digest)
}

/// Whether an installed model still matches its pinned digest.
fn check_installed(dir: &Path, model: &ModelFile) -> Result<bool> {
    let path = vigil_models::model_path(dir, model);
    if !path.exists() {
        return Ok(false);
    }
    let Some(expected) = vigil_models::pinned_digest(dir, model) else {
        println!("  {} present but not pinned; re-downloading", model.name);
        return Ok(false);
    };
    match vigil_models::verify_file_sha256(model.name, &path, &expected) {
        Ok(()) => Ok(true),
        Err(ModelIntegrityError::ChecksumMismatch { .. }) => {
            println!("  {} does not match its pinned digest; re-downloading", model.name);
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

/// Run the setup command: download missing or altered models.
pub fn run(model_dir: Option<String>) -> Result<()> {
    let dir = match model_dir {
        Some(d) => PathBuf::from(d),
        None => default_model_dir(),
    };

    println!("Model directory: {}", dir.display());

    fs::create_dir_all(&dir).with_context(|| format!("failed to create directory {}", dir.display()))?;

    let mut downloaded = 0;
    let mut skipped = 0;

    for model in MODELS {
        if check_installed(&dir, model)? {
            println!("  {} already present (checksum ok)", model.name);
            skipped += 1;
            continue;
        }
        download_model(&dir, model)?;
        downloaded += 1;
    }

    vigil_models::verify_models_dir(&dir).context("installed models failed verification")?;

    println!();
    if downloaded > 0 {
        println!("Setup complete: {downloaded} model(s) downloaded, {skipped} already present.");
    } else {
        println!("All models already present. Nothing to download.");
    }
    println!("Restart vigild to switch to the trained face engine.");

    Ok(())
}
