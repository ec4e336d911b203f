use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod client;
mod setup;

#[derive(Parser)]
#[command(name = "vigil", version, about = "Password, face and backup-code authentication")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Download the face detection and recognition models
    Setup {
        /// Target directory (defaults to the daemon's model directory)
        #[arg(long)]
        model_dir: Option<String>,
    },
    /// Show daemon status
    Status,
    /// Create a user
    CreateUser {
        username: String,
        #[arg(long)]
        admin: bool,
        /// Read from stdin when omitted
        #[arg(long)]
        password: Option<String>,
    },
    /// Password step; prints the session token
    Login {
        username: String,
        #[arg(long)]
        password: Option<String>,
    },
    /// Close a session
    Logout { user_id: i64, session_token: String },
    /// Change a password (prompts for the current and new password)
    ChangePassword { user_id: i64 },
    /// Register a face from an image file (JPEG, PNG or WebP)
    RegisterFace { user_id: i64, image: PathBuf },
    /// Verify a face from an image file
    VerifyFace { user_id: i64, image: PathBuf },
    /// Generate a new backup code
    BackupCode { user_id: i64 },
    /// Show the current backup code one more time
    RevealBackupCode { user_id: i64 },
    /// Verify a backup code
    VerifyBackupCode { user_id: i64, code: String },
    /// Clear a lockout; erases the face and forces a password reset
    Unlock { user_id: i64 },
    /// Lock an account until it is enabled again
    Disable { user_id: i64 },
    /// Lift a disable
    Enable { user_id: i64 },
}

fn prompt(label: &str) -> Result<String> {
    print!("{label}: ");
    io::stdout().flush().ok();
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line).context("failed to read stdin")?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read image {}", path.display()))
}

async fn daemon() -> Result<client::VigilProxy<'static>> {
    let proxy = client::connect().await.context("failed to connect to vigild")?;
    tracing::debug!("connected to vigild");
    Ok(proxy)
}

/// Pretty-print a JSON reply from the daemon.
fn print_reply(reply: &str) {
    match serde_json::from_str::<serde_json::Value>(reply) {
        Ok(value) => println!("{}", serde_json::to_string_pretty(&value).unwrap_or_else(|_| reply.to_string())),
        Err(_) => println!("{reply}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Setup { model_dir } => {
            tokio::task::spawn_blocking(move || setup::run(model_dir)).await??;
        }
        Command::Status => print_reply(&daemon().await?.status().await?),
        Command::CreateUser {
            username,
            admin,
            password,
        } => {
            let password = match password {
                Some(p) => p,
                None => prompt("Password")?,
            };
            print_reply(&daemon().await?.create_user(&username, &password, admin).await?);
        }
        Command::Login { username, password } => {
            let password = match password {
                Some(p) => p,
                None => prompt("Password")?,
            };
            print_reply(&daemon().await?.login(&username, &password).await?);
        }
        Command::Logout {
            user_id,
            session_token,
        } => {
            let closed = daemon().await?.logout(user_id, &session_token).await?;
            println!("{}", if closed { "session closed" } else { "no matching session" });
        }
        Command::ChangePassword { user_id } => {
            let current = prompt("Current password")?;
            let new_password = prompt("New password")?;
            daemon()
                .await?
                .change_password(user_id, &current, &new_password)
                .await?;
            println!("password changed");
        }
        Command::RegisterFace { user_id, image } => {
            let bytes = read_image(&image)?;
            print_reply(&daemon().await?.register_face(user_id, &bytes).await?);
        }
        Command::VerifyFace { user_id, image } => {
            let bytes = read_image(&image)?;
            print_reply(&daemon().await?.verify_face(user_id, &bytes).await?);
        }
        Command::BackupCode { user_id } => print_reply(&daemon().await?.generate_backup_code(user_id).await?),
        Command::RevealBackupCode { user_id } => {
            print_reply(&daemon().await?.reveal_backup_code(user_id).await?)
        }
        Command::VerifyBackupCode { user_id, code } => {
            print_reply(&daemon().await?.verify_backup_code(user_id, &code).await?)
        }
        Command::Unlock { user_id } => print_reply(&daemon().await?.unlock_account(user_id).await?),
        Command::Disable { user_id } => print_reply(&daemon().await?.disable_account(user_id).await?),
        Command::Enable { user_id } => print_reply(&daemon().await?.enable_account(user_id).await?),
    }

    Ok(())
}
