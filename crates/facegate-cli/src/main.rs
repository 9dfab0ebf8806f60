use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

#[zbus::proxy(
    interface = "org.facegate.Checkpoint1",
    default_service = "org.facegate.Checkpoint1",
    default_path = "/org/facegate/Checkpoint1"
)]
trait Checkpoint {
    fn verify(&self, image: &[u8]) -> zbus::Result<String>;
    fn check_liveness(&self, image: &[u8]) -> zbus::Result<String>;
    fn recognize(&self, image: &[u8]) -> zbus::Result<String>;
    fn check_in(&self, image: &[u8], method: &str) -> zbus::Result<String>;
    fn record_attendance(&self, user_id: i64, method: &str) -> zbus::Result<String>;
    fn check_in_qr(&self, token: &str) -> zbus::Result<String>;
    fn enroll(&self, name: &str, image: &[u8]) -> zbus::Result<String>;
    fn re_enroll(&self, user_id: i64, image: &[u8]) -> zbus::Result<String>;
    fn update_user(&self, user_id: i64, name: &str, qr_code: &str) -> zbus::Result<String>;
    fn list_users(&self) -> zbus::Result<String>;
    fn remove_user(&self, user_id: i64) -> zbus::Result<String>;
    fn deactivate_user(&self, user_id: i64) -> zbus::Result<String>;
    fn records(&self, limit: u32) -> zbus::Result<String>;
    fn stats(&self) -> zbus::Result<String>;
    fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "facegate", about = "facegate checkpoint CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full verification pipeline on an image
    Verify { image: PathBuf },
    /// Run only the liveness check
    Liveness { image: PathBuf },
    /// Identify a face without the liveness check
    Recognize { image: PathBuf },
    /// Verify an image and record attendance for the recognized user
    CheckIn {
        image: PathBuf,
        /// FaceID, QR or FaceID-WebRTC
        #[arg(short, long, default_value = "FaceID")]
        method: String,
    },
    /// Record attendance for a known user id
    Attend {
        user_id: i64,
        #[arg(short, long, default_value = "FaceID")]
        method: String,
    },
    /// Record attendance from a decoded QR token
    Qr { token: String },
    /// Enroll a new user from an image
    Enroll { name: String, image: PathBuf },
    /// Replace a user's stored embedding
    ReEnroll { user_id: i64, image: PathBuf },
    /// Rename a user or change their QR token
    Update {
        user_id: i64,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        qr: Option<String>,
    },
    /// List enrolled users
    List,
    /// Delete a user and their attendance history
    Remove { user_id: i64 },
    /// Deactivate a user, keeping their history
    Deactivate { user_id: i64 },
    /// Show recent attendance records
    Records {
        #[arg(short, long, default_value_t = 100)]
        limit: u32,
    },
    /// Show today's attendance summary
    Stats,
    /// Show daemon status
    Status,
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read image {}", path.display()))
}

/// Pretty-print a JSON reply, falling back to the raw text.
fn pretty(reply: &str) -> String {
    serde_json::from_str::<serde_json::Value>(reply)
        .and_then(|value| serde_json::to_string_pretty(&value))
        .unwrap_or_else(|_| reply.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let connection = if cli.session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("failed to connect to D-Bus")?;
    let proxy = CheckpointProxy::new(&connection)
        .await
        .context("facegated is not reachable")?;

    let reply = match cli.command {
        Commands::Verify { image } => proxy.verify(&read_image(&image)?).await?,
        Commands::Liveness { image } => proxy.check_liveness(&read_image(&image)?).await?,
        Commands::Recognize { image } => proxy.recognize(&read_image(&image)?).await?,
        Commands::CheckIn { image, method } => proxy.check_in(&read_image(&image)?, &method).await?,
        Commands::Attend { user_id, method } => proxy.record_attendance(user_id, &method).await?,
        Commands::Qr { token } => proxy.check_in_qr(&token).await?,
        Commands::Enroll { name, image } => proxy.enroll(&name, &read_image(&image)?).await?,
        Commands::ReEnroll { user_id, image } => proxy.re_enroll(user_id, &read_image(&image)?).await?,
        Commands::Update { user_id, name, qr } => {
            if name.is_none() && qr.is_none() {
                anyhow::bail!("nothing to update: pass --name and/or --qr");
            }
            proxy
                .update_user(user_id, name.as_deref().unwrap_or_default(), qr.as_deref().unwrap_or_default())
                .await?
        }
        Commands::List => proxy.list_users().await?,
        Commands::Remove { user_id } => proxy.remove_user(user_id).await?,
        Commands::Deactivate { user_id } => proxy.deactivate_user(user_id).await?,
        Commands::Records { limit } => proxy.records(limit).await?,
        Commands::Stats => proxy.stats().await?,
        Commands::Status => proxy.status().await?,
    };

    println!("{}", pretty(&reply));
    Ok(())
}
