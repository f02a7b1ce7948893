use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use proxyzero_core::{CodeDecoder, QrDecoder};
use proxyzero_hw::{Camera, FixRequest, GeoClue, PositionSource, Resolution};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "proxyzero", about = "ProxyZero presence verification CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify presence in a class and mark attendance
    Verify {
        /// Class code printed on the classroom QR code (e.g., "CS-306")
        #[arg(short, long)]
        class: String,
        /// User id to mark attendance for
        #[arg(short, long)]
        user: String,
    },
    /// Cancel the running verification
    Cancel,
    /// Show daemon status
    Status,
    /// List video capture devices
    Devices,
    /// Run camera diagnostics
    Test {
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
        /// Number of frames to grab
        #[arg(short, long, default_value_t = 5)]
        frames: usize,
        /// Save the last frame as a JPEG
        #[arg(long)]
        save: Option<PathBuf>,
    },
    /// Decode QR codes from a camera without the daemon
    Scan {
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
        /// Stop after this many seconds
        #[arg(short, long, default_value_t = 10)]
        seconds: u64,
    },
    /// Request a single position fix from GeoClue
    Locate {
        #[arg(long, default_value = "proxyzero")]
        desktop_id: String,
        #[arg(long, default_value_t = 10)]
        timeout: u64,
    },
}

#[zbus::proxy(
    interface = "io.proxyzero.Attendance1",
    default_service = "io.proxyzero.Attendance1",
    default_path = "/io/proxyzero/Attendance1"
)]
trait Attendance {
    async fn start_verification(&self, class_code: &str, user_id: &str)
        -> zbus::Result<(bool, String)>;
    async fn cancel_verification(&self) -> zbus::Result<bool>;
    async fn capture(&self) -> zbus::Result<bool>;
    async fn retry(&self) -> zbus::Result<bool>;
    async fn decline(&self) -> zbus::Result<bool>;
    async fn status(&self) -> zbus::Result<String>;

    #[zbus(signal)]
    async fn stage_changed(&self, stage: &str, status: &str) -> zbus::Result<()>;
    #[zbus(signal)]
    async fn feedback(&self, message: &str) -> zbus::Result<()>;
    #[zbus(signal)]
    async fn retry_offered(&self, message: &str) -> zbus::Result<()>;
}

/// What a line on stdin answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Prompt {
    Capture,
    Retry,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Verify { class, user } => verify(&class, &user).await?,
        Commands::Cancel => {
            let proxy = connect().await?;
            if proxy.cancel_verification().await? {
                println!("Verification cancelled.");
            } else {
                println!("No verification in progress.");
            }
        }
        Commands::Status => {
            let proxy = connect().await?;
            let status: serde_json::Value = serde_json::from_str(&proxy.status().await?)
                .context("daemon returned malformed status")?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No video capture devices found.");
            }
            for dev in devices {
                println!("{}  {} ({}, {})", dev.path, dev.name, dev.driver, dev.bus);
            }
        }
        Commands::Test {
            device,
            frames,
            save,
        } => {
            tokio::task::spawn_blocking(move || camera_test(&device, frames, save)).await??;
        }
        Commands::Scan { device, seconds } => {
            tokio::task::spawn_blocking(move || scan(&device, Duration::from_secs(seconds)))
                .await??;
        }
        Commands::Locate {
            desktop_id,
            timeout,
        } => {
            let request = FixRequest {
                high_accuracy: true,
                timeout: Duration::from_secs(timeout),
            };
            let coords = GeoClue::new(desktop_id)
                .current_position(request)
                .await
                .context("location fix failed")?;
            println!("lat {:.6}  lon {:.6}", coords.lat, coords.lon);
        }
    }

    Ok(())
}

async fn connect() -> Result<AttendanceProxy<'static>> {
    let conn = zbus::Connection::session()
        .await
        .context("failed to connect to the session bus")?;
    AttendanceProxy::new(&conn)
        .await
        .context("proxyzerod is not running")
}

async fn verify(class_code: &str, user_id: &str) -> Result<()> {
    let proxy = connect().await?;
    let mut stages = proxy.receive_stage_changed().await?;
    let mut feedback = proxy.receive_feedback().await?;
    let mut offers = proxy.receive_retry_offered().await?;
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut prompt: Option<Prompt> = None;

    tracing::debug!(class_code, user_id, "starting verification");
    let call = proxy.start_verification(class_code, user_id);
    tokio::pin!(call);

    loop {
        tokio::select! {
            result = &mut call => {
                let (success, message) = result?;
                if success {
                    println!("✓ {message}");
                    return Ok(());
                }
                bail!("{message}");
            }
            Some(signal) = stages.next() => {
                let args = signal.args()?;
                println!("[{}] {}", args.stage(), args.status());
                if *args.stage() == "capturing" {
                    println!("Press Enter to take the photo.");
                    prompt = Some(Prompt::Capture);
                }
            }
            Some(signal) = feedback.next() => {
                println!("  {}", signal.args()?.message());
            }
            Some(signal) = offers.next() => {
                println!("  {}", signal.args()?.message());
                println!("Try again? [y/N]");
                prompt = Some(Prompt::Retry);
            }
            line = stdin.next_line(), if prompt.is_some() => {
                let line = line?.unwrap_or_default();
                match prompt.take() {
                    Some(Prompt::Capture) => {
                        proxy.capture().await?;
                    }
                    Some(Prompt::Retry) if line.trim().eq_ignore_ascii_case("y") => {
                        proxy.retry().await?;
                    }
                    Some(Prompt::Retry) => {
                        proxy.decline().await?;
                    }
                    None => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                proxy.cancel_verification().await?;
            }
        }
    }
}

fn camera_test(device: &str, frames: usize, save: Option<PathBuf>) -> Result<()> {
    println!("Running camera diagnostics on {device}...");
    let camera = Camera::open(device, Resolution::default())?;
    println!(
        "  {}x{} {:?}",
        camera.width, camera.height, camera.fourcc
    );

    let mut last = None;
    for _ in 0..frames.max(1) {
        let start = Instant::now();
        let frame = camera.capture_frame()?;
        println!(
            "  frame {:>4}: brightness {:>5.1}  dark {:<5}  {:?}",
            frame.sequence,
            frame.avg_brightness(),
            frame.is_dark,
            start.elapsed()
        );
        last = Some(frame);
    }

    if let (Some(path), Some(frame)) = (save, last) {
        image::save_buffer(
            &path,
            &frame.data,
            frame.width,
            frame.height,
            image::ExtendedColorType::L8,
        )
        .with_context(|| format!("failed to save {}", path.display()))?;
        println!("  saved {}", path.display());
    }
    Ok(())
}

fn scan(device: &str, duration: Duration) -> Result<()> {
    let camera = Camera::open(device, Resolution::default())?;
    let decoder = QrDecoder;
    let deadline = Instant::now() + duration;
    println!("Scanning on {device} for {duration:?}...");

    let mut last: Option<String> = None;
    while Instant::now() < deadline {
        let frame = camera.capture_frame()?;
        if frame.is_dark {
            continue;
        }
        for code in decoder.decode(&frame) {
            if last.as_deref() != Some(code.as_str()) {
                println!("  {code}");
                last = Some(code);
            }
        }
    }
    Ok(())
}
