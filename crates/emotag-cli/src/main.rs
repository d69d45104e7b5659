use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use emotag_hw::{Camera, Frame, FrameSource};
use futures::StreamExt;
use serde_json::Value;
use std::time::Duration;

// `#[zbus::proxy]` generates `EmotagProxy` (async) and `EmotagProxyBlocking`.
// The CLI uses the async one.
#[zbus::proxy(
    interface = "org.emotag.Emotag1",
    default_service = "org.emotag.Emotag1",
    default_path = "/org/emotag/Emotag1"
)]
trait Emotag {
    async fn start_capture(&self) -> zbus::Result<String>;
    async fn tag_current(&self, topic: &str) -> zbus::Result<String>;
    async fn live_snapshot(&self) -> zbus::Result<String>;
    async fn classify(&self) -> zbus::Result<String>;
    async fn stop_collection(&self) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;

    #[zbus(signal)]
    fn classification_updated(&self, classification: &str) -> zbus::Result<()>;
}

#[derive(Parser)]
#[command(name = "emotag", about = "Emotion capture and topic classification CLI")]
struct Cli {
    /// Print raw JSON replies instead of summaries
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open the camera and start sampling
    Start,
    /// Read the live snapshot, optionally filing it under a topic
    Tag {
        /// Topic to file the snapshot under (e.g., "weekend", "exams")
        #[arg(short, long)]
        topic: Option<String>,
    },
    /// Show the live snapshot without tagging
    Live,
    /// Show good/bad verdicts for the topics tagged so far
    Classify,
    /// Stop capture and print everything collected
    Stop,
    /// Show daemon status
    Status,
    /// Print classification updates as they happen
    Watch,
    /// List local V4L2 capture devices (does not need the daemon)
    Devices,
    /// Run camera diagnostics directly against a device (does not need the daemon)
    Test {
        /// V4L2 device to open
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
        /// Number of frames to read
        #[arg(short, long, default_value_t = 5)]
        frames: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start => {
            connect().await?.start_capture().await?;
            println!("Capture running");
        }
        Commands::Tag { topic } => {
            let reply = connect().await?.tag_current(topic.as_deref().unwrap_or("")).await?;
            if cli.json {
                print_json(&reply);
            } else {
                print_tag(&parse(&reply)?);
            }
        }
        Commands::Live => {
            let reply = connect().await?.live_snapshot().await?;
            if cli.json {
                print_json(&reply);
            } else {
                print_faces(&parse(&reply)?["emotions"]);
            }
        }
        Commands::Classify => {
            let reply = connect().await?.classify().await?;
            if cli.json {
                print_json(&reply);
            } else {
                print_classification(&parse(&reply)?);
            }
        }
        Commands::Stop => {
            let reply = connect().await?.stop_collection().await?;
            if cli.json {
                print_json(&reply);
            } else {
                let result = parse(&reply)?;
                println!("Collected {} topic(s)", result["total_topics"]);
                if let Some(data) = result["collected_data"].as_object() {
                    for (topic, history) in data {
                        let n = history.as_array().map_or(0, Vec::len);
                        println!("  {topic}: {n} snapshot(s)");
                    }
                }
                print_classification(&result["classification"]);
                if let Some(err) = result["stop_error"].as_str() {
                    eprintln!("warning: capture did not stop cleanly: {err}");
                }
            }
        }
        Commands::Status => print_json(&connect().await?.status().await?),
        Commands::Watch => {
            let proxy = connect().await?;
            let mut updates = proxy.receive_classification_updated().await?;
            println!("Watching classification updates (Ctrl-C to stop)");
            while let Some(signal) = updates.next().await {
                let args = signal.args()?;
                if cli.json {
                    print_json(args.classification());
                } else {
                    print_classification(&parse(args.classification())?);
                    println!();
                }
            }
        }
        Commands::Devices => list_devices(),
        Commands::Test { device, frames } => {
            // The daemon holds the device while capturing.
            tokio::task::spawn_blocking(move || camera_test(&device, frames)).await??;
        }
    }

    Ok(())
}

async fn connect() -> Result<EmotagProxy<'static>> {
    // StopCollection may wait out the daemon's stop timeout.
    let conn = zbus::connection::Builder::session()?
        .method_timeout(Duration::from_secs(15))
        .build()
        .await
        .context("failed to connect to the session bus")?;
    tracing::debug!(name = ?conn.unique_name(), "connected to session bus");
    EmotagProxy::new(&conn)
        .await
        .context("emotagd is not reachable on the session bus")
}

fn parse(reply: &str) -> Result<Value> {
    serde_json::from_str(reply).context("daemon returned malformed JSON")
}

fn print_json(reply: &str) {
    match serde_json::from_str::<Value>(reply) {
        Ok(v) => println!(
            "{}",
            serde_json::to_string_pretty(&v).unwrap_or_else(|_| reply.to_string())
        ),
        Err(_) => println!("{reply}"),
    }
}

fn print_tag(summary: &Value) {
    match summary["topic"].as_str() {
        Some(topic) => println!(
            "Tagged \"{topic}\" ({} snapshot(s) so far)",
            summary["total_snapshots_for_topic"]
        ),
        None => println!("Untagged read"),
    }
    print_faces(&summary["emotions"]);
}

fn print_faces(faces: &Value) {
    let faces = faces.as_array().map(Vec::as_slice).unwrap_or_default();
    if faces.is_empty() {
        println!("No faces");
        return;
    }
    for (i, face) in faces.iter().enumerate() {
        let ranked: Vec<String> = face
            .as_array()
            .map(Vec::as_slice)
            .unwrap_or_default()
            .iter()
            .take(3)
            .map(|s| {
                format!(
                    "{} {:.2}",
                    s["label"].as_str().unwrap_or("?"),
                    s["score"].as_f64().unwrap_or(0.0)
                )
            })
            .collect();
        println!("  face {}: {}", i + 1, ranked.join(", "));
    }
}

fn print_classification(c: &Value) {
    for (heading, key) in [("Good", "good_topics"), ("Bad", "bad_topics")] {
        let topics = c[key].as_object();
        println!("{heading} topics:");
        match topics {
            Some(map) if !map.is_empty() => {
                for (topic, score) in map {
                    println!(
                        "  {topic:<24} good={:.2} bad={:.2}",
                        score["good_score"].as_f64().unwrap_or(0.0),
                        score["bad_score"].as_f64().unwrap_or(0.0)
                    );
                }
            }
            _ => println!("  (none)"),
        }
    }
}

fn list_devices() {
    let devices = Camera::list_devices();
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
        return;
    }
    for d in devices {
        println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
    }
}

fn camera_test(device: &str, frames: u32) -> Result<()> {
    let mut camera = Camera::new(device);
    println!("Running camera diagnostics on {}...", camera.device_path());
    camera
        .open()
        .with_context(|| format!("failed to open {}", camera.device_path()))?;
    if let Some((width, height, format)) = camera.geometry() {
        println!("  negotiated {width}x{height} {format:?}");
    }
    let result = (0..frames).try_for_each(|_| {
        let frame = camera.read_frame()?;
        println!("  {}", describe_frame(&frame));
        Ok::<_, emotag_hw::CameraError>(())
    });
    camera.close();
    result.context("frame capture failed")
}

/// Brightness below this usually means a covered lens or a dark room.
const DARK_FRAME_LUMA: f32 = 20.0;

fn describe_frame(frame: &Frame) -> String {
    let brightness = frame.avg_brightness();
    let mut line = format!(
        "frame {}: {}x{} brightness {brightness:.1}",
        frame.sequence,
        frame.width(),
        frame.height()
    );
    if brightness < DARK_FRAME_LUMA {
        line.push_str(" (dark: lens covered?)");
    }
    line
}
