use anyhow::{bail, Result};
use clap::Parser;
use snapcam::backends::{create_provider, CameraSelector, PreviewTarget};
use snapcam::config::{CameraBackendKind, CaptureStrategy};
use snapcam::controller::{BindingStatus, PresentationState};
use snapcam::keyboard_input::KeyboardInputHandler;
use snapcam::permission::{CameraPermission, PermissionState};
use snapcam::screen::{CameraScreen, ScreenHandle};
use snapcam::storage::FileImageStore;
use snapcam::{FrameData, SnapcamConfig, SnapcamError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "snapcam")]
#[command(about = "Camera screen with live preview and photo capture")]
#[command(version)]
#[command(long_about = "A terminal camera screen: binds a camera, keeps a live preview \
running and captures photos on demand. Uses a virtual camera by default; V4L2 devices \
are available through GStreamer when built with the `gstreamer` feature.")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "snapcam.toml", help = "Path to TOML configuration file")]
    config: String,

    /// Enable debug logging (most verbose)
    #[arg(short, long, help = "Enable debug level logging")]
    debug: bool,

    /// Enable verbose logging (info level)
    #[arg(short, long, help = "Enable verbose info level logging")]
    verbose: bool,

    /// Enable quiet mode (errors only)
    #[arg(short, long, help = "Enable quiet mode - only log errors")]
    quiet: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration file and exit without opening the camera")]
    validate_config: bool,

    /// Print default configuration and exit
    #[arg(long, help = "Print default configuration in TOML format and exit")]
    print_config: bool,

    /// Override log format (json, pretty, compact)
    #[arg(long, value_name = "FORMAT", help = "Log output format: json, pretty, or compact")]
    log_format: Option<String>,

    #[arg(long, conflicts_with = "deny", help = "Grant camera permission")]
    grant: bool,

    #[arg(long, help = "Deny camera permission")]
    deny: bool,

    #[arg(long, value_name = "BACKEND", value_parser = parse_backend, help = "Camera backend: virtual or gstreamer")]
    backend: Option<CameraBackendKind>,

    #[arg(long, value_name = "STRATEGY", value_parser = parse_strategy, help = "Capture strategy: still_capture or preview_snapshot")]
    strategy: Option<CaptureStrategy>,

    #[arg(long, value_name = "LENS", value_parser = parse_selector, help = "Camera to open first: back or front")]
    selector: Option<CameraSelector>,

    /// Capture this many photos without keyboard input, then exit
    #[arg(long, value_name = "N", help = "Capture N photos non-interactively and exit")]
    capture_count: Option<u32>,
}

fn parse_backend(value: &str) -> std::result::Result<CameraBackendKind, String> {
    match value {
        "virtual" => Ok(CameraBackendKind::Virtual),
        "gstreamer" => Ok(CameraBackendKind::Gstreamer),
        other => Err(format!("unknown backend '{}'", other)),
    }
}

fn parse_strategy(value: &str) -> std::result::Result<CaptureStrategy, String> {
    match value {
        "still_capture" => Ok(CaptureStrategy::StillCapture),
        "preview_snapshot" => Ok(CaptureStrategy::PreviewSnapshot),
        other => Err(format!("unknown capture strategy '{}'", other)),
    }
}

fn parse_selector(value: &str) -> std::result::Result<CameraSelector, String> {
    match value {
        "back" => Ok(CameraSelector::Back),
        "front" => Ok(CameraSelector::Front),
        other => Err(format!("unknown camera '{}'", other)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        print_default_config()?;
        return Ok(());
    }

    init_logging(&args)?;

    info!("Starting snapcam v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {}", args.config);

    let mut config = SnapcamConfig::load_from_file(&args.config).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;
    apply_overrides(&mut config, &args);

    if args.validate_config {
        match config.validate() {
            Ok(()) => {
                info!("Configuration validation successful");
                println!("✓ Configuration is valid");
                return Ok(());
            }
            Err(e) => {
                error!("Configuration validation failed: {}", e);
                eprintln!("✗ Configuration validation failed: {}", e);
                std::process::exit(1);
            }
        }
    }
    config.validate()?;

    let provider = create_provider(&config.camera).map_err(|e| {
        error!("Failed to create camera backend: {}", e);
        e
    })?;
    let store = Arc::new(FileImageStore::new(&config.storage));
    let permission = initial_permission(&config, &args);
    let lifetime = CancellationToken::new();

    let (screen, handle) =
        CameraScreen::new(&config, provider, store, permission, lifetime.clone());
    let screen_task = tokio::spawn(screen.run());

    let (preview, frames) = PreviewTarget::new("terminal");
    handle.start_preview(preview)?;

    tokio::spawn(render_presentation(handle.clone()));
    tokio::spawn(count_preview_frames(frames, lifetime.clone()));
    setup_signal_handler(lifetime.clone());

    match args.capture_count {
        Some(count) => {
            let result = capture_photos(&handle, count).await;
            handle.shutdown().ok();
            screen_task.await??;
            result?;
        }
        None => {
            let keyboard = KeyboardInputHandler::new(handle.clone());
            keyboard.start().await?;
            let result = screen_task.await;
            keyboard.stop().await?;
            result??;
        }
    }

    info!("snapcam exited");
    Ok(())
}

fn apply_overrides(config: &mut SnapcamConfig, args: &Args) {
    if let Some(backend) = args.backend {
        config.camera.backend = backend;
    }
    if let Some(strategy) = args.strategy {
        config.capture.strategy = strategy;
    }
    if let Some(selector) = args.selector {
        config.camera.selector = selector;
    }
}

/// Command-line flags win over the configured grant
fn initial_permission(config: &SnapcamConfig, args: &Args) -> CameraPermission {
    let state = if args.deny {
        PermissionState::Denied
    } else if args.grant || config.permission.granted {
        PermissionState::Granted
    } else {
        PermissionState::Denied
    };
    CameraPermission::new(state)
}

fn setup_signal_handler(lifetime: CancellationToken) {
    tokio::spawn(async move {
        if let Ok(()) = tokio::signal::ctrl_c().await {
            info!("Received SIGINT signal (Ctrl+C)");
            lifetime.cancel();
        }
    });
}

async fn capture_photos(handle: &ScreenHandle, count: u32) -> Result<()> {
    let state = handle
        .wait_for(|s| {
            matches!(
                s.binding,
                BindingStatus::Bound | BindingStatus::Failed(_) | BindingStatus::PermissionDenied
            )
        })
        .await?;

    match state.binding {
        BindingStatus::Bound => {}
        BindingStatus::PermissionDenied => return Err(SnapcamError::PermissionDenied.into()),
        other => bail!("camera unavailable: {:?}", other),
    }

    for n in 1..=count {
        handle.wait_for(|s| s.capture_enabled()).await?;
        let Some(ticket) = handle.capture().await? else {
            warn!("Capture {} was rejected", n);
            continue;
        };

        match ticket.outcome().await {
            Ok(image) => println!("{}", image),
            Err(e) => warn!("Capture {}/{} failed: {}", n, count, e),
        }
        handle.dismiss_capture()?;
    }

    Ok(())
}

/// Stand-in for the widget layer: logs each state change and shows notices once
async fn render_presentation(handle: ScreenHandle) {
    let mut updates = handle.subscribe();
    let mut shown = updates.borrow_and_update().clone();

    while updates.changed().await.is_ok() {
        let state = updates.borrow_and_update().clone();
        render_changes(&shown, &state);

        if state.notice.is_some() && handle.acknowledge_notice().is_err() {
            break;
        }
        shown = state;
    }

    debug!("Presentation stopped");
}

fn render_changes(previous: &PresentationState, state: &PresentationState) {
    if previous.binding != state.binding || previous.selector != state.selector {
        match &state.binding {
            BindingStatus::Initializing => info!("[screen] starting {} camera...", state.selector),
            BindingStatus::Bound => info!("[screen] {} camera live", state.selector),
            BindingStatus::Unbound => debug!("[screen] camera unbound"),
            BindingStatus::Failed(reason) => {
                warn!("[screen] camera unavailable: {} (press r to retry)", reason)
            }
            BindingStatus::PermissionDenied => warn!("[screen] camera permission required"),
        }
    }

    if state.show_loading() && !previous.show_loading() {
        info!("[screen] capturing...");
    }

    if state.captured_image != previous.captured_image {
        match &state.captured_image {
            Some(image) => info!("[screen] showing {} (press d to dismiss)", image),
            None => info!("[screen] back to live preview"),
        }
    }

    if let Some(notice) = &state.notice {
        if previous.notice.as_ref() != Some(notice) {
            warn!("[toast] {}", notice);
        }
    }
}

async fn count_preview_frames(
    mut frames: watch::Receiver<Option<FrameData>>,
    lifetime: CancellationToken,
) {
    let mut received = 0u64;
    let mut report = tokio::time::interval(Duration::from_secs(5));
    report.tick().await;

    loop {
        tokio::select! {
            _ = lifetime.cancelled() => break,
            changed = frames.changed() => {
                if changed.is_err() {
                    break;
                }
                received += 1;
            }
            _ = report.tick() => {
                if let Some(frame) = frames.borrow().as_ref() {
                    debug!(
                        "Preview: {} frames received, latest {}x{} ({} bytes, {}ms old)",
                        received,
                        frame.width,
                        frame.height,
                        frame.len(),
                        frame.age_ms()
                    );
                }
            }
        }
    }
}

fn init_logging(args: &Args) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    let log_level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else if args.quiet {
        "error"
    } else {
        "warn"
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("snapcam={}", log_level)));

    let fmt_layer = match args.log_format.as_deref() {
        Some("json") => fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        Some("compact") => fmt::layer()
            .compact()
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .boxed(),
        Some("pretty") | None => fmt::layer()
            .pretty()
            .with_target(true)
            .with_thread_ids(args.debug)
            .with_file(args.debug)
            .with_line_number(args.debug)
            .boxed(),
        Some(format) => {
            eprintln!("Warning: Unknown log format '{}', using default", format);
            fmt::layer()
                .with_target(true)
                .with_thread_ids(args.debug)
                .with_file(args.debug)
                .with_line_number(args.debug)
                .boxed()
        }
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .init();

    Ok(())
}

/// Print default configuration in TOML format
fn print_default_config() -> Result<()> {
    println!("# snapcam configuration file");
    println!("# Every value may be overridden with SNAPCAM_<SECTION>__<KEY>, e.g. SNAPCAM_CAMERA__FPS=15");
    println!();
    println!("{}", toml::to_string_pretty(&SnapcamConfig::default())?);
    Ok(())
}
