use super::*;
use crate::backends::{CameraDevice, CameraSelector, PreviewTarget, UseCase, VirtualCameraProvider};
use crate::config::{CaptureStrategy, SnapcamConfig};
use crate::error::{CameraError, CaptureError};
use crate::storage::FileImageStore;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn create_test_config(dir: &Path, strategy: CaptureStrategy) -> SnapcamConfig {
    let mut config = SnapcamConfig::default();
    config.camera.resolution = (32, 24);
    config.camera.fps = 30;
    config.camera.bind_retries = 2;
    config.camera.bind_retry_delay_ms = 10;
    config.capture.strategy = strategy;
    config.capture.timeout_seconds = 5;
    config.storage.path = dir.join("photos").display().to_string();
    config
}

struct Harness {
    controller: SessionController,
    completions: mpsc::UnboundedReceiver<Completion>,
    provider: Arc<VirtualCameraProvider>,
    lifecycle: CancellationToken,
    _dir: TempDir,
}

impl Harness {
    fn new(strategy: CaptureStrategy) -> Self {
        Self::with_config(strategy, |_| {})
    }

    fn with_config(strategy: CaptureStrategy, adjust: impl FnOnce(&mut SnapcamConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = create_test_config(dir.path(), strategy);
        adjust(&mut config);
        let provider = Arc::new(VirtualCameraProvider::new(
            config.camera.resolution,
            config.camera.fps,
        ));
        let store = Arc::new(FileImageStore::new(&config.storage));
        let (tx, rx) = mpsc::unbounded_channel();

        let controller = SessionController::new(&config, provider.clone(), store, tx);

        Self {
            controller,
            completions: rx,
            provider,
            lifecycle: CancellationToken::new(),
            _dir: dir,
        }
    }

    async fn initialized(strategy: CaptureStrategy) -> Self {
        let mut harness = Self::new(strategy);
        let lifecycle = harness.lifecycle.clone();
        harness
            .controller
            .initialize(&lifecycle, CameraSelector::Back)
            .await
            .unwrap();
        harness
    }

    fn device(&self) -> Arc<dyn CameraDevice> {
        Arc::clone(self.controller.session().unwrap().device())
    }

    /// Photos currently on disk
    fn saved_photos(&self) -> Vec<std::path::PathBuf> {
        match std::fs::read_dir(self._dir.path().join("photos")) {
            Ok(entries) => entries
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|path| path.extension().and_then(|e| e.to_str()) == Some("jpg"))
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Deliver the next worker completion to the controller
    async fn settle(&mut self) {
        let completion = tokio::time::timeout(Duration::from_secs(5), self.completions.recv())
            .await
            .expect("capture did not complete")
            .expect("completion channel closed");
        self.controller.handle_completion(completion);
    }
}

#[tokio::test]
async fn test_initialize_binds_preview_and_capture() {
    let harness = Harness::initialized(CaptureStrategy::StillCapture).await;

    let session = harness.controller.session().unwrap();
    assert_eq!(session.bound_state(), BindState::Bound);
    assert_eq!(session.selector(), CameraSelector::Back);

    let device = harness.device();
    assert!(device.is_bound(UseCase::Preview));
    assert!(device.is_bound(UseCase::ImageCapture));

    let state = harness.controller.state();
    assert_eq!(state.binding, BindingStatus::Bound);
    assert!(state.capture_enabled());
    assert!(!state.show_loading());
    assert!(!state.show_overlay());
}

#[tokio::test]
async fn test_start_preview_before_and_after_binding() {
    let mut harness = Harness::new(CaptureStrategy::StillCapture);
    let (first, _rx1) = PreviewTarget::new("first");
    let (second, _rx2) = PreviewTarget::new("second");

    // Remembered until the device is bound
    harness.controller.start_preview(first.clone());
    assert!(first.latest_frame().is_none());

    let lifecycle = harness.lifecycle.clone();
    harness
        .controller
        .initialize(&lifecycle, CameraSelector::Back)
        .await
        .unwrap();
    assert!(first.latest_frame().is_some());

    // Re-attaching redirects frames and is safe to repeat
    harness.controller.start_preview(second.clone());
    harness.controller.start_preview(second.clone());
    assert!(second.latest_frame().is_some());
    assert!(harness
        .controller
        .session()
        .unwrap()
        .preview_target()
        .unwrap()
        .same_surface(&second));
    assert!(harness.controller.session().unwrap().is_bound());
}

#[tokio::test]
async fn test_successful_capture_sets_image_and_returns_to_idle() {
    let mut harness = Harness::initialized(CaptureStrategy::StillCapture).await;

    let ticket = harness.controller.capture().unwrap();
    let state = harness.controller.state();
    assert_eq!(state.capture_status, CaptureStatus::InProgress);
    assert!(state.show_loading());
    assert!(!state.capture_enabled());

    harness.settle().await;

    let image = ticket.outcome().await.unwrap();
    assert!(!image.is_empty());
    assert!(image.to_path().unwrap().exists());

    let state = harness.controller.state();
    assert_eq!(state.capture_status, CaptureStatus::Idle);
    assert_eq!(state.captured_image.as_ref(), Some(&image));
    assert_eq!(
        state.last_request.as_ref().map(|r| r.status.clone()),
        Some(CaptureStatus::Succeeded(image))
    );
    assert!(state.capture_enabled());
}

#[tokio::test]
async fn test_second_trigger_rejected_while_in_progress() {
    let mut harness = Harness::initialized(CaptureStrategy::StillCapture).await;
    harness
        .provider
        .faults()
        .set_capture_delay(Duration::from_millis(50));

    let first = harness.controller.capture().unwrap();
    for _ in 0..5 {
        assert!(harness.controller.capture().is_none());
    }
    assert_eq!(
        harness.controller.in_flight_request().map(|r| r.id),
        Some(first.request_id())
    );

    harness.settle().await;

    assert!(first.outcome().await.is_ok());
    assert_eq!(harness.provider.faults().pictures_taken(), 1);
    assert!(harness.controller.in_flight_request().is_none());
}

#[tokio::test]
async fn test_capture_failure_keeps_session_usable() {
    let mut harness = Harness::initialized(CaptureStrategy::StillCapture).await;
    harness.provider.faults().fail_next_captures(1);

    let ticket = harness.controller.capture().unwrap();
    harness.settle().await;

    match ticket.outcome().await {
        Err(CaptureError::Failed { reason }) => assert_eq!(reason, "Camera device busy"),
        other => panic!("Expected capture failure, got {:?}", other),
    }

    let state = harness.controller.state();
    assert_eq!(state.capture_status, CaptureStatus::Idle);
    assert_eq!(state.binding, BindingStatus::Bound);
    assert_eq!(
        state.notice.as_deref(),
        Some("Photo capture failed: Camera device busy")
    );
    assert!(state.captured_image.is_none());
    assert!(matches!(
        state.last_request.as_ref().map(|r| r.status.clone()),
        Some(CaptureStatus::Failed(_))
    ));

    // Immediate retry works without re-initializing
    let retry = harness.controller.capture().unwrap();
    assert!(harness.controller.state().notice.is_none());
    harness.settle().await;
    assert!(retry.outcome().await.is_ok());
}

#[tokio::test]
async fn test_dismiss_capture_keeps_binding() {
    let mut harness = Harness::initialized(CaptureStrategy::StillCapture).await;
    let (target, mut frames) = PreviewTarget::new("screen");
    harness.controller.start_preview(target);

    let ticket = harness.controller.capture().unwrap();
    harness.settle().await;
    ticket.outcome().await.unwrap();
    assert!(harness.controller.state().show_overlay());

    harness.controller.dismiss_capture();

    let state = harness.controller.state();
    assert!(!state.show_overlay());
    assert_eq!(state.binding, BindingStatus::Bound);
    assert!(harness.device().is_bound(UseCase::Preview));
    assert!(harness.controller.captured_image().is_none());

    // Live frames keep arriving
    frames.borrow_and_update();
    tokio::time::timeout(Duration::from_secs(2), frames.changed())
        .await
        .expect("preview stalled")
        .unwrap();
}

#[tokio::test]
async fn test_preview_snapshot_unbinds_and_rebinds_preview() {
    let mut harness = Harness::initialized(CaptureStrategy::PreviewSnapshot).await;
    let (target, _rx) = PreviewTarget::new("screen");
    harness.controller.start_preview(target.clone());
    let snapshot = target.latest_frame().unwrap();

    let ticket = harness.controller.capture().unwrap();

    let device = harness.device();
    assert!(!device.is_bound(UseCase::Preview));
    assert!(device.is_bound(UseCase::ImageCapture));
    assert_eq!(
        harness.controller.session().unwrap().bound_state(),
        BindState::Unbound
    );
    assert_eq!(harness.controller.state().binding, BindingStatus::Unbound);

    harness.settle().await;

    let image = ticket.outcome().await.unwrap();
    let bytes = std::fs::read(image.to_path().unwrap()).unwrap();
    assert_eq!(bytes, *snapshot.data);

    assert!(device.is_bound(UseCase::Preview));
    assert!(device.is_bound(UseCase::ImageCapture));
    assert_eq!(harness.controller.state().binding, BindingStatus::Bound);
}

#[tokio::test]
async fn test_preview_snapshot_without_frame_fails_and_rebinds() {
    let mut harness = Harness::initialized(CaptureStrategy::PreviewSnapshot).await;

    let ticket = harness.controller.capture().unwrap();
    harness.settle().await;

    assert!(ticket.outcome().await.is_err());
    assert!(harness.controller.session().unwrap().is_bound());
    assert!(harness.controller.state().capture_enabled());
}

#[tokio::test]
async fn test_teardown_mid_capture_ignores_late_completion() {
    let mut harness = Harness::initialized(CaptureStrategy::StillCapture).await;
    harness
        .provider
        .faults()
        .set_capture_delay(Duration::from_millis(100));

    let ticket = harness.controller.capture().unwrap();
    let device = harness.device();
    harness.controller.teardown();

    let after_teardown = harness.controller.state();
    assert_eq!(after_teardown.binding, BindingStatus::Unbound);
    assert!(!device.is_bound(UseCase::Preview));
    assert!(matches!(ticket.outcome().await, Err(CaptureError::Cancelled)));

    // Anything the worker still sends is dropped without a state change
    if let Ok(Some(late)) =
        tokio::time::timeout(Duration::from_millis(250), harness.completions.recv()).await
    {
        harness.controller.handle_completion(late);
    }

    assert_eq!(harness.controller.state(), after_teardown);
    assert!(harness.controller.capture().is_none());
}

#[tokio::test]
async fn test_teardown_mid_capture_leaves_no_photo_behind() {
    let mut harness = Harness::initialized(CaptureStrategy::StillCapture).await;
    harness
        .provider
        .faults()
        .set_capture_delay(Duration::from_millis(200));

    let ticket = harness.controller.capture().unwrap();
    // Let the worker reach the device before tearing down
    tokio::time::sleep(Duration::from_millis(50)).await;
    harness.controller.teardown();
    assert!(matches!(ticket.outcome().await, Err(CaptureError::Cancelled)));

    // The device finishes its write after teardown
    tokio::time::timeout(Duration::from_secs(2), async {
        while harness.provider.faults().pictures_taken() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("device never finished the abandoned capture");

    let mut remaining = harness.saved_photos();
    for _ in 0..40 {
        if remaining.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
        remaining = harness.saved_photos();
    }
    assert!(remaining.is_empty(), "orphaned photos: {:?}", remaining);
    assert!(harness.completions.try_recv().is_err());
}

#[tokio::test]
async fn test_failed_capture_leaves_no_photo_behind() {
    let mut harness = Harness::initialized(CaptureStrategy::StillCapture).await;
    harness.provider.faults().fail_next_captures(1);

    let ticket = harness.controller.capture().unwrap();
    harness.settle().await;

    assert!(ticket.outcome().await.is_err());
    assert!(harness.saved_photos().is_empty());
}

#[tokio::test]
async fn test_stale_completion_is_ignored() {
    let mut harness = Harness::initialized(CaptureStrategy::StillCapture).await;
    let before = harness.controller.state();

    harness.controller.handle_completion(Completion {
        generation: 42,
        request_id: 1,
        result: Err(CaptureError::Failed {
            reason: "late".to_string(),
        }),
    });

    assert_eq!(harness.controller.state(), before);
}

#[tokio::test]
async fn test_binding_failure_is_surfaced_and_recoverable() {
    let mut harness = Harness::new(CaptureStrategy::StillCapture);
    let faults = harness.provider.faults();
    faults.fail_next_acquisitions(10);

    let lifecycle = harness.lifecycle.clone();
    let result = harness
        .controller
        .initialize(&lifecycle, CameraSelector::Back)
        .await;
    assert!(matches!(result, Err(CameraError::DeviceOpen { .. })));
    // bind_retries = 2
    assert_eq!(faults.acquisitions(), 2);

    let state = harness.controller.state();
    assert!(matches!(state.binding, BindingStatus::Failed(_)));
    assert!(!state.capture_enabled());
    assert!(harness.controller.capture().is_none());

    faults.fail_next_acquisitions(0);
    harness.controller.retry_binding().await.unwrap();
    assert_eq!(harness.controller.state().binding, BindingStatus::Bound);
    assert!(harness.controller.capture().is_some());
}

#[tokio::test]
async fn test_transient_acquisition_failure_is_retried() {
    let mut harness = Harness::new(CaptureStrategy::StillCapture);
    harness.provider.faults().fail_next_acquisitions(1);

    let lifecycle = harness.lifecycle.clone();
    harness
        .controller
        .initialize(&lifecycle, CameraSelector::Front)
        .await
        .unwrap();

    assert_eq!(harness.provider.faults().acquisitions(), 2);
    assert_eq!(harness.controller.state().binding, BindingStatus::Bound);
    assert_eq!(harness.controller.state().selector, CameraSelector::Front);
}

#[tokio::test]
async fn test_switch_camera_rebinds_other_lens() {
    let mut harness = Harness::initialized(CaptureStrategy::StillCapture).await;
    let back = harness.device();

    harness
        .controller
        .switch_camera(CameraSelector::Front)
        .await
        .unwrap();

    assert!(!back.is_bound(UseCase::Preview));
    assert_eq!(harness.controller.selector(), CameraSelector::Front);
    assert_eq!(harness.device().selector(), CameraSelector::Front);
    assert!(harness.device().is_bound(UseCase::Preview));

    // Not while a capture is running
    harness.controller.capture().unwrap();
    assert!(matches!(
        harness.controller.switch_camera(CameraSelector::Back).await,
        Err(CameraError::DeviceBusy { .. })
    ));
    harness.settle().await;
}

#[tokio::test]
async fn test_capture_rejected_before_initialize() {
    let mut harness = Harness::new(CaptureStrategy::StillCapture);
    assert!(harness.controller.capture().is_none());
    assert_eq!(
        harness.controller.state().binding,
        BindingStatus::Initializing
    );
}

#[tokio::test]
async fn test_lifecycle_cancel_interrupts_binding_retries() {
    let mut harness = Harness::with_config(CaptureStrategy::StillCapture, |config| {
        config.camera.bind_retries = 50;
        config.camera.bind_retry_delay_ms = 1_000;
    });
    harness.provider.faults().fail_next_acquisitions(100);

    let lifecycle = harness.lifecycle.clone();
    let canceller = lifecycle.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(5)).await;
        canceller.cancel();
    });

    let started = std::time::Instant::now();
    let result = harness
        .controller
        .initialize(&lifecycle, CameraSelector::Back)
        .await;

    assert!(result.is_err());
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(matches!(
        harness.controller.state().binding,
        BindingStatus::Failed(_)
    ));
}
