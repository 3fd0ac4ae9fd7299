use std::fs;
use std::time::Duration;

use tokio::sync::watch;
use xteink::fetch::FetchError;
use xteink::flash::{RunState, StepId, StepStatus, WorkflowKind, WorkflowRun};
use xteink::transport::emulated::FaultKind;
use xteink::transport::{EmulatedDevice, EmulatedDeviceConfig, Region, TransportOp};
use xteink::{
    identify_firmware, Error, ErasePolicy, ErrorKind, FirmwareBinary, FirmwareFamily,
    FirmwareFetcher, FirmwareKey, FlashConfig, Orchestrator, TransportError,
};

/// Serves canned firmware for every key.
struct StubFetcher(Vec<u8>);

impl FirmwareFetcher for StubFetcher {
    async fn fetch(&self, _key: FirmwareKey) -> Result<FirmwareBinary, FetchError> {
        Ok(FirmwareBinary::new(self.0.clone()))
    }
}

/// A server that never answers.
struct HangingFetcher;

impl FirmwareFetcher for HangingFetcher {
    async fn fetch(&self, _key: FirmwareKey) -> Result<FirmwareBinary, FetchError> {
        std::future::pending().await
    }
}

/// A server that answers with an empty body.
struct EmptyFetcher;

impl FirmwareFetcher for EmptyFetcher {
    async fn fetch(&self, _key: FirmwareKey) -> Result<FirmwareBinary, FetchError> {
        Err(FetchError::EmptyBody)
    }
}

fn device_config() -> EmulatedDeviceConfig {
    EmulatedDeviceConfig {
        flash_size: 64 * 1024,
        sector_size: 4096,
        ota_region: Region::new(0x8000, 0x8000),
        ..Default::default()
    }
}

fn english_firmware() -> Vec<u8> {
    let mut image = vec![0u8; 0x3000];
    image[0x20..0x28].copy_from_slice(b"V3.1.0\0\0");
    image[0x1000..0x100e].copy_from_slice(b"End of English");
    image
}

fn flash_config() -> FlashConfig {
    FlashConfig::default().with_chunk_size(1024)
}

fn statuses(run: &WorkflowRun) -> Vec<StepStatus> {
    run.steps.iter().map(|step| step.status).collect()
}

/// Collects the distinct progress values of step `id` until the run finishes.
async fn collect_progress(mut updates: watch::Receiver<WorkflowRun>, id: StepId) -> Vec<f32> {
    let mut seen = Vec::new();

    while updates.changed().await.is_ok() {
        let run = updates.borrow_and_update().clone();

        if let Some(fraction) = run.step(id).and_then(|step| step.progress.fraction()) {
            if seen.last() != Some(&fraction) {
                seen.push(fraction);
            }
        }

        if run.state.is_finished() {
            break;
        }
    }

    seen
}

#[tokio::test]
async fn it_should_publish_transfer_progress_per_chunk() {
    let orchestrator = Orchestrator::new(
        EmulatedDevice::new(device_config()),
        StubFetcher(english_firmware()),
        flash_config(),
    );

    let (result, progress) = tokio::join!(
        orchestrator.flash_english_firmware(),
        collect_progress(orchestrator.subscribe(), StepId::Transfer)
    );

    let info = result.unwrap();
    assert_eq!(info.family, FirmwareFamily::OfficialEnglish);

    assert!(progress.len() > 2);
    assert!(progress.windows(2).all(|pair| pair[0] <= pair[1]));
    assert_eq!(progress.last(), Some(&1.0));

    let run = orchestrator.snapshot();
    assert_eq!(run.state, RunState::Completed);
    assert!(run
        .steps
        .iter()
        .all(|step| step.status == StepStatus::Succeeded));
}

#[tokio::test]
async fn it_should_leave_operations_untouched_while_busy() {
    let orchestrator = Orchestrator::new(
        EmulatedDevice::new(device_config()),
        StubFetcher(english_firmware()),
        flash_config(),
    );
    let image = vec![0x42u8; 16 * 1024];

    let (written, (before, rejected, after)) = tokio::join!(
        orchestrator.write_full_flash(|| Some(FirmwareBinary::new(image))),
        async {
            tokio::task::yield_now().await;

            let before = orchestrator.snapshot();
            let rejected = (
                orchestrator.flash_english_firmware().await.err(),
                orchestrator.save_full_flash().await.err(),
                orchestrator.write_full_flash(|| None).await.err(),
            );

            (before, rejected, orchestrator.snapshot())
        }
    );

    written.unwrap();

    assert!(matches!(
        rejected,
        (Some(Error::Busy), Some(Error::Busy), Some(Error::Busy))
    ));
    assert_eq!(before, after);
    assert_eq!(after.kind, Some(WorkflowKind::WriteFullFlash));
    assert_eq!(orchestrator.snapshot().state, RunState::Completed);
}

#[tokio::test]
async fn it_should_halt_the_ota_sequence_on_a_transfer_failure() {
    let mut device = EmulatedDevice::new(device_config());
    device.inject_fault(TransportOp::Write, 3, FaultKind::Fail);

    let orchestrator = Orchestrator::new(device, StubFetcher(english_firmware()), flash_config());

    let err = orchestrator.flash_english_firmware().await.unwrap_err();

    assert!(matches!(
        err,
        Error::Transport(TransportError::Failed(TransportOp::Write, _))
    ));

    let run = orchestrator.snapshot();
    assert_eq!(run.state, RunState::Failed);
    assert_eq!(
        statuses(&run),
        vec![
            StepStatus::Succeeded,
            StepStatus::Succeeded,
            StepStatus::Succeeded,
            StepStatus::Failed,
            StepStatus::Pending
        ]
    );
    assert_eq!(
        run.step(StepId::Transfer)
            .and_then(|step| step.error.as_ref())
            .map(|err| err.kind),
        Some(ErrorKind::TransportFailure)
    );

    let device = orchestrator.into_transport();
    assert_eq!(device.active_region(), None);
    assert!(!device.is_connected());
    assert_eq!(device.history().last(), Some(&TransportOp::Disconnect));
}

#[tokio::test(start_paused = true)]
async fn it_should_time_out_an_unresponsive_download() {
    let orchestrator = Orchestrator::new(
        EmulatedDevice::new(device_config()),
        HangingFetcher,
        flash_config().with_fetch_timeout(Duration::from_secs(30)),
    );

    let err = orchestrator.flash_english_firmware().await.unwrap_err();

    assert!(matches!(err, Error::NetworkFetch(FetchError::Timeout(_))));

    let run = orchestrator.snapshot();
    assert_eq!(run.state, RunState::Failed);
    assert_eq!(
        run.error.as_ref().map(|err| err.kind),
        Some(ErrorKind::NetworkFetchFailure)
    );
    assert!(!orchestrator.is_running());
}

#[tokio::test]
async fn it_should_not_flash_an_empty_download() {
    let orchestrator = Orchestrator::new(
        EmulatedDevice::new(device_config()),
        EmptyFetcher,
        flash_config(),
    );

    let err = orchestrator.flash_english_firmware().await.unwrap_err();

    assert!(matches!(err, Error::NetworkFetch(FetchError::EmptyBody)));
    assert_eq!(
        statuses(&orchestrator.snapshot())[1..],
        [StepStatus::Pending; 4]
    );
    assert!(orchestrator.into_transport().history().is_empty());
}

#[tokio::test]
async fn it_should_fail_the_in_flight_step_on_unclean_cancellation() {
    let orchestrator = Orchestrator::new(
        EmulatedDevice::new(device_config()),
        StubFetcher(Vec::new()),
        flash_config(),
    );
    let mut updates = orchestrator.subscribe();
    let image = vec![0x42u8; 32 * 1024];

    let cancel = async {
        while updates.changed().await.is_ok() {
            let writing = updates
                .borrow_and_update()
                .step(StepId::Write)
                .and_then(|step| step.progress.fraction())
                .is_some();

            if writing {
                orchestrator.cancel();
                break;
            }
        }
    };

    let (result, _) = tokio::join!(
        orchestrator.write_full_flash(|| Some(FirmwareBinary::new(image))),
        cancel
    );

    assert!(matches!(result, Err(Error::CancelledByUser)));

    let run = orchestrator.snapshot();
    assert_eq!(run.state, RunState::Cancelled);
    assert_eq!(
        statuses(&run),
        vec![
            StepStatus::Succeeded,
            StepStatus::Succeeded,
            StepStatus::Failed,
            StepStatus::Skipped
        ]
    );
    assert_eq!(
        run.step(StepId::Write)
            .and_then(|step| step.error.as_ref())
            .map(|err| err.kind),
        Some(ErrorKind::CancelledByUser)
    );
    assert!(!orchestrator.is_running());
}

#[tokio::test]
async fn it_should_report_the_first_mismatching_byte() {
    // Without an erase, programming cannot set the cleared bits back
    let device = EmulatedDevice::with_data(device_config(), &[0u8; 4096]);
    let orchestrator = Orchestrator::new(
        device,
        StubFetcher(Vec::new()),
        flash_config().with_erase_policy(ErasePolicy::Skip),
    );

    let err = orchestrator
        .write_full_flash(|| Some(FirmwareBinary::new(vec![0xaa; 2048])))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::Transport(TransportError::VerifyMismatch(0))
    ));
    assert_eq!(
        statuses(&orchestrator.snapshot()),
        vec![
            StepStatus::Succeeded,
            StepStatus::Skipped,
            StepStatus::Succeeded,
            StepStatus::Failed
        ]
    );
}

#[tokio::test]
async fn it_should_round_trip_a_device_image_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("device.bin");

    let orchestrator = Orchestrator::new(
        EmulatedDevice::load(&path, device_config()).unwrap(),
        StubFetcher(Vec::new()),
        flash_config(),
    );
    let err = orchestrator.save_full_flash().await.unwrap_err();
    assert!(matches!(err, Error::NoDeviceConnected));

    fs::write(&path, b"").unwrap();

    let orchestrator = Orchestrator::new(
        EmulatedDevice::load(&path, device_config()).unwrap(),
        StubFetcher(Vec::new()),
        flash_config(),
    );
    orchestrator
        .write_full_flash(|| Some(FirmwareBinary::new(b"\0XTOS V3.0.8\0".to_vec())))
        .await
        .unwrap();
    orchestrator.into_transport().persist(&path).unwrap();

    let orchestrator = Orchestrator::new(
        EmulatedDevice::load(&path, device_config()).unwrap(),
        StubFetcher(Vec::new()),
        flash_config(),
    );
    let image = orchestrator.save_full_flash().await.unwrap();

    assert_eq!(image.len(), 64 * 1024);

    let info = identify_firmware(&image);
    assert_eq!(info.family, FirmwareFamily::OfficialChinese);
    assert_eq!(info.version, "V3.0.8");
}

#[tokio::test(start_paused = true)]
async fn it_should_cancel_a_download_in_flight() {
    let orchestrator = Orchestrator::new(
        EmulatedDevice::new(device_config()),
        HangingFetcher,
        flash_config().with_fetch_timeout(Duration::from_secs(60)),
    );
    let start = tokio::time::Instant::now();

    let (result, ()) = tokio::join!(orchestrator.flash_english_firmware(), async {
        tokio::task::yield_now().await;
        orchestrator.cancel();
    });

    assert!(matches!(result, Err(Error::CancelledByUser)));
    assert!(start.elapsed() < Duration::from_secs(60));

    let run = orchestrator.snapshot();
    assert_eq!(run.state, RunState::Cancelled);
    assert_eq!(
        statuses(&run),
        vec![
            StepStatus::Failed,
            StepStatus::Skipped,
            StepStatus::Skipped,
            StepStatus::Skipped,
            StepStatus::Skipped
        ]
    );
    assert_eq!(
        run.step(StepId::Fetch)
            .and_then(|step| step.error.as_ref())
            .map(|err| err.kind),
        Some(ErrorKind::CancelledByUser)
    );
    assert!(orchestrator.into_transport().history().is_empty());
}

#[tokio::test(start_paused = true)]
async fn it_should_cancel_a_hung_device_call() {
    let mut device = EmulatedDevice::new(device_config());
    device.inject_fault(TransportOp::Write, 0, FaultKind::Hang);

    let orchestrator = Orchestrator::new(
        device,
        StubFetcher(Vec::new()),
        flash_config().with_io_timeout(Duration::from_secs(10)),
    );
    let mut updates = orchestrator.subscribe();
    let start = tokio::time::Instant::now();

    let cancel = async {
        while updates.changed().await.is_ok() {
            let writing = updates
                .borrow_and_update()
                .step(StepId::Write)
                .map(|step| step.status == StepStatus::Running)
                .unwrap_or(false);

            if writing {
                orchestrator.cancel();
                break;
            }
        }
    };

    let (result, ()) = tokio::join!(
        orchestrator.write_full_flash(|| Some(FirmwareBinary::new(vec![0; 4096]))),
        cancel
    );

    assert!(matches!(result, Err(Error::CancelledByUser)));
    assert!(start.elapsed() < Duration::from_secs(10));

    let run = orchestrator.snapshot();
    assert_eq!(run.state, RunState::Cancelled);
    assert_eq!(
        statuses(&run),
        vec![
            StepStatus::Succeeded,
            StepStatus::Succeeded,
            StepStatus::Failed,
            StepStatus::Skipped
        ]
    );
    assert_eq!(
        run.error.as_ref().map(|err| err.kind),
        Some(ErrorKind::CancelledByUser)
    );

    let history = orchestrator.into_transport().history().to_vec();
    assert!(history.contains(&TransportOp::Abort));
    assert_eq!(history.last(), Some(&TransportOp::Disconnect));
}

#[tokio::test]
async fn it_should_fail_the_write_step_on_a_short_write() {
    let mut device = EmulatedDevice::new(device_config());
    device.inject_fault(TransportOp::Write, 1, FaultKind::ShortWrite);

    let orchestrator = Orchestrator::new(device, StubFetcher(Vec::new()), flash_config());

    let err = orchestrator
        .write_full_flash(|| Some(FirmwareBinary::new(vec![0; 4096])))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::Transport(TransportError::ShortWrite {
            offset: 1024,
            acknowledged: 512,
            expected: 1024,
        })
    ));

    let run = orchestrator.snapshot();
    assert_eq!(run.state, RunState::Failed);
    assert_eq!(
        statuses(&run),
        vec![
            StepStatus::Succeeded,
            StepStatus::Succeeded,
            StepStatus::Failed,
            StepStatus::Pending
        ]
    );
    assert_eq!(
        run.step(StepId::Write)
            .and_then(|step| step.error.as_ref())
            .map(|err| err.kind),
        Some(ErrorKind::TransportFailure)
    );
}

#[tokio::test]
async fn it_should_keep_a_partial_write_in_the_device_image() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("device.bin");
    fs::write(&path, vec![0x11u8; 8 * 1024]).unwrap();

    let mut device = EmulatedDevice::load(&path, device_config()).unwrap();
    device.inject_fault(TransportOp::Write, 2, FaultKind::Fail);

    let orchestrator = Orchestrator::new(device, StubFetcher(Vec::new()), flash_config());
    let result = orchestrator
        .write_full_flash(|| Some(FirmwareBinary::new(vec![0; 8 * 1024])))
        .await;

    orchestrator.into_transport().persist(&path).unwrap();
    assert!(matches!(
        result,
        Err(Error::Transport(TransportError::Failed(TransportOp::Write, _)))
    ));

    let saved = fs::read(&path).unwrap();
    assert_eq!(saved.len(), 64 * 1024);
    assert!(saved[..2048].iter().all(|&b| b == 0));
    assert!(saved[2048..8 * 1024].iter().all(|&b| b == 0xff));
}
