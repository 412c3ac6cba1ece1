use anyhow::Result;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use depth_capture::driver::{DriverErrorKind, SyntheticDevice, SyntheticDriver};
use depth_capture::{
    DeviceSessionRegistry, FrameRetrievalError, PixelFormat, StartError, StopOutcome, StreamSpec,
};

fn streams() -> Vec<StreamSpec> {
    vec![
        StreamSpec::color(32, 24, PixelFormat::Bgr8, 30),
        StreamSpec::depth(32, 24, 30),
    ]
}

fn rig(serials: &[&str]) -> (SyntheticDriver, DeviceSessionRegistry) {
    let rig = SyntheticDriver::with_devices(
        serials
            .iter()
            .map(|serial| SyntheticDevice::new(serial, "D400")),
    );
    let registry = DeviceSessionRegistry::new(Arc::new(rig.clone()));
    (rig, registry)
}

#[test]
fn start_twice_keeps_one_pipeline() -> Result<()> {
    let (rig, registry) = rig(&["SN123"]);

    registry.start("SN123", &streams(), false)?;
    let first = registry.get("SN123").expect("session after start");
    registry.start("SN123", &streams(), false)?;
    let second = registry.get("SN123").expect("session after second start");

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(rig.live_pipelines("SN123"), 1);
    assert_eq!(rig.pipelines_opened("SN123"), 1);
    Ok(())
}

#[test]
fn is_active_tracks_start_stop_sequence() -> Result<()> {
    let (rig, registry) = rig(&["SN1"]);

    let ops = ["start", "start", "stop", "stop", "start", "stop", "start", "start"];
    let mut expect_active = false;
    for op in ops {
        match op {
            "start" => {
                registry.start("SN1", &streams(), false)?;
                expect_active = true;
            }
            _ => {
                let result = registry.stop("SN1");
                if expect_active {
                    assert!(result?.is_clean());
                } else {
                    assert_eq!(result.err().map(|e| e.serial), Some("SN1".to_string()));
                }
                expect_active = false;
            }
        }
        assert_eq!(registry.is_active("SN1"), expect_active, "after {op}");
        assert_eq!(rig.live_pipelines("SN1"), usize::from(expect_active));
    }
    assert_eq!(rig.pipelines_opened("SN1"), 3);
    Ok(())
}

#[test]
fn stop_removes_session_even_when_hardware_stop_fails() -> Result<()> {
    let (rig, registry) = rig(&["SN1"]);
    registry.start("SN1", &streams(), false)?;
    rig.fail_stop("SN1", true);

    let outcome = registry.stop("SN1")?;
    match outcome {
        StopOutcome::Faulted(err) => {
            assert_eq!(err.serial, "SN1");
            assert_eq!(err.source.kind, DriverErrorKind::Hardware);
        }
        StopOutcome::Released => panic!("stop fault was not reported"),
    }
    assert!(!registry.is_active("SN1"));
    assert!(registry.get("SN1").is_none());

    // A faulted stop never blocks the next start.
    registry.start("SN1", &streams(), false)?;
    assert!(registry.is_active("SN1"));
    assert_eq!(rig.live_pipelines("SN1"), 1);
    Ok(())
}

#[test]
fn failed_starts_leave_no_session_behind() {
    let (rig, registry) = rig(&["SN1"]);

    let err = registry.start("SN9", &streams(), false).unwrap_err();
    assert!(matches!(err, StartError::UnknownDevice { .. }));

    let err = registry
        .start("SN1", &[StreamSpec::color(32, 24, PixelFormat::Z16, 30)], false)
        .unwrap_err();
    assert!(matches!(err, StartError::Unsupported { .. }));

    rig.refuse_next_start("SN1", DriverErrorKind::Busy);
    let err = registry.start("SN1", &streams(), false).unwrap_err();
    assert!(matches!(
        err,
        StartError::Refused { ref source, .. } if source.kind == DriverErrorKind::Busy
    ));

    rig.fail_context(Some("usb subsystem unavailable"));
    let err = registry.start("SN1", &streams(), false).unwrap_err();
    assert!(matches!(err, StartError::Context(_)));

    assert!(registry.is_empty());
    assert_eq!(rig.live_pipelines("SN1"), 0);
}

#[test]
fn concurrent_starts_create_one_session() -> Result<()> {
    let (rig, registry) = rig(&["SN1"]);
    let registry = Arc::new(registry);
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let registry = Arc::clone(&registry);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                registry.start("SN1", &streams(), true)
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("start thread panicked")?;
    }

    assert_eq!(registry.len(), 1);
    assert_eq!(rig.pipelines_opened("SN1"), 1);
    assert_eq!(rig.live_pipelines("SN1"), 1);
    Ok(())
}

#[test]
fn stop_waits_for_in_flight_frame_wait() -> Result<()> {
    let (rig, registry) = rig(&["SN1"]);
    registry.start("SN1", &streams(), false)?;
    rig.set_wait_delay("SN1", Duration::from_millis(200));

    let session = registry.get("SN1").expect("session");
    let waiter = thread::spawn(move || session.wait_for_frameset());
    thread::sleep(Duration::from_millis(50));

    let started = Instant::now();
    registry.stop("SN1")?;
    assert!(started.elapsed() >= Duration::from_millis(100));

    let frames = waiter.join().expect("waiter panicked")?;
    assert_eq!(frames.len(), 2);
    assert_eq!(rig.live_pipelines("SN1"), 0);
    Ok(())
}

#[test]
fn slow_device_does_not_stall_other_lifecycles() -> Result<()> {
    let (rig, registry) = rig(&["SN1", "SN2"]);
    let registry = Arc::new(registry);
    registry.start("SN1", &streams(), false)?;
    rig.set_wait_delay("SN1", Duration::from_millis(400));

    let session = registry.get("SN1").expect("session");
    let waiter = thread::spawn(move || session.wait_for_frameset());
    thread::sleep(Duration::from_millis(50));

    let stopper = {
        let registry = Arc::clone(&registry);
        thread::spawn(move || registry.stop("SN1"))
    };
    thread::sleep(Duration::from_millis(20));

    let started = Instant::now();
    registry.start("SN2", &streams(), false)?;
    registry.stop("SN2")?;
    assert!(started.elapsed() < Duration::from_millis(300));

    stopper.join().expect("stopper panicked")?;
    waiter.join().expect("waiter panicked")?;
    Ok(())
}

#[test]
fn stale_handle_reports_inactive_after_stop() -> Result<()> {
    let (_rig, registry) = rig(&["SN1"]);
    registry.start("SN1", &streams(), false)?;
    let stale = registry.get("SN1").expect("session");
    registry.stop("SN1")?;

    assert!(!stale.is_running());
    assert!(matches!(
        stale.wait_for_frameset(),
        Err(FrameRetrievalError::Inactive { .. })
    ));
    Ok(())
}

#[test]
fn unplugged_device_fails_waits_with_hardware_error() -> Result<()> {
    let (rig, registry) = rig(&["SN1"]);
    registry.start("SN1", &streams(), false)?;
    rig.detach("SN1");

    let session = registry.get("SN1").expect("session");
    assert!(matches!(
        session.wait_for_frameset(),
        Err(FrameRetrievalError::Hardware { .. })
    ));
    assert!(registry.stop("SN1").is_ok());
    assert!(!registry.is_active("SN1"));
    Ok(())
}
