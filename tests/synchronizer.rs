use anyhow::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};

use depth_capture::driver::{SyntheticDevice, SyntheticDriver};
use depth_capture::{
    DeviceSessionRegistry, FrameRetrievalError, FrameSynchronizer, KindSelection, PixelFormat,
    StreamKind, StreamSpec, SyncError,
};

fn color_depth() -> Vec<StreamSpec> {
    vec![
        StreamSpec::color(32, 24, PixelFormat::Rgb8, 30),
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
fn round_returns_entry_per_session() -> Result<()> {
    let (_rig, registry) = rig(&["SN1", "SN2", "SN3"]);
    for serial in ["SN1", "SN2", "SN3"] {
        registry.start(serial, &color_depth(), false)?;
    }

    let frames =
        FrameSynchronizer::new().poll_round(&registry.active_sessions(), &KindSelection::default())?;

    let mut serials: Vec<&str> = frames.keys().map(String::as_str).collect();
    serials.sort();
    assert_eq!(serials, ["SN1", "SN2", "SN3"]);
    for (serial, set) in &frames {
        assert_eq!(&set.serial, serial);
        assert_eq!(set.kinds(), vec![StreamKind::Color, StreamKind::Depth]);
    }
    Ok(())
}

#[test]
fn hardware_error_aborts_round() -> Result<()> {
    let (rig, registry) = rig(&["SN1", "SN2"]);
    registry.start("SN1", &color_depth(), false)?;
    registry.start("SN2", &color_depth(), false)?;
    rig.fail_next_waits("SN2", 1);

    let err = FrameSynchronizer::new()
        .poll_round(&registry.active_sessions(), &KindSelection::AllEnabled)
        .unwrap_err();
    match err {
        SyncError::Frame(FrameRetrievalError::Hardware { serial, .. }) => {
            assert_eq!(serial, "SN2")
        }
        other => panic!("unexpected error: {other}"),
    }

    // The fault was transient; the next round completes.
    let frames =
        FrameSynchronizer::new().poll_round(&registry.active_sessions(), &KindSelection::AllEnabled)?;
    assert_eq!(frames.len(), 2);
    Ok(())
}

#[test]
fn partial_bundles_are_polled_until_complete() -> Result<()> {
    let (rig, registry) = rig(&["SN1", "SN2"]);
    registry.start("SN1", &color_depth(), false)?;
    registry.start("SN2", &color_depth(), false)?;
    rig.drop_stream("SN1", StreamKind::Color, 3);

    let sessions = registry.active_sessions();
    let frames = FrameSynchronizer::new().poll_round(&sessions, &KindSelection::AllEnabled)?;

    assert_eq!(frames.len(), 2);
    assert!(frames["SN1"].missing(&[StreamKind::Color, StreamKind::Depth]).is_empty());
    // Three partial passes plus the completing one.
    assert_eq!(sessions[0].frames_delivered(), 4);
    Ok(())
}

#[test]
fn infrared_imagers_are_keyed_by_index() -> Result<()> {
    let (_rig, registry) = rig(&["SN1"]);
    registry.start(
        "SN1",
        &[
            StreamSpec::depth(32, 24, 30),
            StreamSpec::infrared(1, 32, 24, 30),
            StreamSpec::infrared(2, 32, 24, 30),
        ],
        false,
    )?;

    let frames =
        FrameSynchronizer::new().poll_round(&registry.active_sessions(), &KindSelection::AllEnabled)?;

    let set = &frames["SN1"];
    assert_eq!(
        set.kinds(),
        vec![
            StreamKind::Depth,
            StreamKind::Infrared(1),
            StreamKind::Infrared(2)
        ]
    );
    assert_ne!(
        set.get(StreamKind::Infrared(1)).map(|ir| ir.data().to_vec()),
        set.get(StreamKind::Infrared(2)).map(|ir| ir.data().to_vec())
    );
    Ok(())
}

#[test]
fn deadline_names_the_devices_still_waiting() -> Result<()> {
    let (rig, registry) = rig(&["SN1", "SN2"]);
    registry.start("SN1", &color_depth(), false)?;
    registry.start("SN2", &color_depth(), false)?;
    rig.set_wait_delay("SN2", Duration::from_millis(500));

    let started = Instant::now();
    let err = FrameSynchronizer::new()
        .poll_round_within(
            &registry.active_sessions(),
            &KindSelection::AllEnabled,
            Duration::from_millis(100),
        )
        .unwrap_err();
    assert!(started.elapsed() < Duration::from_millis(400));

    match err {
        SyncError::Timeout(timeout) => {
            assert!(timeout.serials.contains(&"SN2".to_string()));
            assert!(!timeout.serials.contains(&"SN1".to_string()));
            assert!(timeout.waited >= Duration::from_millis(100));
        }
        other => panic!("unexpected error: {other}"),
    }
    Ok(())
}

#[test]
fn deadline_round_returns_frames_when_fast_enough() -> Result<()> {
    let (_rig, registry) = rig(&["SN1", "SN2"]);
    registry.start("SN1", &color_depth(), false)?;
    registry.start("SN2", &color_depth(), false)?;

    let frames = FrameSynchronizer::new().poll_round_within(
        &registry.active_sessions(),
        &KindSelection::AllEnabled,
        Duration::from_secs(5),
    )?;
    assert_eq!(frames.len(), 2);
    Ok(())
}

#[test]
fn warm_up_consumes_one_wait_per_session_per_round() -> Result<()> {
    let (_rig, registry) = rig(&["SN1", "SN2"]);
    registry.start("SN1", &color_depth(), false)?;
    registry.start("SN2", &color_depth(), false)?;
    let sessions = registry.active_sessions();

    FrameSynchronizer::new().warm_up(&sessions, &KindSelection::AllEnabled, 5)?;

    for session in &sessions {
        assert_eq!(session.frames_delivered(), 5);
    }
    Ok(())
}

#[test]
fn stopped_session_aborts_round_as_inactive() -> Result<()> {
    let (_rig, registry) = rig(&["SN1"]);
    registry.start("SN1", &color_depth(), false)?;
    let sessions = registry.active_sessions();
    registry.stop("SN1")?;

    let err = FrameSynchronizer::new()
        .poll_round(&sessions, &KindSelection::AllEnabled)
        .unwrap_err();
    assert!(matches!(
        err,
        SyncError::Frame(FrameRetrievalError::Inactive { .. })
    ));
    Ok(())
}
