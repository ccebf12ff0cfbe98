//! AsioDevice lifecycle tests
//!
//! Tests for:
//! - Open-time validation and rollback
//! - Close idempotence from every state
//! - Crash escalation during control calls
//! - Keep-alive silence state machine

mod common;

use common::{DRIVER_ID, Fixture, small_buffers};
use rf_asio::mock::{MockConfig, MockFault};
use rf_asio::{
    AsioErrorKind, Channels, ChannelMapping, DeviceSettings, DeviceState, DriverError,
    EngineOptions, SampleFormat, process_tainted,
};
use std::sync::atomic::Ordering;

fn stereo() -> DeviceSettings {
    DeviceSettings::default()
}

fn keep_alive() -> DeviceSettings {
    DeviceSettings {
        keep_device_running: true,
        ..Default::default()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// OPEN
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_open_sets_rate_and_clears_buffers() {
    let f = Fixture::new(small_buffers()).open(DeviceSettings {
        sample_rate: 96000,
        input_channels: 2,
        ..Default::default()
    });
    assert_eq!(f.mock.current_sample_rate(), 96000.0);
    assert_eq!(f.buffer_len(), 64);
    assert_eq!(f.device.state(), DeviceState::Open);
    assert_eq!(f.device.settings().sample_format, SampleFormat::Int32);
    for channel in 0..2 {
        for half in 0..2 {
            let samples = f.mock.output_samples(channel, half).expect("output buffer");
            assert!(samples.iter().all(|&s| s == 0.0));
        }
    }
    // stream position starts one buffer in
    assert_eq!(f.device.realtime().stream_position_offset(), 64);
}

#[test]
fn test_open_rejects_too_many_outputs() {
    let mut f = Fixture::new(MockConfig::default());
    f.device
        .set_settings(DeviceSettings {
            outputs: ChannelMapping::identity(9),
            ..Default::default()
        })
        .expect("settings");
    let err = f.device.open().expect_err("9 outputs on an 8 output device");
    assert_eq!(err.kind, AsioErrorKind::UnsupportedConfiguration);
    assert_eq!(err.message, "Not enough output channels.");
    assert_eq!(f.mock.calls("createBuffers"), 0);
}

#[test]
fn test_open_rejects_mapping_beyond_device() {
    let mut f = Fixture::new(MockConfig::default());
    f.device
        .set_settings(DeviceSettings {
            outputs: ChannelMapping::base_channel(2, 7),
            ..Default::default()
        })
        .expect("settings");
    let err = f.device.open().expect_err("mapping needs 9 channels");
    assert_eq!(
        err.message,
        "Channel mapping requires more channels than available."
    );
    assert!(!f.device.is_open());
}

#[test]
fn test_open_rejects_input_mapping_beyond_device() {
    let mut f = Fixture::new(MockConfig::default());
    f.device
        .set_settings(DeviceSettings {
            input_channels: 2,
            input_source_id: 3,
            ..Default::default()
        })
        .expect("settings");
    let err = f.device.open().expect_err("inputs 3..5 on a 4 input device");
    assert_eq!(err.kind, AsioErrorKind::UnsupportedConfiguration);
    assert_eq!(
        err.message,
        "Channel mapping requires more channels than available."
    );
    assert_eq!(f.mock.calls("createBuffers"), 0);
}

#[test]
fn test_open_rejects_unavailable_device() {
    let mut f = Fixture::new(MockConfig {
        channels: Channels {
            input: 0,
            output: 0,
        },
        ..Default::default()
    });
    assert!(f.device.open().is_err());
    assert!(f.device.device_unavailable_on_open());
    assert!(!f.device.has_active_buffers());
}

#[test]
fn test_open_null_buffers_rolls_back() {
    let mut f = Fixture::new(MockConfig {
        null_buffers: true,
        ..Default::default()
    });
    let err = f.device.open().expect_err("null buffers");
    assert_eq!(err.kind, AsioErrorKind::Protocol);
    assert_eq!(err.message, "createBuffers returned null");
    assert_eq!(f.mock.calls("disposeBuffers"), 1);
    assert!(!f.mock.has_buffers());
    assert_eq!(f.device.state(), DeviceState::Closed);
}

#[test]
fn test_open_rejects_unsupported_rate() {
    let mut f = Fixture::new(MockConfig::default());
    f.device
        .set_settings(DeviceSettings {
            sample_rate: 22050,
            ..Default::default()
        })
        .expect("settings");
    let err = f.device.open().expect_err("rate not supported");
    assert_eq!(err.kind, AsioErrorKind::Protocol);
    assert_eq!(err.call, "setSampleRate");
    assert!(!f.device.is_open());
}

#[test]
fn test_open_unknown_driver() {
    let mut f = Fixture::new(MockConfig::default());
    let registry = rf_asio::mock::MockRegistry::default();
    let mut device = rf_asio::AsioDevice::new(
        std::sync::Arc::new(registry),
        DRIVER_ID,
        f.source.clone(),
        f.events.clone(),
        EngineOptions::default(),
    );
    let err = device.open().expect_err("no driver");
    assert_eq!(err.kind, AsioErrorKind::DriverLoad);
    assert_eq!(device.state(), DeviceState::Closed);
    f.device.close();
}

// ═══════════════════════════════════════════════════════════════════════════════
// CLOSE
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_close_never_opened() {
    let mut f = Fixture::new(MockConfig::default());
    f.device.close();
    f.device.close();
    assert_eq!(f.device.state(), DeviceState::Closed);
    assert_eq!(f.registry.instantiations(), 0);
}

#[test]
fn test_close_partially_opened() {
    let mut f = Fixture::new(MockConfig::default());
    f.mock.inject_fault(
        "getChannelInfo",
        MockFault::Error(DriverError::not_present("channel info")),
    );
    assert!(f.device.open().is_err());
    // buffers were created before the failing call and must be gone again
    assert_eq!(f.mock.calls("createBuffers"), 1);
    assert_eq!(f.mock.calls("disposeBuffers"), 1);
    f.device.close();
    f.device.close();
    assert!(!f.device.has_active_buffers());
}

#[test]
fn test_close_started_stops_first() {
    let mut f = Fixture::new(MockConfig::default()).open(stereo());
    f.device.start().expect("start");
    assert!(f.mock.is_running());
    f.device.close();
    assert_eq!(f.mock.calls("stop"), 1);
    assert!(!f.mock.has_buffers());
    f.device.close();
    assert_eq!(f.mock.calls("stop"), 1);
    assert_eq!(f.mock.calls("disposeBuffers"), 1);
}

#[test]
fn test_close_absorbs_stop_failure() {
    let mut f = Fixture::new(MockConfig::default()).open(stereo());
    f.device.start().expect("start");
    f.mock.inject_fault("stop", MockFault::Panic);
    f.device.close();
    assert_eq!(f.device.state(), DeviceState::Closed);
    assert!(!f.mock.has_buffers());
}

#[test]
fn test_drop_closes() {
    let f = Fixture::new(MockConfig::default()).open(stereo());
    let mock = f.mock.clone();
    drop(f);
    assert!(!mock.has_buffers());
}

// ═══════════════════════════════════════════════════════════════════════════════
// CRASHES
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_crash_during_open_leaves_closed() {
    for func in [
        "instantiate",
        "getDriverName",
        "getChannels",
        "setSampleRate",
        "getBufferSize",
        "createBuffers",
        "getChannelInfo",
        "canOutputReady",
        "getLatencies",
    ] {
        let mut f = Fixture::new(MockConfig::default());
        f.mock.inject_fault(func, MockFault::Panic);
        let err = f.device.open().expect_err(func);
        assert!(err.is_crash(), "{func}: {err}");
        assert_eq!(f.device.state(), DeviceState::Closed, "{func}");
        assert!(!f.device.has_active_buffers(), "{func}");
        assert!(f.device.geometry().is_none(), "{func}");
        assert!(!f.mock.has_buffers(), "{func}");
    }
    assert!(process_tainted());
}

#[test]
fn test_crash_reported_to_user() {
    let mut f = Fixture::new(MockConfig::default());
    f.mock.inject_fault("getBufferSize", MockFault::Panic);
    assert!(f.device.open().is_err());
    let messages = f.events.messages.lock();
    assert!(
        messages
            .iter()
            .any(|(_, m)| m == "ASIO Driver Crash: getBufferSize")
    );
}

#[test]
fn test_crash_during_start_closes() {
    let mut f = Fixture::new(MockConfig::default()).open(stereo());
    f.mock.inject_fault("start", MockFault::Panic);
    assert!(f.device.start().is_err_and(|e| e.is_crash()));
    assert_eq!(f.device.state(), DeviceState::Closed);
    assert!(!f.device.has_active_buffers());
}

#[test]
fn test_start_error_keeps_open() {
    let mut f = Fixture::new(MockConfig::default()).open(stereo());
    f.mock.inject_fault(
        "start",
        MockFault::Error(DriverError::not_present("no clock")),
    );
    let err = f.device.start().expect_err("start fails");
    assert_eq!(err.kind, AsioErrorKind::Protocol);
    assert_eq!(f.device.state(), DeviceState::Open);
}

#[test]
fn test_unmasked_crash_unwinds() {
    let options = EngineOptions {
        mask_driver_crashes: false,
        ..Default::default()
    };
    let mut f = Fixture::with_options(MockConfig::default(), options);
    f.mock.inject_fault("getChannels", MockFault::Panic);
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f.device.open()));
    assert!(result.is_err());
    f.mock.clear_faults();
    f.device.close();
    assert_eq!(f.device.state(), DeviceState::Closed);
}

#[test]
fn test_unmasked_crash_in_stop_still_closes() {
    let options = EngineOptions {
        mask_driver_crashes: false,
        ..Default::default()
    };
    let mut f = Fixture::with_options(small_buffers(), options).open(stereo());
    f.device.start().expect("start");
    f.mock.inject_fault("stop", MockFault::Panic);

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f.device.close()));
    assert!(result.is_ok());
    assert_eq!(f.device.state(), DeviceState::Closed);
    assert!(!f.device.has_active_buffers());
    assert_eq!(f.mock.calls("disposeBuffers"), 1);
    assert!(!f.mock.has_buffers());
    assert!(process_tainted());
}

#[test]
fn test_unmasked_crash_in_stop_closes_device() {
    let options = EngineOptions {
        mask_driver_crashes: false,
        ..Default::default()
    };
    let mut f = Fixture::with_options(small_buffers(), options).open(stereo());
    f.device.start().expect("start");
    f.mock.inject_fault("stop", MockFault::Panic);

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f.device.stop()));
    assert!(result.is_ok());
    assert_eq!(f.device.state(), DeviceState::Closed);
    assert!(!f.mock.has_buffers());
}

#[test]
fn test_unmasked_crash_in_dispose_still_releases_driver() {
    let options = EngineOptions {
        mask_driver_crashes: false,
        ..Default::default()
    };
    let mut f = Fixture::with_options(small_buffers(), options).open(stereo());
    f.mock.inject_fault("disposeBuffers", MockFault::Panic);

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f.device.close()));
    assert!(result.is_ok());
    assert_eq!(f.device.state(), DeviceState::Closed);
    assert!(!f.device.realtime().has_dispatcher());
}

// ═══════════════════════════════════════════════════════════════════════════════
// START / STOP / SILENCE
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_start_requires_open() {
    let mut f = Fixture::new(MockConfig::default());
    assert!(f.device.start().is_err());
    assert_eq!(f.mock.calls("start"), 0);
}

#[test]
fn test_stop_without_keep_alive_stops_driver() {
    let mut f = Fixture::new(MockConfig::default()).open(stereo());
    f.device.start().expect("start");
    assert_eq!(f.device.state(), DeviceState::Started);
    f.device.stop();
    assert_eq!(f.mock.calls("stop"), 1);
    assert!(!f.mock.is_running());
    assert_eq!(f.device.state(), DeviceState::Open);
    assert!(!f.device.is_playing_silence());
}

#[test]
fn test_keep_alive_renders_silence() {
    let mut f = Fixture::new(MockConfig::default()).open(keep_alive());
    f.device.start().expect("start");
    f.device.stop();
    // driver untouched, only the silence flag changed
    assert_eq!(f.mock.calls("start"), 1);
    assert_eq!(f.mock.calls("stop"), 0);
    assert!(f.mock.is_running());
    assert!(f.device.is_playing_silence());
    assert_eq!(f.device.state(), DeviceState::RenderingSilence);

    f.device.start().expect("restart");
    assert_eq!(f.mock.calls("start"), 1);
    assert_eq!(f.device.state(), DeviceState::Started);
    assert!(!f.device.realtime().render_silence());

    f.device.stop_and_avoid_playing_silence();
    assert_eq!(f.mock.calls("stop"), 1);
    assert_eq!(f.device.state(), DeviceState::Open);
}

#[test]
fn test_end_playing_silence() {
    let mut f = Fixture::new(MockConfig::default()).open(keep_alive());
    f.device.end_playing_silence();
    assert_eq!(f.mock.calls("stop"), 0);

    f.device.start().expect("start");
    f.device.stop();
    assert!(f.device.is_playing_silence());
    f.device.end_playing_silence();
    assert_eq!(f.mock.calls("stop"), 1);
    assert!(!f.device.is_playing_silence());
    assert_eq!(f.device.state(), DeviceState::Open);
}

#[test]
fn test_silence_ack_timeout_reports() {
    let f = Fixture::new(MockConfig::default()).open(stereo());
    // no buffer switch arrives, so the acknowledgment never comes
    assert!(!f.device.set_render_silence(true, true));
    assert!(f.device.set_render_silence(false, false));
}

#[test]
fn test_start_with_source_locked_still_starts() {
    let mut f = Fixture::new(MockConfig::default()).open(stereo());
    f.source.locked.store(true, Ordering::SeqCst);
    f.device.start().expect("start");
    assert!(f.device.is_started());
    f.device.stop();
    assert!(!f.device.is_started());
}

#[test]
fn test_settings_rejected_while_open() {
    let mut f = Fixture::new(MockConfig::default()).open(stereo());
    let err = f
        .device
        .set_settings(keep_alive())
        .expect_err("locked while open");
    assert_eq!(err.kind, AsioErrorKind::UnsupportedConfiguration);
    assert!(!f.device.settings().keep_device_running);
}

#[test]
fn test_fragile_and_callback_identity() {
    let f = Fixture::new(MockConfig::default());
    assert!(f.device.is_fragile_device());
    assert!(!f.device.debug_in_realtime_callback());
}
