//! Unit tests for the grafton-av library.

use std::time::Duration;

use crate::{
    error::Error,
    finder::{Source, SourceAddress},
    frames::{fourcc, AudioFormat, AudioFrame, FourCC, FrameType, MetadataFrame, Tally, VideoFrame},
    receiver::{Bandwidth, ColorFormat, ReceiverStatus},
    TIMECODE_SYNTHESIZE,
};

#[test]
fn test_fourcc_codes_match_their_names() {
    for format in [
        FourCC::UYVY,
        FourCC::UYVA,
        FourCC::P216,
        FourCC::PA16,
        FourCC::YV12,
        FourCC::I420,
        FourCC::NV12,
        FourCC::BGRA,
        FourCC::BGRX,
        FourCC::RGBA,
        FourCC::RGBX,
        FourCC::FLTp,
    ] {
        assert_eq!(u32::from(format), fourcc(&format.code()));
    }
    assert_eq!(&FourCC::UYVY.code(), b"UYVY");
    assert_eq!(&FourCC::FLTp.code(), b"FLTp");
}

#[test]
fn test_enum_integer_values() {
    assert_eq!(i32::from(FrameType::Interlaced), 0);
    assert_eq!(i32::from(FrameType::Progressive), 1);
    assert_eq!(i32::from(FrameType::Field0), 2);
    assert_eq!(i32::from(FrameType::Field1), 3);

    assert_eq!(i32::from(AudioFormat::Float32Separate), 0);
    assert_eq!(i32::from(AudioFormat::Float32Interleaved), 1);
    assert_eq!(i32::from(AudioFormat::Int16Interleaved), 2);

    assert_eq!(i32::from(ColorFormat::BGRX_BGRA), 0);
    assert_eq!(i32::from(ColorFormat::Fastest), 100);
    assert_eq!(i32::from(ColorFormat::BGRX_BGRA_FLIPPED), 200);

    assert_eq!(i32::from(Bandwidth::MetadataOnly), -10);
    assert_eq!(i32::from(Bandwidth::AudioOnly), 10);
    assert_eq!(i32::from(Bandwidth::Lowest), 0);
    assert_eq!(i32::from(Bandwidth::Highest), 100);
}

#[test]
fn test_unknown_enum_values_rejected() {
    assert!(FrameType::try_from(7).is_err());
    assert!(Bandwidth::try_from(50).is_err());
    assert!(FourCC::try_from(fourcc(b"H264")).is_err());
}

#[test]
fn test_video_frame_builder() {
    let frame = VideoFrame::builder()
        .resolution(1280, 720)
        .frame_rate(30000, 1001)
        .metadata("<camera id=\"1\"/>")
        .build();

    assert_eq!(frame.width, 1280);
    assert_eq!(frame.height, 720);
    assert_eq!(frame.line_stride, 1280 * 4);
    assert_eq!(frame.data.len(), 1280 * 4 * 720);
    assert_eq!(frame.metadata.as_deref(), Some("<camera id=\"1\"/>"));
    assert!(frame.validate().is_ok());
}

#[test]
fn test_audio_frame_channel_data() {
    // 3 samples, 2 channels, interleaved
    let frame = AudioFrame::builder()
        .format(AudioFormat::Float32Interleaved)
        .channels(2)
        .samples(3)
        .data_f32(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0])
        .build();

    assert_eq!(frame.channel_data(0).unwrap(), vec![1.0, 3.0, 5.0]);
    assert_eq!(frame.channel_data(1).unwrap(), vec![2.0, 4.0, 6.0]);

    // Out of bounds should return None
    assert!(frame.channel_data(2).is_none());
}

#[test]
fn test_frame_defaults_do_not_synthesize() {
    let video = VideoFrame::builder().build();
    assert!(video.timestamp.is_zero());
    assert_ne!(video.timecode, TIMECODE_SYNTHESIZE);

    let video = VideoFrame::builder().timecode(TIMECODE_SYNTHESIZE).build();
    assert_eq!(video.timecode, TIMECODE_SYNTHESIZE);
}

#[test]
fn test_receiver_status_default() {
    let status = ReceiverStatus::default();
    assert!(!status.connected);
    assert!(status.source_name.is_none());
    assert!(status.clock_offset.is_none());
    assert_eq!(status.video_frames, 0);
    assert_eq!(status.dropped_audio, 0);
}

#[test]
fn test_tally_metadata_is_xml() {
    let frame = Tally::new(true, false).to_metadata();
    assert!(frame.data.starts_with("<ndi_tally"));
    assert_eq!(Tally::from_metadata(&frame), Some(Tally::new(true, false)));
    assert_eq!(
        Tally::from_metadata(&MetadataFrame::with_data("<other/>", 0)),
        None
    );
}

#[test]
fn test_error_classification() {
    let timeout = Error::Timeout {
        operation: "video frame",
        timeout: Duration::from_millis(250),
    };
    assert!(timeout.is_timeout());
    assert!(!timeout.is_fatal());
    assert_eq!(
        timeout.to_string(),
        "Timed out after 250ms waiting for video frame"
    );

    let closed = Error::Closed("receiver");
    assert!(closed.is_closed());
    assert!(closed.is_fatal());
    assert_eq!(closed.to_string(), "The receiver has been closed");

    assert!(Error::Transport("reset".into()).is_fatal());
    assert!(!Error::InvalidFrame("short".into()).is_fatal());
}

#[test]
fn test_source_address_contains_host() {
    let ip_addr = SourceAddress::Ip("192.168.1.100:5961".to_string());
    assert!(ip_addr.contains_host("192.168.1.100"));
    assert!(ip_addr.contains_host("192.168.1"));
    assert!(!ip_addr.contains_host("192.168.2"));

    let url_addr = SourceAddress::Url("tcp://camera.local:8080".to_string());
    assert!(url_addr.contains_host("camera.local"));
    assert!(!url_addr.contains_host("other.local"));

    assert!(!SourceAddress::None.contains_host("anything"));
}

#[test]
fn test_source_address_port() {
    assert_eq!(SourceAddress::Ip("192.168.1.100:5961".into()).port(), Some(5961));
    assert_eq!(SourceAddress::Ip("192.168.1.100".into()).port(), None);
    assert_eq!(SourceAddress::Url("tcp://camera.local:8080/stream".into()).port(), Some(8080));
    assert_eq!(SourceAddress::Url("tcp://camera.local/stream".into()).port(), None);
    assert_eq!(SourceAddress::None.port(), None);
}

#[test]
fn test_source_matching_real_world_example() {
    let source = Source {
        name: "CAMERA1 (Chan1, 192.168.0.107)".to_string(),
        address: SourceAddress::Ip("192.168.0.107:5961".to_string()),
    };

    // By address, partial address and name
    assert!(source.matches_host("192.168.0.107"));
    assert!(source.matches_host("192.168.0"));
    assert!(source.matches_host("CAMERA1"));
    assert!(!source.matches_host("CAMERA2"));

    assert_eq!(source.host(), Some("192.168.0.107"));
    assert_eq!(source.address.port(), Some(5961));
}

#[test]
fn test_named_source_has_no_host() {
    let source = Source::named("STUDIO (Main)");
    assert_eq!(source.host(), None);
    assert!(source.matches_host("STUDIO"));
    assert_eq!(source.to_string(), "STUDIO (Main)");
}
