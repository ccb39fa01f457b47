//! Pipeline integration tests.
//!
//! Drives the controller with mock demuxers, muxers and codecs to verify
//! data flow, drain semantics, error policy and state management.

mod common;

use std::sync::{Arc, Mutex};

use common::{
    audio_stream, delayed_registry, registry, stuck_registry, video_packets, video_stream,
    MockDemuxer, MockMuxer, MuxRecord,
};
use transcode_core::{MediaKind, Packet, Rational, TimeBase, Timestamp};
use transcode_pipeline::*;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn av_config() -> TranscodeConfig {
    TranscodeConfig::new()
        .video_codec("rawvideo")
        .audio_codec("pcm_s16le")
}

fn video_config() -> TranscodeConfig {
    TranscodeConfig::new()
        .video_codec("rawvideo")
        .drop_audio(true)
}

fn configured(config: TranscodeConfig, demuxer: MockDemuxer) -> (Pipeline, Arc<Mutex<MuxRecord>>) {
    let (muxer, record) = MockMuxer::new();
    let mut pipeline = Pipeline::new(registry(), config);
    pipeline
        .configure_with(Box::new(demuxer), Box::new(muxer))
        .unwrap();
    (pipeline, record)
}

fn end_us(packet: &Packet) -> Option<i64> {
    (packet.pts + packet.duration).to_micros()
}

fn shift_us(packets: &mut [Packet], us: i64) {
    for packet in packets {
        let offset = TimeBase::MICROSECONDS.convert(us, packet.pts.time_base);
        packet.pts.value += offset;
        packet.dts.value += offset;
    }
}

fn assert_monotonic(record: &MuxRecord, stream: u32) {
    let packets = record.packets_of(stream);
    for pair in packets.windows(2) {
        assert!(
            pair[0].dts <= pair[1].dts,
            "stream {} dts went backwards: {} then {}",
            stream,
            pair[0].dts,
            pair[1].dts
        );
    }
}

// =============================================================================
// Data flow
// =============================================================================

#[test]
fn test_av_pipeline_runs_to_completion() {
    init_tracing();
    let (mut pipeline, record) = configured(av_config(), MockDemuxer::av(50, 100));
    let report = pipeline.run().unwrap();

    assert_eq!(report.outcome, Outcome::Success);
    assert_eq!(report.state, PipelineState::Closed);
    assert!(report.error.is_none());

    let record = record.lock().unwrap();
    assert!(record.header);
    assert!(record.trailer);
    assert_eq!(record.streams.len(), 2);
    assert_eq!(record.packets_of(0).len(), 50);
    // 96000 samples regrouped into 1024-sample packets.
    assert_eq!(record.packets_of(1).len(), 94);
    assert_monotonic(&record, 0);
    assert_monotonic(&record, 1);

    let video = report.stats.stream(0).unwrap();
    assert_eq!(video.kind, Some(MediaKind::Video));
    assert_eq!(video.packets_read, 50);
    assert_eq!(video.frames_decoded, 50);
    assert_eq!(video.frames_encoded, 50);
    assert_eq!(video.packets_written, 50);
    let audio = report.stats.stream(1).unwrap();
    assert_eq!(audio.frames_decoded, 100);
    assert_eq!(audio.packets_written, 94);
    assert_eq!(report.stats.packets_read, 150);
    assert_eq!(report.stats.dropped(), 0);
}

#[test]
fn test_output_interleaved_by_time() {
    let (mut pipeline, record) = configured(av_config(), MockDemuxer::av(25, 50));
    pipeline.run().unwrap();

    let record = record.lock().unwrap();
    let times: Vec<i64> = record
        .packets
        .iter()
        .map(|p| p.dts.to_micros().unwrap())
        .collect();
    assert!(times.windows(2).all(|w| w[0] <= w[1]), "{:?}", times);
}

#[test]
fn test_pipeline_step_by_step() {
    let (mut pipeline, record) = configured(av_config(), MockDemuxer::av(5, 10));
    assert_eq!(pipeline.state(), PipelineState::Configured);

    assert!(pipeline.step().unwrap());
    assert_eq!(pipeline.state(), PipelineState::Running);

    let mut steps = 1;
    while pipeline.step().unwrap() {
        steps += 1;
    }
    // One step per packet; the last read hits end of input and drains.
    assert_eq!(steps, 15);
    assert_eq!(pipeline.state(), PipelineState::Closed);
    assert!(record.lock().unwrap().trailer);

    let err = pipeline.step().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert_eq!(pipeline.run().unwrap_err().kind(), ErrorKind::InvalidState);
    assert_eq!(pipeline.state(), PipelineState::Closed);
}

#[test]
fn test_buffering_decoder_drained_on_flush() {
    let config = video_config().video_decoder("delayed");
    let demuxer = MockDemuxer::av(20, 0);
    let (muxer, record) = MockMuxer::new();
    let mut pipeline = Pipeline::new(delayed_registry(3), config);
    pipeline
        .configure_with(Box::new(demuxer), Box::new(muxer))
        .unwrap();
    let report = pipeline.run().unwrap();

    assert_eq!(report.outcome, Outcome::Success);
    let video = report.stats.stream(0).unwrap();
    assert_eq!(video.frames_decoded, 20);
    assert_eq!(video.packets_written, 20);

    let record = record.lock().unwrap();
    let first_bytes: Vec<u8> = record.packets.iter().map(|p| p.data()[0]).collect();
    assert_eq!(first_bytes, (0..20).collect::<Vec<u8>>());
}

#[test]
fn test_drop_audio_yields_one_video_stream() {
    let (mut pipeline, record) = configured(video_config(), MockDemuxer::av(10, 20));
    let report = pipeline.run().unwrap();

    let record = record.lock().unwrap();
    assert_eq!(record.streams.len(), 1);
    assert_eq!(record.streams[0].kind(), MediaKind::Video);
    assert!(record.packets.iter().all(|p| p.stream_index == 0));
    assert_eq!(report.stats.streams.len(), 1);
    assert_eq!(report.stats.packets_ignored, 20);
}

#[test]
fn test_stream_selector() {
    let (muxer, record) = MockMuxer::new();
    let mut pipeline = Pipeline::new(registry(), av_config())
        .select_streams(|s| s.kind() == MediaKind::Audio);
    pipeline
        .configure_with(Box::new(MockDemuxer::av(10, 20)), Box::new(muxer))
        .unwrap();
    let report = pipeline.run().unwrap();

    let record = record.lock().unwrap();
    assert_eq!(record.streams.len(), 1);
    assert_eq!(record.streams[0].kind(), MediaKind::Audio);
    assert_eq!(report.stats.stream(0).unwrap().input_index, 1);
    assert_eq!(report.stats.packets_ignored, 10);
}

#[test]
fn test_scale_crop_rate_output_descriptor() {
    let source = video_stream(0, 1920, 1080, Rational::from_int(30));
    let packets = video_packets(&source, 10);
    let config = video_config().video_filters(
        FilterSpec::parse("scale=1080:-1, crop=1080:1920:0:0, fps=29").unwrap(),
    );
    let (mut pipeline, record) = configured(config, MockDemuxer::new(vec![source], packets));

    let output = pipeline.output_streams()[0].video_params().copied().unwrap();
    assert_eq!((output.width, output.height), (1080, 1920));
    assert_eq!(output.frame_rate, Rational::from_int(29));

    let report = pipeline.run().unwrap();
    assert_eq!(report.outcome, Outcome::Success);
    let record = record.lock().unwrap();
    let written = record.packets_of(0);
    assert!((9..=10).contains(&written.len()), "{} frames", written.len());
    assert!(written.iter().all(|p| p.size() == 1080 * 1920));
    assert_eq!(record.streams[0].time_base.to_string(), "1/29");
}

#[test]
fn test_rebases_to_common_origin() {
    let video = video_stream(0, 32, 16, Rational::from_int(25));
    let audio = audio_stream(1);
    let mut packets = common::interleave(vec![
        video_packets(&video, 10),
        common::audio_packets(&audio, 20),
    ]);
    // Shift the whole input by five seconds.
    for packet in &mut packets {
        let offset = TimeBase::new(1, 1).convert(5, packet.pts.time_base);
        packet.pts.value += offset;
        packet.dts.value += offset;
    }
    let streams = vec![
        video.with_timing(450_000, 90_000),
        audio.with_timing(240_000, 19_200),
    ];
    let (mut pipeline, record) = configured(av_config(), MockDemuxer::new(streams, packets));
    pipeline.run().unwrap();

    let record = record.lock().unwrap();
    assert_eq!(record.packets_of(0)[0].pts.to_micros(), Some(0));
    assert_eq!(record.packets_of(1)[0].pts.to_micros(), Some(0));
}

#[test]
fn test_rebase_origin_is_earliest_stream_start() {
    let video = video_stream(0, 32, 16, Rational::from_int(25));
    let audio = audio_stream(1);
    let mut video_list = video_packets(&video, 10);
    let mut audio_list = common::audio_packets(&audio, 20);
    // Audio starts 200ms before video, but the file opens with video.
    shift_us(&mut video_list, 5_200_000);
    shift_us(&mut audio_list, 5_000_000);
    let mut packets = common::interleave(vec![video_list, audio_list]);
    let first_video = packets.iter().position(|p| p.stream_index == 0).unwrap();
    let head = packets.remove(first_video);
    packets.insert(0, head);

    let (mut pipeline, record) =
        configured(av_config(), MockDemuxer::new(vec![video, audio], packets));
    let report = pipeline.run().unwrap();
    assert_eq!(report.outcome, Outcome::Success);

    let record = record.lock().unwrap();
    assert_eq!(record.packets_of(1)[0].pts.to_micros(), Some(0));
    assert_eq!(record.packets_of(0)[0].pts.to_micros(), Some(200_000));
    assert!(record.packets.iter().all(|p| p.pts.value >= 0));
    assert_eq!(report.stats.packets_read, 30);
}

#[test]
fn test_video_only_input_needs_no_audio_codec() {
    let source = video_stream(0, 32, 16, Rational::from_int(25));
    let demuxer = MockDemuxer::new(vec![source.clone()], video_packets(&source, 10));
    let config = TranscodeConfig::new().video_codec("rawvideo");
    let (mut pipeline, record) = configured(config, demuxer);
    let report = pipeline.run().unwrap();

    assert_eq!(report.outcome, Outcome::Success);
    assert_eq!(report.stats.streams.len(), 1);
    let record = record.lock().unwrap();
    assert_eq!(record.streams.len(), 1);
    assert_eq!(record.packets_of(0).len(), 10);
}

// =============================================================================
// Error policy
// =============================================================================

#[test]
fn test_corrupt_packets_are_skipped() {
    let source = video_stream(0, 32, 16, Rational::from_int(25));
    let mut packets = video_packets(&source, 20);
    for i in [5, 12] {
        let corrupt = Packet::new(vec![0; 7])
            .with_timestamps(packets[i].pts, packets[i].dts)
            .with_stream_index(0);
        packets[i] = corrupt;
    }
    let (mut pipeline, record) = configured(video_config(), MockDemuxer::new(vec![source], packets));
    let report = pipeline.run().unwrap();

    assert_eq!(report.outcome, Outcome::PartialSuccess);
    assert_eq!(report.outcome.exit_code(), 2);
    let video = report.stats.stream(0).unwrap();
    assert_eq!(video.packets_read, 20);
    assert_eq!(video.dropped_packets, 2);
    assert_eq!(video.packets_written, 18);
    assert!(record.lock().unwrap().trailer);
}

#[test]
fn test_audio_stays_in_sync_after_dropped_packet() {
    let video = video_stream(0, 32, 16, Rational::from_int(25));
    let audio = audio_stream(1);
    let mut audio_list = common::audio_packets(&audio, 40);
    let lost = &audio_list[10];
    audio_list[10] = Packet::new(vec![0; 3])
        .with_timestamps(lost.pts, lost.dts)
        .with_duration(lost.duration)
        .with_stream_index(1);
    let packets = common::interleave(vec![video_packets(&video, 20), audio_list]);
    let (mut pipeline, record) =
        configured(av_config(), MockDemuxer::new(vec![video, audio], packets));
    let report = pipeline.run().unwrap();

    assert_eq!(report.outcome, Outcome::PartialSuccess);
    assert_eq!(report.stats.stream(1).unwrap().dropped_packets, 1);
    let record = record.lock().unwrap();
    let video_end = record.packets_of(0).last().and_then(|p| end_us(p));
    let audio_end = record.packets_of(1).last().and_then(|p| end_us(p));
    assert_eq!(video_end, Some(800_000));
    assert_eq!(audio_end, Some(800_000));
    // Audio after the hole keeps its source position.
    assert!(record
        .packets_of(1)
        .iter()
        .any(|p| p.pts.to_micros() == Some(220_000)));
    assert_monotonic(&record, 1);
}

#[test]
fn test_failing_decoder_does_not_hang() {
    init_tracing();
    let (muxer, record) = MockMuxer::new();
    let config = video_config().video_decoder("stuck");
    let mut pipeline = Pipeline::new(stuck_registry(), config);
    pipeline
        .configure_with(Box::new(MockDemuxer::av(20, 0)), Box::new(muxer))
        .unwrap();
    let report = pipeline.run().unwrap();

    assert_eq!(report.outcome, Outcome::PartialSuccess);
    assert_eq!(report.state, PipelineState::Closed);
    let video = report.stats.stream(0).unwrap();
    assert_eq!(video.packets_read, 20);
    assert_eq!(video.frames_decoded, 0);
    // A few retries per packet, not an endless loop.
    assert!(video.dropped_packets >= 20, "{} dropped", video.dropped_packets);
    assert!(video.dropped_packets < 1_000, "{} dropped", video.dropped_packets);
    let record = record.lock().unwrap();
    assert!(record.trailer);
    assert!(record.packets.is_empty());
}

#[test]
fn test_non_monotonic_packets_dropped() {
    let source = video_stream(0, 32, 16, Rational::from_int(25));
    let mut packets = video_packets(&source, 5);
    // Presentation order 0, 1, 2, 1, 4.
    let tb = source.time_base;
    packets[3] = packets[3]
        .clone()
        .with_timestamps(Timestamp::new(3600, tb), Timestamp::new(3600, tb));
    let (mut pipeline, record) = configured(video_config(), MockDemuxer::new(vec![source], packets));
    let report = pipeline.run().unwrap();

    let video = report.stats.stream(0).unwrap();
    assert_eq!(video.dropped_packets, 1);
    assert_eq!(video.packets_written, 4);
    assert_eq!(report.outcome, Outcome::PartialSuccess);
    assert_monotonic(&record.lock().unwrap(), 0);
}

#[test]
fn test_unknown_encoder_never_runs() {
    let (muxer, record) = MockMuxer::new();
    let mut pipeline = Pipeline::new(registry(), video_config().video_codec("vp9"));
    let err = pipeline
        .configure_with(Box::new(MockDemuxer::av(5, 0)), Box::new(muxer))
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::CodecNotFound);
    assert_eq!(pipeline.state(), PipelineState::Failed);
    assert_eq!(pipeline.error().map(|e| e.kind()), Some(ErrorKind::CodecNotFound));
    assert_eq!(pipeline.step().unwrap_err().kind(), ErrorKind::InvalidState);

    let record = record.lock().unwrap();
    assert!(record.streams.is_empty());
    assert!(!record.header);
}

#[test]
fn test_selected_audio_needs_codec() {
    let (muxer, record) = MockMuxer::new();
    let mut pipeline = Pipeline::new(registry(), TranscodeConfig::new().video_codec("rawvideo"));
    let err = pipeline
        .configure_with(Box::new(MockDemuxer::av(5, 5)), Box::new(muxer))
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert_eq!(pipeline.state(), PipelineState::Failed);
    assert!(!record.lock().unwrap().header);
}

#[test]
fn test_unknown_filter_fails_configure() {
    let (muxer, _record) = MockMuxer::new();
    let config = video_config().video_filters(FilterSpec::parse("blur=3").unwrap());
    let mut pipeline = Pipeline::new(registry(), config);
    let err = pipeline
        .configure_with(Box::new(MockDemuxer::av(5, 0)), Box::new(muxer))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FilterGraph);
    assert_eq!(pipeline.report().outcome, Outcome::Failure);
}

#[test]
fn test_configure_twice_rejected() {
    let (mut pipeline, _record) = configured(video_config(), MockDemuxer::av(5, 0));
    let (muxer, _) = MockMuxer::new();
    let err = pipeline
        .configure_with(Box::new(MockDemuxer::av(5, 0)), Box::new(muxer))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert_eq!(pipeline.state(), PipelineState::Configured);
}

#[test]
fn test_mux_failure_is_fatal() {
    let (mut muxer, record) = MockMuxer::new();
    muxer.fail_after = Some(5);
    let mut pipeline = Pipeline::new(registry(), video_config());
    pipeline
        .configure_with(Box::new(MockDemuxer::av(20, 0)), Box::new(muxer))
        .unwrap();

    let err = pipeline.run().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Mux);
    assert_eq!(pipeline.state(), PipelineState::Failed);

    let report = pipeline.report();
    assert_eq!(report.outcome, Outcome::Failure);
    assert_eq!(report.error.map(|e| e.kind()), Some(ErrorKind::Mux));
    assert!(!record.lock().unwrap().trailer);
    pipeline.close().unwrap();
    assert_eq!(pipeline.state(), PipelineState::Failed);
}

#[test]
fn test_input_failure_is_fatal() {
    let mut demuxer = MockDemuxer::av(20, 0);
    demuxer.fail_after = Some(10);
    let (mut pipeline, record) = configured(video_config(), demuxer);

    let err = pipeline.run().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Input);
    assert_eq!(pipeline.report().stats.stream(0).unwrap().packets_read, 10);
    assert!(!record.lock().unwrap().trailer);
}

#[test]
fn test_write_packet_before_header() {
    let (muxer, record) = MockMuxer::new();
    let mut sink = MuxSink::new("memory", Box::new(muxer));
    let stream = video_stream(0, 32, 16, Rational::from_int(25));
    let packet = video_packets(&stream, 1).remove(0);
    let handle = sink.add_stream(stream).unwrap();

    let err = sink.write_packet(handle, packet).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Mux);
    assert!(record.lock().unwrap().packets.is_empty());
}

// =============================================================================
// Cancellation and close
// =============================================================================

#[test]
fn test_cancel_mid_run_finalizes_output() {
    init_tracing();
    let token = CancellationToken::new();
    let trigger = token.clone();
    let (muxer, record) = MockMuxer::new();
    let mut pipeline = Pipeline::new(registry(), av_config().progress_interval(10))
        .with_cancellation(token)
        .on_progress(move |progress| {
            if progress.packets_read >= 20 {
                trigger.cancel();
            }
        });
    pipeline
        .configure_with(Box::new(MockDemuxer::av(50, 100)), Box::new(muxer))
        .unwrap();
    let report = pipeline.run().unwrap();

    assert!(report.cancelled);
    assert_eq!(report.outcome, Outcome::PartialSuccess);
    assert_eq!(report.state, PipelineState::Closed);
    let record = record.lock().unwrap();
    assert!(record.trailer);
    let frames = record.packets_of(0).len();
    assert!(frames > 0 && frames < 50, "{} frames", frames);
}

#[test]
fn test_close_mid_run() {
    let (mut pipeline, record) = configured(video_config(), MockDemuxer::av(20, 0));
    for _ in 0..5 {
        assert!(pipeline.step().unwrap());
    }
    pipeline.close().unwrap();
    assert_eq!(pipeline.state(), PipelineState::Closed);
    assert!(pipeline.report().cancelled);

    let record = record.lock().unwrap();
    assert!(record.trailer);
    assert_eq!(record.packets.len(), 5);
    pipeline.close().unwrap();
}

// =============================================================================
// Threaded execution
// =============================================================================

#[test]
fn test_threaded_matches_sequential() {
    let (mut sequential, expected) = configured(av_config(), MockDemuxer::av(50, 100));
    sequential.run().unwrap();
    let config = av_config()
        .execution(ExecutionMode::Threaded)
        .queue_capacity(2);
    let (mut threaded, actual) = configured(config, MockDemuxer::av(50, 100));
    let report = threaded.run().unwrap();

    assert_eq!(report.outcome, Outcome::Success);
    assert_eq!(report.state, PipelineState::Closed);
    let expected = expected.lock().unwrap();
    let actual = actual.lock().unwrap();
    assert!(actual.trailer);
    for stream in 0..2 {
        let a: Vec<(i64, &[u8])> = expected
            .packets_of(stream)
            .iter()
            .map(|p| (p.pts.value, p.data()))
            .collect();
        let b: Vec<(i64, &[u8])> = actual
            .packets_of(stream)
            .iter()
            .map(|p| (p.pts.value, p.data()))
            .collect();
        assert_eq!(a, b, "stream {}", stream);
    }
    assert_eq!(report.stats.stream(0).unwrap().frames_encoded, 50);
    assert_eq!(report.stats.stream(1).unwrap().packets_written, 94);
}

#[test]
fn test_threaded_cancel_before_start() {
    let token = CancellationToken::new();
    token.cancel();
    let (muxer, record) = MockMuxer::new();
    let mut pipeline = Pipeline::new(
        registry(),
        av_config().execution(ExecutionMode::Threaded),
    )
    .with_cancellation(token);
    pipeline
        .configure_with(Box::new(MockDemuxer::av(50, 100)), Box::new(muxer))
        .unwrap();
    let report = pipeline.run().unwrap();

    assert!(report.cancelled);
    assert_eq!(report.outcome, Outcome::PartialSuccess);
    let record = record.lock().unwrap();
    assert!(record.trailer);
    assert!(record.packets.is_empty());
}

#[test]
fn test_threaded_cancel_mid_run() {
    init_tracing();
    let token = CancellationToken::new();
    let trigger = token.clone();
    let (muxer, record) = MockMuxer::new();
    let config = av_config()
        .execution(ExecutionMode::Threaded)
        .progress_interval(10);
    let mut pipeline = Pipeline::new(registry(), config)
        .with_cancellation(token)
        .on_progress(move |progress| {
            if progress.packets_read >= 20 {
                trigger.cancel();
            }
        });
    pipeline
        .configure_with(Box::new(MockDemuxer::av(50, 100)), Box::new(muxer))
        .unwrap();
    let report = pipeline.run().unwrap();

    assert!(report.cancelled);
    assert_eq!(report.outcome, Outcome::PartialSuccess);
    assert_eq!(report.state, PipelineState::Closed);
    assert!(report.stats.packets_read < 150);
    let record = record.lock().unwrap();
    assert!(record.header);
    assert!(record.trailer);
    let frames = record.packets_of(0).len();
    assert!(frames > 0 && frames < 50, "{} frames", frames);
    assert_monotonic(&record, 0);
    assert_monotonic(&record, 1);
}

#[test]
fn test_threaded_mux_failure() {
    let (mut muxer, record) = MockMuxer::new();
    muxer.fail_after = Some(3);
    let mut pipeline = Pipeline::new(
        registry(),
        av_config().execution(ExecutionMode::Threaded).queue_capacity(1),
    );
    pipeline
        .configure_with(Box::new(MockDemuxer::av(50, 100)), Box::new(muxer))
        .unwrap();

    let err = pipeline.run().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Mux);
    assert_eq!(pipeline.state(), PipelineState::Failed);
    assert!(!record.lock().unwrap().trailer);
}
