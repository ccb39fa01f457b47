//! Three-thread executor.
//!
//! Demux+decode, filter+encode and mux each run on their own thread,
//! connected per stream by bounded queues. A full queue blocks its
//! producer; end of stream travels as [`Msg::End`]. Every stage object is
//! borrowed by exactly one thread for the whole run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Select, Sender};
use parking_lot::Mutex;
use tracing::{debug, info};
use transcode_core::Packet;

use crate::cancel::CancellationToken;
use crate::error::{PipelineError, Result};
use crate::lane::{DecodeLane, EncodeLane, PacketWriter};
use crate::media::MediaFrame;
use crate::pipeline::{Demuxed, Input, Run};

/// How often blocked consumers look at the abort flag.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

enum Msg<T> {
    Item(T),
    End,
}

/// Failure state shared by the workers. The first error wins.
#[derive(Default)]
struct Shared {
    abort: AtomicBool,
    error: Mutex<Option<PipelineError>>,
}

impl Shared {
    fn fail(&self, err: PipelineError) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            debug!("Worker failed: {}", err);
            *slot = Some(err);
        }
        self.abort.store(true, Ordering::Release);
    }

    fn aborted(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }

    /// Record a worker result. A closed queue only means another worker
    /// stopped first and already recorded why.
    fn settle(&self, result: Result<()>) {
        match result {
            Ok(()) | Err(PipelineError::Cancelled) => {}
            Err(e) => self.fail(e),
        }
    }
}

fn send<T>(tx: &Sender<Msg<T>>, item: T) -> Result<()> {
    tx.send(Msg::Item(item))
        .map_err(|_| PipelineError::Cancelled)
}

fn end<T>(tx: &Sender<Msg<T>>) -> Result<()> {
    tx.send(Msg::End).map_err(|_| PipelineError::Cancelled)
}

/// Run `run` to completion on three threads.
///
/// Returns whether the run was cancelled. The trailer has been written
/// when this returns `Ok`.
pub(crate) fn execute(run: &mut Run, cancel: &CancellationToken, capacity: usize) -> Result<bool> {
    let Run {
        input,
        decoders,
        encoders,
        writer,
    } = run;
    let lanes = decoders.len();
    let shared = Shared::default();
    let cancelled = AtomicBool::new(false);
    info!("Running {} streams on 3 threads (queue capacity {})", lanes, capacity);

    thread::scope(|scope| {
        let (frame_tx, frame_rx): (Vec<_>, Vec<_>) =
            (0..lanes).map(|_| bounded::<Msg<MediaFrame>>(capacity)).unzip();
        let (packet_tx, packet_rx): (Vec<_>, Vec<_>) =
            (0..lanes).map(|_| bounded::<Msg<Packet>>(capacity)).unzip();
        let shared = &shared;
        let cancelled = &cancelled;

        scope.spawn(move || {
            let result = demux_decode(input, decoders, &frame_tx, cancel, cancelled, shared);
            shared.settle(result);
            drop(frame_tx);
        });
        scope.spawn(move || {
            let result = filter_encode(encoders, &frame_rx, &packet_tx, shared);
            shared.settle(result);
            drop(frame_rx);
            drop(packet_tx);
        });

        let result = write(writer, &packet_rx, shared);
        shared.settle(result);
        drop(packet_rx);
    });

    match shared.error.into_inner() {
        Some(err) => Err(err),
        None => Ok(cancelled.into_inner()),
    }
}

fn demux_decode(
    input: &mut Input,
    decoders: &mut [DecodeLane],
    frames: &[Sender<Msg<MediaFrame>>],
    cancel: &CancellationToken,
    cancelled: &AtomicBool,
    shared: &Shared,
) -> Result<()> {
    loop {
        if shared.aborted() {
            return Ok(());
        }
        if cancel.is_cancelled() {
            info!("Cancellation requested, draining");
            cancelled.store(true, Ordering::Release);
            break;
        }
        match input.next()? {
            Demuxed::Packet(lane, packet) => {
                if let (Some(decoder), Some(tx)) = (decoders.get_mut(lane), frames.get(lane)) {
                    decoder.push(packet, &mut |frame| send(tx, frame))?;
                }
            }
            Demuxed::Ignored => {}
            Demuxed::End => {
                info!("End of input");
                break;
            }
        }
    }

    let flush = !cancelled.load(Ordering::Acquire);
    for (decoder, tx) in decoders.iter_mut().zip(frames) {
        if flush {
            decoder.flush(&mut |frame| send(tx, frame))?;
        }
        end(tx)?;
    }
    Ok(())
}

fn filter_encode(
    encoders: &mut [EncodeLane],
    frames: &[Receiver<Msg<MediaFrame>>],
    packets: &[Sender<Msg<Packet>>],
    shared: &Shared,
) -> Result<()> {
    let mut open: Vec<usize> = (0..frames.len()).collect();
    while !open.is_empty() {
        if shared.aborted() {
            return Ok(());
        }
        let mut select = Select::new();
        for &lane in &open {
            select.recv(&frames[lane]);
        }
        let Ok(op) = select.select_timeout(POLL_INTERVAL) else {
            continue;
        };
        let position = op.index();
        let lane = open[position];
        let tx = &packets[lane];
        match op.recv(&frames[lane]) {
            Ok(Msg::Item(frame)) => {
                encoders[lane].push(frame, &mut |packet| send(tx, packet))?;
            }
            Ok(Msg::End) => {
                encoders[lane].flush(&mut |packet| send(tx, packet))?;
                end(tx)?;
                open.remove(position);
            }
            // Upstream stopped without finishing the stream.
            Err(_) => return Ok(()),
        }
    }
    Ok(())
}

fn write(writer: &mut PacketWriter, packets: &[Receiver<Msg<Packet>>], shared: &Shared) -> Result<()> {
    let mut open: Vec<usize> = (0..packets.len()).collect();
    while !open.is_empty() {
        if shared.aborted() {
            return Ok(());
        }
        let mut select = Select::new();
        for &lane in &open {
            select.recv(&packets[lane]);
        }
        let Ok(op) = select.select_timeout(POLL_INTERVAL) else {
            continue;
        };
        let position = op.index();
        let lane = open[position];
        match op.recv(&packets[lane]) {
            Ok(Msg::Item(packet)) => writer.write(packet)?,
            Ok(Msg::End) => {
                writer.end_stream(lane)?;
                open.remove(position);
            }
            Err(_) => return Ok(()),
        }
    }
    if shared.aborted() {
        return Ok(());
    }
    writer.finish()
}
