use super::CodecParameters;
use crate::encoder::{EncodedBuffer, Muxer, TrackFormat};
use crate::error::{Error, Result};
use ffmpeg_next::format::context::Output as OutputContext;
use ffmpeg_next::{Packet, Rational, format, packet};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info, trace};

struct MuxerState {
    output: OutputContext,
    /// Time base of the timestamps each track is written with.
    source_time_bases: Vec<Rational>,
    started: bool,
    finished: bool,
    samples: usize,
}

/// MP4 writer. Both tracks write through one lock, so video draining and
/// the audio loop may call in concurrently.
pub struct FfmpegMuxer {
    state: Mutex<MuxerState>,
}

// The output context is only reached through the mutex.
unsafe impl Send for MuxerState {}

impl FfmpegMuxer {
    pub fn create(path: &Path) -> Result<Self> {
        let output = format::output(&path).map_err(|e| {
            Error::ResourceUnavailable(format!("Failed to create {}: {e}", path.display()))
        })?;
        info!(path = %path.display(), "Muxer opened");
        Ok(Self {
            state: Mutex::new(MuxerState {
                output,
                source_time_bases: Vec::new(),
                started: false,
                finished: false,
                samples: 0,
            }),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MuxerState>> {
        self.state
            .lock()
            .map_err(|_| Error::ResourceUnavailable("muxer lock poisoned".into()))
    }
}

impl Muxer for FfmpegMuxer {
    fn add_track(&self, format: &TrackFormat) -> Result<usize> {
        let native = CodecParameters::from_format(format)?;
        let mut state = self.lock()?;
        if state.started {
            return Err(Error::ProtocolViolation(format!(
                "{} track added after muxer start",
                format.codec
            )));
        }

        let mut stream = state.output.add_stream(native.parameters.id())?;
        stream.set_parameters(native.parameters.clone());
        stream.set_time_base(native.time_base);
        let index = stream.index();
        state.source_time_bases.push(native.time_base);
        debug!(index, kind = ?format.kind, codec = %format.codec, "Muxer track added");
        Ok(index)
    }

    fn start(&self) -> Result<()> {
        let mut state = self.lock()?;
        if state.started {
            return Err(Error::ProtocolViolation("muxer started twice".into()));
        }
        state.output.write_header()?;
        state.started = true;
        debug!(tracks = state.source_time_bases.len(), "Muxer header written");
        Ok(())
    }

    fn write_sample(&self, track: usize, buffer: &EncodedBuffer) -> Result<()> {
        let mut state = self.lock()?;
        if !state.started || state.finished {
            return Err(Error::ProtocolViolation(format!(
                "sample for track {track} while muxer is not running"
            )));
        }
        let source = *state
            .source_time_bases
            .get(track)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown track {track}")))?;
        let target = state
            .output
            .stream(track)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown track {track}")))?
            .time_base();

        let mut packet = Packet::copy(&buffer.data);
        packet.set_stream(track);
        packet.set_pts(Some(buffer.pts_us));
        packet.set_dts(Some(buffer.pts_us));
        if buffer.key_frame {
            packet.set_flags(packet::Flags::KEY);
        }
        packet.rescale_ts(source, target);
        trace!(track, pts = ?packet.pts(), size = buffer.data.len(), "Muxing sample");

        packet.write_interleaved(&mut state.output)?;
        state.samples += 1;
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        let mut state = self.lock()?;
        if !state.started {
            return Err(Error::InvalidState("muxer stopped before start".into()));
        }
        if state.finished {
            return Ok(());
        }
        state.finished = true;
        state.output.write_trailer()?;
        info!(samples = state.samples, "Muxer finalized");
        Ok(())
    }
}
