use std::{collections::HashMap, fs::File, io, path::Path, time::Duration};

use log::{debug, warn};
use symphonia::core::{
    audio::{SampleBuffer, SignalSpec},
    codecs::{CodecParameters, DecoderOptions, CODEC_TYPE_NULL},
    errors::Error as SymphoniaError,
    formats::{FormatOptions, FormatReader, SeekMode, SeekTo},
    io::MediaSourceStream,
    meta::{MetadataOptions, MetadataRevision},
    probe::Hint,
    units::Time,
};

use super::{Decoder, DecoderError, StreamParams};

/// Decodes local files with symphonia.
pub struct RustyDecoder {
    format_reader: Box<dyn FormatReader>,
    decoder: Box<dyn symphonia::core::codecs::Decoder>,
    sample_buf: Option<(SampleBuffer<f32>, usize)>,
    track_id: u32,
    params: CodecParameters,
    timestamp: u64,
    spec: SignalSpec,
    metadata: HashMap<String, String>,
}

fn to_duration(t: Time) -> Duration {
    Duration::from_secs(t.seconds) + Duration::from_secs_f64(t.frac)
}

fn collect_tags(rev: &MetadataRevision, into: &mut HashMap<String, String>) {
    for tag in rev.tags() {
        into.insert(tag.key.clone(), tag.value.to_string());
    }
}

impl RustyDecoder {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DecoderError> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let input = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let meta_opts: MetadataOptions = Default::default();
        let fmt_opts: FormatOptions = FormatOptions {
            enable_gapless: true,
            ..Default::default()
        };

        let mut probed = symphonia::default::get_probe()
            .format(&hint, input, &fmt_opts, &meta_opts)
            .map_err(|e| DecoderError::InternalError(e.to_string()))?;

        // Tags may live in front of the container (ID3) or inside it
        let mut metadata = HashMap::new();
        if let Some(rev) = probed.metadata.get().as_ref().and_then(|m| m.current()) {
            collect_tags(rev, &mut metadata);
        }
        let mut format_reader = probed.format;
        if let Some(rev) = format_reader.metadata().current() {
            collect_tags(rev, &mut metadata);
        }
        debug!("found {} metadata tags", metadata.len());

        let track = format_reader
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or(DecoderError::NoTrack)?;

        let dec_opts: DecoderOptions = Default::default();
        let decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &dec_opts)
            .map_err(|e| DecoderError::InternalError(e.to_string()))?;

        let rate = decoder.codec_params().sample_rate.ok_or(DecoderError::NoTrack)?;
        let channels = decoder.codec_params().channels.ok_or(DecoderError::NoTrack)?;
        if channels.count() < 2 {
            warn!("mono audio will be sent in stereo to both left and right");
        }

        let track_id = track.id;
        let params = track.codec_params.clone();

        Ok(Self {
            spec: SignalSpec::new(rate, channels),
            params,
            format_reader,
            decoder,
            track_id,
            timestamp: 0,
            sample_buf: None,
            metadata,
        })
    }

    fn ts_to_duration(&self, ts: u64) -> Option<Duration> {
        match self.params.time_base {
            Some(t) => Some(to_duration(t.calc_time(ts))),
            // Without a timebase, timestamps count frames
            None if self.spec.rate != 0 => {
                Some(Duration::from_secs_f64(ts as f64 / self.spec.rate as f64))
            }
            None => None,
        }
    }
}

impl Decoder for RustyDecoder {
    fn seek(&mut self, pos: Duration) -> Result<(), DecoderError> {
        let seeked = self
            .format_reader
            .seek(
                SeekMode::Accurate,
                SeekTo::Time {
                    time: Time::new(pos.as_secs(), pos.subsec_nanos() as f64 / 1_000_000_000.0),
                    track_id: Some(self.track_id),
                },
            )
            .map_err(|e| DecoderError::InternalError(e.to_string()))?;
        self.timestamp = seeked.actual_ts;

        self.decoder.reset();

        Ok(())
    }

    fn position(&self) -> Option<Duration> {
        self.ts_to_duration(self.timestamp)
    }

    fn duration(&self) -> Option<Duration> {
        self.ts_to_duration(self.params.n_frames?)
    }

    fn next_packet_to_buf(&mut self, buf: &mut [f32]) -> Result<usize, DecoderError> {
        loop {
            // Get the next packet from the media format.
            let packet = match self.format_reader.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Err(DecoderError::EndOfStream)
                }
                Err(SymphoniaError::ResetRequired) => {
                    return Err(DecoderError::InternalError("stream requires a decoder reset".to_string()))
                }
                Err(err) => return Err(DecoderError::InternalError(err.to_string())),
            };

            // Consume any new metadata that has been read since the last packet.
            while !self.format_reader.metadata().is_latest() {
                if let Some(rev) = self.format_reader.metadata().pop() {
                    collect_tags(&rev, &mut self.metadata);
                }
            }

            // If the packet does not belong to the selected track, skip over it.
            if packet.track_id() != self.track_id {
                continue;
            }

            self.timestamp = packet.ts;

            // Decode the packet into audio samples.
            let decoded = match self.decoder.decode(&packet) {
                Ok(decoded) => decoded,
                // The packet failed to decode due to an IO error or invalid
                // data, skip the packet.
                Err(SymphoniaError::IoError(_)) | Err(SymphoniaError::DecodeError(_)) => continue,
                Err(err) => return Err(DecoderError::InternalError(err.to_string())),
            };

            self.spec = *decoded.spec();

            let capacity = decoded.capacity();
            if self.sample_buf.as_ref().map_or(true, |(_, cap)| *cap < capacity) {
                self.sample_buf = Some((SampleBuffer::new(capacity as u64, *decoded.spec()), capacity));
            }
            let Some((sample_buf, _)) = self.sample_buf.as_mut() else {
                return Err(DecoderError::DecodeFailed);
            };

            // Copy the decoded samples to a buffer (why is it this convoluted?)
            sample_buf.copy_planar_ref(decoded);
            let len = sample_buf.len();
            if len > buf.len() {
                return Err(DecoderError::DecodeFailed);
            }
            buf[..len].copy_from_slice(sample_buf.samples());

            // No loop needed, packet was successfully decoded
            return Ok(len);
        }
    }

    fn params(&self) -> StreamParams {
        StreamParams {
            rate: self.spec.rate,
            channels: self.spec.channels.count() as u16,
            packet_size: self.params.max_frames_per_packet.unwrap_or(4096),
        }
    }

    fn metadata(&self) -> HashMap<String, String> {
        self.metadata.clone()
    }
}
