use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use ffmpeg_next::{
    codec::{self, Context},
    decoder::Audio,
    filter,
    format::{
        context::Input,
        sample::{self, Type},
    },
    frame, media, rescale, Dictionary, Rational, Rescale as _,
};
use fluent_uri::Uri;
use log::{debug, info, warn};
use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock,
    },
    thread,
    time::Duration,
};

use crate::utils::{is_network, uri_to_path};

use super::{Decoder, DecoderError, StreamParams};

/// How long to wait on the decode thread before giving up on a packet.
const DATA_TIMEOUT: Duration = Duration::from_millis(1000);

/// Decodes network streams and anything symphonia can't open.
///
/// Decoding happens on its own thread, and packets are handed over through a
/// rendezvous channel so a slow network never blocks the player thread for
/// longer than [`DATA_TIMEOUT`].
pub struct FfmpegDecoder {
    seek_send: Sender<i64>,
    /// Lets a newer seek replace one the decode thread hasn't taken yet
    seek_pending: Receiver<i64>,
    data_recv: Receiver<Arc<[f32]>>,
    stream_params: StreamParams,

    duration: Option<Duration>,
    position: Arc<RwLock<Option<Duration>>>,

    metadata: Arc<RwLock<HashMap<String, String>>>,

    ended: Arc<AtomicBool>,
    killswitch: Sender<()>,
}

fn internal<E: ToString>(e: E) -> DecoderError {
    DecoderError::InternalError(e.to_string())
}

impl FfmpegDecoder {
    pub fn new(input: &Uri<String>) -> Result<Self, DecoderError> {
        ffmpeg_next::init().map_err(internal)?;
        ffmpeg_next::log::set_level(ffmpeg_next::log::Level::Quiet);

        let ictx = if is_network(input) {
            info!("playing back from network source");
            ffmpeg_next::format::input::<PathBuf>(&input.to_string().into()).map_err(internal)?
        } else {
            let path = uri_to_path(input);
            let options = Dictionary::new();
            ffmpeg_next::format::input_with_dictionary(&path, options).map_err(internal)?
        };

        let mut meta_map = HashMap::new();
        for (k, v) in &ictx.metadata() {
            meta_map.insert(k.to_string(), v.to_string());
        }
        debug!("found {} metadata tags", meta_map.len());
        let metadata = Arc::new(RwLock::new(meta_map));

        let stream = ictx
            .streams()
            .best(media::Type::Audio)
            .ok_or(DecoderError::NoTrack)?;

        // Live streams report nonsense here
        let duration = if ictx.duration() <= 0 || ictx.duration() == i64::MAX {
            warn!("duration is out of range, treating the stream as endless");
            None
        } else {
            Some(Duration::from_millis(
                ictx.duration().rescale(rescale::TIME_BASE, (1, 1000)) as u64,
            ))
        };
        let position = Arc::new(RwLock::new(None));

        let context = Context::from_parameters(stream.parameters()).map_err(internal)?;
        let mut decoder = context.decoder().audio().map_err(internal)?;
        decoder.set_parameters(stream.parameters()).map_err(internal)?;
        decoder.set_time_base(rescale::TIME_BASE);

        let rate = match decoder.rate() {
            r if r <= 96000 => r,
            _ => 48000,
        };

        let stream_params = StreamParams {
            rate,
            channels: decoder.channels(),
            packet_size: if decoder.frame_size() != 0 {
                decoder.frame_size() as u64
            } else {
                4096
            },
        };

        // Set up the filter for resampling and sample format
        let filter = filter(&decoder, stream_params).map_err(internal)?;

        let (seek_send, seek_recv) = crossbeam::channel::bounded::<i64>(1);
        let (data_send, data_recv) = crossbeam::channel::bounded(0);
        let ended = Arc::new(AtomicBool::new(false));
        let (kill_send, kill_recv) = crossbeam::channel::bounded(1);
        let input_time_base = stream.time_base();
        let seek_pending = seek_recv.clone();
        thread::Builder::new()
            .name("ffmpeg_decoder".to_string())
            .spawn({
                let position = Arc::clone(&position);
                let metadata = Arc::clone(&metadata);
                let ended = Arc::clone(&ended);
                move || {
                    decode_loop(
                        ictx,
                        decoder,
                        filter,
                        input_time_base,
                        position,
                        data_send,
                        seek_recv,
                        metadata,
                        ended,
                        kill_recv,
                    );
                }
            })
            .map_err(internal)?;

        Ok(Self {
            seek_send,
            seek_pending,
            data_recv,
            stream_params,

            duration,
            position,

            metadata,

            ended,
            killswitch: kill_send,
        })
    }
}

impl Drop for FfmpegDecoder {
    fn drop(&mut self) {
        let _ = self.killswitch.try_send(());
    }
}

impl Decoder for FfmpegDecoder {
    fn next_packet_to_buf(&mut self, buf: &mut [f32]) -> Result<usize, DecoderError> {
        let data = match self.data_recv.recv_timeout(DATA_TIMEOUT) {
            Ok(l) => l,
            Err(_) if self.ended.load(Ordering::Acquire) => return Err(DecoderError::EndOfStream),
            Err(RecvTimeoutError::Timeout) => return Err(DecoderError::DecodeTimeout),
            Err(RecvTimeoutError::Disconnected) => return Err(DecoderError::EndOfStream),
        };
        if data.len() > buf.len() {
            return Err(DecoderError::DecodeFailed);
        }
        buf[..data.len()].copy_from_slice(&data);

        Ok(data.len())
    }

    fn seek(&mut self, pos: Duration) -> Result<(), DecoderError> {
        // The decode thread may be parked on a packet nobody is reading, so
        // never wait on it here
        while self.seek_pending.try_recv().is_ok() {}

        let millis = i64::try_from(pos.as_millis()).unwrap_or(i64::MAX);
        match self.seek_send.try_send(millis) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(DecoderError::DecodeTimeout),
            Err(TrySendError::Disconnected(_)) => Err(DecoderError::EndOfStream),
        }
    }

    fn position(&self) -> Option<Duration> {
        *self.position.read().unwrap_or_else(|e| e.into_inner())
    }

    fn duration(&self) -> Option<Duration> {
        self.duration
    }

    fn params(&self) -> StreamParams {
        self.stream_params
    }

    fn metadata(&self) -> HashMap<String, String> {
        self.metadata.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

fn filter(
    decoder: &codec::decoder::Audio,
    params: StreamParams,
) -> Result<filter::Graph, ffmpeg_next::Error> {
    let mut filter = filter::Graph::new();

    let args = format!(
        "time_base={}:sample_rate={}:sample_fmt={}:channel_layout=0x{:x}",
        decoder.time_base(),
        decoder.rate(),
        decoder.format().name(),
        if decoder.channel_layout().bits() != 0 {
            decoder.channel_layout().bits()
        } else {
            ffmpeg_next::ChannelLayout::STEREO.bits()
        }
    );

    let abuffer = filter::find("abuffer").ok_or(ffmpeg_next::Error::FilterNotFound)?;
    let abuffersink = filter::find("abuffersink").ok_or(ffmpeg_next::Error::FilterNotFound)?;
    filter.add(&abuffer, "in", &args)?;
    filter.add(&abuffersink, "out", "")?;

    {
        let mut out = filter.get("out").ok_or(ffmpeg_next::Error::FilterNotFound)?;

        out.set_sample_format(sample::Sample::F32(Type::Planar));
        out.set_sample_rate(params.rate);
    }

    filter.output("in", 0)?.input("out", 0)?.parse("anull")?;
    filter.validate()?;

    Ok(filter)
}

#[allow(clippy::too_many_arguments)]
fn decode_loop(
    mut ictx: Input,
    mut decoder: Audio,
    mut filter: filter::Graph,
    input_time_base: Rational,
    position: Arc<RwLock<Option<Duration>>>,
    data_send: Sender<Arc<[f32]>>,
    seek_recv: Receiver<i64>,
    metadata: Arc<RwLock<HashMap<String, String>>>,
    ended: Arc<AtomicBool>,
    killswitch: Receiver<()>,
) {
    let mut local_metadata = metadata.read().unwrap_or_else(|e| e.into_inner()).clone();
    let mut temp_map = HashMap::new();

    'main: while let Some((stream, packet)) = ictx.packets().next() {
        if killswitch.try_recv().is_ok() {
            break 'main;
        }

        // Radio streams change their title tags as songs go by
        temp_map.clear();
        for (k, v) in stream.metadata().iter() {
            temp_map.insert(k.to_string(), v.to_string());
        }
        if temp_map != local_metadata {
            let mut ext_meta = metadata.write().unwrap_or_else(|e| e.into_inner());
            temp_map.iter().for_each(|(k, v)| {
                ext_meta.insert(k.to_string(), v.to_string());
            });
            debug!("found {} new metadata tags", temp_map.len());
            local_metadata = temp_map.clone();
        }

        // Decode the frame
        let mut decoded = frame::Audio::empty();
        decoder.send_packet(&packet).unwrap_or_default();
        while decoder.receive_frame(&mut decoded).is_ok() {
            // Filter the frame to the proper format
            let mut filtered = frame::Audio::empty();
            let Some(mut source) = filter.get("in") else {
                break 'main;
            };
            if source.source().add(&decoded).is_err() {
                break 'main;
            }

            while let Some(mut sink) = filter.get("out") {
                if sink.sink().frame(&mut filtered).is_err() {
                    break;
                }

                if let Some(ts) = filtered.timestamp() {
                    let millis = ts.rescale(input_time_base, (1, 1000)).max(0);
                    *position.write().unwrap_or_else(|e| e.into_inner()) =
                        Some(Duration::from_millis(millis as u64));
                }

                let output: Vec<f32> = (0..filtered.planes())
                    .flat_map(|p| filtered.plane::<f32>(p))
                    .copied()
                    .collect();

                if data_send.send(output.as_slice().into()).is_err() {
                    break 'main;
                }
            }
        }

        // Check for seek events and seek on them
        if let Ok(s) = seek_recv.try_recv() {
            let position = s.rescale((1, 1000), rescale::TIME_BASE);
            if let Err(e) = ictx.seek(position, ..position) {
                warn!("seek failed: {e}");
            }
            decoder.flush();
        }
    }
    ended.store(true, Ordering::Release);
    let _ = decoder.send_eof();
}
