// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! VP9 decoding session.
//!
//! [`Vp9Decoder::decode_frame_check`] runs the synchronous part of a decode: it splits the
//! incoming chunk, parses the next frame, submits it to the [`Accelerator`] and updates the
//! reference slots. The wait for the hardware (or, for a re-shown frame, the copy into the new
//! output surface) is deferred to the returned [`DecodeTask`], which the client runs on a worker
//! of its choosing.

pub mod frame_storage;
pub mod picture_params;

use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use anyhow::anyhow;
use log::debug;
use log::error;
use log::warn;

use crate::backend::Accelerator;
use crate::backend::Allocator;
use crate::backend::BackendResult;
use crate::backend::FrameMemId;
use crate::backend::OutputSurface;
use crate::codec::vp9::dpb::ReferenceFrameTable;
use crate::codec::vp9::parser::BitDepth;
use crate::codec::vp9::parser::FrameType;
use crate::codec::vp9::parser::Header;
use crate::codec::vp9::parser::ParseError;
use crate::codec::vp9::parser::Parser;
use crate::codec::vp9::parser::Profile;
use crate::codec::vp9::parser::StreamInfo;
use crate::codec::vp9::superframe::SuperframeSplitter;
use crate::decoder::stateless::DecodeError;
use crate::decoder::stateless::FatalError;
use crate::decoder::Bitstream;
use crate::decoder::DecodedFrame;
use crate::decoder::PicStruct;
use crate::decoder::SurfaceInfo;
use crate::decoder::TIMESTAMP_CLOCK_RATE;
use crate::Resolution;

use frame_storage::DecoderFrame;
use frame_storage::FrameStorage;
use picture_params::PictureParameters;

/// Alignment of the coded size of the output surfaces.
const SURFACE_ALIGNMENT: u32 = 16;

/// Parameters of a decoding session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecoderConfig {
    /// Size of the output surfaces allocated by the client.
    pub resolution: Resolution,
    pub bit_depth: BitDepth,
    /// Frames per second, as `(numerator, denominator)`. Used to derive missing timestamps.
    pub frame_rate: (u32, u32),
    /// Ask for a reallocation instead of failing when a frame outgrows the output surfaces.
    pub adaptive: bool,
    /// Maximum number of frames in flight, 0 for no limit.
    pub async_depth: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            resolution: Resolution::from((1920, 1088)),
            bit_depth: BitDepth::Depth8,
            frame_rate: (30000, 1000),
            adaptive: false,
            async_depth: 0,
        }
    }
}

/// Stream parameters of a session.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct VideoParams {
    /// Size required for the output surfaces.
    pub coded_resolution: Resolution,
    /// Visible size of the last frame.
    pub display_resolution: Resolution,
    pub profile: Profile,
    pub bit_depth: BitDepth,
    pub subsampling_x: bool,
    pub subsampling_y: bool,
    pub frame_rate: (u32, u32),
}

impl VideoParams {
    fn from_config(config: &DecoderConfig) -> Self {
        Self {
            coded_resolution: config.resolution.round(SURFACE_ALIGNMENT),
            display_resolution: config.resolution,
            profile: Profile::Profile0,
            bit_depth: config.bit_depth,
            subsampling_x: true,
            subsampling_y: true,
            frame_rate: config.frame_rate,
        }
    }

    fn from_stream_info(info: &StreamInfo, frame_rate: (u32, u32)) -> Self {
        Self {
            coded_resolution: info.coded_resolution.round(SURFACE_ALIGNMENT),
            display_resolution: info.coded_resolution,
            profile: info.profile,
            bit_depth: info.bit_depth,
            subsampling_x: info.subsampling_x,
            subsampling_y: info.subsampling_y,
            frame_rate,
        }
    }

    fn update(&mut self, hdr: &Header) {
        self.coded_resolution = hdr.resolution().round(SURFACE_ALIGNMENT);
        self.display_resolution = hdr.resolution();

        // A re-shown frame carries no color configuration.
        if !hdr.show_existing_frame {
            self.profile = hdr.profile;
            self.bit_depth = hdr.bit_depth;
            self.subsampling_x = hdr.subsampling_x;
            self.subsampling_y = hdr.subsampling_y;
        }
    }
}

/// Counters of a session.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DecodeStat {
    /// Frames returned for display.
    pub num_frame: u32,
    /// Frames sent to the hardware or queued for a copy.
    pub num_submitted: u32,
    /// Frames dropped because of a bitstream error.
    pub num_error: u32,
}

/// Successful outcome of [`Vp9Decoder::decode_frame_check`].
#[derive(Debug)]
pub enum DecodeStatus {
    /// A frame to display. Its content is valid once the task has run.
    Ready(DecodedFrame, DecodeTask),
    /// A hidden frame was submitted; its task still has to run.
    NeedMoreInputWithTask(DecodeTask),
    NeedMoreInput,
}

/// State shared between the decoder and its pending tasks.
struct Session {
    allocator: Box<dyn Allocator>,
    parser: Parser,
    splitter: SuperframeSplitter,
    ref_frames: ReferenceFrameTable,
    storage: FrameStorage,
    config: DecoderConfig,
    /// Parameters the output surfaces were allocated for.
    init_params: VideoParams,
    params: VideoParams,
    /// Set on the first unrecoverable device error.
    fatal: Option<FatalError>,
    closed: bool,
    stat: DecodeStat,
}

/// What a successful submission hands over to its task.
struct Submitted {
    target: FrameMemId,
    copy_source: Option<FrameMemId>,
    output: OutputSurface,
    show_frame: bool,
    frame: Option<DecodedFrame>,
}

fn lock(session: &Mutex<Session>) -> MutexGuard<'_, Session> {
    // A poisoned lock only means a task panicked; the bookkeeping is still consistent.
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

fn submit_to_device(
    accelerator: &dyn Accelerator,
    target: FrameMemId,
    params: &PictureParameters,
    data: &[u8],
) -> BackendResult<()> {
    accelerator.begin_submission(target)?;
    accelerator.execute(params, data)?;
    accelerator.end_submission()
}

impl Session {
    fn check_usable(&self) -> Result<(), DecodeError> {
        if self.closed {
            return Err(DecodeError::NotInitialized);
        }

        match self.fatal {
            Some(fatal) => Err(DecodeError::Fatal(fatal)),
            None => Ok(()),
        }
    }

    fn complete_frames(&mut self) {
        if let Err(e) = self.storage.complete_frames(self.allocator.as_mut()) {
            warn!("Failed to retire completed frames: {}", e);
        }
    }

    /// Consumes the current frame of the chunk after it has been rejected.
    fn skip_frame(&mut self, bitstream: &mut Bitstream) {
        self.stat.num_error += 1;

        if self.splitter.advance() {
            bitstream.consume_all();
        }
    }

    /// Handles the end of the stream.
    fn drain(&mut self) -> Result<DecodeStatus, DecodeError> {
        self.splitter.reset();
        self.ref_frames.clean_ref_list(self.allocator.as_mut())?;

        if self.storage.is_empty() {
            Ok(DecodeStatus::NeedMoreInput)
        } else {
            debug!("{} frames still in flight", self.storage.len());
            Err(DecodeError::DeviceBusy)
        }
    }

    fn check_resize(&mut self, hdr: &Header, surface: &SurfaceInfo) -> Result<(), DecodeError> {
        self.params.update(hdr);
        let coded = self.params.coded_resolution;

        if surface.bit_depth != self.params.bit_depth as u8 {
            return Err(DecodeError::Incompatible(format!(
                "{}-bit stream cannot be decoded into a {}-bit surface",
                self.params.bit_depth as u8, surface.bit_depth
            )));
        }

        if !surface.resolution.can_contain(coded) {
            if self.config.adaptive {
                debug!("Requesting reallocation to {:?}", coded);
                return Err(DecodeError::Realloc(coded));
            }

            return Err(DecodeError::Incompatible(format!(
                "{}x{} frame does not fit in a {}x{} surface",
                coded.width, coded.height, surface.resolution.width, surface.resolution.height
            )));
        }

        if !self.config.adaptive {
            let init = self.init_params.coded_resolution;

            if !init.can_contain(coded) {
                return Err(DecodeError::Incompatible(format!(
                    "{}x{} frame exceeds the {}x{} allocation",
                    coded.width, coded.height, init.width, init.height
                )));
            }

            if !hdr.show_existing_frame
                && hdr.frame_type == FrameType::KeyFrame
                && coded != init
                && self.stat.num_submitted > 0
            {
                return Err(DecodeError::Incompatible(format!(
                    "key frame changes the size to {}x{}",
                    coded.width, coded.height
                )));
            }
        }

        Ok(())
    }

    fn derived_timestamp(&self) -> u64 {
        let (num, den) = self.params.frame_rate;

        u64::from(self.stat.num_frame) * TIMESTAMP_CLOCK_RATE * u64::from(den) / u64::from(num)
    }

    /// Submits the next frame of `bitstream`. On a retryable error or a size mismatch nothing is
    /// consumed and the parser is left as it was; only the reported video parameters change.
    fn submit(
        &mut self,
        accelerator: &dyn Accelerator,
        bitstream: &mut Bitstream,
        surface: &SurfaceInfo,
    ) -> Result<Submitted, DecodeError> {
        let async_depth = self.config.async_depth;
        if async_depth > 0 && self.storage.num_pending() >= async_depth {
            debug!("{} frames pending, waiting for completion", async_depth);
            return Err(DecodeError::DeviceBusy);
        }

        let chunk = bitstream.data();
        let sub_frame = match self.splitter.next_frame(chunk) {
            Ok(sub_frame) => sub_frame,
            Err(e) => {
                warn!("Dropping {} byte chunk: {}", chunk.len(), e);
                self.splitter.reset();
                self.stat.num_error += 1;
                bitstream.consume_all();
                return Err(e.into());
            }
        };
        let data = sub_frame.data(chunk);

        let hdr = match self.parser.parse_frame(data) {
            Ok(hdr) => hdr,
            Err(e) => {
                warn!("Dropping frame {} of chunk: {}", sub_frame.index, e);
                self.skip_frame(bitstream);
                return Err(e.into());
            }
        };

        let shown_slot = if hdr.show_existing_frame {
            let idx = usize::from(hdr.frame_to_show_map_idx);
            match self.ref_frames.slot(idx).copied() {
                Some(entry) => Some(entry),
                None => {
                    self.skip_frame(bitstream);
                    return Err(DecodeError::Malformed(ParseError::Malformed(format!(
                        "reference slot {} to show is empty",
                        idx
                    ))));
                }
            }
        } else {
            None
        };

        self.check_resize(&hdr, surface)?;

        let target = self.allocator.acquire_free_handle().ok_or_else(|| {
            debug!("No free frame handle");
            DecodeError::DeviceBusy
        })?;
        let output = self.allocator.resolve_output_surface(target)?;

        if shown_slot.is_none() {
            let params = PictureParameters::new(&hdr, self.ref_frames.handles());
            if let Err(e) = submit_to_device(accelerator, target, &params, data) {
                error!("Submission of {:?} failed: {}", target, e);
                self.fatal = Some(FatalError::DeviceFailed);
                return Err(DecodeError::Fatal(FatalError::DeviceFailed));
            }
        }

        self.parser.commit(&hdr);
        if self.splitter.advance() {
            bitstream.consume_all();
        }
        self.stat.num_submitted += 1;

        // Held until the task has run.
        self.allocator.increase_reference(target)?;

        let frame = DecoderFrame::new(target, &hdr, self.ref_frames.snapshot());
        if let Err(e) = self.storage.add(frame, self.allocator.as_mut()) {
            let _ = self.allocator.decrease_reference(target);
            return Err(e);
        }
        if let Err(e) = self
            .ref_frames
            .update_ref_frames(target, &hdr, self.allocator.as_mut())
        {
            self.abandon_frame(target);
            return Err(e.into());
        }

        let frame = if hdr.show_frame {
            let frame = DecodedFrame {
                surface: output,
                timestamp: bitstream
                    .timestamp
                    .unwrap_or_else(|| self.derived_timestamp()),
                frame_order: self.stat.num_frame,
                crop: hdr.resolution(),
                pic_struct: PicStruct::Progressive,
            };
            self.stat.num_frame += 1;
            Some(frame)
        } else {
            None
        };

        debug!(
            "Submitted {:?} (show_frame: {}, copy of: {:?})",
            target,
            hdr.show_frame,
            shown_slot.map(|s| s.handle)
        );

        Ok(Submitted {
            target,
            copy_source: shown_slot.map(|s| s.handle),
            output,
            show_frame: hdr.show_frame,
            frame,
        })
    }

    /// Drops a submitted frame no task will run for.
    fn abandon_frame(&mut self, target: FrameMemId) {
        warn!("Abandoning frame {:?}", target);

        if let Err(e) = self.storage.remove(target, self.allocator.as_mut()) {
            warn!("Failed to release the references of {:?}: {}", target, e);
        }
        if let Err(e) = self.allocator.decrease_reference(target) {
            warn!("Failed to release {:?}: {}", target, e);
        }
    }

    /// Releases the in-flight reference of `target`, and marks its frame done if `decoded`.
    fn finish_task(&mut self, target: FrameMemId, decoded: bool) -> Result<(), DecodeError> {
        if decoded {
            self.storage.decode_frame(target);
        }

        self.allocator.decrease_reference(target)?;

        Ok(())
    }

    fn release_everything(&mut self) -> BackendResult<()> {
        let frames = self.storage.release_all(self.allocator.as_mut());
        let slots = self.ref_frames.clean_ref_list(self.allocator.as_mut());

        frames.and(slots)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.release_everything() {
            warn!("Failed to release frames on teardown: {}", e);
        }
    }
}

/// Deferred part of a decode operation.
///
/// Returned by [`Vp9Decoder::decode_frame_check`] for every submitted frame. Running it waits for
/// the hardware (or copies a re-shown frame into its new surface) and then retires the frame.
///
/// A failed copy is returned but does not stop the session: the frame is retired anyway and its
/// output surface keeps whatever it held before.
pub struct DecodeTask {
    session: Arc<Mutex<Session>>,
    accelerator: Arc<dyn Accelerator>,
    target: FrameMemId,
    copy_source: Option<FrameMemId>,
    output: OutputSurface,
    show_frame: bool,
}

impl fmt::Debug for DecodeTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodeTask")
            .field("target", &self.target)
            .field("copy_source", &self.copy_source)
            .field("output", &self.output)
            .field("show_frame", &self.show_frame)
            .finish()
    }
}

impl DecodeTask {
    /// The frame being decoded.
    pub fn target(&self) -> FrameMemId {
        self.target
    }

    pub fn output_surface(&self) -> OutputSurface {
        self.output
    }

    pub fn show_frame(&self) -> bool {
        self.show_frame
    }

    /// Completes the frame. The hardware wait or the copy happens without the session lock held.
    pub fn run(self) -> Result<(), DecodeError> {
        let fatal = lock(&self.session).fatal;
        if let Some(fatal) = fatal {
            debug!("Aborting task of {:?} after fatal error", self.target);
            lock(&self.session).finish_task(self.target, false)?;
            return Err(DecodeError::Fatal(fatal));
        }

        match self.copy_source {
            Some(src) => {
                let copied = self.accelerator.copy_surface(src, self.target);
                if let Err(e) = &copied {
                    warn!(
                        "Copy of {:?} into {:?} failed, {:?} is stale: {}",
                        src, self.target, self.output, e
                    );
                }

                lock(&self.session).finish_task(self.target, true)?;
                copied?;
            }
            None => {
                if let Err(e) = self.accelerator.wait_for_completion(self.target) {
                    let fatal = FatalError::from(e);
                    error!("Decoding of {:?} failed: {}", self.target, fatal);

                    let mut session = lock(&self.session);
                    session.fatal.get_or_insert(fatal);
                    session.finish_task(self.target, false)?;
                    return Err(DecodeError::Fatal(fatal));
                }

                lock(&self.session).finish_task(self.target, true)?;
            }
        }

        Ok(())
    }
}

/// Hardware-accelerated VP9 decoder.
pub struct Vp9Decoder {
    session: Arc<Mutex<Session>>,
    accelerator: Arc<dyn Accelerator>,
}

impl Vp9Decoder {
    /// Creates a session decoding into surfaces of `config.resolution`.
    pub fn new(
        allocator: Box<dyn Allocator>,
        accelerator: Arc<dyn Accelerator>,
        config: DecoderConfig,
    ) -> anyhow::Result<Self> {
        if config.resolution.is_empty() {
            return Err(anyhow!("invalid surface size {:?}", config.resolution));
        }

        if config.frame_rate.0 == 0 || config.frame_rate.1 == 0 {
            return Err(anyhow!("invalid frame rate {:?}", config.frame_rate));
        }

        let params = VideoParams::from_config(&config);
        debug!("New VP9 session: {:?}", config);

        let session = Session {
            allocator,
            parser: Default::default(),
            splitter: Default::default(),
            ref_frames: Default::default(),
            storage: Default::default(),
            config,
            init_params: params,
            params,
            fatal: None,
            closed: false,
            stat: Default::default(),
        };

        Ok(Self {
            session: Arc::new(Mutex::new(session)),
            accelerator,
        })
    }

    /// Submits the next frame of `bitstream` for decoding into `surface`.
    ///
    /// A chunk holding a superframe must be presented again until it is fully consumed: each
    /// call takes one of its frames. Passing `None` signals the end of the stream and returns
    /// [`DecodeStatus::NeedMoreInput`] once every pending task has run.
    pub fn decode_frame_check(
        &self,
        bitstream: Option<&mut Bitstream>,
        surface: &SurfaceInfo,
    ) -> Result<DecodeStatus, DecodeError> {
        let mut session = lock(&self.session);
        session.check_usable()?;
        session.complete_frames();

        let bitstream = match bitstream {
            None => return session.drain(),
            Some(bitstream) if bitstream.is_empty() => return Ok(DecodeStatus::NeedMoreInput),
            Some(bitstream) => bitstream,
        };

        if surface.locked {
            return Err(DecodeError::NeedMoreSurfaces);
        }

        let submitted = session.submit(self.accelerator.as_ref(), bitstream, surface)?;
        drop(session);

        let task = DecodeTask {
            session: Arc::clone(&self.session),
            accelerator: Arc::clone(&self.accelerator),
            target: submitted.target,
            copy_source: submitted.copy_source,
            output: submitted.output,
            show_frame: submitted.show_frame,
        };

        Ok(match submitted.frame {
            Some(frame) => DecodeStatus::Ready(frame, task),
            None => DecodeStatus::NeedMoreInputWithTask(task),
        })
    }

    /// Restarts the stream with `config`, which must fit in the initial allocation.
    pub fn reset(&self, mut config: DecoderConfig) -> Result<(), DecodeError> {
        let mut session = lock(&self.session);
        if session.closed {
            return Err(DecodeError::NotInitialized);
        }

        if config.bit_depth != session.init_params.bit_depth {
            return Err(DecodeError::Incompatible(format!(
                "cannot switch from {:?} to {:?}",
                session.init_params.bit_depth, config.bit_depth
            )));
        }

        let init = session.init_params.coded_resolution;
        if config.resolution.is_empty()
            || !init.can_contain(config.resolution.round(SURFACE_ALIGNMENT))
        {
            return Err(DecodeError::Incompatible(format!(
                "{}x{} does not fit in the {}x{} allocation",
                config.resolution.width, config.resolution.height, init.width, init.height
            )));
        }

        if config.frame_rate.0 == 0 || config.frame_rate.1 == 0 {
            config.frame_rate = session.init_params.frame_rate;
        }

        let session = &mut *session;
        session.ref_frames.clean_ref_list(session.allocator.as_mut())?;
        session.parser = Default::default();
        session.splitter.reset();
        session.stat = Default::default();
        session.params = VideoParams::from_config(&config);
        session.config = config;

        Ok(())
    }

    /// Ends the session. Every further call fails with [`DecodeError::NotInitialized`].
    pub fn close(&self) -> Result<(), DecodeError> {
        let mut session = lock(&self.session);
        if session.closed {
            return Err(DecodeError::NotInitialized);
        }

        session.closed = true;
        session.stat = Default::default();
        session.release_everything()?;

        Ok(())
    }

    /// Reads the stream parameters from the first key frame of `chunk`, without a session.
    pub fn decode_header(chunk: &[u8]) -> Result<Option<VideoParams>, DecodeError> {
        if chunk.is_empty() {
            return Ok(None);
        }

        let frame_rate = DecoderConfig::default().frame_rate;
        let mut splitter = SuperframeSplitter::default();

        loop {
            let sub_frame = splitter.next_frame(chunk)?;
            if let Some(info) = Parser::parse_stream_info(sub_frame.data(chunk))? {
                return Ok(Some(VideoParams::from_stream_info(&info, frame_rate)));
            }

            if splitter.advance() {
                return Ok(None);
            }
        }
    }

    /// Current stream parameters.
    pub fn video_params(&self) -> Result<VideoParams, DecodeError> {
        let session = lock(&self.session);
        if session.closed {
            return Err(DecodeError::NotInitialized);
        }

        Ok(session.params)
    }

    pub fn decode_stat(&self) -> Result<DecodeStat, DecodeError> {
        let session = lock(&self.session);
        if session.closed {
            return Err(DecodeError::NotInitialized);
        }

        Ok(session.stat)
    }
}
