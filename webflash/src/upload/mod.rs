//! Streaming uploads into flash
//!
//! An [UploadSession] is fed the body of one upload request, chunk by chunk,
//! in whatever sizes the transport delivers it. It classifies the image from
//! its first bytes, skips the half of a combined image that does not belong
//! in the target partition, writes the rest through a [PageWriter], and once
//! the last byte has arrived commits the image and selects it for the next
//! boot.
//!
//! ```text
//! Start ──┬──> Write ──> Skip ──> Done
//!         └──> Skip ──> Write ──> Done
//! ```
//!
//! Any state can fall into `Error`, which swallows the rest of the body.

use std::{
    collections::{BTreeMap, HashMap},
    hash::BuildHasher,
    mem,
    sync::Arc,
};

use log::{debug, error, info, warn};
use serde::Serialize;
use strum::Display;

pub use self::{
    commit::verify_written_image,
    selector::{ByOtaSlot, FixedSubImage, SubImageSelector},
};
use crate::{
    boot::BootControl,
    error::{ClassificationError, Error, ProtocolError},
    flash_target::{FlashStorage, ProgressCallbacks},
    flasher::PageWriter,
    image_format::{Classifier, ImageKind, SubImage, UploadKind, COMBINED_HEADER_LEN, PROBE_LEN},
    partition::{ImageTarget, PartitionDescriptor},
};

mod commit;
mod selector;

/// Message reported for a successfully committed upload
pub const SUCCESS_MESSAGE: &str = "Flash Success.";

/// Lookup of request parameters such as `partition` and `force`
pub trait RequestParams {
    fn param(&self, name: &str) -> Option<&str>;

    /// Integer flags are set when non-zero
    fn flag(&self, name: &str) -> bool {
        self.param(name)
            .and_then(|value| value.trim().parse::<i64>().ok())
            .is_some_and(|value| value != 0)
    }
}

impl<S: BuildHasher> RequestParams for HashMap<String, String, S> {
    fn param(&self, name: &str) -> Option<&str> {
        self.get(name).map(String::as_str)
    }
}

impl RequestParams for BTreeMap<String, String> {
    fn param(&self, name: &str) -> Option<&str> {
        self.get(name).map(String::as_str)
    }
}

/// One piece of a request body as delivered by the transport
#[derive(Debug, Clone, Copy)]
pub struct BodyChunk<'a> {
    pub data: &'a [u8],
    /// Declared length of the whole body
    pub total_len: u32,
    /// Bytes received so far, including `data`
    pub received: u32,
}

impl<'a> BodyChunk<'a> {
    /// Whether this is the final chunk of the body
    pub fn is_last(&self) -> bool {
        self.received >= self.total_len
    }

    /// Split a complete body into chunks of at most `chunk_size` bytes
    pub fn split(body: &'a [u8], chunk_size: usize) -> impl Iterator<Item = BodyChunk<'a>> + 'a {
        let total_len = body.len() as u32;
        let chunk_size = chunk_size.max(1);
        let count = body.len().div_ceil(chunk_size).max(1);

        (0..count).map(move |index| {
            let start = (index * chunk_size).min(body.len());
            let end = (start + chunk_size).min(body.len());
            BodyChunk {
                data: &body[start..end],
                total_len,
                received: end as u32,
            }
        })
    }
}

/// Outcome of an upload, reported once per session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadResult {
    pub success: bool,
    pub message: String,
    #[serde(rename = "target")]
    pub target_label: String,
}

impl UploadResult {
    fn success(target_label: &str) -> Self {
        Self {
            success: true,
            message: SUCCESS_MESSAGE.to_string(),
            target_label: target_label.to_string(),
        }
    }

    pub fn failure(target_label: &str, error: &Error) -> Self {
        Self {
            success: false,
            message: error.to_string(),
            target_label: target_label.to_string(),
        }
    }
}

/// Upload progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Phase {
    /// Collecting the header
    Start,
    /// Discarding the half of a combined image meant for the other slot
    Skip,
    /// Writing image data to flash
    Write,
    /// All image data was received
    Done,
    /// The upload failed; the rest of the body is ignored
    Error,
}

/// Per-upload settings
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub route: UploadKind,
    pub classifier: Classifier,
    pub selector: Arc<dyn SubImageSelector>,
    pub page_size: u32,
    pub force: bool,
    pub verify: bool,
}

/// State of one upload request
pub struct UploadSession {
    config: SessionConfig,
    target: Option<ImageTarget>,
    label: String,
    writer: PageWriter,
    phase: Phase,
    error: Option<Error>,
    kind: Option<ImageKind>,
    probe: heapless::Vec<u8, PROBE_LEN>,
    total_len: Option<u32>,
    received: u32,
    remaining: u32,
    skip: u32,
    written: u32,
    finished: bool,
    progress: Option<Box<dyn ProgressCallbacks + Send>>,
}

impl UploadSession {
    /// Start an upload into `target`
    pub fn new(config: SessionConfig, target: ImageTarget) -> Self {
        info!(
            "Starting {} upload to '{}' at {:#x}",
            config.route,
            target.label(),
            target.partition().address()
        );

        Self {
            writer: PageWriter::new(config.page_size),
            label: target.label().to_string(),
            target: Some(target),
            config,
            phase: Phase::Start,
            error: None,
            kind: None,
            probe: heapless::Vec::new(),
            total_len: None,
            received: 0,
            remaining: 0,
            skip: 0,
            written: 0,
            finished: false,
            progress: None,
        }
    }

    /// A session that failed before it started; it drains the body and
    /// reports `error` at the end
    pub fn rejected(config: SessionConfig, error: impl Into<Error>) -> Self {
        let error = error.into();
        error!("Rejecting {} upload: {}", config.route, error);

        Self {
            writer: PageWriter::new(0),
            label: String::new(),
            target: None,
            config,
            phase: Phase::Error,
            error: Some(error),
            kind: None,
            probe: heapless::Vec::new(),
            total_len: None,
            received: 0,
            remaining: 0,
            skip: 0,
            written: 0,
            finished: false,
            progress: None,
        }
    }

    /// Report write progress to `progress`
    pub fn with_progress(mut self, progress: Box<dyn ProgressCallbacks + Send>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Cause of the failure, once in [Phase::Error]
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// Label of the partition being written
    pub fn target_label(&self) -> &str {
        &self.label
    }

    /// The partition, while the session holds its lease
    pub fn target(&self) -> Option<&PartitionDescriptor> {
        self.target.as_ref().map(ImageTarget::partition)
    }

    pub fn image_kind(&self) -> Option<&ImageKind> {
        self.kind.as_ref()
    }

    /// Image bytes written to flash so far
    pub fn bytes_written(&self) -> u32 {
        self.written
    }

    /// Whether the result was reported or the upload aborted
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Process the next piece of the body.
    ///
    /// Returns the result when `chunk` is the last one; that happens exactly
    /// once per session.
    pub fn on_chunk(
        &mut self,
        flash: &mut dyn FlashStorage,
        boot: &mut dyn BootControl,
        chunk: BodyChunk<'_>,
    ) -> Option<UploadResult> {
        if self.finished {
            warn!(
                "Ignoring {} bytes received after the upload finished",
                chunk.data.len()
            );
            return None;
        }

        let total_len = *self.total_len.get_or_insert(chunk.total_len);
        if total_len != chunk.total_len {
            warn!(
                "Declared length changed from {} to {}",
                total_len, chunk.total_len
            );
        }

        let expected = (total_len - self.received) as usize;
        let data = if chunk.data.len() > expected {
            self.excess(chunk.data.len() - expected);
            &chunk.data[..expected]
        } else {
            chunk.data
        };
        self.received += data.len() as u32;

        self.consume(flash, data);

        if !chunk.is_last() {
            return None;
        }

        self.finished = true;
        let result = self.finish(flash, boot);
        info!("Upload to '{}': {}", self.label, result.message);

        Some(result)
    }

    /// The connection closed before the body was complete. Nothing is
    /// committed and the partition is released.
    pub fn abort(&mut self) {
        if self.finished {
            return;
        }

        warn!(
            "Upload to '{}' aborted after {} of {} bytes",
            self.label,
            self.received,
            self.total_len.unwrap_or_default()
        );

        self.finished = true;
        self.target = None;
        if self.phase != Phase::Error {
            self.phase = Phase::Error;
            self.error = Some(ProtocolError::Aborted.into());
        }
    }

    fn probe_len(&self) -> usize {
        PROBE_LEN.min(self.total_len.unwrap_or_default() as usize)
    }

    fn consume(&mut self, flash: &mut dyn FlashStorage, mut data: &[u8]) {
        while !data.is_empty() {
            match self.phase {
                Phase::Start => {
                    let wanted = self.probe_len() - self.probe.len();
                    let (head, rest) = data.split_at(wanted.min(data.len()));
                    data = rest;

                    if self.probe.extend_from_slice(head).is_err() {
                        self.fail(ClassificationError::Unrecognized.into());
                    } else if self.probe.len() == self.probe_len() {
                        let probe = mem::take(&mut self.probe);
                        match self.start(flash, &probe) {
                            Ok(header_len) => self.consume(flash, &probe[header_len..]),
                            Err(err) => self.fail(err),
                        }
                    }
                }
                Phase::Skip => {
                    let len = (self.skip as usize).min(data.len());
                    self.skip -= len as u32;
                    data = &data[len..];
                    self.settle();
                }
                Phase::Write => {
                    let len = (self.remaining as usize).min(data.len());
                    match self.writer.write(flash, &data[..len], self.remaining) {
                        Ok(consumed) => {
                            self.remaining -= consumed as u32;
                            self.written += consumed as u32;
                            data = &data[consumed..];
                            if let Some(progress) = self.progress.as_mut() {
                                progress.update(self.written as usize);
                            }
                            self.settle();
                        }
                        Err(err) => self.fail(err.into()),
                    }
                }
                Phase::Done => {
                    self.excess(data.len());
                    data = &[];
                }
                Phase::Error => data = &[],
            }
        }
    }

    /// Classify the upload and set up the first data phase. Returns the
    /// number of probe bytes that belong to a container header.
    fn start(&mut self, flash: &mut dyn FlashStorage, probe: &[u8]) -> Result<usize, Error> {
        let total_len = self.total_len.unwrap_or_default();
        let kind = self
            .config
            .classifier
            .classify(self.config.route, probe, self.config.force)?;

        let partition = self
            .target
            .as_ref()
            .map(ImageTarget::partition)
            .ok_or(ProtocolError::Aborted)?;
        let capacity = partition.size();

        match &kind {
            ImageKind::Combined(header) => {
                if u64::from(total_len) > 2 * u64::from(capacity) + COMBINED_HEADER_LEN as u64 {
                    return Err(ClassificationError::TooLarge {
                        size: total_len,
                        capacity,
                    }
                    .into());
                }
                if header.total_len() > u64::from(total_len) {
                    return Err(ClassificationError::Truncated(header.total_len()).into());
                }

                let selected = self.config.selector.select(partition);
                let (len, other) = match selected {
                    SubImage::First => (header.len1(), header.len2()),
                    SubImage::Second => (header.len2(), header.len1()),
                };
                if len == 0 {
                    return Err(ClassificationError::EmptySubImage(selected.file_name()).into());
                }
                if len > capacity {
                    return Err(ClassificationError::TooLarge {
                        size: len,
                        capacity,
                    }
                    .into());
                }

                info!(
                    "Combined image tagged '{}': writing {} ({} bytes)",
                    header.tag(),
                    selected.file_name(),
                    len
                );

                self.remaining = len;
                self.skip = other;
                self.phase = match selected {
                    SubImage::First => Phase::Write,
                    SubImage::Second => Phase::Skip,
                };
            }
            ImageKind::SingleFirmware | ImageKind::Filesystem => {
                if total_len > capacity {
                    return Err(ClassificationError::TooLarge {
                        size: total_len,
                        capacity,
                    }
                    .into());
                }

                self.remaining = total_len;
                self.skip = 0;
                self.phase = Phase::Write;
            }
        }

        self.writer
            .begin(partition.address(), capacity, flash.sector_size())?;
        if let Some(progress) = self.progress.as_mut() {
            progress.init(partition.address(), self.remaining as usize);
        }

        debug!(
            "Classified as {:?}, entering {} with {} bytes to write and {} to skip",
            kind, self.phase, self.remaining, self.skip
        );

        let header_len = kind.header_len();
        self.kind = Some(kind);
        self.settle();

        Ok(header_len)
    }

    /// Move on from data phases whose counters ran out
    fn settle(&mut self) {
        loop {
            let next = match self.phase {
                Phase::Write if self.remaining == 0 => {
                    if let Some(progress) = self.progress.as_mut() {
                        progress.finish();
                    }
                    if self.skip > 0 {
                        Phase::Skip
                    } else {
                        Phase::Done
                    }
                }
                Phase::Skip if self.skip == 0 => {
                    if self.remaining > 0 {
                        Phase::Write
                    } else {
                        Phase::Done
                    }
                }
                _ => break,
            };

            debug!("Upload phase {} -> {}", self.phase, next);
            self.phase = next;
        }
    }

    fn finish(&mut self, flash: &mut dyn FlashStorage, boot: &mut dyn BootControl) -> UploadResult {
        match self.phase {
            Phase::Done => match self.commit(flash, boot) {
                Ok(()) => UploadResult::success(&self.label),
                Err(err) => {
                    let result = UploadResult::failure(&self.label, &err);
                    self.fail(err);
                    result
                }
            },
            Phase::Error => match &self.error {
                Some(err) => UploadResult::failure(&self.label, err),
                None => UploadResult::failure(&self.label, &ProtocolError::PrematureEnd.into()),
            },
            Phase::Start | Phase::Skip | Phase::Write => {
                let err: Error = ProtocolError::PrematureEnd.into();
                let result = UploadResult::failure(&self.label, &err);
                self.fail(err);
                result
            }
        }
    }

    fn commit(
        &mut self,
        flash: &mut dyn FlashStorage,
        boot: &mut dyn BootControl,
    ) -> Result<(), Error> {
        let target = self.target.take().ok_or(ProtocolError::Aborted)?;
        let kind = self.kind.take().ok_or(ProtocolError::PrematureEnd)?;

        let result = commit::commit(
            flash,
            boot,
            &mut self.writer,
            target,
            &kind,
            self.config.classifier.platform(),
            self.config.verify,
        );
        self.kind = Some(kind);

        result.map(|_| ())
    }

    fn excess(&self, len: usize) {
        let err = ProtocolError::ExcessData(len);
        warn!("{} (upload to '{}')", err, self.label);
    }

    fn fail(&mut self, err: Error) {
        error!("Upload to '{}' failed: {}", self.label, err);

        self.phase = Phase::Error;
        self.error = Some(err);
        self.target = None;
    }
}
