//! Buffered PCM streams.
//!
//! A recycling owns one template signal (the immutable source of defaults)
//! and any number of voice instances synthesized from it. Instances carry a
//! cursor that moves forward one buffer per run and never rewinds.

use std::sync::{Arc, Mutex, MutexGuard};

use vesper_types::{Note, SignalId, SoundcardFormat};

use crate::buffer::AudioBuffer;
use crate::recall_id::{RecallId, RecyclingContext};
use crate::{lock, next_id};

/// Mutable part of an [`AudioSignal`], guarded by the signal's own lock.
#[derive(Debug, Clone)]
pub struct SignalState {
    pub samplerate: u32,
    pub buffer_size: usize,
    pub format: SoundcardFormat,
    pub stream: Vec<AudioBuffer>,
    /// Cursor into `stream`; `None` once the stream is exhausted.
    pub stream_current: Option<usize>,
    /// Frame offset of the first sample inside the first buffer.
    pub first_frame: usize,
    /// Frame offset of the end of data inside the last buffer.
    pub last_frame: usize,
    pub loop_start: u64,
    pub loop_end: u64,
    /// Frames synthesized so far (instances only).
    pub frame_count: u64,
    /// Sub-buffer offset as a fraction of `buffer_size`.
    pub delay: f64,
    /// Whole-frame offset added to the delay.
    pub attack: usize,
    pub recall_id: Option<Arc<RecallId>>,
    pub notes: Vec<Note>,
}

impl SignalState {
    fn new(samplerate: u32, buffer_size: usize, format: SoundcardFormat) -> Self {
        Self {
            samplerate,
            buffer_size,
            format,
            stream: Vec::new(),
            stream_current: None,
            first_frame: 0,
            last_frame: 0,
            loop_start: 0,
            loop_end: 0,
            frame_count: 0,
            delay: 0.0,
            attack: 0,
            recall_id: None,
            notes: Vec::new(),
        }
    }

    /// Number of buffers in the stream.
    pub fn length(&self) -> usize {
        self.stream.len()
    }

    /// Total frames the stream can hold.
    pub fn capacity_frames(&self) -> u64 {
        (self.stream.len() * self.buffer_size) as u64
    }

    /// Frame offset where a delay/attack pair places the first sample.
    pub fn offset_frames(&self) -> u64 {
        (self.delay * self.buffer_size as f64).floor() as u64 + self.attack as u64
    }

    /// Grow with silent buffers or truncate. A cursor past the new end
    /// becomes exhausted; a fresh stream starts at its first buffer.
    pub fn resize(&mut self, length: usize) {
        let old = self.stream.len();
        if length > old {
            let (format, size) = (self.format, self.buffer_size);
            self.stream
                .extend((old..length).map(|_| AudioBuffer::new(format, size)));
            if old == 0 {
                self.stream_current = Some(0);
            }
        } else {
            self.stream.truncate(length);
            if matches!(self.stream_current, Some(i) if i >= length) {
                self.stream_current = None;
            }
        }
    }

    /// Like [`resize`](Self::resize) but never drops the buffer under the cursor.
    pub fn safe_resize(&mut self, length: usize) {
        let floor = self.stream_current.map(|i| i + 1).unwrap_or(0);
        self.resize(length.max(floor));
    }

    /// Append one silent buffer.
    pub fn add_stream(&mut self) {
        let was_empty = self.stream.is_empty();
        self.stream
            .push(AudioBuffer::new(self.format, self.buffer_size));
        if was_empty {
            self.stream_current = Some(0);
        }
    }

    /// Overwrite this stream with the content of `template`, buffer for
    /// buffer, converting formats where they differ.
    pub fn duplicate_stream(&mut self, template: &SignalState) {
        for (dst, src) in self.stream.iter_mut().zip(template.stream.iter()) {
            dst.copy_from(0, src, 0, src.len());
        }
    }

    /// Buffers consumed so far.
    pub fn length_till_current(&self) -> usize {
        self.stream_current.unwrap_or(self.stream.len())
    }

    pub fn current(&self) -> Option<&AudioBuffer> {
        self.stream_current.and_then(|i| self.stream.get(i))
    }

    pub fn current_mut(&mut self) -> Option<&mut AudioBuffer> {
        match self.stream_current {
            Some(i) => self.stream.get_mut(i),
            None => None,
        }
    }

    /// Move the cursor forward one buffer. Returns whether data remains.
    pub fn advance(&mut self) -> bool {
        self.stream_current = match self.stream_current {
            Some(i) if i + 1 < self.stream.len() => Some(i + 1),
            _ => None,
        };
        self.stream_current.is_some()
    }

    pub fn is_exhausted(&self) -> bool {
        self.stream_current.is_none()
    }

    /// Re-chunk the stream into buffers of `buffer_size` samples. The data
    /// is preserved; the cursor keeps pointing at the same frame.
    pub fn set_buffer_size(&mut self, buffer_size: usize) {
        if buffer_size == 0 || buffer_size == self.buffer_size {
            return;
        }
        let old_size = self.buffer_size;
        let total = self.stream.len() * old_size;
        let mut flat = AudioBuffer::new(self.format, total);
        for (i, buffer) in self.stream.iter().enumerate() {
            flat.copy_from(i * old_size, buffer, 0, old_size);
        }

        let length = total.div_ceil(buffer_size);
        let mut stream = Vec::with_capacity(length);
        for i in 0..length {
            let mut chunk = AudioBuffer::new(self.format, buffer_size);
            chunk.copy_from(0, &flat, i * buffer_size, buffer_size);
            stream.push(chunk);
        }

        self.stream_current = self
            .stream_current
            .map(|i| i * old_size / buffer_size)
            .filter(|i| *i < length);
        self.stream = stream;
        self.buffer_size = buffer_size;
    }

    /// Convert every buffer to `format`.
    pub fn set_format(&mut self, format: SoundcardFormat) {
        if format == self.format {
            return;
        }
        for buffer in self.stream.iter_mut() {
            *buffer = buffer.converted(format);
        }
        self.format = format;
    }

    /// Record a new samplerate. Existing data is not resampled.
    pub fn set_samplerate(&mut self, samplerate: u32) {
        if samplerate != self.samplerate {
            log::debug!(
                target: "audio::signal",
                "samplerate {} -> {} without resampling",
                self.samplerate,
                samplerate
            );
            self.samplerate = samplerate;
        }
    }

    pub fn add_note(&mut self, note: Note) {
        self.notes.push(note);
    }

    pub fn remove_note(&mut self, note: &Note) -> bool {
        match self.notes.iter().position(|n| n == note) {
            Some(i) => {
                self.notes.remove(i);
                true
            }
            None => false,
        }
    }

    /// Whether any governing note sounds at `position`. A signal without
    /// notes is driven by its stream alone and counts as sounding.
    pub fn has_active_note(&self, position: u64) -> bool {
        self.notes.is_empty() || self.notes.iter().any(|n| n.is_active_at(position))
    }

    fn reset_stream(&mut self, template: &SignalState) {
        self.stream.clear();
        self.stream_current = None;
        self.samplerate = template.samplerate;
        self.buffer_size = template.buffer_size;
        self.format = template.format;
    }

    /// Fill instance frames `[from, to)` from `template`, placed at `offset`.
    ///
    /// Template frames are read linearly until the loop start; from there the
    /// read position wraps back to the loop start each time it reaches the
    /// loop end, so everything past the loop start is a tiling of the loop
    /// region. Without a usable loop the copy stops at the template's end.
    fn synthesize(&mut self, template: &SignalState, offset: u64, from: u64, to: u64) {
        let bs = self.buffer_size as u64;
        let tbs = template.buffer_size as u64;
        if bs == 0 || tbs == 0 {
            return;
        }
        let template_frames = template.capacity_frames();
        let loop_end = template.loop_end.min(template_frames);
        let loop_start = template.loop_start;
        let looping = loop_start < loop_end;

        let mut i = from;
        while i < to {
            let src_frame = if looping && i >= loop_start {
                loop_start + (i - loop_start) % (loop_end - loop_start)
            } else if i < template_frames {
                i
            } else {
                break;
            };

            let dst_frame = offset + i;
            let (dst_buf, dst_off) = ((dst_frame / bs) as usize, dst_frame % bs);
            let (src_buf, src_off) = ((src_frame / tbs) as usize, src_frame % tbs);
            if dst_buf >= self.stream.len() || src_buf >= template.stream.len() {
                break;
            }

            let mut run = (bs - dst_off).min(tbs - src_off).min(to - i);
            if looping && src_frame < loop_end {
                run = run.min(loop_end - src_frame);
            }

            self.stream[dst_buf].copy_from(
                dst_off as usize,
                &template.stream[src_buf],
                src_off as usize,
                run as usize,
            );
            i += run;
        }
    }
}

/// A buffered PCM stream, either an immutable template or a voice instance.
#[derive(Debug)]
pub struct AudioSignal {
    id: SignalId,
    template: bool,
    state: Mutex<SignalState>,
}

impl AudioSignal {
    /// A voice instance with an empty stream.
    pub fn new(samplerate: u32, buffer_size: usize, format: SoundcardFormat) -> Self {
        Self {
            id: SignalId::new(next_id()),
            template: false,
            state: Mutex::new(SignalState::new(samplerate, buffer_size, format)),
        }
    }

    /// A template of `length` silent buffers.
    pub fn new_template(
        samplerate: u32,
        buffer_size: usize,
        format: SoundcardFormat,
        length: usize,
    ) -> Self {
        let mut state = SignalState::new(samplerate, buffer_size, format);
        state.resize(length);
        state.last_frame = 0;
        Self {
            id: SignalId::new(next_id()),
            template: true,
            state: Mutex::new(state),
        }
    }

    pub fn id(&self) -> SignalId {
        self.id
    }

    pub fn is_template(&self) -> bool {
        self.template
    }

    /// Lock the signal. Keep the guard short; copy what you need and drop it.
    pub fn lock(&self) -> MutexGuard<'_, SignalState> {
        lock(&self.state)
    }

    /// A copy of the whole state taken under the lock.
    pub fn snapshot(&self) -> SignalState {
        self.lock().clone()
    }

    pub fn recall_id(&self) -> Option<Arc<RecallId>> {
        self.lock().recall_id.clone()
    }

    pub fn set_recall_id(&self, recall_id: Option<Arc<RecallId>>) {
        self.lock().recall_id = recall_id;
    }

    /// Whether this instance belongs to `context`.
    pub fn belongs_to(&self, context: &RecyclingContext) -> bool {
        self.recall_id()
            .map(|id| std::ptr::eq(id.context().as_ref(), context))
            .unwrap_or(false)
    }

    /// Whether this instance still has data to play.
    pub fn is_active(&self) -> bool {
        !self.template && !self.lock().is_exhausted()
    }

    pub fn length(&self) -> usize {
        self.lock().length()
    }

    pub fn advance(&self) -> bool {
        self.lock().advance()
    }

    /// Copy the template's shape and content into this instance.
    ///
    /// Loop points are shifted by `floor(delay * buffer_size) + attack`; the
    /// stream length equals the template's. An empty template, or one with
    /// zero-sized buffers, leaves this instance with an empty stream.
    pub fn apply_defaults(&self, template: &SignalState, delay: f64, attack: usize) {
        let mut state = self.lock();
        state.delay = delay;
        state.attack = attack;
        if template.length() == 0 || template.buffer_size == 0 {
            state.resize(0);
            return;
        }

        state.reset_stream(template);
        let offset = state.offset_frames();
        let bs = state.buffer_size as u64;
        state.loop_start = offset + template.loop_start;
        state.loop_end = offset + template.loop_end;
        state.last_frame = ((offset + template.last_frame as u64) % bs) as usize;
        state.first_frame = (offset % bs) as usize;

        state.resize(template.length());
        state.duplicate_stream(template);
        state.frame_count = template.capacity_frames();
    }

    /// Synthesize exactly `frame_count` frames from the template, tiling its
    /// loop region. The stream is resized to
    /// `ceil((offset + frame_count) / buffer_size)` buffers.
    pub fn apply_frame_count(
        &self,
        template: &SignalState,
        frame_count: u64,
        delay: f64,
        attack: usize,
    ) {
        let mut state = self.lock();
        state.delay = delay;
        state.attack = attack;
        if template.length() == 0 || template.buffer_size == 0 {
            state.resize(0);
            return;
        }

        state.reset_stream(template);
        let offset = state.offset_frames();
        let bs = state.buffer_size as u64;
        state.loop_start = offset + template.loop_start;
        state.loop_end = offset + template.loop_end;

        let total = offset + frame_count;
        state.resize(total.div_ceil(bs) as usize);
        state.first_frame = (offset % bs) as usize;
        state.last_frame = (total % bs) as usize;
        state.synthesize(template, offset, 0, frame_count);
        state.frame_count = frame_count;
    }

    /// Grow a held voice to `frame_count` frames, continuing the tiling.
    /// Shrinking requests are ignored.
    pub fn feed(&self, template: &AudioSignal, frame_count: u64) {
        if std::ptr::eq(self, template) {
            return;
        }
        let template = template.snapshot();

        let mut state = self.lock();
        if frame_count <= state.frame_count || template.length() == 0 || state.buffer_size == 0 {
            return;
        }
        let offset = state.offset_frames();
        let bs = state.buffer_size as u64;
        let total = offset + frame_count;
        let from = state.frame_count;

        state.safe_resize(total.div_ceil(bs) as usize);
        state.last_frame = (total % bs) as usize;
        state.synthesize(&template, offset, from, frame_count);
        state.frame_count = frame_count;
    }

    /// The template in `signals`, if any.
    pub fn find_template(signals: &[Arc<AudioSignal>]) -> Option<Arc<AudioSignal>> {
        signals.iter().find(|s| s.is_template()).cloned()
    }

    /// Every instance in `signals` bound to `context`.
    pub fn find_by_context(
        signals: &[Arc<AudioSignal>],
        context: &RecyclingContext,
    ) -> Vec<Arc<AudioSignal>> {
        signals
            .iter()
            .filter(|s| !s.is_template() && s.belongs_to(context))
            .cloned()
            .collect()
    }

    /// The first instance bound to `recall_id`'s context.
    pub fn find_by_recall_id(
        signals: &[Arc<AudioSignal>],
        recall_id: &RecallId,
    ) -> Option<Arc<AudioSignal>> {
        signals
            .iter()
            .find(|s| !s.is_template() && s.belongs_to(recall_id.context()))
            .cloned()
    }

    /// The first instance bound to `context` whose cursor still points at a
    /// buffer.
    pub fn find_stream_current(
        signals: &[Arc<AudioSignal>],
        context: &RecyclingContext,
    ) -> Option<Arc<AudioSignal>> {
        signals
            .iter()
            .find(|s| !s.is_template() && s.belongs_to(context) && s.is_active())
            .cloned()
    }

    /// Whether any instance bound to `context` still has data to play.
    pub fn is_active_in(signals: &[Arc<AudioSignal>], context: &RecyclingContext) -> bool {
        signals
            .iter()
            .any(|s| !s.is_template() && s.belongs_to(context) && s.is_active())
    }
}
