//! Streaming sentence splitter
//!
//! Buffers streamed LLM fragments and emits sentence-sized units for TTS as
//! soon as they are complete, instead of waiting for the stream to end.
//!
//! Lengths are measured as *effective length*: punctuation is skipped, ASCII
//! counts 1, everything else counts 2. Terminator punctuation (。！？…!?.)
//! cuts eagerly once the minimum length is reached; separator punctuation
//! only cuts once a run has outgrown the maximum length.

/// Characters that end a sentence.
const TERMINATORS: &[char] = &['。', '！', '？', '…', '!', '?', '.'];

/// Non-terminating punctuation. A run of em-dashes forms a separator block.
const SEPARATORS: &[char] = &[
    '，', '、', '；', '：', '—', ',', ';', ':', '“', '”', '‘', '’', '"', '\'',
];

fn is_terminator(c: char) -> bool {
    TERMINATORS.contains(&c)
}

fn is_punct(c: char) -> bool {
    TERMINATORS.contains(&c) || SEPARATORS.contains(&c)
}

/// Width of a single character: ASCII counts 1, wide glyphs count 2.
fn char_width(c: char) -> usize {
    if (c as u32) < 128 {
        1
    } else {
        2
    }
}

/// Effective length of a string: punctuation skipped, widths summed.
///
/// `"你好......"` has effective length 4, not 10.
fn effective_len(text: &str) -> usize {
    text.chars()
        .filter(|&c| !is_punct(c))
        .map(char_width)
        .sum()
}

/// Split text into a sequence of alternating text runs and punctuation
/// blocks, tagged `true` for punctuation.
fn tokenize(text: &str) -> Vec<(String, bool)> {
    let mut runs: Vec<(String, bool)> = Vec::new();
    for c in text.chars() {
        let punct = is_punct(c);
        match runs.last_mut() {
            Some((run, is_punct_run)) if *is_punct_run == punct => run.push(c),
            _ => runs.push((c.to_string(), punct)),
        }
    }
    runs
}

/// Stateful stream-to-sentence transducer.
///
/// One instance per client stream; discard after the stream ends.
#[derive(Debug)]
pub struct StreamingSplitter {
    /// Soft maximum: a separator block cuts once the run reaches this length
    max_len: usize,
    /// Hard minimum: a terminator block below this length does not cut
    min_len: usize,
    buffer: String,
}

impl Default for StreamingSplitter {
    fn default() -> Self {
        Self::new(40, 5)
    }
}

impl StreamingSplitter {
    pub fn new(max_len: usize, min_len: usize) -> Self {
        Self {
            max_len,
            min_len,
            buffer: String::new(),
        }
    }

    /// Feed a stream fragment, returning any sentences completed by it.
    pub fn feed(&mut self, fragment: &str) -> Vec<String> {
        if fragment.is_empty() {
            return Vec::new();
        }
        self.buffer.push_str(fragment);
        self.try_split()
    }

    /// Walk the buffered text and emit every completed sentence.
    ///
    /// The last token of the pass never cuts: the stream may still append to
    /// it. The residue after the last emitted boundary becomes the new
    /// buffer.
    fn try_split(&mut self) -> Vec<String> {
        if self.buffer.is_empty() {
            return Vec::new();
        }

        let clean: String = self.buffer.chars().filter(|&c| c != '\n').collect();
        let runs = tokenize(&clean);

        let mut sentences = Vec::new();
        let mut current = String::new();
        let last = runs.len().saturating_sub(1);

        for (i, (run, punct)) in runs.iter().enumerate() {
            current.push_str(run);
            if !*punct || i == last {
                continue;
            }

            let eff_len = effective_len(&current);
            let cut = if run.chars().any(is_terminator) {
                eff_len >= self.min_len
            } else {
                eff_len >= self.max_len
            };

            if cut {
                sentences.push(current.trim().to_string());
                current.clear();
            }
        }

        self.buffer = current;
        sentences
    }

    /// Return the residual buffer if it has any effective content, clearing
    /// it either way. Called once at stream end.
    pub fn flush(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }

        let remaining = self.buffer.trim().to_string();
        self.buffer.clear();

        if !remaining.is_empty() && effective_len(&remaining) > 0 {
            Some(remaining)
        } else {
            None
        }
    }

    /// Clear the buffer unconditionally.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Split a complete text in one pass (non-streaming convenience).
    pub fn split_text(&mut self, text: &str) -> Vec<String> {
        self.reset();
        let mut sentences = self.feed(text);
        if let Some(remaining) = self.flush() {
            sentences.push(remaining);
        }
        sentences
    }
}
