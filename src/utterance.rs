//! Utterance assembly from transcript fragments.
//!
//! Transcription returns one fragment per speech segment together with a
//! completeness classification. Fragments accumulate here until the buffer
//! decides the utterance is finished enough to dispatch: immediately for a
//! COMPLETE fragment, or after an extra-wait window measured from the most
//! recent INCOMPLETE fragment. The timer itself is owned by the
//! coordinator; this type only makes the decision.

use crate::stt::Completeness;

/// What the coordinator should do after a fragment was pushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushDecision {
    /// Dispatch the utterance now and cancel any pending extra wait.
    FlushNow,
    /// (Re)arm the extra-wait timer from this fragment.
    ArmExtraWait,
}

/// Ordered transcript fragments for the utterance being assembled.
#[derive(Debug, Default)]
pub struct UtteranceBuffer {
    fragments: Vec<String>,
}

impl UtteranceBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one fragment and decide the flush policy for it.
    pub fn push(&mut self, text: String, completeness: Completeness) -> FlushDecision {
        self.fragments.push(text);
        match completeness {
            Completeness::Complete => FlushDecision::FlushNow,
            Completeness::Incomplete => FlushDecision::ArmExtraWait,
        }
    }

    /// All fragments joined with single spaces, in arrival order.
    pub fn joined(&self) -> String {
        self.fragments.join(" ")
    }

    /// Whether any fragment is buffered.
    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// Take the finalized utterance text, clearing the buffer.
    ///
    /// Returns `None` when nothing is buffered (e.g. a stale force-flush
    /// timer firing after the utterance already went out).
    pub fn take(&mut self) -> Option<String> {
        if self.fragments.is_empty() {
            return None;
        }
        let text = self.fragments.join(" ");
        self.fragments.clear();
        Some(text)
    }

    /// Discard all fragments.
    pub fn clear(&mut self) {
        self.fragments.clear();
    }
}
