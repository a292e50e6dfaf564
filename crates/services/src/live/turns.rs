use std::time::{Duration, Instant};

use tracing::debug;

/// One hypothesis event from the streaming recognizer.
#[derive(Debug, Clone)]
pub struct Hypothesis {
    pub transcript: String,
    pub is_final: bool,
    pub speech_final: bool,
}

/// What a hypothesis produced, with its intended audience.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutput {
    /// Interim hypothesis — host-only live monitoring, never a Turn.
    Partial { text: String },
    /// Finalized utterance — broadcast to both peers.
    Turn { text: String },
}

/// Per-peer mutable assembly state. Owned by the peer, fed by its
/// recognizer event stream only, so no internal locking is needed.
#[derive(Debug, Default)]
pub struct TurnState {
    pending_final: String,
    last_turn_at: Option<Instant>,
}

/// Reconciles partial/final hypotheses into deduplicated speaker turns.
///
/// Final fragments accumulate until the recognizer flags end-of-utterance
/// (`speech_final`), then the joined text is emitted as one turn. Turns for
/// the same speaker are rate-limited: an end-of-utterance landing inside
/// `min_gap` is dropped together with its accumulated text. That discards
/// speech, but it matches the shipped anti-flood behavior — see DESIGN.md
/// before changing it to merge-into-next-turn.
#[derive(Debug, Clone)]
pub struct TurnAssembler {
    min_gap: Duration,
}

impl TurnAssembler {
    pub fn new(min_gap: Duration) -> Self {
        Self { min_gap }
    }

    pub fn assemble(&self, state: &mut TurnState, hyp: &Hypothesis) -> Option<TurnOutput> {
        self.assemble_at(state, hyp, Instant::now())
    }

    /// Same as [`assemble`](Self::assemble) with an injected clock.
    pub fn assemble_at(
        &self,
        state: &mut TurnState,
        hyp: &Hypothesis,
        now: Instant,
    ) -> Option<TurnOutput> {
        if hyp.transcript.trim().is_empty() && !hyp.speech_final {
            return None;
        }

        if !hyp.is_final {
            return Some(TurnOutput::Partial {
                text: hyp.transcript.clone(),
            });
        }

        // Final fragment: accumulate, space-joined.
        if !hyp.transcript.is_empty() {
            if !state.pending_final.is_empty() {
                state.pending_final.push(' ');
            }
            state.pending_final.push_str(&hyp.transcript);
        }

        if !hyp.speech_final {
            return None;
        }

        // End of utterance: flush the buffer whatever happens next.
        let text = std::mem::take(&mut state.pending_final);
        let text = text.trim();
        if text.is_empty() {
            return None;
        }

        if let Some(last) = state.last_turn_at {
            if now.duration_since(last) < self.min_gap {
                debug!(chars = text.len(), "turn dropped inside min-gap window");
                return None;
            }
        }

        state.last_turn_at = Some(now);
        Some(TurnOutput::Turn {
            text: text.to_string(),
        })
    }
}
