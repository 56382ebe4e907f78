use std::sync::OnceLock;

use tiktoken_rs::CoreBPE;
use tracing::warn;

/// Process-wide BPE encoder, loaded on first use. Initialization through
/// OnceLock is herd-safe: concurrent first callers block on one load.
static BPE: OnceLock<Option<CoreBPE>> = OnceLock::new();

fn bpe() -> Option<&'static CoreBPE> {
    BPE.get_or_init(|| match tiktoken_rs::cl100k_base() {
        Ok(encoder) => Some(encoder),
        Err(e) => {
            warn!(error = %e, "failed to load cl100k encoder; falling back to heuristic counting");
            None
        }
    })
    .as_ref()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TokenizerKind {
    /// Deterministic subword counting. The default, and the only kind
    /// allowed for budget enforcement.
    Bpe,
    /// chars/4 estimate over Unicode scalar values. Display-only.
    Heuristic,
}

/// Token counting for budget math and cost display.
#[derive(Clone, Copy, Debug)]
pub struct Tokenizer {
    kind: TokenizerKind,
}

impl Default for Tokenizer {
    fn default() -> Self {
        Self::bpe()
    }
}

impl Tokenizer {
    pub fn bpe() -> Self {
        Self {
            kind: TokenizerKind::Bpe,
        }
    }

    /// Rough estimator for progress displays. Never use for budgets:
    /// multi-byte text makes character heuristics drift badly.
    pub fn heuristic() -> Self {
        Self {
            kind: TokenizerKind::Heuristic,
        }
    }

    pub fn count(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        match self.kind {
            TokenizerKind::Bpe => match bpe() {
                Some(encoder) => encoder.encode_ordinary(text).len(),
                None => heuristic_count(text),
            },
            TokenizerKind::Heuristic => heuristic_count(text),
        }
    }
}

fn heuristic_count(text: &str) -> usize {
    // Char count, not byte count: byte length overcounts CJK/emoji text.
    text.chars().count().div_ceil(4).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_counts_zero() {
        assert_eq!(Tokenizer::bpe().count(""), 0);
        assert_eq!(Tokenizer::heuristic().count(""), 0);
    }

    #[test]
    fn bpe_counts_subwords() {
        let t = Tokenizer::bpe();
        let n = t.count("hello world");
        assert!(n >= 2 && n <= 4, "got {n}");
    }

    #[test]
    fn bpe_is_deterministic() {
        let t = Tokenizer::bpe();
        let text = "Build a FastAPI JWT auth endpoint with refresh tokens";
        assert_eq!(t.count(text), t.count(text));
    }

    #[test]
    fn bpe_handles_multibyte_text() {
        let t = Tokenizer::bpe();
        // Turkish + CJK + emoji: counting must not panic and must be stable.
        let text = "Python'da matplotlib ile chart nasıl çizilir? 你好世界 🚀";
        let n = t.count(text);
        assert!(n > 0);
        assert_eq!(n, t.count(text));
    }

    #[test]
    fn heuristic_uses_chars_not_bytes() {
        let t = Tokenizer::heuristic();
        // 8 CJK chars = 24 bytes; char-based heuristic gives 2, not 6.
        assert_eq!(t.count("你好世界你好世界"), 2);
    }

    #[test]
    fn bpe_multibyte_differs_from_char_heuristic() {
        // A char heuristic would claim ~6 tokens for 24 CJK chars; the BPE
        // count is materially higher. Budget math must see the real number.
        let text = "你好世界".repeat(6);
        let exact = Tokenizer::bpe().count(&text);
        let rough = Tokenizer::heuristic().count(&text);
        assert!(exact > rough, "bpe {exact} <= heuristic {rough}");
    }

    #[test]
    fn longer_text_counts_more() {
        let t = Tokenizer::bpe();
        let short = t.count("one two three");
        let long = t.count(&"one two three ".repeat(50));
        assert!(long > short * 10);
    }
}
