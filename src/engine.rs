//! Generation engine seam.
//!
//! The model runtime is an external collaborator: the server only needs to
//! tokenize a prompt, pull tokens off a cancelable stream, and turn each
//! token back into text. Everything behind that boundary is opaque.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{bail, Result};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Opaque token produced by an engine. Only the engine that issued it can
/// turn it back into text.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Token(pub u32);

pub type TokenSequence = Vec<Token>;

/// Receiving half of an in-progress generation. Closed when the engine is
/// done, failed, or has honored cancellation.
pub type TokenStream = mpsc::Receiver<Result<Token>>;

/// Capacity of the channel between an engine producer and the lifecycle
/// manager. Small on purpose: the manager relays one token at a time and the
/// engine should not run far ahead of a slow client.
const TOKEN_CHANNEL_CAPACITY: usize = 8;

pub trait GenerationEngine: Send + Sync {
    /// Encode a prompt. May be slow or fail; callers run it off the reactor.
    fn tokenize(&self, prompt: &str) -> Result<TokenSequence>;

    /// Start generating from `tokens`. Returns immediately; tokens arrive on
    /// the stream one at a time. The producer should stop promptly once
    /// `cancel` fires, but callers must not rely on it doing so.
    fn generate(&self, tokens: TokenSequence, cancel: CancellationToken) -> TokenStream;

    /// Decode a single token into a text fragment.
    fn detokenize(&self, token: Token) -> Result<String>;
}

/// Placeholder engine so the demo runs without model weights: interns
/// whitespace-separated words as tokens and streams the prompt straight back
/// with a fixed per-token delay.
pub struct EchoEngine {
    vocab: Mutex<EchoVocab>,
    token_delay: Duration,
}

#[derive(Default)]
struct EchoVocab {
    words: Vec<String>,
    ids: HashMap<String, u32>,
}

impl EchoEngine {
    pub fn new(token_delay: Duration) -> Self {
        Self {
            vocab: Mutex::new(EchoVocab::default()),
            token_delay,
        }
    }

    fn intern(&self, word: &str) -> Token {
        let mut vocab = self.vocab.lock();
        if let Some(&id) = vocab.ids.get(word) {
            return Token(id);
        }
        let id = vocab.words.len() as u32;
        vocab.words.push(word.to_string());
        vocab.ids.insert(word.to_string(), id);
        Token(id)
    }
}

impl GenerationEngine for EchoEngine {
    fn tokenize(&self, prompt: &str) -> Result<TokenSequence> {
        let tokens: TokenSequence = prompt
            .split_whitespace()
            .map(|word| self.intern(word))
            .collect();
        if tokens.is_empty() {
            bail!("prompt contained no tokens");
        }
        Ok(tokens)
    }

    fn generate(&self, tokens: TokenSequence, cancel: CancellationToken) -> TokenStream {
        let (tx, rx) = mpsc::channel(TOKEN_CHANNEL_CAPACITY);
        let delay = self.token_delay;
        tokio::spawn(async move {
            for token in tokens {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                if tx.send(Ok(token)).await.is_err() {
                    break;
                }
            }
        });
        rx
    }

    fn detokenize(&self, token: Token) -> Result<String> {
        let vocab = self.vocab.lock();
        match vocab.words.get(token.0 as usize) {
            Some(word) => Ok(format!("{word} ")),
            None => bail!("unknown token id {}", token.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_round_trip() {
        let engine = EchoEngine::new(Duration::ZERO);
        let tokens = engine.tokenize("hello streaming world").unwrap();
        assert_eq!(tokens.len(), 3);

        let mut stream = engine.generate(tokens, CancellationToken::new());
        let mut text = String::new();
        while let Some(token) = stream.recv().await {
            text.push_str(&engine.detokenize(token.unwrap()).unwrap());
        }
        assert_eq!(text, "hello streaming world ");
    }

    #[tokio::test]
    async fn echo_interning_is_stable() {
        let engine = EchoEngine::new(Duration::ZERO);
        let first = engine.tokenize("a b a").unwrap();
        let second = engine.tokenize("b a").unwrap();
        assert_eq!(first[0], first[2]);
        assert_eq!(first[1], second[0]);
    }

    #[test]
    fn empty_prompt_is_rejected() {
        let engine = EchoEngine::new(Duration::ZERO);
        assert!(engine.tokenize("   ").is_err());
    }

    #[tokio::test]
    async fn cancel_stops_production() {
        let engine = EchoEngine::new(Duration::from_millis(5));
        let tokens = engine.tokenize("one two three four five").unwrap();
        let cancel = CancellationToken::new();
        let mut stream = engine.generate(tokens, cancel.clone());

        let first = stream.recv().await.expect("one token before cancel");
        first.unwrap();
        cancel.cancel();

        // A token already in flight may still arrive; the stream must close
        // shortly after.
        let mut trailing = 0;
        while stream.recv().await.is_some() {
            trailing += 1;
        }
        assert!(trailing <= 1, "engine kept producing after cancel");
    }
}
