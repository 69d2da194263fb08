//! Synthetic request construction.
//!
//! Prompts are made of words from a fixed vocabulary whose members are single tokens (with
//! their leading space) in the cl100k and o200k BPE vocabularies. The shared prompt body is
//! measured once with the cl100k tokenizer and trimmed or padded until it fills the token
//! budget left after the chat framing ([`TOKENS_PER_MESSAGE`] per message and
//! [`REPLY_PRIMING_TOKENS`] per reply). Cache-busting nonces add one token per word. Other
//! OpenAI tokenizers land within
//! [`TOKEN_ESTIMATE_TOLERANCE`](loadbench_core::TOKEN_ESTIMATE_TOLERANCE) of the requested size.
mod vocabulary;

use crate::client::{ChatMessage, CompletionRequest, StreamOptions};
use loadbench_core::{
    SamplingParams, ShapeParams, CACHE_BUSTING_NONCE_WORDS, REPLY_PRIMING_TOKENS,
    TOKENS_PER_MESSAGE,
};
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::sync::OnceLock;
use thiserror::Error;
use tiktoken_rs::CoreBPE;
#[allow(unused)]
use tracing::{debug, trace};
use vocabulary::WORDS;

/// Trim/pad passes over the prompt body before its token count is accepted as is.
const CALIBRATION_ROUNDS: usize = 8;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ShapeConstructionError {
    #[error("context tokens must be greater than 0")]
    ZeroContextTokens,

    #[error("max tokens must be greater than 0")]
    ZeroMaxTokens,

    #[error("a context of {requested} tokens cannot hold the {minimum}-token minimum prompt")]
    ContextTooSmall { requested: u32, minimum: u32 },

    #[error("unable to load the tokenizer: {0}")]
    Tokenizer(String),
}

/// Builds request payloads matching a token shape.
pub struct RequestShapeGenerator {
    shape: ShapeParams,
    sampling: SamplingParams,
    prevent_server_caching: bool,
    body: String,
    body_tokens: u32,
    rng: SmallRng,
}

impl RequestShapeGenerator {
    pub fn new(
        shape: ShapeParams,
        sampling: SamplingParams,
        prevent_server_caching: bool,
    ) -> Result<Self, ShapeConstructionError> {
        Self::with_rng(shape, sampling, prevent_server_caching, SmallRng::from_entropy())
    }

    /// Deterministic variant for reproducible prompts.
    pub fn with_seed(
        shape: ShapeParams,
        sampling: SamplingParams,
        prevent_server_caching: bool,
        seed: u64,
    ) -> Result<Self, ShapeConstructionError> {
        Self::with_rng(shape, sampling, prevent_server_caching, SmallRng::seed_from_u64(seed))
    }

    fn with_rng(
        shape: ShapeParams,
        sampling: SamplingParams,
        prevent_server_caching: bool,
        mut rng: SmallRng,
    ) -> Result<Self, ShapeConstructionError> {
        if shape.context_tokens == 0 {
            return Err(ShapeConstructionError::ZeroContextTokens);
        }
        if shape.max_tokens == 0 {
            return Err(ShapeConstructionError::ZeroMaxTokens);
        }

        let reserved = framing_tokens(1) + nonce_words(prevent_server_caching);
        let minimum = reserved + 1;
        if shape.context_tokens < minimum {
            return Err(ShapeConstructionError::ContextTooSmall {
                requested: shape.context_tokens,
                minimum,
            });
        }

        let budget = shape.context_tokens - reserved;
        let (body, body_tokens) =
            calibrated_body(cl100k()?, &mut rng, budget, prevent_server_caching);
        if body_tokens != budget {
            debug!("Prompt body settled at {body_tokens} tokens for a budget of {budget}");
        }

        Ok(Self {
            shape,
            sampling,
            prevent_server_caching,
            body,
            body_tokens,
            rng,
        })
    }

    pub fn shape(&self) -> ShapeParams {
        self.shape
    }

    /// Build the next payload. The shared prompt body is reused; with cache prevention on, each
    /// payload gets a fresh random prefix.
    pub fn generate(&mut self) -> CompletionRequest {
        let content = if self.prevent_server_caching {
            let nonce = random_words(&mut self.rng, CACHE_BUSTING_NONCE_WORDS);
            format!("{nonce} {}", self.body)
        } else {
            self.body.clone()
        };

        let context_tokens =
            framing_tokens(1) + nonce_words(self.prevent_server_caching) + self.body_tokens;

        CompletionRequest {
            messages: vec![ChatMessage::user(content)],
            max_tokens: self.shape.max_tokens,
            stream: true,
            temperature: self.sampling.temperature,
            top_p: self.sampling.top_p,
            frequency_penalty: self.sampling.frequency_penalty,
            presence_penalty: self.sampling.presence_penalty,
            completions: self.sampling.completions,
            stream_options: Some(StreamOptions {
                include_usage: true,
            }),
            context_tokens,
        }
    }
}

/// The cl100k tokenizer, built on first use.
fn cl100k() -> Result<&'static CoreBPE, ShapeConstructionError> {
    static CL100K: OnceLock<Result<CoreBPE, String>> = OnceLock::new();
    CL100K
        .get_or_init(|| tiktoken_rs::cl100k_base().map_err(|err| err.to_string()))
        .as_ref()
        .map_err(|err| ShapeConstructionError::Tokenizer(err.clone()))
}

/// Random vocabulary words whose cl100k token count is as close to `budget` as trimming and
/// padding gets it. With `leading_space` the body is measured as it appears after a nonce.
fn calibrated_body(
    bpe: &CoreBPE,
    rng: &mut SmallRng,
    budget: u32,
    leading_space: bool,
) -> (String, u32) {
    let mut words: Vec<&str> = (0..budget).map(|_| random_word(rng)).collect();
    let count = |words: &[&str]| {
        let text = words.join(" ");
        let tokens = if leading_space {
            bpe.encode_with_special_tokens(&format!(" {text}")).len()
        } else {
            bpe.encode_with_special_tokens(&text).len()
        };
        tokens as u32
    };

    let mut tokens = count(&words);
    for _ in 0..CALIBRATION_ROUNDS {
        if tokens > budget {
            let excess = (tokens - budget) as usize;
            if words.len() > excess {
                words.truncate(words.len() - excess);
            } else {
                // A lone word spanning several tokens.
                words.truncate(1);
                words[0] = random_word(rng);
            }
        } else if tokens < budget {
            words.extend((tokens..budget).map(|_| random_word(rng)));
        } else {
            break;
        }
        tokens = count(&words);
        trace!("Prompt body: {} words, {tokens} tokens", words.len());
    }

    (words.join(" "), tokens)
}

/// Estimated prompt tokens of a chat request built from vocabulary words.
pub fn estimate_prompt_tokens(messages: &[ChatMessage]) -> u32 {
    let words: usize = messages
        .iter()
        .map(|m| m.content.split_whitespace().count())
        .sum();
    framing_tokens(messages.len() as u32) + words as u32
}

fn framing_tokens(messages: u32) -> u32 {
    messages * TOKENS_PER_MESSAGE + REPLY_PRIMING_TOKENS
}

fn nonce_words(prevent_server_caching: bool) -> u32 {
    if prevent_server_caching {
        CACHE_BUSTING_NONCE_WORDS
    } else {
        0
    }
}

fn random_words(rng: &mut SmallRng, count: u32) -> String {
    let mut out = String::with_capacity(count as usize * 6);
    for i in 0..count {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(random_word(rng));
    }
    out
}

fn random_word(rng: &mut SmallRng) -> &'static str {
    // WORDS is a non-empty constant.
    WORDS.choose(rng).copied().unwrap_or("the")
}
