//! Per-invocation timing and token accounting.

use crate::types::{ChatRequest, Metrics, Usage};
use std::time::{Duration, Instant};

/// Characters per token used when a provider reports no usage.
const CHARS_PER_TOKEN: usize = 4;

/// Rough token estimate for text a provider did not count for us.
pub fn estimate_tokens(chars: usize) -> u64 {
    (chars / CHARS_PER_TOKEN) as u64
}

/// Number of prompt characters a request sends, used for input estimates.
pub fn prompt_chars(request: &ChatRequest) -> usize {
    let system = request.system.as_deref().map_or(0, str::len);
    let messages: usize = request
        .messages
        .iter()
        .map(|msg| {
            msg.content.len()
                + msg
                    .tool_calls
                    .iter()
                    .map(|call| call.name.len() + call.arguments.to_string().len())
                    .sum::<usize>()
                + msg
                    .tool_results
                    .iter()
                    .map(|result| result.content.len())
                    .sum::<usize>()
        })
        .sum();
    system + messages
}

/// Tracks wall-clock timing for one adapter invocation.
#[derive(Debug, Clone)]
pub struct MetricsTracker {
    started: Instant,
    first_byte: Option<Duration>,
}

impl MetricsTracker {
    /// Start timing now.
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
            first_byte: None,
        }
    }

    /// Record the first content event. Later calls are ignored.
    pub fn mark_first_byte(&mut self) {
        if self.first_byte.is_none() {
            self.first_byte = Some(self.started.elapsed());
        }
    }

    /// Whether first content has been observed.
    pub fn has_first_byte(&self) -> bool {
        self.first_byte.is_some()
    }

    /// Compute final metrics.
    ///
    /// Reported counters win, including a reported zero; a counter the
    /// provider did not report falls back to a `chars / 4` estimate.
    pub fn finish(&self, reported: Option<Usage>, input_chars: usize, output_chars: usize) -> Metrics {
        let total = self.started.elapsed();
        let ttfb = self.first_byte.unwrap_or(total);
        let usage = reported.unwrap_or_default();

        let mut estimated = false;
        let mut counter = |reported: Option<u64>, chars: usize| {
            reported.unwrap_or_else(|| {
                estimated = true;
                estimate_tokens(chars)
            })
        };
        let input_tokens = counter(usage.input_tokens, input_chars);
        let output_tokens = counter(usage.output_tokens, output_chars);

        let generation = total.saturating_sub(ttfb);
        let generation = if generation.is_zero() { total } else { generation };
        let tokens_per_second = if generation.is_zero() {
            0.0
        } else {
            output_tokens as f64 / generation.as_secs_f64()
        };

        Metrics {
            input_tokens,
            output_tokens,
            cache_creation_tokens: usage.cache_creation_tokens,
            cache_read_tokens: usage.cache_read_tokens,
            ttfb_ms: ttfb.as_millis() as u64,
            total_ms: total.as_millis() as u64,
            tokens_per_second,
            estimated,
        }
    }
}
