use std::sync::Arc;

use crate::cache::BlockId;
use crate::input::{Embedding, SamplingParams, TokenId};
use crate::lora::LoraId;
use crate::stream::GenerateStream;

/// Transient descriptor of one decode step.
///
/// Built by the scheduler, filled in by the executor, applied back to the
/// member streams, then dropped; never retained across iterations. Member
/// order is prefill streams first, then decode streams; all per-member
/// vectors (`context_lengths`, `block_tables`, `lora_ids`, `next_tokens`,
/// ...) follow that order.
#[derive(Default)]
pub struct BatchQuery {
    /// Streams taking their first step after admission; their full token
    /// sequence is packed into `input_tokens`.
    pub prefill: Vec<Arc<GenerateStream>>,
    /// Streams advancing by one token; only their last token is packed.
    pub decode: Vec<Arc<GenerateStream>>,

    /// Packed input token ids: each prefill member's whole sequence, then
    /// one token per decode member.
    pub input_tokens: Vec<TokenId>,
    /// Token-type ids parallel to `input_tokens`; zero where the request
    /// supplied none.
    pub token_type_ids: Vec<TokenId>,
    /// Position of each packed token within its sequence.
    pub positions: Vec<u32>,
    /// Tokens packed per prefill member, for segmenting `input_tokens`.
    pub prefill_lengths: Vec<usize>,
    /// Per-member sequence length after this step's input is consumed.
    pub context_lengths: Vec<usize>,
    /// Per-member KV block tables.
    pub block_tables: Vec<Vec<BlockId>>,
    /// Per-member adapter ids.
    pub lora_ids: Vec<Option<LoraId>>,
    /// Per-member multimodal embeddings (prefill members only carry one).
    pub embeddings: Vec<Option<Embedding>>,
    /// Per-member sampling parameters.
    pub sampling: Vec<SamplingParams>,

    /// Filled by the executor: one sampled token per member.
    pub next_tokens: Vec<Option<TokenId>>,
    /// Filled by the executor when logprobs were requested.
    pub logprobs: Vec<Option<f32>>,
}

impl BatchQuery {
    pub fn total_batch_size(&self) -> usize {
        self.prefill.len() + self.decode.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prefill.is_empty() && self.decode.is_empty()
    }

    /// Member streams in packing order: prefill, then decode.
    pub fn members(&self) -> impl Iterator<Item = &Arc<GenerateStream>> {
        self.prefill.iter().chain(self.decode.iter())
    }

    pub(crate) fn push_prefill(&mut self, stream: &Arc<GenerateStream>) {
        let tokens = stream.prefill_tokens();
        self.positions.extend(0..tokens.len() as u32);
        match &stream.input().token_type_ids {
            Some(type_ids) => {
                self.token_type_ids.extend_from_slice(type_ids);
                // Preserved-token tail (after preemption) has no type ids.
                self.token_type_ids.extend(std::iter::repeat_n(
                    0,
                    tokens.len().saturating_sub(type_ids.len()),
                ));
            }
            None => self
                .token_type_ids
                .extend(std::iter::repeat_n(0, tokens.len())),
        }
        self.prefill_lengths.push(tokens.len());
        self.context_lengths.push(tokens.len());
        // The embedding is consumed while the prompt is prefilled; decode
        // members never carry one.
        self.embeddings.push(stream.input().embedding.clone());
        self.push_member_meta(stream);
        self.input_tokens.extend(tokens);
        self.prefill.push(Arc::clone(stream));
    }

    pub(crate) fn push_decode(&mut self, stream: &Arc<GenerateStream>) {
        let seq_len = stream.seq_len();
        self.input_tokens.push(stream.last_token());
        self.token_type_ids.push(0);
        self.positions.push((seq_len - 1) as u32);
        self.context_lengths.push(seq_len);
        self.embeddings.push(None);
        self.push_member_meta(stream);
        self.decode.push(Arc::clone(stream));
    }

    fn push_member_meta(&mut self, stream: &Arc<GenerateStream>) {
        self.block_tables.push(stream.block_table());
        self.lora_ids.push(stream.lora_id());
        self.sampling.push(stream.input().config.sampling.clone());
    }

    /// Size the output slots once assembly is complete.
    pub(crate) fn seal(&mut self) {
        let members = self.total_batch_size();
        self.next_tokens = vec![None; members];
        self.logprobs = vec![None; members];
    }
}
