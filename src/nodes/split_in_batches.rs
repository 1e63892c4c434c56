/// Split In Batches node
///
/// The first call parks all input items in scratch state and emits the first batch
/// on `loop`. Every later call in the same run receives the processed batch back,
/// collects it, and emits the next batch. Once the items run out, everything that
/// was collected goes out on `done` and the state is cleared.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use crate::node::types::{Item, NodeDefinition, NodeHandler, NodeLogic, NodeProperty, OutputEntry, Properties, PropertyType};
use crate::output::main_entry;
use crate::runtime::ExecutionContext;

pub const IDENTIFIER: &str = "nodeward.splitInBatches";

const DEFAULT_BATCH_SIZE: u64 = 10;

pub fn definition() -> NodeDefinition {
    let mut definition = NodeDefinition::new(IDENTIFIER, "Split In Batches", NodeLogic::Host(Arc::new(SplitInBatchesNode)));
    definition.name = "splitInBatches".to_string();
    definition.description = "Split data into batches and iterate over each batch".to_string();
    definition.outputs = vec!["loop".to_string(), "done".to_string()];
    definition.properties = Properties::Static(vec![
        NodeProperty::new("batchSize", "Batch Size", PropertyType::Number).with_default(json!(DEFAULT_BATCH_SIZE)),
        NodeProperty::new("reset", "Reset", PropertyType::Boolean).with_default(json!(false)),
    ]);
    definition
}

/// Batch cursor kept between calls of one run
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct BatchState {
    items: Vec<Item>,
    cursor: usize,
    processed: Vec<Item>,
}

struct SplitInBatchesNode;

#[async_trait]
impl NodeHandler for SplitInBatchesNode {
    async fn execute(&self, ctx: &ExecutionContext, input: Vec<Item>) -> anyhow::Result<Vec<OutputEntry>> {
        let batch_size = ctx
            .get_node_parameter("batchSize", 0)
            .await?
            .as_u64()
            .filter(|size| *size > 0)
            .unwrap_or(DEFAULT_BATCH_SIZE) as usize;
        let reset = ctx.get_node_parameter("reset", 0).await?.as_bool().unwrap_or(false);

        let stored: Option<BatchState> = serde_json::from_value(ctx.get_node_state()).ok();
        let mut state = match stored {
            Some(state) if !reset && !state.items.is_empty() => {
                let mut state = state;
                state.processed.extend(input);
                state
            }
            _ => BatchState {
                items: input,
                cursor: 0,
                processed: Vec::new(),
            },
        };

        if state.cursor >= state.items.len() {
            ctx.clear_node_state();
            tracing::debug!("📦 Split In Batches done with {} item(s)", state.processed.len());
            return Ok(vec![main_entry(Vec::new()), main_entry(state.processed)]);
        }

        let end = (state.cursor + batch_size).min(state.items.len());
        let batch = state.items[state.cursor..end].to_vec();
        state.cursor = end;

        tracing::debug!(
            "📦 Split In Batches emitting items {}..{} of {}",
            end - batch.len(),
            end,
            state.items.len()
        );

        ctx.set_node_state(serde_json::to_value(&state)?);
        Ok(vec![main_entry(batch), main_entry(Vec::new())])
    }
}
