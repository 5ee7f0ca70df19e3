//! Streaming execution
//!
//! Layers before the first stream-capable layer run buffered. That layer's
//! chunks are forwarded as they arrive. Layers after it run buffered too;
//! whatever they add to the final content is sent as one more chunk. The
//! stream always ends with [`StreamEvent::End`].

use std::{sync::Arc, time::Instant};

use async_stream::stream;
use futures::{stream::BoxStream, StreamExt};
use serde::Serialize;
use serde_json::json;

use super::Orchestrator;
use crate::{
    core::{DataMap, Phase, PipelineError, ProcessingResult},
    stage::Stage,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Chunk { content: String },
    Error { code: String, message: String },
    /// Last event of every stream. A consumer that never sees it must treat
    /// the response as incomplete.
    End { request_id: String, success: bool },
}

impl StreamEvent {
    fn error(err: &PipelineError) -> Self {
        StreamEvent::Error {
            code: err.error_code().to_string(),
            message: err.to_string(),
        }
    }

    pub fn is_end(&self) -> bool {
        matches!(self, StreamEvent::End { .. })
    }
}

impl Orchestrator {
    /// Run one request, yielding content as soon as it is produced
    pub fn process_stream(
        self: &Arc<Self>,
        user_id: &str,
        query: &str,
        session_context: DataMap,
    ) -> BoxStream<'static, StreamEvent> {
        let this = Arc::clone(self);
        let user_id = user_id.to_string();
        let query = query.to_string();

        Box::pin(stream! {
            if let Err(err) = this.check_ready() {
                yield StreamEvent::error(&err);
                yield StreamEvent::End { request_id: String::new(), success: false };
                return;
            }

            let started = Instant::now();
            let mut ctx = this.new_context(&user_id, &query, session_context);
            let count = this.layers.len();
            let pivot = this.layers.iter().position(|layer| {
                layer.is_enabled() && layer.phase() == Phase::Completed && layer.supports_streaming()
            });

            let mut streamed = String::new();
            let mut outcome = this.run_layers(&mut ctx, 0..pivot.unwrap_or(count)).await;

            if outcome.is_ok() {
                if let Some(pivot) = pivot {
                    let layer = &this.layers[pivot];
                    this.record_input(&ctx, layer);
                    let layer_started = Instant::now();
                    let deadline = ctx.deadline();

                    let opened = match deadline {
                        Some(deadline) => tokio::time::timeout_at(deadline, layer.process_stream(&mut ctx))
                            .await
                            .unwrap_or_else(|_| Err(PipelineError::Timeout(layer.name().to_string()))),
                        None => layer.process_stream(&mut ctx).await,
                    };

                    let result = match opened {
                        Ok(mut chunks) => {
                            let mut failure = None;
                            loop {
                                let next = match deadline {
                                    Some(deadline) => tokio::time::timeout_at(deadline, chunks.next())
                                        .await
                                        .unwrap_or_else(|_| {
                                            Some(Err(PipelineError::Timeout(layer.name().to_string())))
                                        }),
                                    None => chunks.next().await,
                                };
                                match next {
                                    Some(Ok(chunk)) => {
                                        if !chunk.is_empty() {
                                            streamed.push_str(&chunk);
                                            yield StreamEvent::Chunk { content: chunk };
                                        }
                                    }
                                    Some(Err(e)) => {
                                        failure = Some(e);
                                        break;
                                    }
                                    None => break,
                                }
                            }
                            match failure {
                                None => ProcessingResult::success_value(json!({
                                    "content": streamed.clone(),
                                    "streamed": true,
                                })),
                                Some(e) => ProcessingResult::from_error(&e),
                            }
                        }
                        Err(e) => ProcessingResult::from_error(&e),
                    };

                    outcome = this.complete_layer(&mut ctx, layer, result, layer_started);
                    if outcome.is_ok() {
                        outcome = this.run_layers(&mut ctx, pivot + 1..count).await;
                    }
                }
            }

            match &outcome {
                Ok(()) => {
                    let content = this.final_content(&ctx).unwrap_or_default();
                    let tail = match content.strip_prefix(streamed.as_str()) {
                        Some(rest) => rest.to_string(),
                        None => content,
                    };
                    if !tail.is_empty() {
                        yield StreamEvent::Chunk { content: tail };
                    }
                }
                Err(e) => {
                    yield StreamEvent::error(e);
                }
            }

            let response = this.finish(ctx, outcome, started, "stream");
            yield StreamEvent::End {
                request_id: response.request_id,
                success: response.success,
            };
        })
    }
}
