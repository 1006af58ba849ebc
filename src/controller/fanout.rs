//! Bounded parallel fan-out of one workflow step across nodes

use crate::common::{Error, NodeFailure, Result};
use futures_util::stream::{self, StreamExt};
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Per-node results of one step, in node order
#[derive(Debug)]
pub struct StepReport<T> {
    pub succeeded: Vec<(String, T)>,
    pub failed: Vec<(String, Error)>,
}

impl<T> StepReport<T> {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn succeeded_nodes(&self) -> Vec<String> {
        self.succeeded.iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn failures(&self) -> Vec<NodeFailure> {
        self.failed
            .iter()
            .map(|(node, e)| e.node_failure(node))
            .collect()
    }

    /// Barrier: all nodes succeeded, or the first failure in node order.
    pub fn into_result(mut self) -> Result<Vec<(String, T)>> {
        if self.failed.is_empty() {
            Ok(self.succeeded)
        } else {
            Err(self.failed.remove(0).1)
        }
    }

    /// Barrier returning the succeeded nodes alongside the first failure.
    pub fn split(mut self) -> std::result::Result<Vec<(String, T)>, (Vec<String>, Error)> {
        if self.failed.is_empty() {
            Ok(self.succeeded)
        } else {
            let nodes = self.succeeded_nodes();
            Err((nodes, self.failed.remove(0).1))
        }
    }
}

/// Run `f` for every node with at most `parallelism` calls in flight.
///
/// A cancelled token turns every unfinished call into `Cancelled`. Per-call
/// deadlines are enforced by the agent client.
pub async fn fan_out<T, F, Fut>(
    nodes: &[String],
    parallelism: usize,
    cancel: &CancellationToken,
    f: F,
) -> StepReport<T>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut calls = Vec::with_capacity(nodes.len());
    for (idx, node) in nodes.iter().enumerate() {
        let fut = f(node.clone());
        let node = node.clone();
        calls.push(async move {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(Error::Cancelled(format!("call to {} cancelled", node))),
                r = fut => r,
            };
            (idx, node, result)
        });
    }

    let mut results: Vec<(usize, String, Result<T>)> = stream::iter(calls)
        .buffer_unordered(parallelism.max(1))
        .collect()
        .await;
    results.sort_by_key(|(idx, _, _)| *idx);

    let mut report = StepReport {
        succeeded: Vec::new(),
        failed: Vec::new(),
    };
    for (_, node, result) in results {
        match result {
            Ok(value) => report.succeeded.push((node, value)),
            Err(e) => report.failed.push((node, e)),
        }
    }
    report
}
