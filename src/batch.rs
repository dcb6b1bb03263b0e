use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::analyze::{AnalysisResult, Analyzer};
use crate::extract::{extract, ExtractedFields};
use crate::identifier::{normalize, Identifier};
use crate::scrape::{ScrapeResult, Scraper};

/// Where an item is in the pipeline. A failed item records the stage it failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Pending,
    Normalizing,
    Scraping,
    Analyzing,
    Extracting,
    Done,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SucceededItem {
    pub index: usize,
    pub input: String,
    pub identifier: Identifier,
    pub scrape: ScrapeResult,
    pub analysis: AnalysisResult,
    pub extracted: ExtractedFields,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedItem {
    pub index: usize,
    /// The entry exactly as it was passed in.
    pub input: String,
    pub identifier: Option<Identifier>,
    pub stage: Stage,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BatchItemResult {
    Succeeded(Box<SucceededItem>),
    Failed(FailedItem),
}

impl BatchItemResult {
    pub fn is_success(&self) -> bool {
        matches!(self, BatchItemResult::Succeeded(_))
    }

    pub fn index(&self) -> usize {
        match self {
            BatchItemResult::Succeeded(s) => s.index,
            BatchItemResult::Failed(f) => f.index,
        }
    }

    pub fn input(&self) -> &str {
        match self {
            BatchItemResult::Succeeded(s) => &s.input,
            BatchItemResult::Failed(f) => &f.input,
        }
    }

    pub fn identifier(&self) -> Option<&Identifier> {
        match self {
            BatchItemResult::Succeeded(s) => Some(&s.identifier),
            BatchItemResult::Failed(f) => f.identifier.as_ref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub finished_at: DateTime<Utc>,
}

/// Results in input order, one per input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub items: Vec<BatchItemResult>,
    pub summary: BatchSummary,
}

impl BatchResult {
    pub fn from_items(items: Vec<BatchItemResult>) -> Self {
        let succeeded = items.iter().filter(|i| i.is_success()).count();
        let summary = BatchSummary {
            total: items.len(),
            succeeded,
            failed: items.len() - succeeded,
            finished_at: Utc::now(),
        };
        BatchResult { items, summary }
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &SucceededItem> {
        self.items.iter().filter_map(|i| match i {
            BatchItemResult::Succeeded(s) => Some(s.as_ref()),
            BatchItemResult::Failed(_) => None,
        })
    }

    pub fn failed(&self) -> impl Iterator<Item = &FailedItem> {
        self.items.iter().filter_map(|i| match i {
            BatchItemResult::Failed(f) => Some(f),
            BatchItemResult::Succeeded(_) => None,
        })
    }
}

pub struct Progress<'a> {
    /// 1-based.
    pub current: usize,
    pub total: usize,
    pub input: &'a str,
}

/// Lifecycle hooks. Called synchronously from the batch task.
pub trait BatchObserver: Sync {
    /// Before an item starts.
    fn on_progress(&self, _progress: &Progress<'_>) {}
    /// When an item fails, at the moment it fails.
    fn on_failure(&self, _failure: &FailedItem) {}
    /// After an item's chunk has settled, in input order.
    fn on_item_done(&self, _item: &BatchItemResult) {}
}

#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Items per chunk. Chunks run one after another; items within a chunk run together.
    pub chunk_size: usize,
}

impl Default for BatchOptions {
    fn default() -> Self {
        BatchOptions { chunk_size: 5 }
    }
}

pub struct Pipeline<S, A> {
    scraper: S,
    analyzer: A,
    opts: BatchOptions,
}

impl<S: Scraper, A: Analyzer> Pipeline<S, A> {
    pub fn new(scraper: S, analyzer: A, opts: BatchOptions) -> Self {
        Pipeline {
            scraper,
            analyzer,
            opts,
        }
    }

    pub async fn run(&self, inputs: &[String], observer: &dyn BatchObserver) -> BatchResult {
        let total = inputs.len();
        let chunk_size = self.opts.chunk_size.max(1);
        info!("Starting batch: {} items, chunks of {}", total, chunk_size);

        let mut items = Vec::with_capacity(total);
        for (chunk_no, chunk) in inputs.chunks(chunk_size).enumerate() {
            let base = chunk_no * chunk_size;
            let mut pending = Vec::with_capacity(chunk.len());
            for (offset, input) in chunk.iter().enumerate() {
                let index = base + offset;
                observer.on_progress(&Progress {
                    current: index + 1,
                    total,
                    input,
                });
                pending.push(self.process(index, input, observer));
            }

            // Settle the whole chunk before appending so output order matches input order.
            for item in join_all(pending).await {
                observer.on_item_done(&item);
                items.push(item);
            }
        }

        let result = BatchResult::from_items(items);
        info!(
            "Batch complete: {}/{} succeeded",
            result.summary.succeeded, result.summary.total
        );
        result
    }

    async fn process(
        &self,
        index: usize,
        input: &str,
        observer: &dyn BatchObserver,
    ) -> BatchItemResult {
        let fail = |identifier: Option<Identifier>, stage: Stage, error: String| {
            warn!("Item {} ({}) failed while {:?}: {}", index + 1, input, stage, error);
            let failure = FailedItem {
                index,
                input: input.to_string(),
                identifier,
                stage,
                error,
                timestamp: Utc::now(),
            };
            observer.on_failure(&failure);
            BatchItemResult::Failed(failure)
        };

        debug!(index, input, stage = ?Stage::Pending);
        debug!(index, input, stage = ?Stage::Normalizing);
        let Some(identifier) = normalize(input) else {
            return fail(None, Stage::Normalizing, "Invalid ASIN or URL format".into());
        };

        debug!(index, identifier = %identifier, stage = ?Stage::Scraping);
        let scrape = match caught(self.scraper.scrape(&identifier)).await {
            Ok(scrape) => scrape,
            Err(e) => return fail(Some(identifier), Stage::Scraping, e),
        };
        let Some(content) = scrape.content.as_deref() else {
            let error = scrape.error.clone().unwrap_or_else(|| "Scraping failed".into());
            return fail(Some(identifier), Stage::Scraping, error);
        };

        debug!(index, identifier = %identifier, stage = ?Stage::Analyzing);
        let analysis = match caught(self.analyzer.analyze(content)).await {
            Ok(analysis) => analysis,
            Err(e) => return fail(Some(identifier), Stage::Analyzing, e),
        };
        let Some(text) = analysis.content.as_deref() else {
            let error = analysis.error.clone().unwrap_or_else(|| "AI analysis failed".into());
            return fail(Some(identifier), Stage::Analyzing, error);
        };

        debug!(index, identifier = %identifier, stage = ?Stage::Extracting);
        let extracted = match caught(async { extract(text, &identifier) }).await {
            Ok(extracted) => extracted,
            Err(e) => return fail(Some(identifier), Stage::Extracting, e),
        };

        debug!(index, identifier = %identifier, stage = ?Stage::Done);
        BatchItemResult::Succeeded(Box::new(SucceededItem {
            index,
            input: input.to_string(),
            identifier,
            scrape,
            analysis,
            extracted,
        }))
    }
}

/// Turn a panic inside a stage into an error message for that item.
async fn caught<F: Future>(fut: F) -> Result<F::Output, String> {
    AssertUnwindSafe(fut)
        .catch_unwind()
        .await
        .map_err(|payload| format!("panicked: {}", panic_message(payload.as_ref())))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::scrape::ApiVersion;

    struct NoopObserver;

    impl BatchObserver for NoopObserver {}

    #[derive(Clone, Copy)]
    enum Behaviour {
        Ok,
        Fail,
        Panic,
        Delay(u64),
    }

    #[derive(Default)]
    struct FakeScraper {
        behaviour: HashMap<String, Behaviour>,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl FakeScraper {
        fn with(pairs: &[(&str, Behaviour)]) -> Self {
            FakeScraper {
                behaviour: pairs.iter().map(|(k, b)| (k.to_string(), *b)).collect(),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl Scraper for FakeScraper {
        async fn scrape(&self, id: &Identifier) -> ScrapeResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            let behaviour = self.behaviour.get(id.as_str()).copied().unwrap_or(Behaviour::Ok);
            // Yield once so every item of a chunk is in flight together.
            tokio::task::yield_now().await;
            if let Behaviour::Delay(ms) = behaviour {
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let (content, error) = match behaviour {
                Behaviour::Fail => (None, Some("request failed: connection reset".to_string())),
                Behaviour::Panic => panic!("scraper exploded"),
                _ => (Some(format!("page for {}", id)), None),
            };
            ScrapeResult {
                identifier: id.clone(),
                url: format!("https://www.amazon.com/dp/{}", id),
                api_version: ApiVersion::V1,
                attempts: 1,
                content,
                error,
                requested_at: Utc::now(),
            }
        }
    }

    struct FakeAnalyzer {
        fail_on: Option<&'static str>,
    }

    #[async_trait]
    impl Analyzer for FakeAnalyzer {
        async fn analyze(&self, content: &str) -> AnalysisResult {
            let failed = self.fail_on.is_some_and(|needle| content.contains(needle));
            AnalysisResult {
                content: (!failed).then(|| format!("Title: {}\nPrice: $10\nRating: 4.1", content)),
                error: failed.then(|| "generation service returned 500: oops".to_string()),
                model: "fake".into(),
                timestamp: Utc::now(),
            }
        }
    }

    #[derive(Default)]
    struct Recorder {
        progress: Mutex<Vec<(usize, usize, String)>>,
        failures: Mutex<Vec<FailedItem>>,
        done: Mutex<Vec<usize>>,
    }

    impl BatchObserver for Recorder {
        fn on_progress(&self, p: &Progress<'_>) {
            self.progress
                .lock()
                .unwrap()
                .push((p.current, p.total, p.input.to_string()));
        }
        fn on_failure(&self, f: &FailedItem) {
            self.failures.lock().unwrap().push(f.clone());
        }
        fn on_item_done(&self, item: &BatchItemResult) {
            self.done.lock().unwrap().push(item.index());
        }
    }

    fn pipeline(scraper: FakeScraper, chunk_size: usize) -> Pipeline<FakeScraper, FakeAnalyzer> {
        Pipeline::new(scraper, FakeAnalyzer { fail_on: None }, BatchOptions { chunk_size })
    }

    fn inputs(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn empty_batch() {
        let result = pipeline(FakeScraper::default(), 5).run(&[], &NoopObserver).await;
        assert!(result.items.is_empty());
        assert_eq!(result.summary.total, 0);
        assert_eq!(result.summary.succeeded, 0);
        assert_eq!(result.summary.failed, 0);
    }

    #[tokio::test]
    async fn one_network_failure_is_isolated() {
        let scraper = FakeScraper::with(&[("B000000002", Behaviour::Fail)]);
        let raw = inputs(&["B000000001", " https://www.amazon.com/dp/b000000002 ", "B000000003"]);
        let recorder = Recorder::default();
        let result = pipeline(scraper, 5).run(&raw, &recorder).await;

        assert_eq!(result.items.len(), 3);
        assert_eq!(result.summary.succeeded, 2);
        assert_eq!(result.summary.failed, 1);

        let failed: Vec<_> = result.failed().collect();
        assert_eq!(failed[0].input, " https://www.amazon.com/dp/b000000002 ");
        assert_eq!(failed[0].stage, Stage::Scraping);
        assert_eq!(failed[0].identifier.as_ref().unwrap().as_str(), "B000000002");
        assert!(failed[0].error.contains("connection reset"));
        assert_eq!(recorder.failures.lock().unwrap().len(), 1);

        let order: Vec<usize> = result.items.iter().map(|i| i.index()).collect();
        assert_eq!(order, vec![0, 1, 2]);
        let ok = result.succeeded().next().unwrap();
        assert_eq!(ok.extracted.title, "page for B000000001");
        assert_eq!(ok.extracted.price, "10");
    }

    #[tokio::test]
    async fn unparseable_input_fails_at_normalization() {
        let scraper = FakeScraper::default();
        let raw = inputs(&["not a product", "B000000001"]);
        let p = pipeline(scraper, 5);
        let result = p.run(&raw, &NoopObserver).await;

        match &result.items[0] {
            BatchItemResult::Failed(f) => {
                assert_eq!(f.stage, Stage::Normalizing);
                assert!(f.identifier.is_none());
                assert_eq!(f.input, "not a product");
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert!(result.items[1].is_success());
        assert_eq!(p.scraper.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn analysis_failure_stops_the_item() {
        let p = Pipeline::new(
            FakeScraper::default(),
            FakeAnalyzer {
                fail_on: Some("B000000002"),
            },
            BatchOptions::default(),
        );
        let result = p
            .run(&inputs(&["B000000001", "B000000002"]), &NoopObserver)
            .await;
        let failed: Vec<_> = result.failed().collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].stage, Stage::Analyzing);
        assert!(failed[0].error.contains("500"));
    }

    #[tokio::test]
    async fn panic_in_a_stage_becomes_a_failure() {
        let scraper = FakeScraper::with(&[("B000000002", Behaviour::Panic)]);
        let raw = inputs(&["B000000001", "B000000002", "B000000003"]);
        let result = pipeline(scraper, 2).run(&raw, &NoopObserver).await;

        assert_eq!(result.summary.succeeded, 2);
        let failed: Vec<_> = result.failed().collect();
        assert_eq!(failed[0].index, 1);
        assert_eq!(failed[0].stage, Stage::Scraping);
        assert!(failed[0].error.contains("scraper exploded"));
    }

    #[tokio::test(start_paused = true)]
    async fn order_kept_when_completions_are_reversed() {
        let scraper = FakeScraper::with(&[
            ("B000000001", Behaviour::Delay(300)),
            ("B000000002", Behaviour::Delay(200)),
            ("B000000003", Behaviour::Delay(100)),
        ]);
        let raw = inputs(&["B000000001", "B000000002", "B000000003"]);
        let recorder = Recorder::default();
        let result = pipeline(scraper, 3).run(&raw, &recorder).await;

        let ids: Vec<_> = result
            .items
            .iter()
            .map(|i| i.identifier().unwrap().as_str().to_string())
            .collect();
        assert_eq!(ids, vec!["B000000001", "B000000002", "B000000003"]);
        assert_eq!(*recorder.done.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn chunks_bound_concurrency() {
        let raw: Vec<String> = (1..=7).map(|n| format!("B00000000{}", n)).collect();
        let p = pipeline(FakeScraper::default(), 3);
        let recorder = Recorder::default();
        let result = p.run(&raw, &recorder).await;

        assert_eq!(result.summary.succeeded, 7);
        assert_eq!(p.scraper.max_in_flight.load(Ordering::SeqCst), 3);

        let progress = recorder.progress.lock().unwrap();
        let currents: Vec<usize> = progress.iter().map(|(c, _, _)| *c).collect();
        assert_eq!(currents, (1..=7).collect::<Vec<_>>());
        assert!(progress.iter().all(|(_, total, _)| *total == 7));
        assert_eq!(progress[0].2, "B000000001");
    }

    #[tokio::test]
    async fn zero_chunk_size_is_treated_as_one() {
        let p = pipeline(FakeScraper::default(), 0);
        let result = p
            .run(&inputs(&["B000000001", "B000000002"]), &NoopObserver)
            .await;
        assert_eq!(result.summary.succeeded, 2);
        assert_eq!(p.scraper.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn item_results_serialize_with_status_tag() {
        let failure = BatchItemResult::Failed(FailedItem {
            index: 0,
            input: "x".into(),
            identifier: None,
            stage: Stage::Normalizing,
            error: "Invalid ASIN or URL format".into(),
            timestamp: Utc::now(),
        });
        let json = serde_json::to_value(&failure).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["stage"], "normalizing");
        let back: BatchItemResult = serde_json::from_value(json).unwrap();
        assert_eq!(back, failure);
    }
}
